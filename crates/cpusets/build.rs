fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true) // registration with the kubelet
        .compile_protos(&["proto/deviceplugin/v1beta1/api.proto"], &["proto"])?;
    Ok(())
}
