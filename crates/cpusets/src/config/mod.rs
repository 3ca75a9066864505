pub mod agents;
pub mod cli;

pub use agents::*;
pub use cli::*;
