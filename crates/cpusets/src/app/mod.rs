//! Application module
//!
//! Wires the agent selected on the command line into background tasks and
//! drives them until shutdown.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub(crate) use builder::ApplicationBuilder;
