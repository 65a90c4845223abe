//! CLI for key administration and sending.

pub mod commands;

pub use commands::{run_cli, Cli, Commands};
