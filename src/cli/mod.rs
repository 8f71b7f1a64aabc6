//! Command-line interface for operating the AI queue.
//!
//! Provides commands for inspecting queue depth, enqueueing and purging
//! items, running the recovery sweep and checking rate limits.

mod commands;

pub use commands::{execute, parse_cli, run, run_with_cli, Cli, CommandContext, Commands};
