//! Command-line interface for resque-cluster.
//!
//! Provides operator commands for enqueueing, inspecting and pruning queues,
//! reading job status and failures, and printing sentinel topology.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
