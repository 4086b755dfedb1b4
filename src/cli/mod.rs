//! CLI module for fundlink - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for pinging the backend,
//! sending raw requests, task and auth actions, and listening for
//! notifications.

pub mod commands;

pub use commands::Cli;
