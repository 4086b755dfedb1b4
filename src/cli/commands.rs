//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - ping: check the backend is reachable
//! - request: send any action with JSON params
//! - tasks: list/create tasks
//! - login: authenticate and verify the session
//! - listen: print notifications as they arrive

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fundlink::config::Config;

/// Fundlink - messaging client for the fund analysis backend
#[derive(Parser, Debug)]
#[command(name = "fundlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Backend host (overrides config)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Request/reply port (overrides config)
    #[arg(long, global = true)]
    pub req_port: Option<u16>,

    /// Publish/subscribe port (overrides config)
    #[arg(long, global = true)]
    pub pub_port: Option<u16>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Apply host/port flags on top of loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.backend.host = host.clone();
        }
        if let Some(port) = self.req_port {
            config.backend.req_port = port;
        }
        if let Some(port) = self.pub_port {
            config.backend.pub_port = port;
        }
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send test.ping and report the round trip
    Ping,

    /// Send an arbitrary action
    Request {
        /// Action name (e.g., task.list)
        action: String,

        /// Params as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Timeout in milliseconds (defaults to config)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Task actions
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Log in and verify the session token
    Login {
        /// User name
        username: String,

        /// Password (sent as its SHA-256 digest)
        #[arg(short, long)]
        password: String,
    },

    /// Print notifications until interrupted
    Listen {
        /// Topic prefix to subscribe (repeatable; none means everything)
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Exit after this many notifications
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TaskCommands {
    /// List tasks
    List,

    /// Create a task
    Create {
        /// Task name
        name: String,
    },
}
