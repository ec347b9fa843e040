//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::state::TaskState;

/// Command-line interface for managing pipeline queues.
#[derive(Debug, Parser)]
#[command(
    name = "desipipe",
    version,
    about = "Persistent, DAG-aware task scheduler for batch pipelines.",
    long_about = None
)]
pub struct CliArgs {
    /// Queue base directory. Defaults to DESIPIPE_QUEUE_DIR, else
    /// $HOME/.desipipe/queues/$USER.
    #[arg(long, value_name = "DIR", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List queues matching a glob, with per-state task counts.
    Queues {
        /// Queue name glob (`*` and `?`).
        #[arg(short = 'q', long = "queue", value_name = "GLOB", default_value = "*")]
        queue: String,
    },

    /// Dump tasks of a queue, optionally filtered by state.
    Tasks {
        #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
        queue: String,
        /// Only tasks in this state.
        #[arg(long, value_enum, value_name = "STATE")]
        state: Option<StateArg>,
    },

    /// Pause a queue: no new claims, in-flight tasks continue.
    Pause {
        #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
        queue: String,
    },

    /// Resume a paused queue.
    Resume {
        #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
        queue: String,
        /// Also start a spawn loop as a background process.
        #[arg(long)]
        spawn: bool,
    },

    /// Move tasks in a state back to PENDING, clearing their outcome.
    Retry {
        #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
        queue: String,
        #[arg(long, value_enum, value_name = "STATE", required = true)]
        state: Vec<StateArg>,
    },

    /// Run the scheduler loop for a queue.
    Spawn {
        #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
        queue: String,
        /// Detach: run the loop as a background process.
        #[arg(long)]
        spawn: bool,
        /// Seconds between scans.
        #[arg(long, value_name = "SEC")]
        timestep: Option<f64>,
    },

    /// Mark all non-terminal tasks KILLED.
    Kill {
        #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
        queue: String,
    },

    /// Delete queues matching a glob.
    Delete {
        #[arg(short = 'q', long = "queue", value_name = "GLOB")]
        queue: String,
        /// Required when a matched queue still holds tasks.
        #[arg(long)]
        force: bool,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(lvl: LogLevel) -> Self {
        match lvl {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Task state as a CLI value.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum StateArg {
    Waiting,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    Unknown,
}

impl From<StateArg> for TaskState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Waiting => TaskState::Waiting,
            StateArg::Pending => TaskState::Pending,
            StateArg::Running => TaskState::Running,
            StateArg::Succeeded => TaskState::Succeeded,
            StateArg::Failed => TaskState::Failed,
            StateArg::Killed => TaskState::Killed,
            StateArg::Unknown => TaskState::Unknown,
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
