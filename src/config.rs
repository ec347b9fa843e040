//! TaskManager configuration: environment, scheduler, and provider specs.
//!
//! The whole bundle serializes into each task row's `tm_config` blob, so a
//! spawn process started later (or on another host sharing the filesystem)
//! can reconstruct how the submitting process wanted its tasks run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident;

/// Environment variable overriding the queue base directory.
pub const QUEUE_DIR_ENV: &str = "DESIPIPE_QUEUE_DIR";

/// Resolve the base directory holding queue files.
///
/// `DESIPIPE_QUEUE_DIR` wins; otherwise `$HOME/.desipipe/queues/$USER`.
pub fn default_queue_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(QUEUE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    home.join(".desipipe").join("queues").join(user)
}

/// Environment preparation for workers: variables to export and shell
/// commands to run before the first claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Environment variables exported to the worker and its subprocesses.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Shell commands run once at worker startup (e.g. `module load ...`).
    #[serde(default)]
    pub prep_commands: Vec<String>,

    /// Command line starting a worker process, for providers that submit
    /// jobs to an external batch system. Local workers run in-process and
    /// ignore this.
    #[serde(default)]
    pub worker_command: Option<String>,
}

/// Scheduler timings and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSpec {
    /// Maximum concurrent workers for this TaskManager's tasks.
    #[serde(default = "defaults::max_workers")]
    pub max_workers: usize,

    /// Seconds between spawn-loop scans.
    #[serde(default = "defaults::timestep")]
    pub timestep: f64,

    /// Seconds a paused queue with no live workers survives before the
    /// spawn loop exits.
    #[serde(default = "defaults::idle_grace")]
    pub idle_grace: f64,

    /// Seconds without a heartbeat before a RUNNING task is presumed lost.
    #[serde(default = "defaults::heartbeat_timeout")]
    pub heartbeat_timeout: f64,

    /// Seconds a worker waits on an empty claim before exiting.
    #[serde(default = "defaults::worker_idle_timeout")]
    pub worker_idle_timeout: f64,

    /// Seconds the spawn loop waits for the provider's job list to reflect
    /// a launch before declaring the provider stale.
    #[serde(default = "defaults::refresh_timeout")]
    pub refresh_timeout: f64,
}

mod defaults {
    pub fn max_workers() -> usize {
        1
    }
    pub fn timestep() -> f64 {
        2.0
    }
    pub fn idle_grace() -> f64 {
        60.0
    }
    pub fn heartbeat_timeout() -> f64 {
        60.0
    }
    pub fn worker_idle_timeout() -> f64 {
        10.0
    }
    pub fn refresh_timeout() -> f64 {
        120.0
    }
}

impl Default for SchedulerSpec {
    fn default() -> Self {
        Self {
            max_workers: defaults::max_workers(),
            timestep: defaults::timestep(),
            idle_grace: defaults::idle_grace(),
            heartbeat_timeout: defaults::heartbeat_timeout(),
            worker_idle_timeout: defaults::worker_idle_timeout(),
            refresh_timeout: defaults::refresh_timeout(),
        }
    }
}

/// Where workers run. Tagged variants, one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderSpec {
    /// In-process worker pool on the local machine.
    Local {},

    /// Slurm-shaped batch system driven through command templates.
    ///
    /// `submit` receives the worker command on stdin-free argv via the
    /// `{command}` placeholder and must print one job id. `query` prints the
    /// live job ids, one per line. `kill` receives job ids as trailing
    /// arguments.
    Batch {
        submit: String,
        query: String,
        kill: String,
        /// When a batch slot expires mid-task: `true` marks the task KILLED
        /// (terminal), `false` re-queues it as PENDING for idempotent work.
        #[serde(default)]
        killed_at_timeout: bool,
    },
}

impl Default for ProviderSpec {
    fn default() -> Self {
        ProviderSpec::Local {}
    }
}

/// The full configuration bundle a TaskManager stamps onto its tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TmConfig {
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub scheduler: SchedulerSpec,
    #[serde(default)]
    pub provider: ProviderSpec,
}

impl TmConfig {
    /// Stable 128-bit digest of the canonical config JSON. Used to group
    /// tasks by owning TaskManager when claiming and spawning.
    pub fn digest(&self) -> String {
        let value: Value = serde_json::to_value(self).unwrap_or(Value::Null);
        let canonical = ident::canonical_json(&value);
        let digest = blake3::hash(canonical.as_bytes());
        let mut out = String::with_capacity(32);
        use std::fmt::Write;
        for byte in &digest.as_bytes()[..16] {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}
