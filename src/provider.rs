//! Providers: where workers run.
//!
//! One contract over two tagged implementations. `local` keeps a pool of
//! in-process workers; `batch` drives a Slurm-shaped system through command
//! templates and never executes user code itself.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::app::AppRegistry;
use crate::config::{ProviderSpec, TmConfig};
use crate::error::QueueError;
use crate::queue::Queue;
use crate::worker::Worker;

/// Uniform contract over worker allocation backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Allocate `n` workers; returns their job handles.
    async fn launch(&self, n: usize) -> Result<Vec<String>, QueueError>;

    /// Workers currently holding a slot (running).
    async fn live_workers(&self) -> Result<usize, QueueError>;

    /// Jobs submitted but not yet holding a slot, oldest first, with the
    /// worker count each carries.
    async fn pending_jobs(&self) -> Result<Vec<(String, usize)>, QueueError>;

    /// Every job id this provider currently knows about, live or pending.
    async fn jobids(&self) -> Result<Vec<String>, QueueError>;

    /// When a slot's wall time expires mid-task: `true` means the task is
    /// terminally KILLED, `false` means it is re-queued as PENDING.
    fn killed_at_timeout(&self) -> bool;

    /// Relative cost of allocating a batch of `n` workers at once. The
    /// spawn loop launches in batches minimizing this.
    fn cost(&self, workers: usize) -> f64;

    /// Cancel the given jobs.
    async fn kill(&self, jobids: &[String]) -> Result<(), QueueError>;
}

/// Build the provider for a TaskManager config.
pub fn provider_for(
    config: &TmConfig,
    queue: Queue,
    registry: AppRegistry,
) -> Arc<dyn Provider> {
    match &config.provider {
        ProviderSpec::Local {} => Arc::new(LocalProvider::new(queue, registry, config.clone())),
        ProviderSpec::Batch {
            submit,
            query,
            kill,
            killed_at_timeout,
        } => Arc::new(BatchProvider {
            submit: submit.clone(),
            query: query.clone(),
            kill: kill.clone(),
            killed_at_timeout: *killed_at_timeout,
            config: config.clone(),
            submitted: Mutex::new(Vec::new()),
        }),
    }
}

/// In-process worker pool. Launching spawns tokio tasks running the worker
/// loop; a worker releases its slot by returning (idle timeout or pause).
pub struct LocalProvider {
    queue: Queue,
    registry: AppRegistry,
    config: TmConfig,
    handles: Mutex<Vec<(String, tokio::task::JoinHandle<()>)>>,
}

impl LocalProvider {
    pub fn new(queue: Queue, registry: AppRegistry, config: TmConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn reap(&self) -> usize {
        let mut handles = self.handles.lock().expect("handle lock poisoned");
        handles.retain(|(_, handle)| !handle.is_finished());
        handles.len()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn launch(&self, n: usize) -> Result<Vec<String>, QueueError> {
        let mut launched = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = Worker::new(
                self.queue.clone(),
                self.registry.clone(),
                self.config.clone(),
            );
            let jobid = worker.jobid().to_string();
            let handle = tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    warn!(error = %e, "worker exited with error");
                }
            });
            debug!(jobid = %jobid, "launched local worker");
            self.handles
                .lock()
                .expect("handle lock poisoned")
                .push((jobid.clone(), handle));
            launched.push(jobid);
        }
        Ok(launched)
    }

    async fn live_workers(&self) -> Result<usize, QueueError> {
        Ok(self.reap())
    }

    async fn pending_jobs(&self) -> Result<Vec<(String, usize)>, QueueError> {
        // Local workers start immediately; nothing ever queues.
        Ok(Vec::new())
    }

    async fn jobids(&self) -> Result<Vec<String>, QueueError> {
        self.reap();
        Ok(self
            .handles
            .lock()
            .expect("handle lock poisoned")
            .iter()
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn killed_at_timeout(&self) -> bool {
        // Local slots have no wall-time limit; the flag is never consulted.
        false
    }

    fn cost(&self, _workers: usize) -> f64 {
        // Flat: the spawn loop launches everything it needs in one batch.
        0.0
    }

    async fn kill(&self, jobids: &[String]) -> Result<(), QueueError> {
        let mut handles = self.handles.lock().expect("handle lock poisoned");
        for (id, handle) in handles.iter() {
            if jobids.contains(id) {
                handle.abort();
            }
        }
        handles.retain(|(id, _)| !jobids.contains(id));
        Ok(())
    }
}

/// Batch-system provider driven by command templates.
///
/// `submit` runs once per job with `{command}` replaced by the configured
/// worker command; it must print the new job id. `query` prints the ids of
/// jobs currently holding a slot, one per line. `kill` receives job ids as
/// trailing arguments. The batch system owns node placement.
pub struct BatchProvider {
    submit: String,
    query: String,
    kill: String,
    killed_at_timeout: bool,
    config: TmConfig,
    submitted: Mutex<Vec<String>>,
}

impl BatchProvider {
    async fn run_template(&self, command: &str) -> Result<String, QueueError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(&self.config.environment.vars)
            .output()
            .await
            .map_err(|e| QueueError::Provider(format!("running {command:?}: {e}")))?;
        if !output.status.success() {
            return Err(QueueError::Provider(format!(
                "{command:?} exited {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn query_live(&self) -> Result<Vec<String>, QueueError> {
        let stdout = self.run_template(&self.query).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Provider for BatchProvider {
    async fn launch(&self, n: usize) -> Result<Vec<String>, QueueError> {
        let worker_command = self
            .config
            .environment
            .worker_command
            .as_deref()
            .ok_or_else(|| {
                QueueError::Provider("batch provider needs environment.worker_command".into())
            })?;
        let command = self.submit.replace("{command}", worker_command);
        let mut launched = Vec::with_capacity(n);
        for _ in 0..n {
            let stdout = self.run_template(&command).await?;
            let jobid = stdout
                .split_whitespace()
                .last()
                .ok_or_else(|| QueueError::Provider("submit printed no job id".into()))?
                .to_string();
            info!(jobid = %jobid, "submitted batch worker");
            self.submitted
                .lock()
                .expect("submit lock poisoned")
                .push(jobid.clone());
            launched.push(jobid);
        }
        Ok(launched)
    }

    async fn live_workers(&self) -> Result<usize, QueueError> {
        Ok(self.query_live().await?.len())
    }

    async fn pending_jobs(&self) -> Result<Vec<(String, usize)>, QueueError> {
        // Submitted but not yet visible as holding a slot.
        let live = self.query_live().await?;
        let submitted = self.submitted.lock().expect("submit lock poisoned").clone();
        Ok(submitted
            .into_iter()
            .filter(|id| !live.contains(id))
            .map(|id| (id, 1))
            .collect())
    }

    async fn jobids(&self) -> Result<Vec<String>, QueueError> {
        let mut ids = self.query_live().await?;
        for (id, _) in self.pending_jobs().await? {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn killed_at_timeout(&self) -> bool {
        self.killed_at_timeout
    }

    fn cost(&self, workers: usize) -> f64 {
        // Each submission occupies one scheduling slot; prefer fewer, larger
        // batches only when the batch system bills that way. One job per
        // worker keeps the cost linear.
        workers as f64
    }

    async fn kill(&self, jobids: &[String]) -> Result<(), QueueError> {
        if jobids.is_empty() {
            return Ok(());
        }
        let command = format!("{} {}", self.kill, jobids.join(" "));
        self.run_template(&command).await?;
        let mut submitted = self.submitted.lock().expect("submit lock poisoned");
        submitted.retain(|id| !jobids.contains(id));
        Ok(())
    }
}
