//! Worker runtime: claims one task at a time and executes it.
//!
//! A worker loops `claim -> execute -> finish`, heartbeating while a task
//! runs, and exits when no eligible task shows up within the idle timeout or
//! the queue is paused. Workers never decide scheduling; the queue's atomic
//! claim is the only arbiter.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::{AppExec, AppRegistry, TaskInput};
use crate::codec;
use crate::config::TmConfig;
use crate::error::{errno_for, QueueError};
use crate::queue::{ClaimFilter, Queue, TaskOutcome};
use crate::state::{QueueState, TaskState};
use crate::task::{TaskKind, TaskRow};

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Interval between empty-claim polls.
const CLAIM_POLL: Duration = Duration::from_millis(500);

/// A single worker bound to one queue and TaskManager config.
pub struct Worker {
    queue: Queue,
    registry: AppRegistry,
    config: TmConfig,
    jobid: String,
}

impl Worker {
    pub fn new(queue: Queue, registry: AppRegistry, config: TmConfig) -> Self {
        let jobid = format!(
            "{}-{}",
            std::process::id(),
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            queue,
            registry,
            config,
            jobid,
        }
    }

    /// Provider-visible identifier stamped on claimed rows.
    pub fn jobid(&self) -> &str {
        &self.jobid
    }

    /// Run until idle for `worker_idle_timeout` or the queue pauses.
    pub async fn run(&self) -> Result<(), QueueError> {
        self.prepare_environment().await?;
        let idle_timeout = Duration::from_secs_f64(self.config.scheduler.worker_idle_timeout);
        let mut idle_since = Instant::now();
        info!(jobid = %self.jobid, "worker started");
        loop {
            if self.queue.state().await? == QueueState::Paused {
                info!(jobid = %self.jobid, "queue paused, worker exiting");
                break;
            }
            match self.claim_one().await? {
                Some(task) => {
                    self.execute(task).await?;
                    idle_since = Instant::now();
                }
                None => {
                    if idle_since.elapsed() >= idle_timeout {
                        debug!(jobid = %self.jobid, "idle timeout, worker exiting");
                        break;
                    }
                    tokio::time::sleep(CLAIM_POLL).await;
                }
            }
        }
        Ok(())
    }

    /// Claim preference: tasks this registry can run in-process, then bash
    /// tasks (executable without a registry entry).
    async fn claim_one(&self) -> Result<Option<TaskRow>, QueueError> {
        let digest = self.config.digest();
        let names = self.registry.names();
        if !names.is_empty() {
            let filter = ClaimFilter {
                app_names: Some(names),
                kinds: None,
                tm_digest: Some(digest.clone()),
            };
            if let Some(task) = self.queue.claim(&filter, &self.jobid).await? {
                return Ok(Some(task));
            }
        }
        let filter = ClaimFilter {
            app_names: None,
            kinds: Some(vec![TaskKind::Bash]),
            tm_digest: Some(digest),
        };
        self.queue.claim(&filter, &self.jobid).await
    }

    /// Run prep commands once before the first claim. Environment variables
    /// are passed to each subprocess rather than mutated process-wide, so
    /// concurrent in-process workers cannot race.
    async fn prepare_environment(&self) -> Result<(), QueueError> {
        for command in &self.config.environment.prep_commands {
            debug!(command = %command, "running prep command");
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .envs(&self.config.environment.vars)
                .status()
                .await
                .map_err(|e| QueueError::Provider(format!("prep command {command:?}: {e}")))?;
            if !status.success() {
                return Err(QueueError::Provider(format!(
                    "prep command {command:?} exited {}",
                    status.code().unwrap_or(-1)
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, task: TaskRow) -> Result<(), QueueError> {
        debug!(task = %task.id, app = %task.app_name, kind = %task.kind, "executing");

        let resolved = match self.materialize_inputs(&task).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let err = e.to_string();
                self.queue
                    .finish(
                        &task.id,
                        TaskOutcome::Failure {
                            errno: errno_for(&err),
                            out: String::new(),
                            err,
                        },
                    )
                    .await?;
                return Ok(());
            }
        };

        // Heartbeat for the whole execution; flushes rolling output too.
        let buffers = Arc::new(Mutex::new((String::new(), String::new())));
        let beat = self.spawn_heartbeat(task.id.clone(), buffers.clone());

        let outcome = match task.kind {
            TaskKind::Func => self.execute_func(&task, resolved).await,
            TaskKind::Bash => self.execute_bash(&task, resolved, buffers.clone()).await,
        };

        beat.abort();
        match self.queue.finish(&task.id, outcome).await {
            Ok(()) => Ok(()),
            // The row left RUNNING under us: an explicit kill or a sweep
            // won the race. The outcome is dropped; the row's state stands.
            Err(QueueError::InvalidTransition { from, .. }) => {
                warn!(task = %task.id, state = %from, "task finalized elsewhere, dropping outcome");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Substitute dependency placeholders in args/kwargs with materialized
    /// results. Every referenced task must be SUCCEEDED.
    async fn materialize_inputs(&self, task: &TaskRow) -> Result<(Value, Value), QueueError> {
        let mut results: HashMap<String, Value> = HashMap::new();
        for dep in &task.deps {
            let row = self
                .queue
                .get(dep)
                .await?
                .ok_or_else(|| QueueError::Corrupt(format!("dangling dependency {dep}")))?;
            if row.state != TaskState::Succeeded {
                return Err(QueueError::Corrupt(format!(
                    "dependency {dep} is {} at execution time",
                    row.state
                )));
            }
            let blob = row
                .result
                .ok_or_else(|| QueueError::Corrupt(format!("succeeded task {dep} has no result")))?;
            results.insert(dep.clone(), codec::decode(&blob)?);
        }
        let lookup = |id: &str| {
            results
                .get(id)
                .cloned()
                .ok_or_else(|| QueueError::Corrupt(format!("unresolved dependency {id}")))
        };
        let args = codec::resolve_deps(task.args_value()?, &lookup)?;
        let kwargs = codec::resolve_deps(task.kwargs_value()?, &lookup)?;
        Ok((args, kwargs))
    }

    async fn execute_func(&self, task: &TaskRow, (args, kwargs): (Value, Value)) -> TaskOutcome {
        let Some(AppExec::Func(func)) = self.registry.get(&task.app_name) else {
            let err = format!("no executor registered for app {}", task.app_name);
            return TaskOutcome::Failure {
                errno: errno_for(&err),
                out: String::new(),
                err,
            };
        };
        let input = TaskInput::new(
            args.as_array().cloned().unwrap_or_default(),
            kwargs.as_object().cloned().unwrap_or_default(),
        );
        match func(input).await {
            Ok(value) => match codec::encode(&value) {
                Ok(result) => TaskOutcome::Success {
                    result,
                    out: String::new(),
                    err: String::new(),
                },
                Err(e) => {
                    let err = format!("serializing result: {e}");
                    TaskOutcome::Failure {
                        errno: errno_for(&err),
                        out: String::new(),
                        err,
                    }
                }
            },
            Err(e) => {
                // Display text drives the errno so the same failure kind
                // maps to the same code across runs; the chain goes to err.
                let display = e.to_string();
                TaskOutcome::Failure {
                    errno: errno_for(&display),
                    out: String::new(),
                    err: format!("{e:?}"),
                }
            }
        }
    }

    /// Run the rendered argv as a subprocess, streaming stdout/stderr into
    /// the rolling buffers the heartbeat flushes.
    async fn execute_bash(
        &self,
        task: &TaskRow,
        (args, _kwargs): (Value, Value),
        buffers: Arc<Mutex<(String, String)>>,
    ) -> TaskOutcome {
        let tokens: Vec<String> = match args.as_array() {
            Some(items) if !items.is_empty() => items.iter().map(token_to_string).collect(),
            _ => {
                let err = "bash task has an empty argv".to_string();
                return TaskOutcome::Failure {
                    errno: errno_for(&err),
                    out: String::new(),
                    err,
                };
            }
        };

        let spawned = tokio::process::Command::new(&tokens[0])
            .args(&tokens[1..])
            .envs(&self.config.environment.vars)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = format!("spawning {:?}: {e}", tokens[0]);
                return TaskOutcome::Failure {
                    errno: errno_for(&err),
                    out: String::new(),
                    err,
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_buffers = buffers.clone();
        let out_reader = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = out_buffers.lock().expect("buffer lock poisoned");
                    guard.0.push_str(&line);
                    guard.0.push('\n');
                }
            }
        });
        let err_buffers = buffers.clone();
        let err_reader = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = err_buffers.lock().expect("buffer lock poisoned");
                    guard.1.push_str(&line);
                    guard.1.push('\n');
                }
            }
        });

        let status = child.wait().await;
        let _ = out_reader.await;
        let _ = err_reader.await;

        let (out, err) = {
            let guard = buffers.lock().expect("buffer lock poisoned");
            (guard.0.clone(), guard.1.clone())
        };

        match status {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                if code == 0 {
                    match codec::encode(&Value::from(0)) {
                        Ok(result) => TaskOutcome::Success { result, out, err },
                        Err(e) => TaskOutcome::Failure {
                            errno: errno_for("serializing exit status"),
                            out,
                            err: format!("serializing exit status: {e}"),
                        },
                    }
                } else {
                    warn!(task = %task.id, code, "bash task exited nonzero");
                    TaskOutcome::Failure {
                        errno: code,
                        out,
                        err,
                    }
                }
            }
            Err(e) => {
                let err_text = format!("waiting on {:?}: {e}", tokens[0]);
                TaskOutcome::Failure {
                    errno: errno_for(&err_text),
                    out,
                    err: err_text,
                }
            }
        }
    }

    /// Heartbeat the claimed row and flush output buffers until aborted.
    fn spawn_heartbeat(
        &self,
        id: String,
        buffers: Arc<Mutex<(String, String)>>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let timeout = self.config.scheduler.heartbeat_timeout;
        let interval = Duration::from_secs_f64((timeout / 4.0).max(0.1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (out, err) = {
                    let guard = buffers.lock().expect("buffer lock poisoned");
                    (guard.0.clone(), guard.1.clone())
                };
                if !out.is_empty() || !err.is_empty() {
                    let _ = queue.push_output(&id, &out, &err).await;
                }
                if queue.heartbeat(&id).await.is_err() {
                    // Row left RUNNING under us (kill or sweep); stop.
                    break;
                }
            }
        })
    }
}

fn token_to_string(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
