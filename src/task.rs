//! Task row model and the future handle over it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec;
use crate::error::{errno, QueueError, TaskFailure};
use crate::queue::Queue;
use crate::state::TaskState;

/// Wall-clock now as unix seconds, matching the store's REAL columns.
pub(crate) fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// How an app's task executes: an in-process function, or a subprocess argv.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Func,
    Bash,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Func => "FUNC",
            TaskKind::Bash => "BASH",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FUNC" => Ok(TaskKind::Func),
            "BASH" => Ok(TaskKind::Bash),
            other => Err(QueueError::Corrupt(format!("unknown task kind {other:?}"))),
        }
    }
}

/// One task: a row in the queue store.
#[derive(Debug, Clone)]
pub struct TaskRow {
    /// 128-bit content hash, hex. Primary key.
    pub id: String,
    pub app_name: String,
    pub app_hash: String,
    pub kind: TaskKind,
    /// Serialized positional arguments. For bash tasks: the rendered argv
    /// token array, dep placeholders included.
    pub args: Vec<u8>,
    /// Serialized keyword arguments.
    pub kwargs: Vec<u8>,
    /// Ids of tasks referenced by placeholder arguments.
    pub deps: Vec<String>,
    pub state: TaskState,
    /// Present iff `state == Succeeded`.
    pub result: Option<Vec<u8>>,
    /// 0 iff succeeded.
    pub errno: i32,
    /// Captured stdout; mutated while running.
    pub out: String,
    /// Captured stderr / error chain.
    pub err: String,
    /// Provider-assigned worker identifier while claimed.
    pub jobid: Option<String>,
    /// Serialized [`crate::config::TmConfig`] of the owning TaskManager.
    pub tm_config: Vec<u8>,
    /// Digest of `tm_config`, for claim filtering.
    pub tm_digest: String,
    pub t_created: f64,
    pub t_started: Option<f64>,
    pub t_finished: Option<f64>,
    pub t_heartbeat: Option<f64>,
}

impl TaskRow {
    /// Decode the positional-arguments blob.
    pub fn args_value(&self) -> Result<Value, QueueError> {
        codec::decode(&self.args)
    }

    /// Decode the keyword-arguments blob.
    pub fn kwargs_value(&self) -> Result<Value, QueueError> {
        codec::decode(&self.kwargs)
    }
}

/// Poll interval bounds for [`TaskFuture::wait`]. Starts fast, backs off.
const POLL_MIN: Duration = Duration::from_millis(200);
const POLL_MAX: Duration = Duration::from_secs(2);

/// In-memory handle for awaiting a task's result.
///
/// A future is just `(id, queue)`; it survives nothing and promises nothing
/// beyond what the store says. Any process holding a handle to the same
/// queue file can await the same task.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    id: String,
    queue: Queue,
}

impl TaskFuture {
    pub(crate) fn new(id: String, queue: Queue) -> Self {
        Self { id, queue }
    }

    /// The task id this future refers to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Placeholder value for passing this future as an argument to another
    /// app; the worker substitutes the materialized result.
    pub fn arg(&self) -> Value {
        codec::dep_ref(&self.id)
    }

    /// Current state without blocking.
    pub async fn state(&self) -> Result<TaskState, QueueError> {
        Ok(self.row().await?.state)
    }

    /// Captured stdout so far (live while running).
    pub async fn out(&self) -> Result<String, QueueError> {
        Ok(self.row().await?.out)
    }

    /// Captured stderr / error text so far (live while running).
    pub async fn err(&self) -> Result<String, QueueError> {
        Ok(self.row().await?.err)
    }

    /// Block until the task reaches an outcome, then return the row.
    ///
    /// `Unknown` counts as an outcome here: a lost worker would otherwise
    /// leave callers hanging until an explicit retry.
    pub async fn wait(&self) -> Result<TaskRow, QueueError> {
        let mut interval = POLL_MIN;
        loop {
            let row = self.row().await?;
            if row.state.is_terminal() || row.state == TaskState::Unknown {
                return Ok(row);
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(POLL_MAX);
        }
    }

    /// Block until terminal and decode the result.
    ///
    /// Returns the deserialized `result_blob` on success; a
    /// [`TaskFailure`] carrying errno and captured error text otherwise.
    pub async fn result<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        let row = self.wait().await?;
        match row.state {
            TaskState::Succeeded => {
                let blob = row
                    .result
                    .ok_or_else(|| QueueError::Corrupt(format!("succeeded task {} has no result", row.id)))?;
                codec::decode(&blob)
            }
            state => {
                let errno = if row.errno != 0 { row.errno } else { errno::LOST };
                Err(TaskFailure {
                    id: row.id,
                    state,
                    errno,
                    err: row.err,
                }
                .into())
            }
        }
    }

    async fn row(&self) -> Result<TaskRow, QueueError> {
        self.queue
            .get(&self.id)
            .await?
            .ok_or_else(|| QueueError::NotFound(self.id.clone()))
    }
}
