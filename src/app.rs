//! App declaration and submission.
//!
//! An app is a registered computational unit: a name, the source text that
//! identifies its implementation, and an executor. Invoking an app with
//! concrete arguments persists a task row (or reuses a prior one, per the
//! reuse policy) and returns a [`TaskFuture`].
//!
//! There is no closure introspection: the source text is an explicit
//! contract supplied at registration, and it is what the identity hash
//! captures. Free variables the implementation closes over must be declared
//! on the [`AppSpec`] to count toward identity.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::codec;
use crate::config::TmConfig;
use crate::error::QueueError;
use crate::ident;
use crate::queue::Queue;
use crate::state::TaskState;
use crate::task::{now_secs, TaskFuture, TaskKind, TaskRow};

/// Positional and keyword arguments of one task invocation, with
/// dependency placeholders already materialized by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskInput {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional argument by index, `Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Null)
    }

    /// Keyword argument by name, `Null` when absent.
    pub fn kwarg(&self, name: &str) -> &Value {
        self.kwargs.get(name).unwrap_or(&Value::Null)
    }
}

/// Future type returned by func-app executors.
pub type FuncFuture = Pin<Box<dyn Future<Output = Result<Value, anyhow::Error>> + Send>>;

/// Executor for an app, dispatched by name at execution time.
#[derive(Clone)]
pub enum AppExec {
    /// In-process function: input to result value.
    Func(Arc<dyn Fn(TaskInput) -> FuncFuture + Send + Sync>),
    /// Token builder: input to argv, executed as a subprocess by the worker.
    Bash(Arc<dyn Fn(TaskInput) -> Result<Vec<Value>, anyhow::Error> + Send + Sync>),
}

/// Name-keyed executor registry shared by managers and workers.
///
/// Bash tasks persist their rendered argv, so a worker without the relevant
/// registry entry can still execute them; func tasks need the entry.
#[derive(Clone, Default)]
pub struct AppRegistry {
    inner: Arc<RwLock<HashMap<String, AppExec>>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, exec: AppExec) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), exec);
    }

    pub fn get(&self, name: &str) -> Option<AppExec> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Names of all registered apps.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// How a repeated declaration maps onto prior task rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReusePolicy {
    /// Identity covers the source: any implementation change yields a new
    /// id and a re-execution.
    #[default]
    Fresh,
    /// Calls are no-ops resolving immediately to null.
    Skip,
    /// Identity ignores the source; match prior tasks by app name and
    /// arguments, optionally only those in a given prior state.
    ByName {
        /// Match under this name instead of the app's own.
        name: Option<String>,
        /// Only reuse rows in this state; otherwise insert fresh.
        state: Option<TaskState>,
    },
}

/// Declaration of an app: identity inputs plus reuse policy.
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub name: String,
    pub source: String,
    pub free_vars: Value,
    pub reuse: ReusePolicy,
}

impl AppSpec {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            free_vars: Value::Object(Map::new()),
            reuse: ReusePolicy::Fresh,
        }
    }

    /// Declare the free variables the implementation closes over; they are
    /// hashed with the source.
    pub fn free_vars(mut self, vars: Value) -> Self {
        self.free_vars = vars;
        self
    }

    pub fn reuse(mut self, policy: ReusePolicy) -> Self {
        self.reuse = policy;
        self
    }
}

/// A declared app bound to a queue and TaskManager config. Calling it
/// persists tasks and returns futures.
#[derive(Clone)]
pub struct App {
    spec: AppSpec,
    kind: TaskKind,
    queue: Queue,
    config: TmConfig,
    registry: AppRegistry,
}

impl App {
    pub(crate) fn new(
        spec: AppSpec,
        kind: TaskKind,
        queue: Queue,
        config: TmConfig,
        registry: AppRegistry,
    ) -> Self {
        Self {
            spec,
            kind,
            queue,
            config,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Invoke with positional arguments only.
    pub async fn call(&self, args: Vec<Value>) -> Result<TaskFuture, QueueError> {
        self.call_with_kwargs(args, Map::new()).await
    }

    /// Invoke with positional and keyword arguments. Arguments may embed
    /// futures (via [`TaskFuture::arg`]); those become dependency edges.
    pub async fn call_with_kwargs(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<TaskFuture, QueueError> {
        let args_value = Value::Array(args.clone());
        let kwargs_value = Value::Object(kwargs.clone());

        if self.spec.reuse == ReusePolicy::Skip {
            return self.submit_skip(&args_value, &kwargs_value).await;
        }

        let mut deps = codec::collect_deps(&args_value);
        for dep in codec::collect_deps(&kwargs_value) {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        let id = ident::task_id(
            &self.spec.name,
            &self.spec.source,
            &self.spec.free_vars,
            &args_value,
            &kwargs_value,
        );

        let args_blob = codec::encode(&args_value)?;
        let kwargs_blob = codec::encode(&kwargs_value)?;

        // Name-based reuse: match a prior row by name and arguments,
        // ignoring the implementation hash.
        if let ReusePolicy::ByName { name, state } = &self.spec.reuse {
            let match_name = name.as_deref().unwrap_or(&self.spec.name);
            if let Some(prior) = self
                .queue
                .find_reusable(match_name, &args_blob, &kwargs_blob, *state)
                .await?
            {
                debug!(task = %prior.id, app = match_name, "reusing prior task by name");
                return Ok(TaskFuture::new(prior.id, self.queue.clone()));
            }
        } else if let Some(prior) = self.queue.get(&id).await? {
            // Default policy: reuse any prior row that has not failed.
            match prior.state {
                TaskState::Failed | TaskState::Killed => {
                    // The user resubmitted an identical task whose last run
                    // failed: re-queue it.
                    self.queue.requeue(&id).await?;
                }
                _ => {}
            }
            return Ok(TaskFuture::new(id, self.queue.clone()));
        }

        let row = self.build_row(id.clone(), deps, &args_value, &kwargs, kwargs_blob)?;
        self.queue.upsert(&row).await?;
        debug!(task = %id, app = %self.spec.name, state = %row.state, "submitted");
        Ok(TaskFuture::new(id, self.queue.clone()))
    }

    fn build_row(
        &self,
        id: String,
        deps: Vec<String>,
        args_value: &Value,
        kwargs: &Map<String, Value>,
        kwargs_blob: Vec<u8>,
    ) -> Result<TaskRow, QueueError> {
        // Bash apps render their argv at submit time so that any worker,
        // registry or not, can execute the row. Dep placeholders survive
        // rendering and are materialized by the worker.
        let args_blob = match self.kind {
            TaskKind::Func => codec::encode(args_value)?,
            TaskKind::Bash => {
                let exec = self
                    .registry
                    .get(&self.spec.name)
                    .ok_or_else(|| QueueError::UnknownApp(self.spec.name.clone()))?;
                let AppExec::Bash(builder) = exec else {
                    return Err(QueueError::UnknownApp(self.spec.name.clone()));
                };
                let input = TaskInput::new(
                    args_value.as_array().cloned().unwrap_or_default(),
                    kwargs.clone(),
                );
                let tokens = builder(input).map_err(|e| QueueError::Corrupt(e.to_string()))?;
                codec::encode(&tokens)?
            }
        };

        let state = if deps.is_empty() {
            TaskState::Pending
        } else {
            TaskState::Waiting
        };

        Ok(TaskRow {
            id,
            app_name: self.spec.name.clone(),
            app_hash: ident::app_hash(&self.spec.source, &self.spec.free_vars),
            kind: self.kind,
            args: args_blob,
            kwargs: kwargs_blob,
            deps,
            state,
            result: None,
            errno: 0,
            out: String::new(),
            err: String::new(),
            jobid: None,
            tm_config: codec::encode(&self.config)?,
            tm_digest: self.config.digest(),
            t_created: now_secs(),
            t_started: None,
            t_finished: None,
            t_heartbeat: None,
        })
    }

    /// A skipped call: persist at most a terminal SUCCEEDED marker whose
    /// result is null, and resolve immediately.
    async fn submit_skip(
        &self,
        args_value: &Value,
        kwargs_value: &Value,
    ) -> Result<TaskFuture, QueueError> {
        let id = ident::task_id(
            &self.spec.name,
            &self.spec.source,
            &self.spec.free_vars,
            args_value,
            kwargs_value,
        );
        if self.queue.get(&id).await?.is_none() {
            let now = now_secs();
            let row = TaskRow {
                id: id.clone(),
                app_name: self.spec.name.clone(),
                app_hash: ident::app_hash(&self.spec.source, &self.spec.free_vars),
                kind: self.kind,
                args: codec::encode(args_value)?,
                kwargs: codec::encode(kwargs_value)?,
                deps: Vec::new(),
                state: TaskState::Succeeded,
                result: Some(codec::encode(&Value::Null)?),
                errno: 0,
                out: String::new(),
                err: String::new(),
                jobid: None,
                tm_config: codec::encode(&self.config)?,
                tm_digest: self.config.digest(),
                t_created: now,
                t_started: None,
                t_finished: Some(now),
                t_heartbeat: None,
            };
            self.queue.upsert(&row).await?;
        }
        Ok(TaskFuture::new(id, self.queue.clone()))
    }
}
