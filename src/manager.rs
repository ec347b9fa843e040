//! TaskManager: the bundle of queue, configuration, and app registry used
//! when declaring and submitting tasks.

use std::future::Future;
use std::sync::Arc;

use crate::app::{App, AppExec, AppRegistry, AppSpec, TaskInput};
use crate::config::TmConfig;
use crate::queue::Queue;
use crate::task::TaskKind;

/// Owns what a submitting process needs: the queue handle, the environment,
/// scheduler and provider specs stamped onto every task, and the registry of
/// executors workers dispatch through.
///
/// Managers are cheap to clone; [`TaskManager::clone_with`] derives a
/// manager with overridden config sharing the same queue and registry.
#[derive(Clone)]
pub struct TaskManager {
    queue: Queue,
    config: TmConfig,
    registry: AppRegistry,
}

impl TaskManager {
    pub fn new(queue: Queue, config: TmConfig) -> Self {
        Self {
            queue,
            config,
            registry: AppRegistry::new(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn config(&self) -> &TmConfig {
        &self.config
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// An independent manager over the same queue and registry, with config
    /// overrides applied.
    pub fn clone_with(&self, overrides: impl FnOnce(&mut TmConfig)) -> Self {
        let mut config = self.config.clone();
        overrides(&mut config);
        Self {
            queue: self.queue.clone(),
            config,
            registry: self.registry.clone(),
        }
    }

    /// Declare an in-process app: an async function from [`TaskInput`] to a
    /// result value, executed by a worker holding this registry.
    pub fn func_app<F, Fut>(&self, spec: AppSpec, func: F) -> App
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, anyhow::Error>> + Send + 'static,
    {
        let func = Arc::new(func);
        self.registry.insert(
            &spec.name,
            AppExec::Func(Arc::new(move |input| {
                let func = func.clone();
                Box::pin(async move { func(input).await })
            })),
        );
        App::new(
            spec,
            TaskKind::Func,
            self.queue.clone(),
            self.config.clone(),
            self.registry.clone(),
        )
    }

    /// Declare a bash app: a function from [`TaskInput`] to command tokens.
    /// The tokens become `argv` of a subprocess; its exit status is the
    /// result and its stdout is captured as `out`.
    pub fn bash_app<F>(&self, spec: AppSpec, builder: F) -> App
    where
        F: Fn(TaskInput) -> Result<Vec<serde_json::Value>, anyhow::Error> + Send + Sync + 'static,
    {
        self.registry
            .insert(&spec.name, AppExec::Bash(Arc::new(builder)));
        App::new(
            spec,
            TaskKind::Bash,
            self.queue.clone(),
            self.config.clone(),
            self.registry.clone(),
        )
    }
}
