//! # desipipe
//!
//! A persistent, DAG-aware task scheduler for scientific batch pipelines.
//!
//! Declare computational units ("apps"), submit invocations of them
//! ("tasks") with dependencies expressed by passing one task's future as an
//! argument to another, and let a spawn loop distribute ready tasks across
//! a pool of workers, locally or on a batch system. Tasks, their states,
//! inputs, outputs, and captured streams persist in a SQLite-backed queue,
//! so pipelines survive process death and re-runs reuse prior results by
//! content identity.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use desipipe::{AppSpec, Queue, SpawnOptions, Spawner, TaskManager, TmConfig};
//! use serde_json::json;
//!
//! let queue = Queue::open_or_create(&dir, "pipeline").await?;
//! let tm = TaskManager::new(queue.clone(), TmConfig::default());
//!
//! let double = tm.func_app(AppSpec::new("double", "x * 2"), |input| async move {
//!     Ok(json!(input.arg(0).as_i64().unwrap_or(0) * 2))
//! });
//!
//! let fut = double.call(vec![json!(21)]).await?;
//! let mut spawner = Spawner::new(queue, tm.registry().clone(), SpawnOptions::default());
//! spawner.run_until_drained().await?;
//! assert_eq!(fut.result::<i64>().await?, 42);
//! ```

pub mod app;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod ident;
pub mod logging;
pub mod manager;
pub mod provider;
pub mod queue;
pub mod spawn;
pub mod state;
pub mod task;
pub mod worker;

pub use app::{App, AppExec, AppRegistry, AppSpec, ReusePolicy, TaskInput};
pub use config::{EnvironmentSpec, ProviderSpec, SchedulerSpec, TmConfig};
pub use error::{errno, errno_for, QueueError, TaskFailure};
pub use manager::TaskManager;
pub use provider::{provider_for, BatchProvider, LocalProvider, Provider};
pub use queue::{list_queues, ClaimFilter, Queue, TaskOutcome};
pub use spawn::{SpawnOptions, Spawner, TickReport};
pub use state::{QueueState, TaskState};
pub use task::{TaskFuture, TaskKind, TaskRow};
pub use worker::Worker;
