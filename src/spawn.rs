//! The spawn loop: converts PENDING tasks into running workers.
//!
//! Runs in its own process. It never executes user code; it sweeps lost
//! workers, promotes ready tasks, and asks providers for workers. Crash-safe
//! by construction: restarting simply re-scans the store, and RUNNING tasks
//! heartbeated by surviving workers stay RUNNING.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::AppRegistry;
use crate::codec;
use crate::config::{ProviderSpec, TmConfig};
use crate::error::QueueError;
use crate::provider::{provider_for, Provider};
use crate::queue::Queue;
use crate::state::{QueueState, TaskState};

/// Knobs for [`Spawner::run`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Seconds between scans. Overrides every config's own timestep when
    /// set (the CLI's `--timestep`).
    pub timestep: Option<f64>,
    /// Seconds a paused queue with no live workers survives before exit.
    pub idle_grace: f64,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            timestep: None,
            idle_grace: 60.0,
        }
    }
}

/// What one scan did; returned by [`Spawner::tick`] for observability and
/// tests.
#[derive(Debug, Default)]
pub struct TickReport {
    pub swept: usize,
    pub promoted: usize,
    pub launched: usize,
    pub killed_back: usize,
}

/// The scheduler. Holds one provider per distinct TaskManager config seen
/// in the queue, keyed by config digest.
pub struct Spawner {
    queue: Queue,
    registry: AppRegistry,
    options: SpawnOptions,
    providers: HashMap<String, Arc<dyn Provider>>,
    configs: HashMap<String, TmConfig>,
    paused_since: Option<Instant>,
}

impl Spawner {
    pub fn new(queue: Queue, registry: AppRegistry, options: SpawnOptions) -> Self {
        Self {
            queue,
            registry,
            options,
            providers: HashMap::new(),
            configs: HashMap::new(),
            paused_since: None,
        }
    }

    /// Scan forever, sleeping `timestep` between scans. Exits when the
    /// queue has been paused for longer than `idle_grace` with no live
    /// workers, or on a store-layer error.
    pub async fn run(&mut self) -> Result<(), QueueError> {
        info!(queue = %self.queue.name(), "spawn loop started");
        loop {
            let report = self.tick().await?;
            debug!(
                swept = report.swept,
                promoted = report.promoted,
                launched = report.launched,
                "scan complete"
            );
            if self.should_exit().await? {
                info!(queue = %self.queue.name(), "queue paused and idle, spawn loop exiting");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs_f64(self.timestep())).await;
        }
    }

    /// Scan until every task is settled (terminal or UNKNOWN) and all
    /// workers have drained. Convenience for batch pipelines and tests.
    pub async fn run_until_drained(&mut self) -> Result<(), QueueError> {
        loop {
            self.tick().await?;
            let counts = self.queue.counts().await?;
            let open: u64 = [TaskState::Waiting, TaskState::Pending, TaskState::Running]
                .iter()
                .filter_map(|s| counts.get(s.as_str()))
                .sum();
            if open == 0 && self.live_workers().await? == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs_f64(self.timestep())).await;
        }
    }

    /// One scan: sweep stale workers, promote ready tasks, reconcile
    /// worker counts per TaskManager config.
    pub async fn tick(&mut self) -> Result<TickReport, QueueError> {
        let mut report = TickReport::default();
        self.refresh_configs().await?;

        // 1. Reclassify lost workers, then apply each provider's timeout
        // policy to what the sweep found.
        for (digest, config) in self.configs.clone() {
            let swept = self
                .queue
                .sweep_stale(config.scheduler.heartbeat_timeout, Some(&digest))
                .await?;
            report.swept += swept.len();
            if !swept.is_empty() {
                if let ProviderSpec::Batch {
                    killed_at_timeout, ..
                } = &config.provider
                {
                    self.queue
                        .resolve_unknown(&swept, *killed_at_timeout)
                        .await?;
                }
            }
        }

        // 2. Promote WAITING -> PENDING and cascade failed dependencies.
        report.promoted = self.queue.scan_ready().await?.len();

        // 3. A paused queue launches nothing; in-flight work continues.
        if self.queue.state().await? == QueueState::Paused {
            return Ok(report);
        }

        // 4. Reconcile worker counts per config.
        for (digest, pending, _blob) in self.queue.pending_configs().await? {
            let Some(config) = self.configs.get(&digest).cloned() else {
                continue;
            };
            let provider = self.provider(&digest, &config);
            let live = provider.live_workers().await?;
            let queued: usize = provider
                .pending_jobs()
                .await?
                .iter()
                .map(|(_, n)| n)
                .sum();
            let target = (pending as usize).min(config.scheduler.max_workers);
            let have = live + queued;

            if have < target {
                let launched = self
                    .launch_batched(provider.as_ref(), target - have, &config)
                    .await?;
                report.launched += launched;
            } else if have > target && queued > 0 {
                // The provider queue holds more submissions than there is
                // work left; shed the newest pending jobs.
                report.killed_back += self
                    .kill_back(provider.as_ref(), have - target)
                    .await?;
            }
        }
        Ok(report)
    }

    /// Launch `desired` workers in batches minimizing the provider's cost,
    /// then wait for the provider's job list to reflect the launch.
    async fn launch_batched(
        &self,
        provider: &dyn Provider,
        desired: usize,
        config: &TmConfig,
    ) -> Result<usize, QueueError> {
        let before = provider.jobids().await?;
        let mut spawned = 0usize;
        while spawned < desired {
            let remaining = desired - spawned;
            let mut best_workers = 0usize;
            let mut best_cost = f64::INFINITY;
            for n in 1..=remaining {
                let cost = provider.cost(n);
                if cost <= best_cost {
                    best_workers = n;
                    best_cost = cost;
                }
            }
            if best_workers == 0 {
                break;
            }
            provider.launch(best_workers).await?;
            spawned += best_workers;
        }

        if spawned > 0 {
            // The job list must eventually reflect what we launched;
            // a provider that never refreshes is broken and respawning
            // against it would over-submit.
            let deadline =
                Instant::now() + Duration::from_secs_f64(config.scheduler.refresh_timeout);
            loop {
                if provider.jobids().await? != before {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(QueueError::Provider(format!(
                        "provider job list unchanged {}s after launching {spawned} workers",
                        config.scheduler.refresh_timeout
                    )));
                }
                tokio::time::sleep(Duration::from_secs_f64(self.timestep().min(1.0))).await;
            }
        }
        Ok(spawned)
    }

    /// Cancel the newest pending submissions until at most `excess` worker
    /// slots are shed.
    async fn kill_back(
        &self,
        provider: &dyn Provider,
        excess: usize,
    ) -> Result<usize, QueueError> {
        let pending = provider.pending_jobs().await?;
        let mut to_kill = Vec::new();
        let mut shed = 0usize;
        for (jobid, nworkers) in pending.into_iter().rev() {
            if shed + nworkers <= excess {
                to_kill.push(jobid);
                shed += nworkers;
            }
        }
        if !to_kill.is_empty() {
            warn!(count = to_kill.len(), "cancelling excess pending jobs");
            provider.kill(&to_kill).await?;
        }
        Ok(shed)
    }

    /// Rebuild the digest -> config map from every task that could still
    /// need scheduling attention.
    async fn refresh_configs(&mut self) -> Result<(), QueueError> {
        let states = [
            TaskState::Waiting,
            TaskState::Pending,
            TaskState::Running,
            TaskState::Unknown,
        ];
        for (digest, blob) in self.queue.configs_in(&states).await? {
            if !self.configs.contains_key(&digest) {
                match codec::decode::<TmConfig>(&blob) {
                    Ok(config) => {
                        self.configs.insert(digest, config);
                    }
                    Err(e) => {
                        warn!(digest = %digest, error = %e, "undecodable tm_config, skipping");
                    }
                }
            }
        }
        Ok(())
    }

    fn provider(&mut self, digest: &str, config: &TmConfig) -> Arc<dyn Provider> {
        self.providers
            .entry(digest.to_string())
            .or_insert_with(|| {
                provider_for(config, self.queue.clone(), self.registry.clone())
            })
            .clone()
    }

    async fn live_workers(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for provider in self.providers.values() {
            total += provider.live_workers().await?;
        }
        Ok(total)
    }

    fn timestep(&self) -> f64 {
        if let Some(step) = self.options.timestep {
            return step;
        }
        self.configs
            .values()
            .map(|c| c.scheduler.timestep)
            .fold(f64::INFINITY, f64::min)
            .min(2.0)
    }

    async fn should_exit(&mut self) -> Result<bool, QueueError> {
        if self.queue.state().await? == QueueState::Paused {
            let since = *self.paused_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= Duration::from_secs_f64(self.options.idle_grace)
                && self.live_workers().await? == 0
            {
                return Ok(true);
            }
        } else {
            self.paused_since = None;
        }
        Ok(false)
    }
}
