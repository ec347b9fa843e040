//! Durable queue store: one SQLite file per queue.
//!
//! The store is the only synchronization primitive in the system. All
//! mutations run inside short transactions; concurrent readers and writers
//! across processes serialize through SQLite's WAL journal and busy timeout.
//! A `Queue` is a handle over a file; two handles to the same file must
//! coordinate only via the store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{errno, QueueError};
use crate::state::{QueueState, TaskState};
use crate::task::{now_secs, TaskKind, TaskRow};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    app_name TEXT NOT NULL,
    app_hash TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'FUNC',
    args BLOB NOT NULL,
    kwargs BLOB NOT NULL,
    deps TEXT NOT NULL DEFAULT '[]',
    state TEXT NOT NULL,
    result BLOB,
    errno INTEGER NOT NULL DEFAULT 0,
    out TEXT NOT NULL DEFAULT '',
    err TEXT NOT NULL DEFAULT '',
    jobid TEXT,
    tm_config BLOB NOT NULL,
    tm_digest TEXT NOT NULL,
    t_created REAL NOT NULL,
    t_started REAL,
    t_finished REAL,
    t_heartbeat REAL
);

CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
CREATE INDEX IF NOT EXISTS idx_tasks_app_state ON tasks(app_name, state);
CREATE INDEX IF NOT EXISTS idx_tasks_digest_state ON tasks(tm_digest, state);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SCHEMA_VERSION: &str = "1";

const TASK_COLUMNS: &str = "id, app_name, app_hash, kind, args, kwargs, deps, state, result, \
     errno, out, err, jobid, tm_config, tm_digest, t_created, t_started, t_finished, t_heartbeat";

/// Filter for [`Queue::claim`]: which tasks a worker may take.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Restrict to these app names. `None` means any.
    pub app_names: Option<Vec<String>>,
    /// Restrict to these execution kinds (a registry-less worker can only
    /// run bash tasks).
    pub kinds: Option<Vec<TaskKind>>,
    /// Restrict to tasks stamped with this TaskManager config digest.
    pub tm_digest: Option<String>,
}

/// How a finished task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success {
        result: Vec<u8>,
        out: String,
        err: String,
    },
    Failure {
        errno: i32,
        out: String,
        err: String,
    },
}

/// Handle over one queue file.
#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    path: PathBuf,
    pool: SqlitePool,
}

impl Queue {
    /// Open a queue, creating the file and schema when missing.
    pub async fn open_or_create(base_dir: &Path, name: &str) -> Result<Self, QueueError> {
        let path = queue_path(base_dir, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Corrupt(format!("creating {parent:?}: {e}")))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let queue = Self {
            name: name.to_string(),
            path,
            pool,
        };
        queue.migrate().await?;
        Ok(queue)
    }

    /// Open an existing queue; error when the file does not exist.
    pub async fn open(base_dir: &Path, name: &str) -> Result<Self, QueueError> {
        let path = queue_path(base_dir, name);
        if !path.exists() {
            return Err(QueueError::QueueNotFound(name.to_string()));
        }
        Self::open_or_create(base_dir, name).await
    }

    /// In-memory queue for tests. Single connection: each SQLite `:memory:`
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(":memory:").map_err(QueueError::Store)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let queue = Self {
            name: "memory".to_string(),
            path: PathBuf::from(":memory:"),
            pool,
        };
        queue.migrate().await?;
        Ok(queue)
    }

    async fn migrate(&self) -> Result<(), QueueError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('state', ?)")
            .bind(QueueState::Active.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('version', ?)")
            .bind(SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ACTIVE or PAUSED.
    pub async fn state(&self) -> Result<QueueState, QueueError> {
        let value: String = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'state'")
            .fetch_one(&self.pool)
            .await?;
        value.parse()
    }

    /// Stop handing out new claims. In-flight tasks continue.
    pub async fn pause(&self) -> Result<(), QueueError> {
        self.set_state(QueueState::Paused).await
    }

    /// Resume handing out claims.
    pub async fn resume(&self) -> Result<(), QueueError> {
        self.set_state(QueueState::Active).await
    }

    async fn set_state(&self, state: QueueState) -> Result<(), QueueError> {
        sqlx::query("UPDATE meta SET value = ? WHERE key = 'state'")
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total number of task rows.
    pub async fn size(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Task counts per state.
    pub async fn counts(&self) -> Result<BTreeMap<String, u64>, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(s, n)| (s, n as u64)).collect())
    }

    /// Fetch one task by id.
    pub async fn get(&self, id: &str) -> Result<Option<TaskRow>, QueueError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| to_task(&r)).transpose()
    }

    /// Dump tasks, optionally filtered by state, FIFO by creation time.
    pub async fn tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRow>, QueueError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ? ORDER BY t_created, id"
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY t_created, id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(to_task).collect()
    }

    /// Insert a new task or update an existing row by id.
    ///
    /// Transitions must obey the state lattice; returns the prior state when
    /// the row existed. New rows are checked for dangling or cyclic deps.
    pub async fn upsert(&self, task: &TaskRow) -> Result<Option<TaskState>, QueueError> {
        let prior = self.get(&task.id).await?;
        match &prior {
            Some(existing) => {
                existing.state.check_transition(task.state)?;
            }
            None => {
                self.check_graph(task).await?;
            }
        }
        let deps_json = serde_json::to_string(&task.deps)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, app_name, app_hash, kind, args, kwargs, deps, state, result,
                               errno, out, err, jobid, tm_config, tm_digest,
                               t_created, t_started, t_finished, t_heartbeat)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                app_name = excluded.app_name,
                app_hash = excluded.app_hash,
                kind = excluded.kind,
                args = excluded.args,
                kwargs = excluded.kwargs,
                deps = excluded.deps,
                state = excluded.state,
                result = excluded.result,
                errno = excluded.errno,
                out = excluded.out,
                err = excluded.err,
                jobid = excluded.jobid,
                tm_config = excluded.tm_config,
                tm_digest = excluded.tm_digest,
                t_started = excluded.t_started,
                t_finished = excluded.t_finished,
                t_heartbeat = excluded.t_heartbeat
            "#,
        )
        .bind(&task.id)
        .bind(&task.app_name)
        .bind(&task.app_hash)
        .bind(task.kind.as_str())
        .bind(&task.args)
        .bind(&task.kwargs)
        .bind(&deps_json)
        .bind(task.state.as_str())
        .bind(&task.result)
        .bind(task.errno)
        .bind(&task.out)
        .bind(&task.err)
        .bind(&task.jobid)
        .bind(&task.tm_config)
        .bind(&task.tm_digest)
        .bind(task.t_created)
        .bind(task.t_started)
        .bind(task.t_finished)
        .bind(task.t_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(prior.map(|p| p.state))
    }

    /// Verify every dep of a new row exists, and that linking them cannot
    /// close a cycle through the new id.
    async fn check_graph(&self, task: &TaskRow) -> Result<(), QueueError> {
        let mut frontier: VecDeque<String> = task.deps.iter().cloned().collect();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(dep) = frontier.pop_front() {
            if dep == task.id {
                return Err(QueueError::InvalidGraph(task.id.clone()));
            }
            if !seen.insert(dep.clone()) {
                continue;
            }
            let row = self
                .get(&dep)
                .await?
                .ok_or_else(|| QueueError::NotFound(dep.clone()))?;
            frontier.extend(row.deps);
        }
        Ok(())
    }

    /// Atomically take one PENDING task matching `filter`, moving it to
    /// RUNNING and stamping `jobid`, `t_started`, `t_heartbeat`.
    ///
    /// Only one claimant wins; losing a race returns `None`. A paused queue
    /// hands out nothing.
    pub async fn claim(
        &self,
        filter: &ClaimFilter,
        jobid: &str,
    ) -> Result<Option<TaskRow>, QueueError> {
        if self.state().await? == QueueState::Paused {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let mut select = format!(
            "SELECT id FROM tasks WHERE state = '{}'",
            TaskState::Pending.as_str()
        );
        let mut binds: Vec<String> = Vec::new();
        if let Some(names) = &filter.app_names {
            if names.is_empty() {
                tx.commit().await?;
                return Ok(None);
            }
            let placeholders = vec!["?"; names.len()].join(",");
            select.push_str(&format!(" AND app_name IN ({placeholders})"));
            binds.extend(names.iter().cloned());
        }
        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                tx.commit().await?;
                return Ok(None);
            }
            let placeholders = vec!["?"; kinds.len()].join(",");
            select.push_str(&format!(" AND kind IN ({placeholders})"));
            binds.extend(kinds.iter().map(|k| k.as_str().to_string()));
        }
        if let Some(digest) = &filter.tm_digest {
            select.push_str(" AND tm_digest = ?");
            binds.push(digest.clone());
        }
        select.push_str(" ORDER BY t_created, id LIMIT 1");

        let mut query = sqlx::query_scalar::<_, String>(&select);
        for bind in &binds {
            query = query.bind(bind);
        }
        let id: Option<String> = query.fetch_optional(&mut *tx).await?;

        let Some(id) = id else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = now_secs();
        // Re-check the state inside the transaction: the compare-and-set
        // that makes execution at-most-once.
        let updated = sqlx::query(
            "UPDATE tasks SET state = ?, jobid = ?, t_started = ?, t_heartbeat = ? \
             WHERE id = ? AND state = ?",
        )
        .bind(TaskState::Running.as_str())
        .bind(jobid)
        .bind(now)
        .bind(now)
        .bind(&id)
        .bind(TaskState::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(task = %id, jobid = %jobid, "claimed");
        Ok(Some(to_task(&row)?))
    }

    /// Advance a RUNNING task's heartbeat.
    pub async fn heartbeat(&self, id: &str) -> Result<(), QueueError> {
        let updated = sqlx::query("UPDATE tasks SET t_heartbeat = ? WHERE id = ? AND state = ?")
            .bind(now_secs())
            .bind(id)
            .bind(TaskState::Running.as_str())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            let state = self.state_of(id).await?;
            return Err(QueueError::InvalidTransition {
                from: state,
                to: TaskState::Running,
            });
        }
        Ok(())
    }

    /// Flush captured stdout/stderr for a RUNNING task. Guarded on state so
    /// a late flush never clobbers a finalized row.
    pub async fn push_output(&self, id: &str, out: &str, err: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE tasks SET out = ?, err = ? WHERE id = ? AND state = ?")
            .bind(out)
            .bind(err)
            .bind(id)
            .bind(TaskState::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition RUNNING -> SUCCEEDED or RUNNING -> FAILED, writing blobs.
    pub async fn finish(&self, id: &str, outcome: TaskOutcome) -> Result<(), QueueError> {
        let (state, result, errno, out, err) = match outcome {
            TaskOutcome::Success { result, out, err } => {
                (TaskState::Succeeded, Some(result), 0, out, err)
            }
            TaskOutcome::Failure { errno, out, err } => (TaskState::Failed, None, errno, out, err),
        };
        let updated = sqlx::query(
            "UPDATE tasks SET state = ?, result = ?, errno = ?, out = ?, err = ?, \
             t_finished = ? WHERE id = ? AND state = ?",
        )
        .bind(state.as_str())
        .bind(&result)
        .bind(errno)
        .bind(&out)
        .bind(&err)
        .bind(now_secs())
        .bind(id)
        .bind(TaskState::Running.as_str())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            let from = self.state_of(id).await?;
            return Err(QueueError::InvalidTransition { from, to: state });
        }
        Ok(())
    }

    /// Mark every transitive dependent of `id` as FAILED(DEPENDENCY_FAILED).
    pub async fn cascade_failure(&self, id: &str) -> Result<Vec<String>, QueueError> {
        let open = self.tasks_in(&[TaskState::Waiting, TaskState::Pending]).await?;
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &open {
            for dep in &task.deps {
                dependents.entry(dep.as_str()).or_default().push(&task.id);
            }
        }

        let mut frontier: VecDeque<&str> = VecDeque::from([id]);
        let mut doomed: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = frontier.pop_front() {
            for &dependent in dependents.get(current).into_iter().flatten() {
                if seen.insert(dependent) {
                    doomed.push(dependent.to_string());
                    frontier.push_back(dependent);
                }
            }
        }

        for task_id in &doomed {
            sqlx::query(
                "UPDATE tasks SET state = ?, errno = ?, err = ?, t_finished = ? \
                 WHERE id = ? AND state IN (?, ?)",
            )
            .bind(TaskState::Failed.as_str())
            .bind(errno::DEPENDENCY_FAILED)
            .bind(format!("dependency {id} failed"))
            .bind(now_secs())
            .bind(task_id)
            .bind(TaskState::Waiting.as_str())
            .bind(TaskState::Pending.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(doomed)
    }

    /// Promote WAITING tasks whose deps have all SUCCEEDED to PENDING, and
    /// cascade failures from deps that ended FAILED or KILLED.
    ///
    /// Returns the ids promoted. Loops to a fixpoint so a whole chain of
    /// doomed dependents resolves within one call.
    pub async fn scan_ready(&self) -> Result<Vec<String>, QueueError> {
        let mut promoted = Vec::new();
        loop {
            let waiting = self.tasks_in(&[TaskState::Waiting]).await?;
            if waiting.is_empty() {
                break;
            }

            // One state lookup for every dep referenced this round.
            let mut dep_ids: HashSet<&str> = HashSet::new();
            for task in &waiting {
                dep_ids.extend(task.deps.iter().map(String::as_str));
            }
            let mut dep_states: HashMap<String, TaskState> = HashMap::new();
            for dep in &dep_ids {
                let state = self
                    .get(dep)
                    .await?
                    .map(|r| r.state)
                    .ok_or_else(|| QueueError::Corrupt(format!("dangling dependency {dep}")))?;
                dep_states.insert((*dep).to_string(), state);
            }

            let mut changed = false;
            for task in &waiting {
                let mut ready = true;
                let mut failed_dep: Option<&str> = None;
                for dep in &task.deps {
                    match dep_states[dep.as_str()] {
                        TaskState::Succeeded => {}
                        TaskState::Failed | TaskState::Killed => {
                            failed_dep = Some(dep);
                            break;
                        }
                        _ => ready = false,
                    }
                }
                if let Some(dep) = failed_dep {
                    self.cascade_failure(dep).await?;
                    changed = true;
                } else if ready {
                    let updated = sqlx::query(
                        "UPDATE tasks SET state = ? WHERE id = ? AND state = ?",
                    )
                    .bind(TaskState::Pending.as_str())
                    .bind(&task.id)
                    .bind(TaskState::Waiting.as_str())
                    .execute(&self.pool)
                    .await?;
                    if updated.rows_affected() > 0 {
                        promoted.push(task.id.clone());
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        Ok(promoted)
    }

    /// Reclassify RUNNING tasks whose heartbeat is older than `timeout`
    /// seconds as UNKNOWN. Optionally restricted to one tm-config digest.
    pub async fn sweep_stale(
        &self,
        timeout: f64,
        digest: Option<&str>,
    ) -> Result<Vec<String>, QueueError> {
        let cutoff = now_secs() - timeout;
        let mut sql = "SELECT id FROM tasks WHERE state = ? \
             AND (t_heartbeat IS NULL OR t_heartbeat < ?)"
            .to_string();
        if digest.is_some() {
            sql.push_str(" AND tm_digest = ?");
        }
        let mut query = sqlx::query_scalar::<_, String>(&sql)
            .bind(TaskState::Running.as_str())
            .bind(cutoff);
        if let Some(digest) = digest {
            query = query.bind(digest);
        }
        let stale: Vec<String> = query.fetch_all(&self.pool).await?;

        for id in &stale {
            warn!(task = %id, "heartbeat expired, marking UNKNOWN");
            sqlx::query("UPDATE tasks SET state = ?, errno = ? WHERE id = ? AND state = ?")
                .bind(TaskState::Unknown.as_str())
                .bind(errno::LOST)
                .bind(id)
                .bind(TaskState::Running.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(stale)
    }

    /// Bulk-transition tasks in the given states back for re-execution,
    /// clearing result, errno, output, and worker stamps. Tasks with
    /// dependencies return to WAITING (the next scan re-checks readiness);
    /// dependency-free tasks go straight to PENDING.
    ///
    /// RUNNING rows are never touched: retrying a task another process is
    /// executing is a warning no-op.
    pub async fn retry(&self, states: &[TaskState]) -> Result<u64, QueueError> {
        let mut total = 0u64;
        for state in states {
            if *state == TaskState::Running {
                let running: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE state = ?")
                        .bind(TaskState::Running.as_str())
                        .fetch_one(&self.pool)
                        .await?;
                warn!(count = running, "retry skips RUNNING tasks");
                continue;
            }
            let updated = sqlx::query(
                "UPDATE tasks SET state = CASE WHEN deps = '[]' THEN ? ELSE ? END, \
                 result = NULL, errno = 0, out = '', err = '', \
                 jobid = NULL, t_started = NULL, t_finished = NULL, t_heartbeat = NULL \
                 WHERE state = ?",
            )
            .bind(TaskState::Pending.as_str())
            .bind(TaskState::Waiting.as_str())
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
            total += updated.rows_affected();
        }
        Ok(total)
    }

    /// Mark every non-terminal task KILLED. Idempotent on terminal rows.
    pub async fn kill(&self) -> Result<u64, QueueError> {
        let updated = sqlx::query(
            "UPDATE tasks SET state = ?, errno = ?, t_finished = ? \
             WHERE state NOT IN (?, ?, ?)",
        )
        .bind(TaskState::Killed.as_str())
        .bind(errno::KILLED)
        .bind(now_secs())
        .bind(TaskState::Succeeded.as_str())
        .bind(TaskState::Failed.as_str())
        .bind(TaskState::Killed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    /// Distinct TaskManager config digests among PENDING tasks, with their
    /// pending counts and one representative config blob each.
    pub async fn pending_configs(&self) -> Result<Vec<(String, u64, Vec<u8>)>, QueueError> {
        let rows: Vec<(String, i64, Vec<u8>)> = sqlx::query_as(
            "SELECT tm_digest, COUNT(*), MIN(tm_config) FROM tasks \
             WHERE state = ? GROUP BY tm_digest",
        )
        .bind(TaskState::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(digest, count, config)| (digest, count as u64, config))
            .collect())
    }

    /// Distinct TaskManager config digests among tasks in the given states,
    /// with one representative config blob each.
    pub async fn configs_in(
        &self,
        states: &[TaskState],
    ) -> Result<Vec<(String, Vec<u8>)>, QueueError> {
        let placeholders = vec!["?"; states.len()].join(",");
        let sql = format!(
            "SELECT tm_digest, MIN(tm_config) FROM tasks \
             WHERE state IN ({placeholders}) GROUP BY tm_digest"
        );
        let mut query = sqlx::query_as::<_, (String, Vec<u8>)>(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Resolve UNKNOWN tasks of one config per the provider's timeout
    /// policy: terminal KILLED, or back to PENDING for idempotent work.
    pub async fn resolve_unknown(
        &self,
        ids: &[String],
        killed_at_timeout: bool,
    ) -> Result<(), QueueError> {
        for id in ids {
            if killed_at_timeout {
                sqlx::query(
                    "UPDATE tasks SET state = ?, errno = ?, t_finished = ? \
                     WHERE id = ? AND state = ?",
                )
                .bind(TaskState::Killed.as_str())
                .bind(errno::KILLED)
                .bind(now_secs())
                .bind(id)
                .bind(TaskState::Unknown.as_str())
                .execute(&self.pool)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE tasks SET state = ?, errno = 0, jobid = NULL, t_started = NULL, \
                     t_heartbeat = NULL WHERE id = ? AND state = ?",
                )
                .bind(TaskState::Pending.as_str())
                .bind(id)
                .bind(TaskState::Unknown.as_str())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Number of RUNNING tasks, optionally for one config digest.
    pub async fn running_count(&self, digest: Option<&str>) -> Result<u64, QueueError> {
        let count: i64 = match digest {
            Some(digest) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM tasks WHERE state = ? AND tm_digest = ?",
                )
                .bind(TaskState::Running.as_str())
                .bind(digest)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE state = ?")
                    .bind(TaskState::Running.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    /// Find a prior task with the same app name and argument blobs,
    /// regardless of source hash. Used by the name-based reuse policy.
    pub async fn find_reusable(
        &self,
        app_name: &str,
        args: &[u8],
        kwargs: &[u8],
        state: Option<TaskState>,
    ) -> Result<Option<TaskRow>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE app_name = ? ORDER BY t_created, id"
        ))
        .bind(app_name)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let task = to_task(row)?;
            if task.args == args && task.kwargs == kwargs {
                match state {
                    Some(wanted) if task.state != wanted => continue,
                    _ => return Ok(Some(task)),
                }
            }
        }
        Ok(None)
    }

    /// Re-queue one task for execution, clearing its prior outcome. Used
    /// when a user resubmits a task whose previous run ended failed.
    pub async fn requeue(&self, id: &str) -> Result<(), QueueError> {
        let task = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let state = if task.deps.is_empty() {
            TaskState::Pending
        } else {
            TaskState::Waiting
        };
        sqlx::query(
            "UPDATE tasks SET state = ?, result = NULL, errno = 0, out = '', err = '', \
             jobid = NULL, t_started = NULL, t_finished = NULL, t_heartbeat = NULL \
             WHERE id = ? AND state != ?",
        )
        .bind(state.as_str())
        .bind(id)
        .bind(TaskState::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the queue file. Refuses without `force` when tasks exist.
    pub async fn delete(self, force: bool) -> Result<(), QueueError> {
        if !force && self.size().await? > 0 {
            return Err(QueueError::Corrupt(format!(
                "queue {} is not empty; pass force to delete",
                self.name
            )));
        }
        let path = self.path.clone();
        self.pool.close().await;
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| QueueError::Corrupt(format!("removing {path:?}: {e}")))?;
            // WAL sidecar files.
            for suffix in ["-wal", "-shm"] {
                let side = PathBuf::from(format!("{}{suffix}", path.display()));
                let _ = std::fs::remove_file(side);
            }
        }
        Ok(())
    }

    async fn tasks_in(&self, states: &[TaskState]) -> Result<Vec<TaskRow>, QueueError> {
        let placeholders = vec!["?"; states.len()].join(",");
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE state IN ({placeholders}) \
             ORDER BY t_created, id"
        );
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(to_task).collect()
    }

    async fn state_of(&self, id: &str) -> Result<TaskState, QueueError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        state
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?
            .parse()
    }
}

fn to_task(row: &SqliteRow) -> Result<TaskRow, QueueError> {
    let state: String = row.try_get("state")?;
    let kind: String = row.try_get("kind")?;
    let deps: String = row.try_get("deps")?;
    Ok(TaskRow {
        id: row.try_get("id")?,
        app_name: row.try_get("app_name")?,
        app_hash: row.try_get("app_hash")?,
        kind: kind.parse()?,
        args: row.try_get("args")?,
        kwargs: row.try_get("kwargs")?,
        deps: serde_json::from_str(&deps)?,
        state: state.parse()?,
        result: row.try_get("result")?,
        errno: row.try_get("errno")?,
        out: row.try_get("out")?,
        err: row.try_get("err")?,
        jobid: row.try_get("jobid")?,
        tm_config: row.try_get("tm_config")?,
        tm_digest: row.try_get("tm_digest")?,
        t_created: row.try_get("t_created")?,
        t_started: row.try_get("t_started")?,
        t_finished: row.try_get("t_finished")?,
        t_heartbeat: row.try_get("t_heartbeat")?,
    })
}

fn queue_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{name}.sqlite"))
}

/// Queue names under `base_dir` matching a shell-style glob (`*` and `?`).
pub fn list_queues(base_dir: &Path, pattern: &str) -> Result<Vec<String>, QueueError> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(names),
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(name) = file_name.strip_suffix(".sqlite") {
            if glob_match(pattern, name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Minimal shell-style matcher: `*` any run, `?` any one char.
fn glob_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = name.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
