//! Tests for the queue store: state lattice, claims, sweeps, retry.

use desipipe::codec;
use desipipe::errno;
use desipipe::{ClaimFilter, Queue, QueueError, QueueState, TaskKind, TaskOutcome, TaskRow, TaskState, TmConfig};
use serde_json::json;

fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

fn row(id: &str, state: TaskState, deps: &[&str]) -> TaskRow {
    let config = TmConfig::default();
    TaskRow {
        id: id.to_string(),
        app_name: "app".to_string(),
        app_hash: "hash".to_string(),
        kind: TaskKind::Func,
        args: codec::encode(&json!([])).unwrap(),
        kwargs: codec::encode(&json!({})).unwrap(),
        deps: deps.iter().map(|d| d.to_string()).collect(),
        state,
        result: None,
        errno: 0,
        out: String::new(),
        err: String::new(),
        jobid: None,
        tm_config: codec::encode(&config).unwrap(),
        tm_digest: config.digest(),
        t_created: now(),
        t_started: None,
        t_finished: None,
        t_heartbeat: None,
    }
}

#[tokio::test]
async fn upsert_and_get() {
    let queue = Queue::in_memory().await.unwrap();
    let prior = queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    assert_eq!(prior, None);

    let task = queue.get("a").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(queue.size().await.unwrap(), 1);
}

#[tokio::test]
async fn upsert_rejects_illegal_transition() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();

    let err = queue
        .upsert(&row("a", TaskState::Succeeded, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
}

#[tokio::test]
async fn insert_rejects_dangling_dep() {
    let queue = Queue::in_memory().await.unwrap();
    let err = queue
        .upsert(&row("b", TaskState::Waiting, &["missing"]))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn insert_rejects_self_cycle() {
    let queue = Queue::in_memory().await.unwrap();
    let err = queue
        .upsert(&row("a", TaskState::Waiting, &["a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidGraph(_)));
}

#[tokio::test]
async fn claim_is_fifo_and_exclusive() {
    let queue = Queue::in_memory().await.unwrap();
    let mut first = row("zz-first", TaskState::Pending, &[]);
    first.t_created -= 10.0;
    queue.upsert(&first).await.unwrap();
    queue.upsert(&row("aa-second", TaskState::Pending, &[])).await.unwrap();

    let filter = ClaimFilter::default();
    let claimed = queue.claim(&filter, "w1").await.unwrap().unwrap();
    // FIFO by creation time, not id order.
    assert_eq!(claimed.id, "zz-first");
    assert_eq!(claimed.state, TaskState::Running);
    assert_eq!(claimed.jobid.as_deref(), Some("w1"));
    assert!(claimed.t_started.is_some());
    assert!(claimed.t_heartbeat.is_some());

    let second = queue.claim(&filter, "w2").await.unwrap().unwrap();
    assert_eq!(second.id, "aa-second");
    assert_eq!(queue.running_count(None).await.unwrap(), 2);

    assert!(queue.claim(&filter, "w3").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();

    let filter = ClaimFilter::default();
    let (r1, r2, r3) = tokio::join!(
        queue.claim(&filter, "w1"),
        queue.claim(&filter, "w2"),
        queue.claim(&filter, "w3"),
    );
    let winners = [r1.unwrap(), r2.unwrap(), r3.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn claim_respects_filters() {
    let queue = Queue::in_memory().await.unwrap();
    let mut bash = row("b", TaskState::Pending, &[]);
    bash.kind = TaskKind::Bash;
    bash.app_name = "echo".to_string();
    queue.upsert(&bash).await.unwrap();
    queue.upsert(&row("f", TaskState::Pending, &[])).await.unwrap();

    let filter = ClaimFilter {
        kinds: Some(vec![TaskKind::Bash]),
        ..ClaimFilter::default()
    };
    let claimed = queue.claim(&filter, "w1").await.unwrap().unwrap();
    assert_eq!(claimed.id, "b");
    assert!(queue.claim(&filter, "w1").await.unwrap().is_none());

    let filter = ClaimFilter {
        app_names: Some(vec!["app".to_string()]),
        ..ClaimFilter::default()
    };
    let claimed = queue.claim(&filter, "w1").await.unwrap().unwrap();
    assert_eq!(claimed.id, "f");
}

#[tokio::test]
async fn paused_queue_hands_out_nothing() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    queue.pause().await.unwrap();
    assert_eq!(queue.state().await.unwrap(), QueueState::Paused);

    assert!(queue.claim(&ClaimFilter::default(), "w1").await.unwrap().is_none());

    queue.resume().await.unwrap();
    assert!(queue.claim(&ClaimFilter::default(), "w1").await.unwrap().is_some());
}

#[tokio::test]
async fn heartbeat_requires_running() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    assert!(queue.heartbeat("a").await.is_err());

    queue.claim(&ClaimFilter::default(), "w1").await.unwrap().unwrap();
    queue.heartbeat("a").await.unwrap();
}

#[tokio::test]
async fn finish_success_and_failure() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    queue.upsert(&row("b", TaskState::Pending, &[])).await.unwrap();
    queue.claim(&ClaimFilter::default(), "w1").await.unwrap();
    queue.claim(&ClaimFilter::default(), "w2").await.unwrap();

    queue
        .finish(
            "a",
            TaskOutcome::Success {
                result: codec::encode(&json!(42)).unwrap(),
                out: "hello\n".to_string(),
                err: String::new(),
            },
        )
        .await
        .unwrap();
    let a = queue.get("a").await.unwrap().unwrap();
    assert_eq!(a.state, TaskState::Succeeded);
    assert_eq!(a.errno, 0);
    assert_eq!(a.out, "hello\n");
    assert!(a.t_finished.is_some());
    assert_eq!(codec::decode::<i64>(&a.result.unwrap()).unwrap(), 42);

    queue
        .finish(
            "b",
            TaskOutcome::Failure {
                errno: 7,
                out: String::new(),
                err: "boom".to_string(),
            },
        )
        .await
        .unwrap();
    let b = queue.get("b").await.unwrap().unwrap();
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(b.errno, 7);
    assert!(b.result.is_none());

    // Finishing a non-RUNNING row is an invalid transition.
    let err = queue
        .finish(
            "b",
            TaskOutcome::Failure {
                errno: 1,
                out: String::new(),
                err: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
}

#[tokio::test]
async fn push_output_never_clobbers_finalized_rows() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    queue.claim(&ClaimFilter::default(), "w1").await.unwrap();
    queue.push_output("a", "partial", "").await.unwrap();
    assert_eq!(queue.get("a").await.unwrap().unwrap().out, "partial");

    queue
        .finish(
            "a",
            TaskOutcome::Success {
                result: codec::encode(&json!(null)).unwrap(),
                out: "final".to_string(),
                err: String::new(),
            },
        )
        .await
        .unwrap();

    // A late flush from a worker that lost the race must be a no-op.
    queue.push_output("a", "late", "").await.unwrap();
    assert_eq!(queue.get("a").await.unwrap().unwrap().out, "final");
}

#[tokio::test]
async fn scan_ready_promotes_when_deps_succeed() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("dep", TaskState::Pending, &[])).await.unwrap();
    queue.upsert(&row("child", TaskState::Waiting, &["dep"])).await.unwrap();

    // Dep not finished: nothing to promote.
    assert!(queue.scan_ready().await.unwrap().is_empty());

    queue.claim(&ClaimFilter::default(), "w1").await.unwrap();
    queue
        .finish(
            "dep",
            TaskOutcome::Success {
                result: codec::encode(&json!(1)).unwrap(),
                out: String::new(),
                err: String::new(),
            },
        )
        .await
        .unwrap();

    let promoted = queue.scan_ready().await.unwrap();
    assert_eq!(promoted, vec!["child".to_string()]);
    assert_eq!(
        queue.get("child").await.unwrap().unwrap().state,
        TaskState::Pending
    );
}

#[tokio::test]
async fn failed_dep_cascades_transitively_in_one_scan() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    queue.upsert(&row("b", TaskState::Waiting, &["a"])).await.unwrap();
    queue.upsert(&row("c", TaskState::Waiting, &["b"])).await.unwrap();
    queue.upsert(&row("d", TaskState::Waiting, &["c"])).await.unwrap();

    queue.claim(&ClaimFilter::default(), "w1").await.unwrap();
    queue
        .finish(
            "a",
            TaskOutcome::Failure {
                errno: 1,
                out: String::new(),
                err: "boom".to_string(),
            },
        )
        .await
        .unwrap();

    queue.scan_ready().await.unwrap();
    for id in ["b", "c", "d"] {
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed, "task {id}");
        assert_eq!(task.errno, errno::DEPENDENCY_FAILED, "task {id}");
    }
}

#[tokio::test]
async fn sweep_stale_marks_unknown() {
    let queue = Queue::in_memory().await.unwrap();
    let mut lost = row("lost", TaskState::Running, &[]);
    lost.jobid = Some("w1".to_string());
    lost.t_heartbeat = Some(now() - 100.0);
    queue.upsert(&lost).await.unwrap();

    let mut alive = row("alive", TaskState::Running, &[]);
    alive.jobid = Some("w2".to_string());
    alive.t_heartbeat = Some(now());
    queue.upsert(&alive).await.unwrap();

    let swept = queue.sweep_stale(30.0, None).await.unwrap();
    assert_eq!(swept, vec!["lost".to_string()]);

    let task = queue.get("lost").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Unknown);
    assert_eq!(task.errno, errno::LOST);
    assert_eq!(
        queue.get("alive").await.unwrap().unwrap().state,
        TaskState::Running
    );
}

#[tokio::test]
async fn retry_requeues_and_skips_running() {
    let queue = Queue::in_memory().await.unwrap();
    let mut failed = row("f", TaskState::Failed, &[]);
    failed.errno = 3;
    failed.err = "boom".to_string();
    queue.upsert(&failed).await.unwrap();

    let mut running = row("r", TaskState::Running, &[]);
    running.jobid = Some("w1".to_string());
    queue.upsert(&running).await.unwrap();

    let count = queue
        .retry(&[TaskState::Failed, TaskState::Running])
        .await
        .unwrap();
    assert_eq!(count, 1);

    let f = queue.get("f").await.unwrap().unwrap();
    assert_eq!(f.state, TaskState::Pending);
    assert_eq!(f.errno, 0);
    assert!(f.err.is_empty());
    assert!(f.jobid.is_none());

    // RUNNING rows are left alone.
    assert_eq!(queue.get("r").await.unwrap().unwrap().state, TaskState::Running);
}

#[tokio::test]
async fn retry_returns_dependents_to_waiting() {
    let queue = Queue::in_memory().await.unwrap();
    let mut dep = row("dep", TaskState::Succeeded, &[]);
    dep.result = Some(codec::encode(&json!(1)).unwrap());
    queue.upsert(&dep).await.unwrap();
    let mut child = row("child", TaskState::Succeeded, &["dep"]);
    child.result = Some(codec::encode(&json!(2)).unwrap());
    queue.upsert(&child).await.unwrap();

    queue.retry(&[TaskState::Succeeded]).await.unwrap();

    // The dep re-runs from PENDING; the child must wait for it again.
    assert_eq!(queue.get("dep").await.unwrap().unwrap().state, TaskState::Pending);
    assert_eq!(queue.get("child").await.unwrap().unwrap().state, TaskState::Waiting);
}

#[tokio::test]
async fn kill_is_idempotent_and_spares_terminal_rows() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("p", TaskState::Pending, &[])).await.unwrap();
    let mut done = row("s", TaskState::Succeeded, &[]);
    done.result = Some(codec::encode(&json!(1)).unwrap());
    queue.upsert(&done).await.unwrap();

    assert_eq!(queue.kill().await.unwrap(), 1);
    let p = queue.get("p").await.unwrap().unwrap();
    assert_eq!(p.state, TaskState::Killed);
    assert_eq!(p.errno, errno::KILLED);
    assert_eq!(queue.get("s").await.unwrap().unwrap().state, TaskState::Succeeded);

    // Second kill touches nothing.
    assert_eq!(queue.kill().await.unwrap(), 0);
}

#[tokio::test]
async fn counts_by_state() {
    let queue = Queue::in_memory().await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();
    queue.upsert(&row("b", TaskState::Pending, &[])).await.unwrap();
    queue.upsert(&row("c", TaskState::Waiting, &["a"])).await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.get("PENDING"), Some(&2));
    assert_eq!(counts.get("WAITING"), Some(&1));
}

#[tokio::test]
async fn file_backed_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open_or_create(dir.path(), "test").await.unwrap();
    let mut done = row("a", TaskState::Succeeded, &[]);
    done.result = Some(codec::encode(&json!("kept")).unwrap());
    queue.upsert(&done).await.unwrap();
    drop(queue);

    let reopened = Queue::open(dir.path(), "test").await.unwrap();
    let task = reopened.get("a").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(
        codec::decode::<String>(&task.result.unwrap()).unwrap(),
        "kept"
    );

    assert!(matches!(
        Queue::open(dir.path(), "absent").await,
        Err(QueueError::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn delete_requires_force_for_nonempty() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open_or_create(dir.path(), "test").await.unwrap();
    queue.upsert(&row("a", TaskState::Pending, &[])).await.unwrap();

    assert!(queue.delete(false).await.is_err());

    let queue = Queue::open(dir.path(), "test").await.unwrap();
    queue.delete(true).await.unwrap();
    assert!(matches!(
        Queue::open(dir.path(), "test").await,
        Err(QueueError::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn list_queues_matches_globs() {
    let dir = tempfile::tempdir().unwrap();
    Queue::open_or_create(dir.path(), "prod_main").await.unwrap();
    Queue::open_or_create(dir.path(), "prod_alt").await.unwrap();
    Queue::open_or_create(dir.path(), "dev").await.unwrap();

    let all = desipipe::list_queues(dir.path(), "*").unwrap();
    assert_eq!(all, vec!["dev", "prod_alt", "prod_main"]);

    let prod = desipipe::list_queues(dir.path(), "prod_*").unwrap();
    assert_eq!(prod, vec!["prod_alt", "prod_main"]);
}
