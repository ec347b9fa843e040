//! End-to-end pipeline scenarios: submit through a TaskManager, schedule
//! with the spawn loop and local workers, observe results through futures.

use desipipe::codec;
use desipipe::{
    AppSpec, Queue, QueueError, ReusePolicy, SpawnOptions, Spawner, TaskKind, TaskManager,
    TaskRow, TaskState, TmConfig,
};
use serde_json::json;

fn fast_config(max_workers: usize) -> TmConfig {
    let mut config = TmConfig::default();
    config.scheduler.max_workers = max_workers;
    config.scheduler.timestep = 0.05;
    config.scheduler.worker_idle_timeout = 1.0;
    config.scheduler.heartbeat_timeout = 10.0;
    config
}

fn spawner(tm: &TaskManager) -> Spawner {
    let options = SpawnOptions {
        timestep: Some(0.05),
        ..SpawnOptions::default()
    };
    Spawner::new(tm.queue().clone(), tm.registry().clone(), options)
}

/// Monte-Carlo quarter-circle fraction with a seeded 64-bit LCG.
fn pi_fraction(seed: u64, size: u64) -> f64 {
    let mut state = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    let mut draw = || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    let mut inside = 0u64;
    for _ in 0..size {
        let x = draw();
        let y = draw();
        if x * x + y * y <= 1.0 {
            inside += 1;
        }
    }
    4.0 * inside as f64 / size as f64
}

/// Scenario: fan out fraction tasks, average them, echo the estimate
/// through a bash app.
#[tokio::test]
async fn pi_estimation_pipeline() {
    let queue = Queue::in_memory().await.unwrap();
    let tm = TaskManager::new(queue.clone(), fast_config(4));

    let fraction = tm.func_app(
        AppSpec::new("fraction", "monte carlo quarter-circle fraction"),
        |input| async move {
            let seed = input.kwarg("seed").as_u64().unwrap_or(0);
            let size = input.kwarg("size").as_u64().unwrap_or(1000);
            Ok(json!(pi_fraction(seed, size)))
        },
    );
    let average = tm.func_app(
        AppSpec::new("average", "mean of input fractions"),
        |input| async move {
            let values: Vec<f64> = input
                .arg(0)
                .as_array()
                .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
                .unwrap_or_default();
            if values.is_empty() {
                anyhow::bail!("no fractions to average");
            }
            Ok(json!(values.iter().sum::<f64>() / values.len() as f64))
        },
    );
    let echo = tm.bash_app(AppSpec::new("echo", "echo the estimate"), |input| {
        Ok(vec![
            json!("echo"),
            json!("bash app says pi is ~"),
            input.arg(0).clone(),
        ])
    });

    let mut fractions = Vec::new();
    for seed in 0..8u64 {
        let fut = fraction
            .call_with_kwargs(
                vec![],
                serde_json::Map::from_iter([
                    ("seed".to_string(), json!(seed)),
                    ("size".to_string(), json!(4000)),
                ]),
            )
            .await
            .unwrap();
        fractions.push(fut);
    }
    let args: Vec<_> = fractions.iter().map(|f| f.arg()).collect();
    let avg = average.call(vec![json!(args)]).await.unwrap();
    let printed = echo.call(vec![avg.arg()]).await.unwrap();

    spawner(&tm).run_until_drained().await.unwrap();

    let estimate: f64 = avg.result().await.unwrap();
    assert!((3.0..3.3).contains(&estimate), "estimate {estimate}");

    let status: i64 = printed.result().await.unwrap();
    assert_eq!(status, 0);
    let out = printed.out().await.unwrap();
    assert!(
        out.starts_with("bash app says pi is ~ 3."),
        "unexpected stdout {out:?}"
    );
}

/// Scenario: partial rerun. Failed tasks get a new implementation; the
/// succeeded ones are reused by name.
#[tokio::test]
async fn partial_rerun_with_name_reuse() {
    let queue = Queue::in_memory().await.unwrap();
    let tm = TaskManager::new(queue.clone(), fast_config(2));

    let flaky = tm.func_app(
        AppSpec::new("test_error", "raise for i >= 2"),
        |input| async move {
            let i = input.arg(0).as_i64().unwrap_or(0);
            if i >= 2 {
                anyhow::bail!("toy error for input {i}");
            }
            Ok(json!(i))
        },
    );
    let mut first = Vec::new();
    for i in 0..4 {
        first.push(flaky.call(vec![json!(i)]).await.unwrap());
    }

    spawner(&tm).run_until_drained().await.unwrap();

    assert_eq!(first[0].result::<i64>().await.unwrap(), 0);
    assert_eq!(first[1].result::<i64>().await.unwrap(), 1);
    for fut in &first[2..] {
        let err = fut.result::<i64>().await.unwrap_err();
        let QueueError::Task(failure) = err else {
            panic!("expected a task failure");
        };
        assert_eq!(failure.state, TaskState::Failed);
        assert_ne!(failure.errno, 0);
        assert!(failure.err.contains("toy error"));
    }

    // Redefine: reuse succeeded rows by name, fresh tasks for the rest.
    let fixed = tm.func_app(
        AppSpec::new("test_error", "return i + 10")
            .reuse(ReusePolicy::ByName {
                name: None,
                state: Some(TaskState::Succeeded),
            }),
        |input| async move { Ok(json!(input.arg(0).as_i64().unwrap_or(0) + 10)) },
    );
    let mut second = Vec::new();
    for i in 0..4 {
        second.push(fixed.call(vec![json!(i)]).await.unwrap());
    }

    spawner(&tm).run_until_drained().await.unwrap();

    let results = [
        second[0].result::<i64>().await.unwrap(),
        second[1].result::<i64>().await.unwrap(),
        second[2].result::<i64>().await.unwrap(),
        second[3].result::<i64>().await.unwrap(),
    ];
    assert_eq!(results, [0, 1, 12, 13]);
    // The first two were reused, not re-executed.
    assert_eq!(second[0].id(), first[0].id());
    assert_eq!(second[1].id(), first[1].id());
}

/// Scenario: pausing stops new claims within a scan interval; resuming
/// picks scheduling back up.
#[tokio::test]
async fn pause_stops_new_claims_resume_continues() {
    let queue = Queue::in_memory().await.unwrap();
    let tm = TaskManager::new(queue.clone(), fast_config(2));

    let slow = tm.func_app(AppSpec::new("slow", "sleep then return"), |input| async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        Ok(input.arg(0).clone())
    });
    for i in 0..6 {
        slow.call(vec![json!(i)]).await.unwrap();
    }

    let mut spawner = spawner(&tm);
    let handle = tokio::spawn(async move {
        spawner.run_until_drained().await.unwrap();
        spawner
    });

    // Wait for some progress, then pause.
    loop {
        let counts = queue.counts().await.unwrap();
        if counts.get("SUCCEEDED").copied().unwrap_or(0) >= 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    queue.pause().await.unwrap();

    // In-flight tasks complete; nothing new starts.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let frozen = queue.counts().await.unwrap();
    assert_eq!(frozen.get("RUNNING").copied().unwrap_or(0), 0);
    let succeeded_at_pause = frozen.get("SUCCEEDED").copied().unwrap_or(0);
    assert!(succeeded_at_pause < 6);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let still = queue.counts().await.unwrap();
    assert_eq!(
        still.get("SUCCEEDED").copied().unwrap_or(0),
        succeeded_at_pause,
        "paused queue made progress"
    );

    queue.resume().await.unwrap();
    handle.await.unwrap();
    let done = queue.counts().await.unwrap();
    assert_eq!(done.get("SUCCEEDED").copied().unwrap_or(0), 6);
}

/// Scenario: bulk retry of SUCCEEDED rows re-runs the whole graph with the
/// same ids and equal results.
#[tokio::test]
async fn retry_succeeded_reruns_with_same_ids() {
    let queue = Queue::in_memory().await.unwrap();
    let tm = TaskManager::new(queue.clone(), fast_config(2));

    let fraction = tm.func_app(
        AppSpec::new("fraction", "monte carlo quarter-circle fraction"),
        |input| async move {
            let seed = input.arg(0).as_u64().unwrap_or(0);
            Ok(json!(pi_fraction(seed, 1000)))
        },
    );
    let average = tm.func_app(AppSpec::new("average", "mean"), |input| async move {
        let values: Vec<f64> = input
            .arg(0)
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
            .unwrap_or_default();
        Ok(json!(values.iter().sum::<f64>() / values.len() as f64))
    });

    let mut fractions = Vec::new();
    for seed in 0..3u64 {
        fractions.push(fraction.call(vec![json!(seed)]).await.unwrap());
    }
    let args: Vec<_> = fractions.iter().map(|f| f.arg()).collect();
    let avg = average.call(vec![json!(args)]).await.unwrap();

    spawner(&tm).run_until_drained().await.unwrap();
    let first: f64 = avg.result().await.unwrap();
    let ids: Vec<String> = queue
        .tasks(None)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id.clone())
        .collect();

    let count = queue.retry(&[TaskState::Succeeded]).await.unwrap();
    assert_eq!(count, 4);

    spawner(&tm).run_until_drained().await.unwrap();
    let second: f64 = avg.result().await.unwrap();
    assert_eq!(first, second);

    let ids_after: Vec<String> = queue
        .tasks(None)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id.clone())
        .collect();
    assert_eq!(ids, ids_after);
}

/// Scenario: a worker dies without a trace. The sweep reclassifies its task
/// UNKNOWN; an explicit retry brings it home.
#[tokio::test]
async fn lost_worker_swept_then_retried() {
    let queue = Queue::in_memory().await.unwrap();
    let config = fast_config(1);
    let tm = TaskManager::new(queue.clone(), config.clone());
    tm.func_app(AppSpec::new("recover", "return 99"), |_| async move {
        Ok(json!(99))
    });

    // A claimed task whose worker was SIGKILLed: RUNNING, stale heartbeat.
    let stale = chrono::Utc::now().timestamp_micros() as f64 / 1e6 - 100.0;
    let lost = TaskRow {
        id: "lost-task".to_string(),
        app_name: "recover".to_string(),
        app_hash: "hash".to_string(),
        kind: TaskKind::Func,
        args: codec::encode(&json!([])).unwrap(),
        kwargs: codec::encode(&json!({})).unwrap(),
        deps: Vec::new(),
        state: TaskState::Running,
        result: None,
        errno: 0,
        out: String::new(),
        err: String::new(),
        jobid: Some("gone-1".to_string()),
        tm_config: codec::encode(&config).unwrap(),
        tm_digest: config.digest(),
        t_created: stale,
        t_started: Some(stale),
        t_finished: None,
        t_heartbeat: Some(stale),
    };
    queue.upsert(&lost).await.unwrap();

    let mut spawner = spawner(&tm);
    spawner.tick().await.unwrap();
    assert_eq!(
        queue.get("lost-task").await.unwrap().unwrap().state,
        TaskState::Unknown
    );

    queue.retry(&[TaskState::Unknown]).await.unwrap();
    assert_eq!(
        queue.get("lost-task").await.unwrap().unwrap().state,
        TaskState::Pending
    );

    spawner.run_until_drained().await.unwrap();
    let task = queue.get("lost-task").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(codec::decode::<i64>(&task.result.unwrap()).unwrap(), 99);
}

/// Scenario: a bash app that exits nonzero fails with its exit code and
/// keeps the stdout it produced before dying.
#[tokio::test]
async fn bash_exit_code_becomes_errno() {
    let queue = Queue::in_memory().await.unwrap();
    let tm = TaskManager::new(queue.clone(), fast_config(1));

    let doomed = tm.bash_app(AppSpec::new("doomed", "echo then exit 3"), |_| {
        Ok(vec![json!("sh"), json!("-c"), json!("echo oops; exit 3")])
    });
    let fut = doomed.call(vec![]).await.unwrap();

    spawner(&tm).run_until_drained().await.unwrap();

    let err = fut.result::<i64>().await.unwrap_err();
    let QueueError::Task(failure) = err else {
        panic!("expected a task failure");
    };
    assert_eq!(failure.state, TaskState::Failed);
    assert_eq!(failure.errno, 3);
    assert!(fut.out().await.unwrap().contains("oops"));
}
