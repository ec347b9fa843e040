use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::error;

use desipipe::cli::{self, CliArgs, Command};
use desipipe::config::default_queue_dir;
use desipipe::error::QueueError;
use desipipe::logging::init_logging;
use desipipe::queue::{list_queues, Queue};
use desipipe::spawn::{SpawnOptions, Spawner};
use desipipe::AppRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    init_logging(args.log_level);

    let base_dir = args.base_dir.clone().unwrap_or_else(default_queue_dir);
    match dispatch(args, &base_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        // User-visible errors exit 1; internal errors exit 2.
        Err(e @ (QueueError::QueueNotFound(_) | QueueError::NotFound(_))) => {
            error!("{e}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(args: CliArgs, base_dir: &Path) -> Result<(), QueueError> {
    match args.command {
        Command::Queues { queue } => {
            for name in list_queues(base_dir, &queue)? {
                let handle = Queue::open(base_dir, &name).await?;
                let state = handle.state().await?;
                let counts = handle.counts().await?;
                let summary: Vec<String> = counts
                    .iter()
                    .map(|(state, count)| format!("{state}={count}"))
                    .collect();
                println!("{name} [{state}] {}", summary.join(" "));
            }
            Ok(())
        }

        Command::Tasks { queue, state } => {
            let handle = Queue::open(base_dir, &queue).await?;
            for task in handle.tasks(state.map(Into::into)).await? {
                println!(
                    "{} {} {} errno={} jobid={}",
                    task.id,
                    task.app_name,
                    task.state,
                    task.errno,
                    task.jobid.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }

        Command::Pause { queue } => {
            Queue::open(base_dir, &queue).await?.pause().await
        }

        Command::Resume { queue, spawn } => {
            let handle = Queue::open(base_dir, &queue).await?;
            handle.resume().await?;
            if spawn {
                detach_spawn(base_dir, &queue, None)?;
            }
            Ok(())
        }

        Command::Retry { queue, state } => {
            let handle = Queue::open(base_dir, &queue).await?;
            let states: Vec<_> = state.into_iter().map(Into::into).collect();
            let count = handle.retry(&states).await?;
            println!("{count} tasks re-queued");
            Ok(())
        }

        Command::Spawn {
            queue,
            spawn,
            timestep,
        } => {
            if spawn {
                return detach_spawn(base_dir, &queue, timestep);
            }
            let handle = Queue::open(base_dir, &queue).await?;
            // The CLI holds no app registry: bash tasks run here, func
            // tasks wait for a spawn loop inside the declaring binary.
            let options = SpawnOptions {
                timestep,
                ..SpawnOptions::default()
            };
            Spawner::new(handle, AppRegistry::new(), options).run().await
        }

        Command::Kill { queue } => {
            let handle = Queue::open(base_dir, &queue).await?;
            let count = handle.kill().await?;
            println!("{count} tasks killed");
            Ok(())
        }

        Command::Delete { queue, force } => {
            let names = list_queues(base_dir, &queue)?;
            if names.is_empty() {
                return Err(QueueError::QueueNotFound(queue));
            }
            for name in names {
                let handle = Queue::open(base_dir, &name).await?;
                handle.delete(force).await?;
                println!("{name} deleted");
            }
            Ok(())
        }
    }
}

/// Re-exec the spawn loop as a detached background process.
fn detach_spawn(base_dir: &Path, queue: &str, timestep: Option<f64>) -> Result<(), QueueError> {
    let exe: PathBuf = std::env::current_exe()
        .map_err(|e| QueueError::Provider(format!("resolving current executable: {e}")))?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("spawn")
        .arg("-q")
        .arg(queue)
        .arg("--base-dir")
        .arg(base_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(step) = timestep {
        command.arg("--timestep").arg(step.to_string());
    }
    let child = command
        .spawn()
        .map_err(|e| QueueError::Provider(format!("spawning background scheduler: {e}")))?;
    println!("spawn loop started (pid {})", child.id());
    Ok(())
}
