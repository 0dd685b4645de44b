use locker::{FatalPolicy, InMemoryLockStore, LockStore, Locker, LockerConfig};
use rand::Rng;
use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Lease requested by each worker.
const JOB_TIMEOUT: Duration = Duration::from_secs(10);

fn env_usize(var: &str, default: usize) -> anyhow::Result<usize> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {var}={value:?}: {e}")),
        Err(_) => Ok(default),
    }
}

async fn worker(index: usize, locker: Locker, jobs: usize, lifetime: CancellationToken) {
    loop {
        let (job, work_ms, pause_ms) = {
            let mut rng = rand::rng();
            (
                format!("job-{}", rng.random_range(0..jobs)),
                rng.random_range(200..2_000),
                rng.random_range(100..1_000),
            )
        };

        match locker.acquire(&job, JOB_TIMEOUT).await {
            Ok(true) => {
                info!(worker = index, locker = %locker.id(), job = %job, "Working");
                tokio::time::sleep(Duration::from_millis(work_ms)).await;
                locker.release(&job);
            }
            Ok(false) => info!(worker = index, job = %job, "Busy elsewhere"),
            Err(e) => {
                warn!(worker = index, job = %job, error = %e, "Acquire failed, worker exiting");
                return;
            }
        }

        tokio::select! {
            () = lifetime.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(pause_ms)) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = LockerConfig::from_env()?;
    if env::var("LOCKER_FATAL_POLICY").is_err() {
        config.fatal_policy = FatalPolicy::Report;
    }
    let workers = env_usize("DEMO_WORKERS", 4)?;
    let jobs = env_usize("DEMO_JOBS", 3)?.max(1);

    info!("Locker demo starting...");
    info!(table = %config.table_name, workers, jobs, "Configuration");

    // Every worker plays a separate process sharing one lock table
    let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
    let lifetime = CancellationToken::new();
    let mut lockers = Vec::with_capacity(workers);
    let mut tasks = Vec::with_capacity(workers);
    for index in 0..workers {
        let locker = Locker::with_config(store.clone(), &lifetime, &config)?;
        info!(worker = index, locker = %locker.id(), "Locker started");
        tasks.push(tokio::spawn(worker(index, locker.clone(), jobs, lifetime.clone())));
        lockers.push(locker);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, releasing locks");
    lifetime.cancel();

    futures::future::join_all(tasks).await;
    for locker in &lockers {
        if let Some(fatal) = locker.closed().await {
            warn!(locker = %locker.id(), error = %fatal, "Locker stopped on fatal error");
        }
    }

    info!("All locks released");
    Ok(())
}
