// Coordinator actor: the only owner of a locker's held-lock set and renewal timer
//
// Callers never touch the held set directly. They send commands over an
// unbounded channel and the coordinator applies them one at a time, between
// renewal passes driven by its own interval timer.

use crate::{
    config::{FatalPolicy, MAX_HEARTBEAT_INTERVAL},
    error::{FatalError, StoreError},
    lease::{renewal_interval, HeldLock},
    protocol::{AcquireOutcome, LockProtocol},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

/// Floor for the renewal period; `tokio::time::interval` rejects zero.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub(crate) enum Command {
    /// Track a freshly granted lease. `epoch` is the protocol's release epoch
    /// read before the lease was written.
    Record {
        lock: HeldLock,
        epoch: u64,
        ack: oneshot::Sender<Recorded>,
    },
    Release {
        name: String,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Answer to a [`Command::Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// Tracked for renewal.
    Tracked,
    /// Another locker claimed the name after one of our releases deleted it.
    Lost,
    /// Re-claiming the lease failed. Nothing is tracked.
    Failed(StoreError),
    /// Picked up by the drain, which releases the lease.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    /// Shutdown observed, held locks being released.
    Draining,
    Stopped,
}

/// Published by the coordinator on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: CoordinatorState,
    pub fatal: Option<FatalError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub held: Vec<HeldLock>,
    pub heartbeat_interval: Duration,
}

/// Channels a [`Locker`](crate::Locker) keeps to talk to its coordinator.
#[derive(Debug)]
pub(crate) struct CoordinatorHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub status: watch::Receiver<Status>,
    #[cfg_attr(not(test), allow(dead_code))]
    pub task: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct Coordinator {
    protocol: Arc<LockProtocol>,
    held: Vec<HeldLock>,
    default_interval: Duration,
    interval: Duration,
    ticker: Interval,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    fatal_policy: FatalPolicy,
    status: watch::Sender<Status>,
}

impl Coordinator {
    /// Spawns the coordinator task. It drains and stops when `shutdown` is
    /// cancelled or every command sender has been dropped.
    pub fn spawn(
        protocol: Arc<LockProtocol>,
        heartbeat_interval: Duration,
        fatal_policy: FatalPolicy,
        shutdown: CancellationToken,
    ) -> CoordinatorHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(Status {
            state: CoordinatorState::Running,
            fatal: None,
        });
        let interval = heartbeat_interval.clamp(MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL);
        let span = tracing::debug_span!("locker", locker = %protocol.id());

        let coordinator = Self {
            protocol,
            held: Vec::new(),
            default_interval: interval,
            interval,
            ticker: new_ticker(interval),
            commands,
            shutdown,
            fatal_policy,
            status,
        };
        let task = tokio::spawn(coordinator.run().instrument(span));

        CoordinatorHandle {
            commands: commands_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(mut self) {
        debug!(interval = ?self.interval, "Heartbeater running");
        loop {
            // Biased so a due renewal pass always runs before queued requests.
            let step = tokio::select! {
                biased;
                _ = self.ticker.tick() => {
                    debug!(held = self.held.len(), "Tick refresh");
                    self.refresh().await
                }
                () = self.shutdown.cancelled() => {
                    debug!("Shutdown requested");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All handles dropped");
                        break;
                    }
                },
            };

            if let Err(fatal) = step {
                self.fail(fatal);
                return;
            }
        }

        self.drain().await;
    }

    async fn handle(&mut self, command: Command) -> Result<(), FatalError> {
        match command {
            Command::Record { lock, epoch, ack } => {
                let recorded = self.record(lock, epoch).await?;
                let _ = ack.send(recorded);
            }
            Command::Release { name } => self.release(&name).await?,
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        Ok(())
    }

    async fn record(&mut self, lock: HeldLock, epoch: u64) -> Result<Recorded, FatalError> {
        let existing = self.held.iter().position(|held| held.name == lock.name);
        match existing {
            Some(position) => {
                // The caller's write used the new timeout; renew on it from now on.
                let held = &mut self.held[position];
                if held.timeout == lock.timeout {
                    debug!(lock = %lock.name, "Lock already held");
                } else {
                    debug!(
                        lock = %lock.name,
                        from = ?held.timeout,
                        to = ?lock.timeout,
                        "Held lock timeout changed"
                    );
                    held.timeout = lock.timeout;
                }
            }
            None => {
                if epoch != self.protocol.release_epoch() {
                    if let Some(recorded) = self.reclaim(&lock).await {
                        return Ok(recorded);
                    }
                }
                debug!(lock = %lock.name, timeout = ?lock.timeout, "Lock record");
                self.held.push(lock);
            }
        }

        self.retune().await?;
        Ok(Recorded::Tracked)
    }

    /// Writes `lock` again after a release may have deleted the caller's
    /// record. Returns the answer for the caller unless the write was granted.
    async fn reclaim(&mut self, lock: &HeldLock) -> Option<Recorded> {
        debug!(lock = %lock.name, "Release raced with acquire, reclaiming");
        match self.protocol.attempt_acquire(&lock.name, lock.timeout).await {
            AcquireOutcome::Granted => None,
            AcquireOutcome::Denied => {
                debug!(lock = %lock.name, "Lock claimed elsewhere after release");
                Some(Recorded::Lost)
            }
            AcquireOutcome::Failed(e) => {
                if let Err(release_err) = self.protocol.attempt_release(&lock.name).await {
                    debug!(
                        lock = %lock.name,
                        error = %release_err,
                        "Untracked lease left to expire"
                    );
                }
                Some(Recorded::Failed(e))
            }
        }
    }

    async fn release(&mut self, name: &str) -> Result<(), FatalError> {
        let Some(position) = self.held.iter().position(|lock| lock.name == name) else {
            debug!(lock = name, "Release of lock not held, ignoring");
            return Ok(());
        };
        self.held.remove(position);

        debug!(lock = name, "Lock release");
        self.protocol
            .attempt_release(name)
            .await
            .map_err(|source| FatalError::ReleaseFailed {
                lock: name.to_string(),
                locker: self.protocol.id(),
                source,
            })?;

        self.retune().await
    }

    /// Re-derives the interval from the held set. A shorter interval restarts
    /// the timer and renews everything at once.
    async fn retune(&mut self) -> Result<(), FatalError> {
        let derived =
            renewal_interval(&self.held, self.default_interval).max(MIN_HEARTBEAT_INTERVAL);
        if derived < self.interval {
            self.set_interval(derived);
            return self.refresh().await;
        }
        if derived > self.interval {
            self.set_interval(derived);
        }
        Ok(())
    }

    /// Renews every held lease with its current timeout.
    async fn refresh(&mut self) -> Result<(), FatalError> {
        for lock in &self.held {
            match self.protocol.attempt_acquire(&lock.name, lock.timeout).await {
                AcquireOutcome::Granted => {}
                AcquireOutcome::Denied => {
                    return Err(FatalError::RenewalDenied {
                        lock: lock.name.clone(),
                        locker: self.protocol.id(),
                    });
                }
                AcquireOutcome::Failed(source) => {
                    return Err(FatalError::RenewalFailed {
                        lock: lock.name.clone(),
                        locker: self.protocol.id(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn drain(&mut self) {
        self.publish(CoordinatorState::Draining, None);
        self.commands.close();

        // Grants that raced with shutdown still own a record.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Record { lock, ack, .. } => {
                    if !self.is_held(&lock.name) {
                        self.held.push(lock);
                    }
                    let _ = ack.send(Recorded::Drained);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Release { .. } => {}
            }
        }

        debug!(held = self.held.len(), "Shutting down, releasing held locks");
        for lock in std::mem::take(&mut self.held) {
            if let Err(e) = self.protocol.attempt_release(&lock.name).await {
                error!(lock = %lock.name, error = %e, "Failed to release lock during shutdown");
            }
        }

        self.protocol.stop_calls();
        self.publish(CoordinatorState::Stopped, None);
        debug!("Heartbeater stopped");
    }

    fn fail(&mut self, fatal: FatalError) {
        error!(error = %fatal, "Lock ownership can no longer be trusted");
        if self.fatal_policy == FatalPolicy::Abort {
            std::process::abort();
        }

        self.commands.close();
        self.protocol.stop_calls();
        self.held.clear();
        self.publish(CoordinatorState::Stopped, Some(fatal));
    }

    fn set_interval(&mut self, interval: Duration) {
        let interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        debug!(from = ?self.interval, to = ?interval, "Heartbeat interval changed");
        self.interval = interval;
        self.ticker = new_ticker(interval);
    }

    fn is_held(&self, name: &str) -> bool {
        self.held.iter().any(|lock| lock.name == name)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            held: self.held.clone(),
            heartbeat_interval: self.interval,
        }
    }

    fn publish(&self, state: CoordinatorState, fatal: Option<FatalError>) {
        self.status.send_modify(|status| {
            status.state = state;
            if fatal.is_some() {
                status.fatal = fatal;
            }
        });
    }
}

/// An interval whose first tick is one full period away.
fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
