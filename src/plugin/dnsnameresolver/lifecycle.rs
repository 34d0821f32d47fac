//! Start/stop of the DNSNameResolver watch.
//!
//! `start` spawns the informer and blocks for at most [`SYNC_TIMEOUT`] waiting
//! for the initial list. A timeout is not an error: the server comes up with a
//! partial index that catches up in the background. `stop` broadcasts the stop
//! signal exactly once; later calls get [`ResolverError::ShutdownInProgress`].

use super::informer::{EventHandler, Informer};
use crate::error::ResolverError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const SYNC_LOG_INTERVAL: Duration = Duration::from_millis(500);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Synced,
    TimedOut,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome { Synced, TimedOut }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    Synced,
    TimedOut,
    Pending { log_progress: bool },
}

/// Clocked wait for the initial sync: poll interval, progress-log interval and
/// overall timeout, all driven by the instants the caller passes in.
#[derive(Debug, Clone)]
pub struct SyncWait {
    started: Instant,
    last_log: Instant,
    log_interval: Duration,
    timeout: Duration,
}

impl SyncWait {
    pub fn new(started: Instant, log_interval: Duration, timeout: Duration) -> Self {
        Self { started, last_log: started, log_interval, timeout }
    }

    pub fn poll(&mut self, now: Instant, synced: bool) -> WaitStep {
        if synced {
            return WaitStep::Synced;
        }
        if now.duration_since(self.started) >= self.timeout {
            return WaitStep::TimedOut;
        }
        let log_progress = now.duration_since(self.last_log) >= self.log_interval;
        if log_progress {
            self.last_log = now;
        }
        WaitStep::Pending { log_progress }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.started)
    }
}

struct ShutdownGuard {
    shut_down: bool,
    stop_tx: watch::Sender<bool>,
}

pub struct WatchController {
    informer: Arc<dyn Informer>,
    handler: Arc<dyn EventHandler>,
    state: Arc<Mutex<LifecycleState>>,
    shutdown: Mutex<ShutdownGuard>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchController {
    pub fn new(informer: Arc<dyn Informer>, handler: Arc<dyn EventHandler>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            informer,
            handler,
            state: Arc::new(Mutex::new(LifecycleState::Created)),
            shutdown: Mutex::new(ShutdownGuard { shut_down: false, stop_tx }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock();
        // 关停流程一旦开始，启动流程不得再覆盖状态
        if !matches!(*state, LifecycleState::ShuttingDown | LifecycleState::Stopped) {
            *state = next;
        }
    }

    pub async fn start(&self) -> Result<SyncOutcome, ResolverError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Created {
                return Err(ResolverError::AlreadyStarted);
            }
            *state = LifecycleState::Starting;
        }

        let stop_rx = self.shutdown.lock().stop_tx.subscribe();
        let informer = self.informer.clone();
        let handler = self.handler.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            informer.run(handler, stop_rx).await;
            *state.lock() = LifecycleState::Stopped;
        });
        *self.task.lock() = Some(handle);

        let outcome = self.wait_for_sync().await;
        self.set_state(match outcome {
            SyncOutcome::Synced => LifecycleState::Synced,
            SyncOutcome::TimedOut => LifecycleState::TimedOut,
        });
        self.set_state(LifecycleState::Running);
        Ok(outcome)
    }

    async fn wait_for_sync(&self) -> SyncOutcome {
        let mut wait = SyncWait::new(Instant::now(), SYNC_LOG_INTERVAL, SYNC_TIMEOUT);
        loop {
            let now = Instant::now();
            match wait.poll(now, self.informer.has_synced()) {
                WaitStep::Synced => {
                    tracing::info!("[dnsnameresolver] DNSNameResolver informer synced in {:?}", wait.elapsed(now));
                    return SyncOutcome::Synced;
                }
                WaitStep::TimedOut => {
                    tracing::warn!(
                        "[dnsnameresolver] DNSNameResolver informer not synced after {:?}, starting with a partial index",
                        SYNC_TIMEOUT
                    );
                    return SyncOutcome::TimedOut;
                }
                WaitStep::Pending { log_progress } => {
                    if log_progress {
                        tracing::info!("[dnsnameresolver] Still waiting for DNSNameResolver informer to sync ({:?} elapsed)", wait.elapsed(now));
                    }
                    sleep(SYNC_POLL_INTERVAL).await;
                }
            }
        }
    }

    pub fn stop(&self) -> Result<(), ResolverError> {
        let mut guard = self.shutdown.lock();
        if guard.shut_down {
            return Err(ResolverError::ShutdownInProgress);
        }
        guard.shut_down = true;
        guard.stop_tx.send_replace(true);

        let mut state = self.state.lock();
        if *state != LifecycleState::Stopped {
            *state = LifecycleState::ShuttingDown;
        }
        tracing::info!("[dnsnameresolver] Stop signal sent to the watch loop");
        Ok(())
    }

    /// Waits for the watch task to exit. Returns immediately if it never started.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("[dnsnameresolver] Watch task panicked: {}", e);
            }
        }
        *self.state.lock() = LifecycleState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::dnsnameresolver::index::NameIndex;
    use crate::plugin::dnsnameresolver::informer::{ChannelInformer, DnsNameResolver, FeedSender};
    use crate::plugin::dnsnameresolver::sync::BindingSynchronizer;

    fn controller() -> (WatchController, FeedSender, Arc<NameIndex>) {
        let index = Arc::new(NameIndex::new());
        let (informer, feed) = ChannelInformer::new();
        let handler = Arc::new(BindingSynchronizer::new(index.clone()));
        (WatchController::new(informer, handler), feed, index)
    }

    #[test]
    fn sync_wait_steps() {
        let t0 = Instant::now();
        let mut wait = SyncWait::new(t0, SYNC_LOG_INTERVAL, SYNC_TIMEOUT);

        assert_eq!(wait.poll(t0 + Duration::from_millis(100), false), WaitStep::Pending { log_progress: false });
        assert_eq!(wait.poll(t0 + Duration::from_millis(500), false), WaitStep::Pending { log_progress: true });
        assert_eq!(wait.poll(t0 + Duration::from_millis(600), false), WaitStep::Pending { log_progress: false });
        assert_eq!(wait.poll(t0 + Duration::from_millis(1000), false), WaitStep::Pending { log_progress: true });
        assert_eq!(wait.poll(t0 + Duration::from_millis(1100), true), WaitStep::Synced);
        assert_eq!(wait.poll(t0 + SYNC_TIMEOUT, false), WaitStep::TimedOut);
        assert_eq!(wait.poll(t0 + SYNC_TIMEOUT * 2, true), WaitStep::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn start_returns_once_synced() {
        let (controller, feed, index) = controller();
        feed.add(DnsNameResolver::new("ns", "obj1", "app.example.com"));
        feed.mark_synced();

        let started = Instant::now();
        assert_eq!(controller.start().await, Ok(SyncOutcome::Synced));
        assert!(started.elapsed() < SYNC_TIMEOUT);
        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(index.owner_of("app.example.com").as_deref(), Some("ns/obj1"));

        controller.stop().unwrap();
        controller.join().await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_times_out_but_still_runs() {
        let (controller, feed, index) = controller();

        let started = Instant::now();
        assert_eq!(controller.start().await, Ok(SyncOutcome::TimedOut));
        assert!(started.elapsed() >= SYNC_TIMEOUT);
        assert_eq!(controller.state(), LifecycleState::Running);

        // Late notifications still reach the index.
        feed.add(DnsNameResolver::new("", "late", "*.late.example.com"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(index.owner_of("*.late.example.com").as_deref(), Some("late"));

        controller.stop().unwrap();
        controller.join().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (controller, feed, _) = controller();
        feed.mark_synced();
        controller.start().await.unwrap();
        assert_eq!(controller.start().await, Err(ResolverError::AlreadyStarted));
        controller.stop().unwrap();
        controller.join().await;
    }

    #[tokio::test]
    async fn stop_twice_reports_shutdown_in_progress() {
        let (controller, feed, _) = controller();
        feed.mark_synced();
        controller.start().await.unwrap();

        assert_eq!(controller.stop(), Ok(()));
        assert_eq!(controller.stop(), Err(ResolverError::ShutdownInProgress));
        controller.join().await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(controller.stop(), Err(ResolverError::ShutdownInProgress));
    }

    #[tokio::test]
    async fn stop_before_start() {
        let (controller, _feed, _) = controller();
        assert_eq!(controller.stop(), Ok(()));
        assert_eq!(controller.state(), LifecycleState::ShuttingDown);
        controller.join().await;
        assert_eq!(controller.stop(), Err(ResolverError::ShutdownInProgress));
    }
}
