//! Refresh scheduler: a ticker-driven worker that runs a refresh
//! collaborator once immediately, then on every tick, under a per-refresh
//! timeout equal to the tick interval, with cooperative shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type RefreshError = Box<dyn std::error::Error + Send + Sync>;
pub type RefreshFuture = Pin<Box<dyn Future<Output = Result<(), RefreshError>> + Send>>;

/// The unit of work the scheduler drives. Implemented by whatever performs
/// the actual per-feed fetch/solve/persist sequence; out of scope here.
pub trait RefreshCollaborator: Send + Sync + 'static {
    fn refresh(&self) -> RefreshFuture;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running (or was already started once)")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// One-shot: `Created -> Running -> Stopping -> Stopped`. Restarting a
/// stopped instance is undefined by contract, so `start` only ever
/// succeeds from `Created`.
pub struct RefreshScheduler<C: RefreshCollaborator> {
    collaborator: Arc<C>,
    interval: Duration,
    state: Mutex<State>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: RefreshCollaborator> RefreshScheduler<C> {
    pub fn new(collaborator: C, interval: Duration) -> Self {
        Self {
            collaborator: Arc::new(collaborator),
            interval,
            state: Mutex::new(State::Created),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != State::Created {
            return Err(SchedulerError::AlreadyRunning);
        }
        *state = State::Running;
        drop(state);

        let collaborator = self.collaborator.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();
        let join = tokio::spawn(async move {
            worker_loop(collaborator, interval, cancel).await;
        });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != State::Running {
                return Err(SchedulerError::NotRunning);
            }
            *state = State::Stopping;
        }

        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = State::Stopped;
        Ok(())
    }
}

async fn worker_loop<C: RefreshCollaborator>(collaborator: Arc<C>, interval: Duration, cancel: CancellationToken) {
    run_once(&collaborator, interval, &cancel).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // interval's own immediate first tick; the above already covered it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => run_once(&collaborator, interval, &cancel).await,
        }
    }
}

async fn run_once<C: RefreshCollaborator>(collaborator: &Arc<C>, interval: Duration, cancel: &CancellationToken) {
    tokio::select! {
        result = tokio::time::timeout(interval, collaborator.refresh()) => match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "refresh failed"),
            Err(_elapsed) => tracing::warn!(timeout_ms = interval.as_millis() as u64, "refresh timed out"),
        },
        _ = cancel.cancelled() => tracing::debug!("refresh cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingCollaborator {
        calls: Arc<AtomicUsize>,
    }

    impl RefreshCollaborator for CountingCollaborator {
        fn refresh(&self) -> RefreshFuture {
            let calls = self.calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct FailingCollaborator;

    impl RefreshCollaborator for FailingCollaborator {
        fn refresh(&self) -> RefreshFuture {
            Box::pin(async move { Err("boom".into()) })
        }
    }

    #[tokio::test]
    async fn runs_immediately_and_then_on_ticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = RefreshScheduler::new(CountingCollaborator { calls: calls.clone() }, Duration::from_millis(20));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(65)).await;
        scheduler.stop().await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2, "expected at least 2 refreshes, got {}", calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn double_start_fails() {
        let scheduler = RefreshScheduler::new(CountingCollaborator { calls: Arc::new(AtomicUsize::new(0)) }, Duration::from_millis(50));
        scheduler.start().unwrap();
        let second = scheduler.start();
        assert!(matches!(second, Err(SchedulerError::AlreadyRunning)));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let scheduler = RefreshScheduler::new(CountingCollaborator { calls: Arc::new(AtomicUsize::new(0)) }, Duration::from_millis(50));
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn refresh_errors_are_logged_and_swallowed() {
        let scheduler = RefreshScheduler::new(FailingCollaborator, Duration::from_millis(20));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(45)).await;
        scheduler.stop().await.unwrap();
    }
}
