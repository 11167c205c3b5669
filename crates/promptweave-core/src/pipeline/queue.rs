//! Bounded task queue: at most N jobs run concurrently, with whole-queue
//! abort and a single "all work finished" signal.
//!
//! The queue does not join its tasks; a `watch` channel tracks the
//! empty/busy/aborted state and `completed()` resolves on the transition to
//! empty. Jobs spawned after `abort()` never run, and in-flight jobs race
//! the shared cancellation token.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

/// The queue was aborted before draining.
#[derive(Debug, thiserror::Error)]
#[error("task queue aborted")]
pub struct QueueAborted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Idle,
    Busy,
    Aborted,
}

/// Runs submitted jobs with bounded parallelism.
pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    remaining: Arc<AtomicUsize>,
    cancel: CancellationToken,
    state: watch::Sender<QueueState>,
}

/// Decrements the in-flight counter when a job finishes, even if the job
/// body panicked.
struct JobGuard {
    remaining: Arc<AtomicUsize>,
    cancel: CancellationToken,
    state: watch::Sender<QueueState>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let state = if self.cancel.is_cancelled() {
                QueueState::Aborted
            } else {
                QueueState::Idle
            };
            self.state.send_replace(state);
        }
    }
}

impl TaskQueue {
    /// Create a queue running at most `max_parallel` jobs concurrently.
    /// `cancel` is the shared abort token; cancelling it externally has the
    /// same effect as [`abort`](TaskQueue::abort) minus the state change.
    pub fn new(max_parallel: usize, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(QueueState::Idle);
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            remaining: Arc::new(AtomicUsize::new(0)),
            cancel,
            state,
        }
    }

    /// Submit a job. Excess jobs queue behind the parallelism limit.
    /// A no-op after abort.
    pub fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        self.remaining.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(QueueState::Busy);

        let guard = JobGuard {
            remaining: Arc::clone(&self.remaining),
            cancel: self.cancel.clone(),
            state: self.state.clone(),
        };
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = async {
                    if let Ok(_permit) = semaphore.acquire_owned().await {
                        job.await;
                    }
                } => {}
            }
        });
    }

    /// Queued plus running job count.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Cancel the shared token and reject `completed()`. Results from
    /// in-flight jobs must be ignored by callers observing the token.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.state.send_replace(QueueState::Aborted);
    }

    /// The shared cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the queue is empty with zero running jobs; rejects if
    /// the queue was aborted first. Re-arms on the next enqueue.
    pub async fn completed(&self) -> Result<(), QueueAborted> {
        let mut rx = self.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                QueueState::Idle => return Ok(()),
                QueueState::Aborted => return Err(QueueAborted),
                QueueState::Busy => {}
            }
            if rx.changed().await.is_err() {
                return Err(QueueAborted);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
