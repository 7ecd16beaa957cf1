//! Retried, cancellable asynchronous operations.
//!
//! Every remote call and every tunnel establish in the daemon runs inside a
//! [`CancellableOperation`].  The operation owns its attempt counter, sleeps
//! between attempts according to a [`RetryPolicy`], and reports its result
//! to a completion callback.
//!
//! # Exactly-once completion
//!
//! The completion callback is stored in a `Mutex<Option<_>>`.  Whoever takes
//! it out first delivers the outcome: either the operation task (with
//! `Completed` or `Failed`) or [`CancelHandle::cancel`] (with `Cancelled`).
//! The loser finds `None`, so a late success can never overwrite a
//! cancellation and vice versa.  A success that loses this race still owns
//! its value; [`CancellableOperation::start_with_cleanup`] hands it to a
//! cleanup callback instead of dropping it.
//!
//! # Stopping work
//!
//! Cancelling also fires a [`CancellationToken`].  The operation task races
//! every attempt and every backoff sleep against that token, so no further
//! attempt starts once `cancel()` has returned.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vpn_core::{RetryPolicy, Retryable};

/// Final result of a [`CancellableOperation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Completed(T),
    Failed(E),
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Converts to a `Result`, producing `cancelled()` for the `Cancelled` case.
    pub fn into_result(self, cancelled: impl FnOnce() -> E) -> Result<T, E> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(error) => Err(error),
            Outcome::Cancelled => Err(cancelled()),
        }
    }
}

type Completion<T, E> = Box<dyn FnOnce(Outcome<T, E>) + Send>;

struct Shared<T, E> {
    completion: Mutex<Option<Completion<T, E>>>,
    token: CancellationToken,
}

impl<T, E> Shared<T, E> {
    fn take_completion(&self) -> Option<Completion<T, E>> {
        self.completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Delivers `outcome`, or returns it if the completion was already
    /// consumed.
    fn finish(&self, outcome: Outcome<T, E>) -> Option<Outcome<T, E>> {
        // The lock is released before the callback runs, so the callback may
        // itself cancel or start other operations.
        match self.take_completion() {
            Some(completion) => {
                completion(outcome);
                None
            }
            None => Some(outcome),
        }
    }
}

trait CancelTarget: Send + Sync {
    fn cancel(&self);
    fn is_finished(&self) -> bool;
}

impl<T: Send, E: Send> CancelTarget for Shared<T, E> {
    fn cancel(&self) {
        self.token.cancel();
        let _ = self.finish(Outcome::Cancelled);
    }

    fn is_finished(&self) -> bool {
        self.completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Type-erased handle used to cancel an operation.
///
/// Cloning is cheap.  `cancel()` is idempotent and safe to call from any
/// thread, including from inside another operation's completion callback.
#[derive(Clone)]
pub struct CancelHandle {
    target: Arc<dyn CancelTarget>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.target.cancel();
    }

    /// `true` once the completion callback has been consumed.
    pub fn is_finished(&self) -> bool {
        self.target.is_finished()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Entry points for starting retried operations on the Tokio runtime.
pub struct CancellableOperation;

impl CancellableOperation {
    /// Starts `attempt` on a new task and returns its cancel handle.
    ///
    /// `attempt` receives the 1-based attempt number.  A retryable error is
    /// followed by another attempt until `policy` is exhausted; any other
    /// error, or the last retryable one, completes the operation.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start<T, E, F, Fut, C>(policy: RetryPolicy, attempt: F, completion: C) -> CancelHandle
    where
        T: Send + 'static,
        E: Retryable + fmt::Display + Send + 'static,
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(Outcome<T, E>) + Send + 'static,
    {
        Self::start_with_cleanup(policy, attempt, completion, drop)
    }

    /// Like [`start`](Self::start), for values that must be released
    /// explicitly.
    ///
    /// If an attempt succeeds but the operation was cancelled before the
    /// success could be delivered, `cleanup` receives the value.  Exactly
    /// one of `completion` and `cleanup` ever sees a successful value.
    pub fn start_with_cleanup<T, E, F, Fut, C, D>(
        policy: RetryPolicy,
        mut attempt: F,
        completion: C,
        cleanup: D,
    ) -> CancelHandle
    where
        T: Send + 'static,
        E: Retryable + fmt::Display + Send + 'static,
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(Outcome<T, E>) + Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            completion: Mutex::new(Some(Box::new(completion) as Completion<T, E>)),
            token: CancellationToken::new(),
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let token = task_shared.token.clone();
            let mut attempts_made = 0u32;
            let outcome = loop {
                attempts_made += 1;
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = attempt(attempts_made) => result,
                };
                match result {
                    Ok(value) => break Outcome::Completed(value),
                    Err(error) if error.is_retryable() && policy.allows_another(attempts_made) => {
                        let delay = policy.delay_for(attempts_made);
                        debug!(attempt = attempts_made, ?delay, %error, "attempt failed, retrying");
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(error) => break Outcome::Failed(error),
                }
            };
            if let Some(Outcome::Completed(value)) = task_shared.finish(outcome) {
                debug!("operation cancelled after its attempt succeeded, releasing result");
                cleanup(value);
            }
        });

        CancelHandle { target: shared }
    }

    /// Like [`start`](Self::start), but the outcome is awaited through the
    /// returned [`PendingOperation`] instead of a callback.
    pub fn spawn<T, E, F, Fut>(policy: RetryPolicy, attempt: F) -> PendingOperation<T, E>
    where
        T: Send + 'static,
        E: Retryable + fmt::Display + Send + 'static,
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = Self::start(policy, attempt, move |outcome| {
            let _ = tx.send(outcome);
        });
        PendingOperation { handle, rx }
    }
}

/// Future resolving to the [`Outcome`] of a spawned operation.
///
/// Dropping it does not cancel the operation; call
/// [`cancel`](Self::cancel) or keep a [`CancelHandle`] for that.
pub struct PendingOperation<T, E> {
    handle: CancelHandle,
    rx: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> PendingOperation<T, E> {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T, E> Future for PendingOperation<T, E> {
    type Output = Outcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The sender only disappears without sending if the runtime
            // dropped the task, which is indistinguishable from cancellation.
            Poll::Ready(Err(_)) => Poll::Ready(Outcome::Cancelled),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::exponential(max, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt_completes() {
        // Arrange
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        // Act
        let outcome = CancellableOperation::spawn(policy(3), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(7) }
        })
        .await;

        // Assert
        assert_eq!(outcome, Outcome::Completed(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_are_retried_until_success() {
        let outcome = CancellableOperation::spawn(policy(5), |attempt| async move {
            if attempt < 3 {
                Err(TestError::Flaky)
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(outcome, Outcome::Completed(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_stops_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let outcome = CancellableOperation::spawn(policy(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Fatal) }
        })
        .await;

        assert_eq!(outcome, Outcome::Failed(TestError::Fatal));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_exhaustion_reports_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let outcome = CancellableOperation::spawn(policy(3), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Flaky) }
        })
        .await;

        assert_eq!(outcome, Outcome::Failed(TestError::Flaky));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_follow_policy() {
        // Arrange
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        // Act
        let outcome = CancellableOperation::spawn(policy(3), move |_| {
            let _ = tx.send(Instant::now());
            async { Err::<(), _>(TestError::Flaky) }
        })
        .await;

        // Assert: attempts at t=0, t=1s, t=3s
        assert!(matches!(outcome, Outcome::Failed(_)));
        let mut offsets = Vec::new();
        while let Ok(at) = rx.try_recv() {
            offsets.push(at - start);
        }
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_completion_delivers_cancelled_once() {
        // Arrange
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = CancellableOperation::start(
            policy(3),
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TestError>(1)
            },
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );

        // Act
        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;

        // Assert
        assert_eq!(rx.recv().await, Some(Outcome::Cancelled));
        assert_eq!(rx.recv().await, None, "completion must fire exactly once");
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_prevents_further_attempts() {
        // Arrange
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let pending = CancellableOperation::spawn(policy(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Flaky) }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Act
        pending.cancel();
        let outcome = pending.await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        // Assert
        assert!(outcome.is_cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_a_no_op() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = CancellableOperation::start(
            policy(1),
            |_| async { Ok::<_, TestError>("done") },
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );

        assert_eq!(rx.recv().await, Some(Outcome::Completed("done")));
        handle.cancel();

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_may_cancel_other_operations() {
        // Arrange: a long-running operation and a fast one that cancels it.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slow_tx = tx.clone();
        let slow = CancellableOperation::start(
            policy(1),
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TestError>("slow")
            },
            move |outcome| {
                let _ = slow_tx.send(outcome);
            },
        );
        let slow_clone = slow.clone();

        // Act
        let _fast = CancellableOperation::start(
            policy(1),
            |_| async { Ok::<_, TestError>("fast") },
            move |outcome| {
                slow_clone.cancel();
                let _ = tx.send(outcome);
            },
        );

        // Assert
        let first = rx.recv().await;
        let second = rx.recv().await;
        assert_eq!(first, Some(Outcome::Cancelled));
        assert_eq!(second, Some(Outcome::Completed("fast")));
    }

    #[tokio::test]
    async fn test_success_losing_to_cancel_is_handed_to_cleanup() {
        // Arrange: the attempt cancels its own operation and then returns a
        // value in the same poll, so the cancel wins the completion race.
        let slot: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let attempt_slot = Arc::clone(&slot);
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel();

        // Act
        let handle = CancellableOperation::start_with_cleanup(
            policy(1),
            move |_| {
                let handle = attempt_slot.lock().unwrap().clone();
                async move {
                    if let Some(handle) = handle {
                        handle.cancel();
                    }
                    Ok::<_, TestError>("tunnel")
                }
            },
            move |outcome| {
                let _ = outcome_tx.send(outcome);
            },
            move |value| {
                let _ = cleanup_tx.send(value);
            },
        );
        *slot.lock().unwrap() = Some(handle.clone());

        // Assert
        assert_eq!(outcome_rx.recv().await, Some(Outcome::Cancelled));
        assert_eq!(cleanup_rx.recv().await, Some("tunnel"));
        assert_eq!(outcome_rx.recv().await, None, "completion must fire exactly once");
        assert!(handle.is_finished());
    }

    #[test]
    fn test_finish_after_cancel_returns_the_outcome() {
        let shared: Shared<u8, TestError> = Shared {
            completion: Mutex::new(Some(Box::new(|_: Outcome<u8, TestError>| {}) as Completion<u8, TestError>)),
            token: CancellationToken::new(),
        };

        shared.cancel();

        assert_eq!(shared.finish(Outcome::Completed(5)), Some(Outcome::Completed(5)));
    }

    #[test]
    fn test_outcome_into_result() {
        let ok: Outcome<u8, &str> = Outcome::Completed(1);
        assert_eq!(ok.into_result(|| "cancelled"), Ok(1));
        let cancelled: Outcome<u8, &str> = Outcome::Cancelled;
        assert_eq!(cancelled.into_result(|| "cancelled"), Err("cancelled"));
    }
}
