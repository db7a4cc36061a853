//! Cancellation and deadlines for long-running waits.
//!
//! The only place converge suspends is between polls. A [`Cancellation`]
//! races every such wait against an optional deadline and an optional
//! caller-held signal, so an operation whose remote side never finishes can
//! always be abandoned.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a wait was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The caller fired its [`CancelHandle`].
    Signalled,
    /// The deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signalled => f.write_str("cancelled by caller"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Sender side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every token derived from this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A cancellation token threaded through tracking and plan execution.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    deadline: Option<Instant>,
    signal: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A token that never cancels.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a token together with the handle that cancels it.
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                deadline: None,
                signal: Some(rx),
            },
        )
    }

    /// Derive a token that also expires `timeout` from now.
    ///
    /// An existing earlier deadline is kept. A timeout too large to
    /// represent as an instant adds no deadline.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => self.with_deadline(at),
            None => self,
        }
    }

    /// Derive a token that also expires at `at`.
    ///
    /// An existing earlier deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(at),
            None => at,
        });
        self
    }

    /// The effective deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check for cancellation without waiting.
    #[must_use]
    pub fn check(&self) -> Option<CancelReason> {
        if self.signal.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(CancelReason::Signalled);
        }
        match self.deadline {
            Some(at) if Instant::now() >= at => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// # Errors
    ///
    /// Returns the cancellation reason if the signal fires or the deadline
    /// passes before the sleep completes.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        if let Some(reason) = self.check() {
            return Err(reason);
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let signal = async {
            let Some(mut rx) = self.signal.clone() else {
                return std::future::pending().await;
            };
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender dropped without cancelling
                    return std::future::pending().await;
                }
            }
        };

        tokio::select! {
            biased;
            () = signal => Err(CancelReason::Signalled),
            () = deadline => Err(CancelReason::DeadlineExceeded),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn none_never_cancels() {
        let cancel = Cancellation::none();
        assert!(cancel.check().is_none());
        assert!(cancel.sleep(Duration::from_secs(3600)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_sleep_short() {
        let start = Instant::now();
        let cancel = Cancellation::none().with_timeout(Duration::from_secs(30));

        let result = cancel.sleep(Duration::from_secs(60)).await;

        assert_eq!(result, Err(CancelReason::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(cancel.check(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins() {
        let cancel = Cancellation::none()
            .with_timeout(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(100));
        let first = cancel.deadline().unwrap();

        let tightened = cancel.with_timeout(Duration::from_secs(5));
        assert!(tightened.deadline().unwrap() < first);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_keeps_existing_deadline() {
        let huge = Duration::from_secs(u64::MAX);
        assert!(Cancellation::none().with_timeout(huge).deadline().is_none());

        let bounded = Cancellation::none().with_timeout(Duration::from_secs(30));
        let at = bounded.deadline();
        assert_eq!(bounded.with_timeout(huge).deadline(), at);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_aborts_wait() {
        let (handle, cancel) = Cancellation::pair();

        let waiter = tokio::spawn(async move { cancel.sleep(Duration::from_secs(600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        assert_eq!(waiter.await.unwrap(), Err(CancelReason::Signalled));
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_returns_immediately() {
        let (handle, cancel) = Cancellation::pair();
        handle.cancel();

        let start = Instant::now();
        assert_eq!(
            cancel.sleep(Duration::from_secs(10)).await,
            Err(CancelReason::Signalled)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_does_not_cancel() {
        let (handle, cancel) = Cancellation::pair();
        drop(handle);

        assert!(cancel.sleep(Duration::from_secs(5)).await.is_ok());
    }
}
