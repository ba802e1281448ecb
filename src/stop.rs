use std::sync::Arc;
use tokio::sync::watch;

/// Why a run's actors were told to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// All work drained normally.
    Finished,
    /// The run was cancelled through intake.
    Cancelled,
    /// The lease could not be refreshed.
    LeaseLost,
    /// An actor hit an error the run cannot recover from.
    Failed(String),
    /// The process is shutting down.
    Shutdown,
}

/// Cooperative stop flag shared by every actor of one run.
/// The first recorded reason wins; later calls are ignored.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records `reason` unless a reason is already set. Returns whether this
    /// call was the one that stopped the run.
    pub fn stop(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once a reason has been recorded.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert!(signal.stop(StopReason::Cancelled));
        assert!(!signal.stop(StopReason::LeaseLost));
        assert_eq!(signal.reason(), Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiters() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.stop(StopReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_when_already_stopped() {
        let signal = StopSignal::new();
        signal.stop(StopReason::Finished);
        tokio::time::timeout(Duration::from_millis(100), signal.stopped())
            .await
            .unwrap();
    }
}
