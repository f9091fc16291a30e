//! Periodic background purging

use crate::store::Purger;
use crate::types::PurgeSelector;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

/// Runs a purge against a target on a fixed interval
pub struct PurgeScheduler {
    target: Arc<dyn Purger>,
    interval: Duration,
    selector: PurgeSelector,
    span: Span,
}

impl PurgeScheduler {
    pub fn new(
        target: Arc<dyn Purger>,
        interval: Duration,
        selector: PurgeSelector,
        span: Span,
    ) -> Self {
        Self {
            target,
            interval,
            selector,
            span,
        }
    }

    /// Spawn the purge loop on the current runtime
    pub fn start(self) -> PurgeSchedulerHandle {
        let token = CancellationToken::new();
        info!(parent: &self.span, interval = ?self.interval, older_than = ?self.selector.older_than, "Starting periodic purge");
        let task = tokio::spawn(self.run(token.clone()));
        PurgeSchedulerHandle { token, task }
    }

    async fn run(self, token: CancellationToken) {
        loop {
            // The wait restarts after every purge, so a slow purge delays
            // the next one by at most its own duration.
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.target.purge(self.selector).await {
                Ok(removed) => {
                    info!(parent: &self.span, removed, "Periodic purge finished")
                }
                Err(e) => error!(parent: &self.span, error = %e, "Periodic purge failed"),
            }
        }
        debug!(parent: &self.span, "Periodic purge stopped");
    }
}

/// Handle to a running [`PurgeScheduler`]
pub struct PurgeSchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PurgeSchedulerHandle {
    /// Stop the loop and wait until it has returned.
    ///
    /// A purge already in progress runs to completion first; no purge
    /// starts after this returns.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Periodic purge task ended abnormally");
        }
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StoreError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingPurger {
        calls: Mutex<Vec<PurgeSelector>>,
        fail: bool,
    }

    impl RecordingPurger {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Purger for RecordingPurger {
        async fn purge(&self, selector: PurgeSelector) -> Result<u64> {
            let call = {
                let mut calls = self.calls.lock();
                calls.push(selector);
                calls.len()
            };
            if self.fail {
                return Err(StoreError::Walk {
                    path: PathBuf::from("/nowhere"),
                    source: io::Error::other(format!("failing call {}", call)),
                });
            }
            Ok(0)
        }
    }

    fn start(purger: &Arc<RecordingPurger>, interval: Duration) -> PurgeSchedulerHandle {
        PurgeScheduler::new(
            purger.clone(),
            interval,
            PurgeSelector::older_than(Duration::from_secs(123)),
            Span::none(),
        )
        .start()
    }

    #[tokio::test]
    async fn test_purges_periodically() {
        let purger = Arc::new(RecordingPurger::default());
        let handle = start(&purger, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown().await;

        let calls = purger.calls.lock().clone();
        assert!(calls.len() > 1);
        assert!(calls
            .iter()
            .all(|s| *s == PurgeSelector::older_than(Duration::from_secs(123))));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_schedule() {
        let purger = Arc::new(RecordingPurger::failing());
        let handle = start(&purger, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;

        assert!(purger.calls() > 1);
    }

    #[tokio::test]
    async fn test_no_purge_after_shutdown() {
        let purger = Arc::new(RecordingPurger::default());
        let handle = start(&purger, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
        let after_shutdown = purger.calls();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(purger.calls(), after_shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_interval() {
        let purger = Arc::new(RecordingPurger::default());
        let handle = start(&purger, Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
        assert_eq!(purger.calls(), 0);
    }
}
