use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BusSettings;
use crate::envelope::{Envelope, OutgoingMessageBatch};
use crate::transport::BatchedSender;

/// Circuit breaker shared by the remote sending agents.
///
/// Consecutive failed batches are counted; at `failures_before_latch` the
/// sender is latched and a ping loop starts. The first answered ping
/// unlatches the sender and held batches flow again.
pub(crate) struct RetryAgent {
    destination: Url,
    failures: Arc<AtomicU32>,
    failures_before_latch: u32,
    ping_interval: Duration,
    pinging: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl RetryAgent {
    pub fn new(destination: Url, settings: &BusSettings, cancel: CancellationToken) -> Self {
        Self {
            destination,
            failures: Arc::new(AtomicU32::new(0)),
            failures_before_latch: settings.failures_before_latch.max(1),
            ping_interval: settings.ping_interval(),
            pinging: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn succeeded(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Count a failed batch, latching the sender at the threshold.
    pub fn failed(&self, sender: &Arc<BatchedSender>) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.failures_before_latch || sender.latched() {
            return;
        }
        warn!(
            destination = %self.destination,
            failures,
            "destination unreachable, latching sender"
        );
        sender.latch();
        self.start_pinging(Arc::downgrade(sender));
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn start_pinging(&self, sender: Weak<BatchedSender>) {
        if self.pinging.swap(true, Ordering::SeqCst) {
            return;
        }
        let destination = self.destination.clone();
        let failures = Arc::clone(&self.failures);
        let pinging = Arc::clone(&self.pinging);
        let interval = self.ping_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(sender) = sender.upgrade() else {
                    break;
                };
                match sender.ping().await {
                    Ok(()) => {
                        failures.store(0, Ordering::SeqCst);
                        sender.unlatch();
                        info!(destination = %destination, "destination answered ping, resuming");
                        break;
                    }
                    Err(e) => debug!(destination = %destination, error = %e, "ping failed"),
                }
            }
            pinging.store(false, Ordering::SeqCst);
        });
    }
}

/// Hand envelopes back to the sender as one batch, ahead of anything
/// formed since the failed batch.
pub(crate) fn requeue(sender: &Arc<BatchedSender>, envelopes: Vec<Envelope>) {
    let batch = OutgoingMessageBatch::new(sender.destination().clone(), envelopes);
    if let Err(e) = sender.retry(batch) {
        debug!(destination = %sender.destination(), error = %e, "could not requeue envelopes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::BatchReply;
    use crate::error::BusError;
    use crate::transport::{SenderProtocol, SenderSettings};
    use async_trait::async_trait;

    struct Flapping {
        up: AtomicBool,
    }

    #[async_trait]
    impl SenderProtocol for Flapping {
        async fn send_batch(&self, _batch: &OutgoingMessageBatch) -> Result<BatchReply, BusError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(BatchReply::Received)
            } else {
                Err(BusError::Transport("down".into()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latches_at_threshold_and_unlatches_after_ping() {
        let destination = Url::parse("memory://flapping").unwrap();
        let protocol = Arc::new(Flapping {
            up: AtomicBool::new(false),
        });
        let sender = Arc::new(BatchedSender::new(
            destination.clone(),
            protocol.clone(),
            SenderSettings::default(),
            CancellationToken::new(),
        ));
        let settings = BusSettings::default()
            .with_failures_before_latch(2)
            .with_ping_interval(Duration::from_millis(100));
        let retry = RetryAgent::new(destination, &settings, CancellationToken::new());

        retry.failed(&sender);
        assert!(!sender.latched());
        retry.failed(&sender);
        assert!(sender.latched());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(sender.latched());

        protocol.up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!sender.latched());
        assert_eq!(retry.failure_count(), 0);
    }
}
