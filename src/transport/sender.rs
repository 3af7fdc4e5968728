use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{SenderCallback, SenderProtocol};
use crate::config::BusSettings;
use crate::envelope::{BatchReply, Envelope, OutgoingMessageBatch};
use crate::error::BusError;

/// Tuning for one [`BatchedSender`].
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub stage_capacity: usize,
    pub send_timeout: Duration,
}

impl SenderSettings {
    pub fn from_bus(settings: &BusSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size,
            flush_interval: settings.batch_flush(),
            stage_capacity: settings.stage_capacity,
            send_timeout: settings.send_timeout(),
        }
    }
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self::from_bus(&BusSettings::default())
    }
}

/// Per-destination pipeline: serialize, batch, transmit.
///
/// Each stage is its own task, joined by bounded channels. The transmit
/// stage sends one batch at a time, so batches reach the destination in the
/// order they were formed. A batch handed back through
/// [`retry`](BatchedSender::retry) goes out before any batch formed after it.
pub struct BatchedSender {
    destination: Url,
    protocol: Arc<dyn SenderProtocol>,
    settings: SenderSettings,
    intake: OnceLock<mpsc::Sender<Envelope>>,
    retries: OnceLock<mpsc::UnboundedSender<OutgoingMessageBatch>>,
    latch: watch::Sender<bool>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl BatchedSender {
    pub fn new(
        destination: Url,
        protocol: Arc<dyn SenderProtocol>,
        settings: SenderSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            destination,
            protocol,
            settings,
            intake: OnceLock::new(),
            retries: OnceLock::new(),
            latch,
            queued: Arc::new(AtomicUsize::new(0)),
            cancel: cancel.child_token(),
        }
    }

    pub fn destination(&self) -> &Url {
        &self.destination
    }

    /// Spawn the stage tasks. Calling `start` a second time has no effect.
    pub fn start(&self, callback: Arc<dyn SenderCallback>) {
        if self.intake.get().is_some() {
            return;
        }
        let capacity = self.settings.stage_capacity.max(1);
        let (intake_tx, intake_rx) = mpsc::channel(capacity);
        let (serialized_tx, serialized_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        if self.intake.set(intake_tx).is_err() || self.retries.set(retry_tx).is_err() {
            return;
        }

        tokio::spawn(serialize_stage(
            self.destination.clone(),
            intake_rx,
            serialized_tx,
            Arc::clone(&self.queued),
            self.cancel.clone(),
        ));
        tokio::spawn(batch_stage(
            self.destination.clone(),
            serialized_rx,
            batch_tx,
            self.settings.max_batch_size.max(1),
            self.settings.flush_interval,
            self.cancel.clone(),
        ));
        tokio::spawn(
            Transmitter {
                destination: self.destination.clone(),
                protocol: Arc::clone(&self.protocol),
                callback,
                latch: self.latch.subscribe(),
                queued: Arc::clone(&self.queued),
                send_timeout: self.settings.send_timeout,
                cancel: self.cancel.clone(),
            }
            .run(retry_rx, batch_rx),
        );
        debug!(destination = %self.destination, "sender started");
    }

    pub fn is_started(&self) -> bool {
        self.intake.get().is_some()
    }

    /// Queue an envelope for transmission.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), BusError> {
        let intake = self
            .intake
            .get()
            .ok_or_else(|| BusError::NotStarted(self.destination.clone()))?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        if intake.send(envelope).await.is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::Shutdown);
        }
        Ok(())
    }

    /// Put a failed batch back at the head of the line: it is transmitted
    /// before every batch still waiting in the stages.
    pub fn retry(&self, batch: OutgoingMessageBatch) -> Result<(), BusError> {
        if batch.is_empty() {
            return Ok(());
        }
        let retries = self
            .retries
            .get()
            .ok_or_else(|| BusError::NotStarted(self.destination.clone()))?;
        let count = batch.len();
        self.queued.fetch_add(count, Ordering::SeqCst);
        if retries.send(batch).is_err() {
            self.queued.fetch_sub(count, Ordering::SeqCst);
            return Err(BusError::Shutdown);
        }
        Ok(())
    }

    /// Envelopes anywhere between `enqueue` and a finished transmission.
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn latch(&self) {
        if !self.latch.send_replace(true) {
            info!(destination = %self.destination, "sender latched");
        }
    }

    pub fn unlatch(&self) {
        if self.latch.send_replace(false) {
            info!(destination = %self.destination, "sender unlatched");
        }
    }

    pub fn latched(&self) -> bool {
        *self.latch.borrow()
    }

    /// Send an empty batch straight through the protocol, bypassing the
    /// stages and the latch.
    pub async fn ping(&self) -> Result<(), BusError> {
        let batch = OutgoingMessageBatch::for_ping(self.destination.clone());
        let reply = tokio::time::timeout(self.settings.send_timeout, self.protocol.send_batch(&batch))
            .await
            .map_err(|_| BusError::Timeout(self.settings.send_timeout))??;
        match reply {
            BatchReply::Received => Ok(()),
            BatchReply::TooBusy => Err(BusError::ReceiverBusy(self.destination.clone())),
            BatchReply::ProcessFailure => Err(BusError::ReceiverFailure(self.destination.clone())),
        }
    }

    /// Stop every stage. Envelopes still queued are dropped.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BatchedSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serialize_stage(
    destination: Url,
    mut intake: mpsc::Receiver<Envelope>,
    next: mpsc::Sender<Envelope>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let mut envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            received = intake.recv() => match received {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(e) = envelope.ensure_data() {
            warn!(destination = %destination, envelope = %envelope, error = %e, "could not serialize envelope, dropping");
            queued.fetch_sub(1, Ordering::SeqCst);
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = next.send(envelope) => if sent.is_err() { break },
        }
    }
}

async fn batch_stage(
    destination: Url,
    mut serialized: mpsc::Receiver<Envelope>,
    next: mpsc::Sender<OutgoingMessageBatch>,
    max_batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut pending: Vec<Envelope> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_at = deadline;
        let full = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = async {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => true,
            received = serialized.recv() => match received {
                Some(envelope) => {
                    if pending.is_empty() {
                        deadline = Some(Instant::now() + flush_interval);
                    }
                    pending.push(envelope);
                    pending.len() >= max_batch_size
                }
                None => break,
            },
        };

        if full && !pending.is_empty() {
            deadline = None;
            let batch = OutgoingMessageBatch::new(destination.clone(), std::mem::take(&mut pending));
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = next.send(batch) => if sent.is_err() { break },
            }
        }
    }
}

struct Transmitter {
    destination: Url,
    protocol: Arc<dyn SenderProtocol>,
    callback: Arc<dyn SenderCallback>,
    latch: watch::Receiver<bool>,
    queued: Arc<AtomicUsize>,
    send_timeout: Duration,
    cancel: CancellationToken,
}

impl Transmitter {
    async fn run(
        mut self,
        mut retries: mpsc::UnboundedReceiver<OutgoingMessageBatch>,
        mut batches: mpsc::Receiver<OutgoingMessageBatch>,
    ) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(batch) = retries.recv() => batch,
                received = batches.recv() => match received {
                    Some(batch) => batch,
                    None => break,
                },
            };

            if *self.latch.borrow_and_update() {
                self.callback.sender_is_latched(&batch).await;
                let unlatched = tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    changed = self.latch.wait_for(|latched| !*latched) => changed.is_ok(),
                };
                if !unlatched {
                    break;
                }
            }

            self.transmit(batch).await;
        }
        debug!(destination = %self.destination, "transmit stage stopped");
    }

    async fn transmit(&self, batch: OutgoingMessageBatch) {
        let result = tokio::time::timeout(self.send_timeout, self.protocol.send_batch(&batch)).await;
        self.queued.fetch_sub(batch.len(), Ordering::SeqCst);

        match result {
            Ok(Ok(BatchReply::Received)) => self.callback.successful(batch).await,
            Ok(Ok(BatchReply::TooBusy)) => self.callback.queue_is_full(batch).await,
            Ok(Ok(BatchReply::ProcessFailure)) => {
                let error = BusError::ReceiverFailure(self.destination.clone());
                self.callback.processing_failure(batch, error).await
            }
            Ok(Err(e)) if e.is_timeout() => self.callback.timed_out(batch).await,
            Ok(Err(e)) => {
                debug!(destination = %self.destination, error = %e, "batch transmission failed");
                self.callback.processing_failure(batch, e).await
            }
            Err(_) => self.callback.timed_out(batch).await,
        }
    }
}
