use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::pipeline::HandlerPipeline;
use super::MessageCallback;
use crate::envelope::Envelope;
use crate::error::BusError;

/// Bounded intake plus a dispatch task that runs the pipeline with at most
/// `parallelism` executions in flight. With a parallelism of one, envelopes
/// execute strictly in the order they were pushed.
#[derive(Debug)]
pub struct WorkerExecutor {
    address: Url,
    sender: mpsc::Sender<Envelope>,
    queued: Arc<AtomicUsize>,
}

impl WorkerExecutor {
    pub fn spawn(
        address: Url,
        pipeline: Arc<HandlerPipeline>,
        callback: Weak<dyn MessageCallback>,
        parallelism: usize,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queued = Arc::new(AtomicUsize::new(0));

        tokio::spawn(dispatch(
            address.clone(),
            receiver,
            pipeline,
            callback,
            parallelism.max(1),
            Arc::clone(&queued),
            cancel,
        ));

        Self {
            address,
            sender,
            queued,
        }
    }

    /// Queue an envelope, waiting while the intake is full.
    pub async fn push(&self, envelope: Envelope) -> Result<(), BusError> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(envelope).await.is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::Shutdown);
        }
        Ok(())
    }

    /// Queue an envelope from inside a running execution. Never waits on
    /// the intake, which the calling execution may itself be blocking.
    pub fn push_nowait(&self, envelope: Envelope) -> Result<(), BusError> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                let sender = self.sender.clone();
                let queued = Arc::clone(&self.queued);
                tokio::spawn(async move {
                    if sender.send(envelope).await.is_err() {
                        queued.fetch_sub(1, Ordering::SeqCst);
                    }
                });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(BusError::Shutdown)
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> &Url {
        &self.address
    }
}

async fn dispatch(
    address: Url,
    mut receiver: mpsc::Receiver<Envelope>,
    pipeline: Arc<HandlerPipeline>,
    callback: Weak<dyn MessageCallback>,
    parallelism: usize,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(parallelism));

    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let Some(callback) = callback.upgrade() else {
            warn!(queue = %address, "worker queue dropped, stopping dispatch");
            break;
        };

        if parallelism == 1 {
            pipeline.invoke(envelope, callback.as_ref()).await;
            queued.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let pipeline = Arc::clone(&pipeline);
        let queued = Arc::clone(&queued);
        tokio::spawn(async move {
            pipeline.invoke(envelope, callback.as_ref()).await;
            queued.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    debug!(queue = %address, "worker dispatch stopped");
}
