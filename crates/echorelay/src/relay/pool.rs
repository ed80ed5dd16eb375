//! Bounded publish pool.
//!
//! The stream handler must never wait on the broker, so it only enqueues
//! publish jobs here. A dispatcher task drains the queue and runs each job
//! under a semaphore permit, bounding both queued and in-flight publishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use echorelay_core::Error;

use super::stats::RelayStats;
use crate::broker::{Broker, DeliveryMode};

/// A single outbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJob {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Why a job could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("publish queue is full")]
    Saturated,

    #[error("publish pool is closed")]
    Closed,
}

/// Pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_in_flight: usize,
    pub queue_capacity: usize,
    /// Bounded wait for each publish acknowledgement.
    pub timeout: Duration,
}

/// Cloneable handle used to submit publish jobs.
#[derive(Debug, Clone)]
pub struct PublishPool {
    tx: mpsc::Sender<PublishJob>,
}

impl PublishPool {
    /// Spawn the dispatcher. It stops when `cancel` fires or every handle has
    /// been dropped. Publishes already running are not awaited.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        limits: PoolLimits,
        stats: Arc<RelayStats>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(limits.queue_capacity.max(1));
        info!(
            max_in_flight = limits.max_in_flight,
            queue_capacity = limits.queue_capacity,
            "Publish pool started"
        );
        let dispatcher = tokio::spawn(dispatch(broker, limits, stats, rx, cancel));
        (Self { tx }, dispatcher)
    }

    /// Queue a job without waiting.
    pub fn submit(&self, job: PublishJob) -> Result<(), SubmitError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Saturated,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

async fn dispatch(
    broker: Arc<dyn Broker>,
    limits: PoolLimits,
    stats: Arc<RelayStats>,
    mut rx: mpsc::Receiver<PublishJob>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(limits.max_in_flight.max(1)));

    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            () = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let broker = Arc::clone(&broker);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let _permit = permit;
            publish_once(broker.as_ref(), job, limits.timeout, &stats).await;
        });
    }

    debug!("Publish pool dispatcher stopped");
}

/// Run one publish with a bounded wait. Failures are logged and counted,
/// never retried.
async fn publish_once(broker: &dyn Broker, job: PublishJob, timeout: Duration, stats: &RelayStats) {
    info!(topic = %job.topic, bytes = job.payload.len(), "Publishing message");

    let outcome = tokio::time::timeout(
        timeout,
        broker.publish(&job.topic, DeliveryMode::AtLeastOnce, job.payload),
    )
    .await;

    let reason = match outcome {
        Ok(Ok(())) => {
            stats.record_published();
            info!(topic = %job.topic, "Message published successfully");
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no acknowledgement within {timeout:?}"),
    };

    stats.record_publish_failure();
    let error = Error::Publish {
        topic: job.topic,
        reason,
    };
    warn!(error = %error, kind = error.kind(), "Publish failed");
}
