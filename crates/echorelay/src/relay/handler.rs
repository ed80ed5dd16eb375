//! Stream callbacks for the echo subscription.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use echorelay_core::Error;
use echorelay_core::envelope::respond_to;

use super::pool::{PublishJob, PublishPool};
use super::stats::RelayStats;
use crate::broker::{BrokerError, InboundMessage, StreamHandler};

/// Turns every inbound message into one queued response publish.
///
/// Nothing escapes these callbacks: every per-message failure is logged,
/// counted, and the stream keeps serving.
pub struct EchoHandler {
    response_topic: String,
    pool: PublishPool,
    stats: Arc<RelayStats>,
    /// Signals the re-subscribe task. `None` when re-subscribe is disabled.
    closed_tx: Option<mpsc::Sender<()>>,
}

impl EchoHandler {
    pub const fn new(
        response_topic: String,
        pool: PublishPool,
        stats: Arc<RelayStats>,
        closed_tx: Option<mpsc::Sender<()>>,
    ) -> Self {
        Self {
            response_topic,
            pool,
            stats,
            closed_tx,
        }
    }
}

impl StreamHandler for EchoHandler {
    fn on_message(&self, message: InboundMessage) {
        self.stats.record_received();

        let (text, payload) = match respond_to(&message.topic, &message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.record_decode_failure();
                warn!(
                    topic = %message.topic,
                    error = %e,
                    kind = e.kind(),
                    "Dropping inbound message"
                );
                return;
            }
        };

        info!(topic = %message.topic, message = %text, "Received new message");

        let job = PublishJob {
            topic: self.response_topic.clone(),
            payload,
        };
        if let Err(e) = self.pool.submit(job) {
            self.stats.record_dropped();
            let error = Error::Publish {
                topic: self.response_topic.clone(),
                reason: e.to_string(),
            };
            warn!(error = %error, kind = error.kind(), "Response dropped");
        }
    }

    fn on_error(&self, error: &BrokerError) -> bool {
        self.stats.record_stream_error();
        let error = Error::TransportStream(error.to_string());
        warn!(error = %error, kind = error.kind(), "Received an operation error");
        false
    }

    fn on_closed(&self) {
        self.stats.record_stream_closed();
        match &self.closed_tx {
            Some(tx) => {
                warn!("Subscription stream has been closed, scheduling re-subscribe");
                // A pending signal already covers this closure.
                let _ = tx.try_send(());
            }
            None => warn!("Subscription stream has been closed"),
        }
    }
}
