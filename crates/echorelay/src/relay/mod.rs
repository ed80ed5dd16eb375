//! The echo relay: one subscription in, one response publish per message out.

pub mod handler;
pub mod pool;
pub mod resubscribe;
pub mod stats;

#[cfg(test)]
mod test_helpers;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use echorelay_core::config::RelaySettings;
use echorelay_core::topic::{response_topic, validate_topic};
use echorelay_core::{Error, Result};

use crate::broker::{Broker, DeliveryMode, StreamHandler, Subscription};

pub use handler::EchoHandler;
pub use pool::{PoolLimits, PublishJob, PublishPool};
pub use resubscribe::ResubscribePolicy;
pub use stats::{RelayStats, StatsSnapshot};

/// Relay construction options.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOptions {
    /// Inbound topic.
    pub topic: String,
    /// Bounded wait for subscribe and publish acknowledgements.
    pub operation_timeout: Duration,
    pub max_in_flight: usize,
    pub queue_capacity: usize,
    pub resubscribe: ResubscribePolicy,
}

impl RelayOptions {
    /// Options with default settings for the given topic.
    pub fn new(topic: impl Into<String>) -> Self {
        Self::from_settings(topic, &RelaySettings::default())
    }

    pub fn from_settings(topic: impl Into<String>, settings: &RelaySettings) -> Self {
        Self {
            topic: topic.into(),
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
            max_in_flight: settings.max_in_flight_publishes,
            queue_capacity: settings.publish_queue_capacity,
            resubscribe: ResubscribePolicy::from(&settings.resubscribe),
        }
    }

    const fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_in_flight: self.max_in_flight,
            queue_capacity: self.queue_capacity,
            timeout: self.operation_timeout,
        }
    }
}

/// Bridges one inbound topic to `<topic>/response`.
pub struct EchoRelay {
    broker: Arc<dyn Broker>,
    options: RelayOptions,
    response_topic: String,
    stats: Arc<RelayStats>,
}

impl EchoRelay {
    /// Validate the topic and derive the response topic. No broker traffic.
    pub fn new(broker: Arc<dyn Broker>, options: RelayOptions) -> Result<Self> {
        validate_topic(&options.topic)?;
        let response_topic = response_topic(&options.topic);
        Ok(Self {
            broker,
            options,
            response_topic,
            stats: Arc::new(RelayStats::new()),
        })
    }

    pub fn topic(&self) -> &str {
        &self.options.topic
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Subscribe and start serving. Fails with [`Error::Connection`] when the
    /// subscribe is refused or not acknowledged in time.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<RunningRelay> {
        info!(topic = %self.options.topic, "Subscribing to topic");
        info!(topic = %self.response_topic, "Publishing to topic");

        let cancel = cancel.child_token();
        let (pool, dispatcher) = PublishPool::spawn(
            Arc::clone(&self.broker),
            self.options.pool_limits(),
            Arc::clone(&self.stats),
            cancel.clone(),
        );

        let (closed_tx, closed_rx) = if self.options.resubscribe.enabled {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handler: Arc<dyn StreamHandler> = Arc::new(EchoHandler::new(
            self.response_topic.clone(),
            pool,
            Arc::clone(&self.stats),
            closed_tx,
        ));

        let subscription = match subscribe_with_timeout(
            self.broker.as_ref(),
            &self.options.topic,
            Arc::clone(&handler),
            self.options.operation_timeout,
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        info!(topic = %self.options.topic, "Successfully subscribed");

        let current = Arc::new(Mutex::new(Some(subscription)));
        let mut tasks = vec![dispatcher];

        if let Some(closed_rx) = closed_rx {
            tasks.push(tokio::spawn(resubscribe_loop(
                Arc::clone(&self.broker),
                self.options.clone(),
                handler,
                Arc::clone(&current),
                closed_rx,
                cancel.clone(),
            )));
        }

        Ok(RunningRelay {
            broker: Arc::clone(&self.broker),
            current,
            cancel,
            tasks,
            timeout: self.options.operation_timeout,
        })
    }

    /// Subscribe, then serve until `cancel` fires. Startup failures are
    /// returned; nothing after a successful subscribe is fatal.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let running = self.start(&cancel).await?;
        cancel.cancelled().await;
        info!("Shutdown requested");
        running.shutdown().await;
        Ok(())
    }
}

/// A relay that has subscribed and is serving.
pub struct RunningRelay {
    broker: Arc<dyn Broker>,
    current: Arc<Mutex<Option<Subscription>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl RunningRelay {
    /// The active subscription, if the stream is currently open.
    pub fn subscription(&self) -> Option<Subscription> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop background tasks and close the subscription. In-flight publishes
    /// are abandoned.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }

        let subscription = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            match tokio::time::timeout(self.timeout, self.broker.unsubscribe(&subscription)).await
            {
                Ok(Ok(())) => info!(topic = subscription.topic(), "Subscription closed"),
                Ok(Err(e)) => warn!(topic = subscription.topic(), error = %e, "Unsubscribe failed"),
                Err(_) => warn!(topic = subscription.topic(), "Unsubscribe timed out"),
            }
        }
    }
}

async fn subscribe_with_timeout(
    broker: &dyn Broker,
    topic: &str,
    handler: Arc<dyn StreamHandler>,
    timeout: Duration,
) -> Result<Subscription> {
    match tokio::time::timeout(
        timeout,
        broker.subscribe(topic, DeliveryMode::AtLeastOnce, handler),
    )
    .await
    {
        Ok(Ok(subscription)) => Ok(subscription),
        Ok(Err(e)) => Err(Error::Connection(format!(
            "subscribe to {topic} failed: {e}"
        ))),
        Err(_) => Err(Error::Connection(format!(
            "subscribe to {topic} not acknowledged within {timeout:?}"
        ))),
    }
}

/// Re-establish the subscription each time the transport closes it.
async fn resubscribe_loop(
    broker: Arc<dyn Broker>,
    options: RelayOptions,
    handler: Arc<dyn StreamHandler>,
    current: Arc<Mutex<Option<Subscription>>>,
    mut closed_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let policy = &options.resubscribe;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            signal = closed_rx.recv() => if signal.is_none() { return },
        }
        current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut attempt: u32 = 0;
        loop {
            if !policy.should_retry(attempt) {
                error!(
                    topic = %options.topic,
                    attempts = attempt,
                    "Giving up re-subscribing, relay is no longer receiving"
                );
                break;
            }

            let delay = policy.delay_for_attempt(attempt);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return,
                outcome = subscribe_with_timeout(
                    broker.as_ref(),
                    &options.topic,
                    Arc::clone(&handler),
                    options.operation_timeout,
                ) => outcome,
            };

            match outcome {
                Ok(subscription) => {
                    info!(topic = %options.topic, attempt, "Re-subscribed");
                    *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
                    break;
                }
                Err(e) => {
                    warn!(
                        topic = %options.topic,
                        error = %e,
                        kind = e.kind(),
                        attempt,
                        "Re-subscribe failed"
                    );
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }
}
