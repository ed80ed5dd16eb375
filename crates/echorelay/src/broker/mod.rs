//! Broker capability consumed by the relay.
//!
//! The relay never talks to a client library directly. It is handed an
//! `Arc<dyn Broker>` at construction time and registers a [`StreamHandler`]
//! per subscription. [`MqttBroker`] is the production implementation.

pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;

pub use mqtt::MqttBroker;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<DeliveryMode> for rumqttc::QoS {
    fn from(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::AtMostOnce => Self::AtMostOnce,
            DeliveryMode::AtLeastOnce => Self::AtLeastOnce,
            DeliveryMode::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

/// A message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Errors reported by a broker implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rejected by broker: {0}")]
    Rejected(String),

    #[error("Broker client is closed")]
    Closed,
}

/// Callbacks for one subscription stream.
///
/// Implementations are invoked from the broker's delivery task and must not
/// block.
pub trait StreamHandler: Send + Sync {
    /// Called once per inbound message.
    fn on_message(&self, message: InboundMessage);

    /// Called on a transport-level error. Returning `true` closes the stream.
    fn on_error(&self, error: &BrokerError) -> bool;

    /// Called after the transport closed the stream.
    fn on_closed(&self);
}

/// Handle for an active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    topic: String,
}

impl Subscription {
    pub fn new(id: u64, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Pub/sub operations the relay depends on.
///
/// `subscribe` and `publish` resolve once the broker acknowledged the request.
/// They do not time out on their own; callers bound the wait.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        mode: DeliveryMode,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Subscription, BrokerError>;

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        topic: &str,
        mode: DeliveryMode,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}
