//! `EchoRelay` Library
//!
//! Core functionality for the relay binary:
//! - Broker capability trait and the MQTT (`rumqttc`) adapter
//! - Stream handler that turns inbound messages into response envelopes
//! - Bounded publish pool
//! - Optional re-subscribe after the transport closes the stream

pub mod broker;
pub mod relay;

pub use broker::{Broker, BrokerError, DeliveryMode, MqttBroker, StreamHandler, Subscription};
pub use relay::{EchoRelay, RelayOptions};
