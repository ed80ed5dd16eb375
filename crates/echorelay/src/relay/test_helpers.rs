#![allow(clippy::unwrap_used, clippy::panic)]

//! In-memory broker for relay tests.
//!
//! Records every call, lets the test script how subscribe/publish behave,
//! and delivers messages or stream events to registered handlers on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{
    Broker, BrokerError, DeliveryMode, InboundMessage, StreamHandler, Subscription,
};

/// Scripted outcome of a broker call.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Ack,
    Fail,
    Hang,
    Delay(Duration),
}

/// A publish call as seen by the broker.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub mode: DeliveryMode,
    pub payload: Vec<u8>,
}

impl PublishRecord {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
struct State {
    handlers: HashMap<u64, (String, Arc<dyn StreamHandler>)>,
    next_id: u64,
    subscribe_calls: Vec<(String, DeliveryMode)>,
    subscribe_script: VecDeque<Behavior>,
    publishes: Vec<PublishRecord>,
    publish_script: VecDeque<Behavior>,
    unsubscribed: Vec<u64>,
}

#[derive(Default)]
pub struct MockBroker {
    state: Mutex<State>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Behaviors for the next subscribe calls; `Ack` once exhausted.
    pub fn script_subscribes(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.state.lock().unwrap().subscribe_script.extend(behaviors);
    }

    /// Behaviors for the next publish calls; `Ack` once exhausted.
    pub fn script_publishes(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.state.lock().unwrap().publish_script.extend(behaviors);
    }

    fn handlers(&self) -> Vec<(String, Arc<dyn StreamHandler>)> {
        self.state
            .lock()
            .unwrap()
            .handlers
            .values()
            .map(|(t, h)| (t.clone(), Arc::clone(h)))
            .collect()
    }

    /// Deliver a message to every subscription on `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        for (filter, handler) in self.handlers() {
            if filter == topic {
                handler.on_message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    /// Report a transport error; returns each handler's close decision.
    pub fn raise_error(&self, error: &BrokerError) -> Vec<bool> {
        self.handlers()
            .into_iter()
            .map(|(_, handler)| handler.on_error(error))
            .collect()
    }

    /// Close every stream from the transport side.
    pub fn close_streams(&self) {
        let closed: Vec<_> = self.state.lock().unwrap().handlers.drain().collect();
        for (_, (_, handler)) in closed {
            handler.on_closed();
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().unwrap().handlers.len()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, DeliveryMode)> {
        self.state.lock().unwrap().subscribe_calls.clone()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.state.lock().unwrap().publishes.clone()
    }

    pub fn unsubscribed(&self) -> Vec<u64> {
        self.state.lock().unwrap().unsubscribed.clone()
    }
}

async fn behave(behavior: Behavior) -> Result<(), BrokerError> {
    match behavior {
        Behavior::Ack => Ok(()),
        Behavior::Fail => Err(BrokerError::Rejected("scripted failure".into())),
        Behavior::Hang => std::future::pending().await,
        Behavior::Delay(d) => {
            tokio::time::sleep(d).await;
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn subscribe(
        &self,
        topic: &str,
        mode: DeliveryMode,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Subscription, BrokerError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.subscribe_calls.push((topic.to_string(), mode));
            state.subscribe_script.pop_front().unwrap_or(Behavior::Ack)
        };
        behave(behavior).await?;

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.handlers.insert(id, (topic.to_string(), handler));
        Ok(Subscription::new(id, topic))
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.handlers.remove(&subscription.id());
        state.unsubscribed.push(subscription.id());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        mode: DeliveryMode,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.publishes.push(PublishRecord {
                topic: topic.to_string(),
                mode,
                payload,
            });
            state.publish_script.pop_front().unwrap_or(Behavior::Ack)
        };
        behave(behavior).await
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within 5s");
}
