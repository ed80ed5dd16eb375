//! MQTT 3.1.1 broker adapter built on `rumqttc`.
//!
//! A single driver task polls the `EventLoop`. It dispatches inbound publishes
//! to registered subscriptions and completes subscribe/publish waiters when
//! the matching acknowledgement arrives.
//!
//! Acknowledgements are correlated through packet ids. `rumqttc` only reveals
//! the id of a request once it has been written (`Outgoing::Publish(pkid)`),
//! so waiters are queued in request order and bound to their id on the
//! outgoing event. Callers hold an order lock while queueing a waiter and
//! handing the request to the client, which keeps both queues in step. A
//! waiter whose request never reached the client is withdrawn by its ticket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use echorelay_core::config::BrokerConfig;
use echorelay_core::topic::matches_filter;

use super::{Broker, BrokerError, DeliveryMode, InboundMessage, StreamHandler, Subscription};

/// Pause between polls after a connection error. `rumqttc` reconnects on the
/// next poll.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How long `disconnect` waits for the DISCONNECT packet to be written.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

type AckResult = Result<(), BrokerError>;
type AckSender = oneshot::Sender<AckResult>;

/// Build client options from broker settings.
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let client_id = config.client_id.clone().unwrap_or_else(generate_client_id);
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(config.clean_session);
    options
}

/// Short random client id, kept under the 23 characters every 3.1.1 broker
/// must accept.
fn generate_client_id() -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("echorelay-{}", &short[..8])
}

struct Registered {
    filter: String,
    handler: Arc<dyn StreamHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Subscribe,
    Publish,
}

#[derive(Default)]
struct AckBook {
    next_ticket: u64,
    queued_subscribes: VecDeque<(u64, AckSender)>,
    subscribes: HashMap<u16, AckSender>,
    queued_publishes: VecDeque<(u64, AckSender)>,
    publishes: HashMap<u16, AckSender>,
}

impl AckBook {
    fn queue(&mut self, queue: Queue) -> &mut VecDeque<(u64, AckSender)> {
        match queue {
            Queue::Subscribe => &mut self.queued_subscribes,
            Queue::Publish => &mut self.queued_publishes,
        }
    }
}

/// State shared between the client handle and the driver task.
struct Shared {
    subscriptions: RwLock<HashMap<u64, Registered>>,
    next_id: AtomicU64,
    acks: Mutex<AckBook>,
    connected_once: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            acks: Mutex::new(AckBook::default()),
            connected_once: AtomicBool::new(false),
        }
    }

    fn acks(&self) -> MutexGuard<'_, AckBook> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a waiter for the next request of `queue` and return its ticket.
    fn enqueue(&self, queue: Queue, tx: AckSender) -> u64 {
        let mut acks = self.acks();
        acks.next_ticket += 1;
        let ticket = acks.next_ticket;
        acks.queue(queue).push_back((ticket, tx));
        ticket
    }

    fn withdraw(&self, queue: Queue, ticket: u64) {
        self.acks().queue(queue).retain(|(t, _)| *t != ticket);
    }

    fn register(&self, filter: &str, handler: Arc<dyn StreamHandler>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Registered {
                    filter: filter.to_string(),
                    handler,
                },
            );
        id
    }

    fn unregister(&self, id: u64) -> Option<Registered> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn StreamHandler>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| matches_filter(topic, &r.filter))
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    fn snapshot(&self) -> Vec<(u64, String, Arc<dyn StreamHandler>)> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, r)| (*id, r.filter.clone(), Arc::clone(&r.handler)))
            .collect()
    }

    fn drain(&self) -> Vec<Registered> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, r)| r)
            .collect()
    }

    fn on_incoming(&self, packet: Packet, client: &AsyncClient) {
        match packet {
            Packet::Publish(publish) => {
                let handlers = self.handlers_for(&publish.topic);
                if handlers.is_empty() {
                    debug!(topic = %publish.topic, "Publish matched no subscription");
                    return;
                }
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                for handler in handlers {
                    handler.on_message(message.clone());
                }
            }
            Packet::SubAck(ack) => {
                let waiter = self.acks().subscribes.remove(&ack.pkid);
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err(BrokerError::Rejected(format!(
                        "subscribe (pkid {}) refused",
                        ack.pkid
                    )))
                } else {
                    Ok(())
                };
                if let Some(tx) = waiter {
                    let _ = tx.send(result);
                }
            }
            Packet::PubAck(ack) => self.complete_publish(ack.pkid),
            Packet::PubComp(comp) => self.complete_publish(comp.pkid),
            Packet::ConnAck(ack) => self.on_connack(ack.session_present, ack.code, client),
            _ => {}
        }
    }

    fn on_connack(&self, session_present: bool, code: ConnectReturnCode, client: &AsyncClient) {
        if code != ConnectReturnCode::Success {
            let error = BrokerError::Rejected(format!("connection refused: {code:?}"));
            self.report_error(&error, client);
            return;
        }

        let reconnect = self.connected_once.swap(true, Ordering::SeqCst);
        info!(session_present, reconnect, "Connected to broker");
        if reconnect && !session_present {
            let lost = self.drain();
            if !lost.is_empty() {
                warn!(
                    subscriptions = lost.len(),
                    "Broker session was not resumed, subscriptions are closed"
                );
            }
            for registered in lost {
                registered.handler.on_closed();
            }
        }
    }

    fn on_outgoing(&self, outgoing: &Outgoing) {
        match *outgoing {
            Outgoing::Subscribe(pkid) => {
                let mut acks = self.acks();
                if let Some((_, tx)) = acks.queued_subscribes.pop_front() {
                    acks.subscribes.insert(pkid, tx);
                }
            }
            Outgoing::Publish(pkid) => {
                let mut acks = self.acks();
                // Retransmission of a publish that is still waiting for its ack.
                if pkid != 0 && acks.publishes.contains_key(&pkid) {
                    return;
                }
                if let Some((_, tx)) = acks.queued_publishes.pop_front() {
                    if pkid == 0 {
                        let _ = tx.send(Ok(()));
                    } else {
                        acks.publishes.insert(pkid, tx);
                    }
                }
            }
            _ => {}
        }
    }

    fn complete_publish(&self, pkid: u16) {
        if let Some(tx) = self.acks().publishes.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Offer a transport error to every subscription. Streams whose handler
    /// asks for it are unsubscribed and closed.
    fn report_error(&self, error: &BrokerError, client: &AsyncClient) {
        for (id, filter, handler) in self.snapshot() {
            if handler.on_error(error) {
                self.unregister(id);
                if let Err(e) = client.try_unsubscribe(filter.clone()) {
                    debug!(topic = %filter, error = %e, "Unsubscribe after close not sent");
                }
                handler.on_closed();
            }
        }
    }

    /// Fail every outstanding waiter. Used once the driver has stopped.
    fn fail_all(&self) {
        let mut acks = self.acks();
        let book = std::mem::take(&mut *acks);
        drop(acks);
        let waiters = book
            .queued_subscribes
            .into_iter()
            .map(|(_, tx)| tx)
            .chain(book.subscribes.into_values())
            .chain(book.queued_publishes.into_iter().map(|(_, tx)| tx))
            .chain(book.publishes.into_values());
        for tx in waiters {
            let _ = tx.send(Err(BrokerError::Closed));
        }
    }
}

/// Removes a subscription registration unless the subscribe completed.
struct PendingRegistration<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl PendingRegistration<'_> {
    fn disarm(mut self) -> u64 {
        self.armed = false;
        self.id
    }
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.unregister(self.id);
        }
    }
}

/// Withdraws a queued waiter unless its request was handed to the client.
///
/// Sending into the client's request channel waits while the channel is full
/// and may be cancelled there, leaving a waiter with no request behind it.
struct QueuedWaiter<'a> {
    shared: &'a Shared,
    queue: Queue,
    ticket: u64,
    armed: bool,
}

impl<'a> QueuedWaiter<'a> {
    fn new(shared: &'a Shared, queue: Queue, tx: AckSender) -> Self {
        Self {
            shared,
            queue,
            ticket: shared.enqueue(queue, tx),
            armed: true,
        }
    }

    fn sent(mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.withdraw(self.queue, self.ticket);
        }
    }
}

/// MQTT broker connection.
pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<Shared>,
    subscribe_order: tokio::sync::Mutex<()>,
    publish_order: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Create the client and spawn its driver task. The network connection is
    /// established by the driver, so this never fails; an unreachable broker
    /// shows up as subscribe/publish calls that never complete.
    pub fn connect(config: &BrokerConfig) -> Self {
        let (client, event_loop) = AsyncClient::new(mqtt_options(config), config.request_capacity);
        let shared = Arc::new(Shared::new());
        let cancel = CancellationToken::new();

        info!(
            host = %config.host,
            port = config.port,
            clean_session = config.clean_session,
            "Connecting to broker"
        );

        let driver = tokio::spawn(drive(
            event_loop,
            Arc::clone(&shared),
            client.clone(),
            cancel.clone(),
        ));

        Self {
            client,
            shared,
            subscribe_order: tokio::sync::Mutex::new(()),
            publish_order: tokio::sync::Mutex::new(()),
            cancel,
            driver: Mutex::new(Some(driver)),
        }
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(
        &self,
        topic: &str,
        mode: DeliveryMode,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Subscription, BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let registration = PendingRegistration {
            shared: &self.shared,
            id: self.shared.register(topic, handler),
            armed: true,
        };

        let (tx, rx) = oneshot::channel();
        {
            let _order = self.subscribe_order.lock().await;
            let waiter = QueuedWaiter::new(&self.shared, Queue::Subscribe, tx);
            self.client
                .subscribe(topic, mode.into())
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            waiter.sent();
        }

        rx.await.map_err(|_| BrokerError::Closed)??;
        let id = registration.disarm();
        debug!(topic, id, "Subscription acknowledged");
        Ok(Subscription::new(id, topic))
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        if self.shared.unregister(subscription.id()).is_none() {
            return Ok(());
        }
        self.client
            .unsubscribe(subscription.topic())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        mode: DeliveryMode,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let _order = self.publish_order.lock().await;
            let waiter = QueuedWaiter::new(&self.shared, Queue::Publish, tx);
            self.client
                .publish(topic, mode.into(), false, payload)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            waiter.sent();
        }

        rx.await.map_err(|_| BrokerError::Closed)?
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let sent = self.client.disconnect().await;

        if let Some(mut driver) = self.take_driver() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .is_err()
            {
                self.cancel.cancel();
                driver.abort();
            }
        }
        self.cancel.cancel();
        self.shared.fail_all();

        sent.map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll the event loop until cancelled or the client disconnects.
async fn drive(
    mut event_loop: EventLoop,
    shared: Arc<Shared>,
    client: AsyncClient,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(packet)) => shared.on_incoming(packet, &client),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from broker");
                break;
            }
            Ok(Event::Outgoing(outgoing)) => shared.on_outgoing(&outgoing),
            Err(e) => {
                let error = BrokerError::Connection(e.to_string());
                warn!(error = %e, "Broker connection error");
                shared.report_error(&error, &client);

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    shared.fail_all();
    debug!("Broker driver stopped");
}
