// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.

use crate::{
    errors::AmqpError,
    transport::{
        Acknowledger, BrokerChannel, BrokerConnection, ChannelEvent, Delivery, DeliveryStream,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    ExchangeKind,
};
use mockall::mock;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};

mock! {
    pub Acker {}

    #[async_trait]
    impl Acknowledger for Acker {
        async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;
        async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ack,
    Nack { requeue: bool },
}

/// Acknowledger that remembers what it was asked to do.
#[derive(Default)]
pub(crate) struct RecordingAcker {
    outcomes: Mutex<Vec<Outcome>>,
}

impl RecordingAcker {
    pub(crate) fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self, _multiple: bool) -> Result<(), AmqpError> {
        self.outcomes.lock().unwrap().push(Outcome::Ack);
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.outcomes.lock().unwrap().push(Outcome::Nack { requeue });
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
struct BrokerState {
    dials: AtomicUsize,
    dial_failures: AtomicUsize,
    consume_failures: AtomicUsize,
    next_channel: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    exchanges: Mutex<Vec<String>>,
    queues: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl BrokerState {
    fn is_failing(&self, name: &str) -> bool {
        self.failing.lock().unwrap().contains(name)
    }

    fn open_channel(self: &Arc<Self>) -> Arc<FakeChannel> {
        let channel = Arc::new(FakeChannel {
            id: self.next_channel.fetch_add(1, Ordering::SeqCst),
            broker: self.clone(),
            events: watch::channel(None).0,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            consumed: Mutex::new(None),
            sender: Mutex::new(None),
        });
        self.channels.lock().unwrap().push(channel.clone());
        channel
    }
}

/// Handle on the fake broker shared by a test and its transport.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            broker: self.state.clone(),
        })
    }

    /// The next `n` dials fail.
    pub(crate) fn fail_dials(&self, n: usize) {
        self.state.dial_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` consumer registrations fail.
    pub(crate) fn fail_consumes(&self, n: usize) {
        self.state.consume_failures.store(n, Ordering::SeqCst);
    }

    /// Declarations of the exchange or queue `name` fail until further notice.
    pub(crate) fn fail_declarations_of(&self, name: &str) {
        self.state.failing.lock().unwrap().insert(name.to_owned());
    }

    pub(crate) fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn exchanges(&self) -> Vec<String> {
        self.state.exchanges.lock().unwrap().clone()
    }

    pub(crate) fn declared_queues(&self) -> Vec<String> {
        self.state.queues.lock().unwrap().clone()
    }

    pub(crate) fn declarations_of(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .unwrap()
            .iter()
            .filter(|name| *name == queue)
            .count()
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.bindings.lock().unwrap().clone()
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.state.channels.lock().unwrap().len()
    }

    pub(crate) fn open_channels(&self) -> usize {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .filter(|channel| !channel.is_closed())
            .count()
    }

    /// Every channel a consumer was registered on for `queue`, oldest first.
    pub(crate) fn consumers_of(&self, queue: &str) -> Vec<Arc<FakeChannel>> {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .filter(|channel| channel.queue().as_deref() == Some(queue))
            .cloned()
            .collect()
    }

    /// The open channel currently consuming `queue`.
    pub(crate) fn active_consumer(&self, queue: &str) -> Option<Arc<FakeChannel>> {
        self.consumers_of(queue)
            .into_iter()
            .rev()
            .find(|channel| !channel.is_closed())
    }

    pub(crate) fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.state.connections.lock().unwrap().last().cloned()
    }

    /// A channel that belongs to no connection.
    pub(crate) fn detached_channel(&self) -> Arc<FakeChannel> {
        self.state.open_channel()
    }
}

struct FakeTransport {
    broker: Arc<BrokerState>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self, _address: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.broker.dials.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.broker.dial_failures) {
            return Err(AmqpError::ConnectionError);
        }

        let connection = Arc::new(FakeConnection {
            broker: self.broker.clone(),
            closed: watch::channel(None).0,
            channels: Mutex::new(vec![]),
        });
        self.broker.connections.lock().unwrap().push(connection.clone());
        Ok(connection as Arc<dyn BrokerConnection>)
    }
}

pub(crate) struct FakeConnection {
    broker: Arc<BrokerState>,
    closed: watch::Sender<Option<String>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Simulates a network failure: the connection and all its channels go away.
    pub(crate) fn drop_connection(&self, cause: &str) {
        self.shutdown(cause);
    }

    fn shutdown(&self, cause: &str) {
        self.closed.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(cause.to_owned());
            true
        });
        for channel in self.channels.lock().unwrap().iter() {
            channel.fail(cause);
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError);
        }
        let channel = self.broker.open_channel();
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel as Arc<dyn BrokerChannel>)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown("closed by application");
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let cause = match rx.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone().unwrap_or_default(),
            Err(_) => String::new(),
        };
        cause
    }
}

pub(crate) struct FakeChannel {
    id: usize,
    broker: Arc<BrokerState>,
    events: watch::Sender<Option<ChannelEvent>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    consumed: Mutex<Option<(String, String)>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

impl FakeChannel {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times the application closed this channel.
    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn queue(&self) -> Option<String> {
        self.consumed.lock().unwrap().as_ref().map(|(queue, _)| queue.clone())
    }

    pub(crate) fn consumer_tag(&self) -> Option<String> {
        self.consumed.lock().unwrap().as_ref().map(|(_, tag)| tag.clone())
    }

    /// Pushes a delivery to the registered consumer.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Simulates the broker cancelling the consumer, as when the queue is deleted.
    /// The channel itself stays open.
    pub(crate) fn cancel(&self) {
        self.terminate(ChannelEvent::Cancelled);
    }

    /// Simulates the broker closing the channel.
    pub(crate) fn fail(&self, cause: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.terminate(ChannelEvent::Closed(Some(cause.to_owned())));
    }

    fn terminate(&self, event: ChannelEvent) {
        self.events.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(event);
            true
        });
        self.sender.lock().unwrap().take();
    }

    fn check_open(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        if self.broker.is_failing(name) {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }
        self.broker.exchanges.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        if self.broker.is_failing(name) {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }
        self.broker.queues.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.bindings.lock().unwrap().push((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
        _args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;
        if take_one(&self.broker.consume_failures) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        *self.consumed.lock().unwrap() = Some((queue.to_owned(), consumer_tag.to_owned()));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.terminate(ChannelEvent::Closed(None));
        Ok(())
    }

    async fn terminated(&self) -> ChannelEvent {
        let mut rx = self.events.subscribe();
        let event = match rx.wait_for(Option::is_some).await {
            Ok(event) => event.clone().unwrap_or(ChannelEvent::Closed(None)),
            Err(_) => ChannelEvent::Closed(None),
        };
        event
    }
}
