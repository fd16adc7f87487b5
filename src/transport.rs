// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Contracts
//!
//! The supervision engine never talks to lapin directly. It dials, opens channels,
//! declares topology, consumes and settles deliveries through the traits in this
//! module. [`AmqpTransport`](crate::channel::AmqpTransport) is the production
//! implementation.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    ExchangeKind,
};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Stream of deliveries produced by [`BrokerChannel::consume`].
///
/// The stream ends when the channel closes or the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Why a channel stopped serving its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel was closed, with the broker or client reason when one is known
    Closed(Option<String>),
    /// The broker cancelled the consumer, usually because the queue was deleted
    Cancelled,
}

/// Dials the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection to `address`.
    async fn dial(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a fresh channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Resolves with the cause once the connection is closed by the broker or the network.
    async fn closed(&self) -> String;
}

/// A channel opened on a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Registers a consumer on `queue` and returns its deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Resolves once the channel is closed or its consumer cancelled.
    async fn terminated(&self) -> ChannelEvent;
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}

struct Settlement {
    settled: AtomicBool,
    acker: Arc<dyn Acknowledger>,
}

/// One message received from a queue.
///
/// Clones share the same settlement state: whichever clone acks or nacks first
/// wins, later attempts fail with [`AmqpError::AlreadySettled`] without reaching
/// the broker.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    /// Text headers of the message; other header types are not carried
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
    settlement: Arc<Settlement>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: routing_key.into(),
            correlation_id: None,
            redelivered: false,
            headers: BTreeMap::default(),
            data,
            settlement: Arc::new(Settlement {
                settled: AtomicBool::new(false),
                acker,
            }),
        }
    }

    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Returns true once an ack or nack was attempted.
    pub fn is_settled(&self) -> bool {
        self.settlement.settled.load(Ordering::Acquire)
    }

    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        if self.settlement.settled.swap(true, Ordering::AcqRel) {
            return Err(AmqpError::AlreadySettled);
        }
        self.settlement.acker.ack(multiple).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        if self.settlement.settled.swap(true, Ordering::AcqRel) {
            return Err(AmqpError::AlreadySettled);
        }
        self.settlement.acker.nack(multiple, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAcker;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn only_the_first_settlement_reaches_the_broker() {
        let mut acker = MockAcker::new();
        acker.expect_ack().with(eq(false)).times(1).returning(|_| Ok(()));
        acker.expect_nack().never();

        let delivery = Delivery::new("orders.created", b"{}".to_vec(), Arc::new(acker));
        let copy = delivery.clone();

        assert!(!delivery.is_settled());
        assert_eq!(delivery.ack(false).await, Ok(()));
        assert!(copy.is_settled());
        assert_eq!(copy.nack(false, false).await, Err(AmqpError::AlreadySettled));
        assert_eq!(delivery.ack(false).await, Err(AmqpError::AlreadySettled));
    }

    #[tokio::test]
    async fn failed_settlement_still_counts() {
        let mut acker = MockAcker::new();
        acker
            .expect_nack()
            .with(eq(false), eq(true))
            .times(1)
            .returning(|_, _| Err(AmqpError::NackMessageError));

        let delivery = Delivery::new("key", vec![], Arc::new(acker)).with_correlation_id("abc");

        assert_eq!(delivery.nack(false, true).await, Err(AmqpError::NackMessageError));
        assert_eq!(delivery.ack(false).await, Err(AmqpError::AlreadySettled));
        assert_eq!(delivery.correlation_id.as_deref(), Some("abc"));
    }
}
