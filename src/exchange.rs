// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the [`ExchangeConfig`] contract the host uses to name and
//! declare an exchange, and [`ExchangeDefinition`], a builder that implements it
//! for the usual exchange kinds, including delayed exchanges.

use crate::{errors::AmqpError, transport::BrokerChannel};
use async_trait::async_trait;
use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Capability the host needs from a registered exchange.
#[async_trait]
pub trait ExchangeConfig: Send + Sync {
    /// Name of the exchange the consumers' queues are bound to.
    fn name(&self) -> Result<String, AmqpError>;

    /// Declares the exchange on the broker.
    async fn build_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// # Example
/// ```
/// use rabbitmq_host::exchange::{ExchangeConfig, ExchangeDefinition};
///
/// let exchange = ExchangeDefinition::new("orders").topic().durable();
/// assert_eq!(exchange.name().unwrap(), "orders");
/// ```
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with default parameters.
    pub fn new(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("direct")),
        );
        self
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("fanout")),
        );
        self
    }

    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

#[async_trait]
impl ExchangeConfig for ExchangeDefinition {
    fn name(&self) -> Result<String, AmqpError> {
        if self.name.trim().is_empty() {
            return Err(AmqpError::InvalidExchangeName(self.name.clone()));
        }
        Ok(self.name.clone())
    }

    async fn build_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", self.name);

        if let Err(err) = channel
            .exchange_declare(
                &self.name,
                self.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: self.passive,
                    durable: self.durable,
                    auto_delete: self.delete,
                    internal: self.internal,
                    nowait: self.no_wait,
                },
                FieldTable::from(self.params.clone()),
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = self.name,
                "error to declare the exchange"
            );
            return Err(err);
        }

        debug!("exchange: {} was created", self.name);
        Ok(())
    }
}
