// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! A [`Consumer`] groups the queues of one business component. The host calls
//! [`Consumer::init`] once to obtain its [`ConsumerConfig`], then supervises every
//! queue returned by [`Consumer::queues`] independently.

use crate::{
    errors::AmqpError,
    middleware::MessageHandler,
    queue::{QueueOptions, Routes},
    topology,
    transport::BrokerChannel,
};
use lapin::{
    options::BasicConsumeOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A set of queues consumed by the host.
pub trait Consumer: Send + Sync {
    /// Returns the configuration shared by every queue of the consumer.
    fn init(&self) -> Result<ConsumerConfig, AmqpError>;

    /// Returns the routes of every queue, keyed by queue name.
    fn queues(&self) -> HashMap<String, Routes>;

    /// Wraps the handlers of this consumer's queues. Runs inside the host middleware.
    fn middleware(&self, handler: MessageHandler) -> MessageHandler {
        handler
    }
}

/// Per-consumer settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerConfig {
    pub(crate) name: String,
    pub(crate) exclusive: bool,
    pub(crate) no_wait: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
    pub(crate) has_deadletter: bool,
    pub(crate) queue: QueueOptions,
}

impl ConsumerConfig {
    /// Creates a configuration whose consumer tags start with `name`.
    pub fn new(name: impl Into<String>) -> ConsumerConfig {
        ConsumerConfig {
            name: name.into(),
            ..ConsumerConfig::default()
        }
    }

    /// Requests exclusive consumption of the queues.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds an argument to the consumer registration.
    pub fn arg(mut self, key: impl Into<ShortString>, value: AMQPValue) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Gives every queue of the consumer a dead letter queue, kept alive by the host.
    pub fn with_deadletter(mut self) -> Self {
        self.has_deadletter = true;
        self
    }

    /// Sets the declaration options of the queues.
    pub fn queue_options(mut self, opts: QueueOptions) -> Self {
        self.queue = opts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn args(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.args
    }

    pub fn has_deadletter(&self) -> bool {
        self.has_deadletter
    }

    pub(crate) fn consume_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: false,
            no_ack: false,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn consume_args(&self) -> FieldTable {
        FieldTable::from(self.args.clone())
    }

    /// Declares the queue `key` and binds it to `exchange`.
    ///
    /// Called every time the queue's channel is (re)acquired, so a deleted queue is
    /// recreated on the next cycle.
    pub async fn build_queue(
        &self,
        key: &str,
        routes: &Routes,
        channel: &dyn BrokerChannel,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        topology::declare_queue(
            channel,
            key,
            routes,
            exchange,
            &self.queue,
            self.has_deadletter,
        )
        .await
    }

    /// Declares the dead letter queue of `key`.
    ///
    /// Dead-lettered messages reach it through the default exchange, so `routes`
    /// and `exchange` only describe the source queue.
    pub async fn build_deadletter_queue(
        &self,
        key: &str,
        routes: &Routes,
        channel: &dyn BrokerChannel,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            queue = key,
            exchange,
            routing_keys = ?routes.routing_keys(),
            "declaring dead letter queue"
        );
        topology::declare_deadletter_queue(channel, key, &self.queue).await
    }
}
