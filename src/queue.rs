// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the declaration options of a consumer queue and the
//! [`Routes`] a consumer attaches to each queue key: the routing keys to bind and
//! the business handler that receives the deliveries.

use crate::middleware::DeliveryHandler;
use std::{fmt, sync::Arc};

/// Returns the name of the dead letter queue attached to `queue`.
pub fn deadletter_name(queue: &str) -> String {
    format!("{}-dlq", queue)
}

/// Declaration parameters of a consumer queue.
///
/// This struct implements the builder pattern. It supports standard queue options
/// as well as message TTL and length limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// When this limit is reached, the oldest messages are discarded, or sent to
    /// the dead letter queue when the consumer has one.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }
}

/// Bindings and business handler of one queue.
#[derive(Clone)]
pub struct Routes {
    pub(crate) routing_keys: Vec<String>,
    pub(crate) handler: Arc<dyn DeliveryHandler>,
}

impl Routes {
    /// Creates routes delivering to `handler`, with no binding yet.
    pub fn new(handler: Arc<dyn DeliveryHandler>) -> Routes {
        Routes {
            routing_keys: vec![],
            handler,
        }
    }

    /// Binds the queue to the exchange with `key`.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("routing_keys", &self.routing_keys)
            .finish_non_exhaustive()
    }
}
