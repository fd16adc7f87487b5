// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declaration of consumer queues, their bindings and their dead letter queues.
//! A queue with a dead letter queue is declared with the `x-dead-letter-*`
//! arguments pointing at `{queue}-dlq` through the default exchange, so rejected
//! and expired messages land there.
//!
//! Every function is idempotent on the broker side: the supervision loops call
//! them again each time a channel is reacquired, which recreates deleted queues.

use crate::{
    errors::AmqpError,
    queue::{deadletter_name, QueueOptions, Routes},
    transport::BrokerChannel,
};
use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

fn declare_options(opts: &QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: opts.passive,
        durable: opts.durable,
        exclusive: opts.exclusive,
        auto_delete: opts.delete,
        nowait: opts.no_wait,
    }
}

/// Builds the declaration arguments of a consumer queue.
pub(crate) fn queue_arguments(
    queue: &str,
    opts: &QueueOptions,
    with_deadletter: bool,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if with_deadletter {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(deadletter_name(queue))),
        );
    }

    if let Some(ttl) = opts.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = opts.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = opts.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    args
}

/// Declares `queue` and binds it to `exchange` with every routing key of `routes`.
pub async fn declare_queue(
    channel: &dyn BrokerChannel,
    queue: &str,
    routes: &Routes,
    exchange: &str,
    opts: &QueueOptions,
    with_deadletter: bool,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", queue);

    if let Err(err) = channel
        .queue_declare(
            queue,
            declare_options(opts),
            FieldTable::from(queue_arguments(queue, opts, with_deadletter)),
        )
        .await
    {
        error!(error = err.to_string(), queue, "failure to declare queue");
        return Err(err);
    }

    for routing_key in &routes.routing_keys {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        if let Err(err) = channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            error!(error = err.to_string(), "error to bind queue to exchange");
            return Err(err);
        }
    }

    debug!("queue: {} was created", queue);
    Ok(())
}

/// Declares the dead letter queue of `queue`.
pub async fn declare_deadletter_queue(
    channel: &dyn BrokerChannel,
    queue: &str,
    opts: &QueueOptions,
) -> Result<(), AmqpError> {
    let dlq_name = deadletter_name(queue);

    match channel
        .queue_declare(
            &dlq_name,
            QueueDeclareOptions {
                passive: false,
                durable: opts.durable,
                exclusive: false,
                auto_delete: false,
                nowait: opts.no_wait,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = dlq_name,
                "failure to declare dead letter queue"
            );
            Err(err)
        }
        _ => Ok(()),
    }
}
