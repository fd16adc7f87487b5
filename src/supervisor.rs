// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Supervision
//!
//! Every queue owns a dedicated channel and a loop that keeps one consumer alive on
//! it: wait for a connection, open and register a channel, (re)declare the queue,
//! register the consumer and hand its deliveries to the pipeline, then wait for the
//! channel to terminate and start over. A deleted queue therefore reappears on the
//! next cycle. Failures stay scoped to the queue they happened on.
//!
//! Queues with a dead letter queue get a second loop that re-declares it at a fixed
//! interval on a short-lived channel.

use crate::{
    consumer::{Consumer, ConsumerConfig},
    errors::AmqpError,
    middleware::Pipeline,
    queue::Routes,
    state::HostState,
    transport::{BrokerChannel, ChannelEvent},
};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Keeps a consumer alive on `key`.
pub(crate) struct QueueSupervisor {
    pub(crate) state: Arc<HostState>,
    pub(crate) key: String,
    pub(crate) exchange: String,
    pub(crate) routes: Routes,
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) pipeline: Arc<Pipeline>,
}

impl QueueSupervisor {
    pub(crate) async fn run(self) {
        let retry = self.state.config.channel_retry_delay_duration();

        while let Some(connection) = self.state.wait_connected().await {
            let channel = match connection.create_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = %self.key,
                        "error setting up consumer queue"
                    );
                    if !self.state.sleep_or_shutdown(retry).await {
                        break;
                    }
                    continue;
                }
            };

            if !self.state.register_channel(&self.key, channel.clone()).await {
                close_quietly(&self.key, channel.as_ref()).await;
                break;
            }

            if let Err(err) = self
                .config
                .build_queue(&self.key, &self.routes, channel.as_ref(), &self.exchange)
                .await
            {
                error!(error = err.to_string(), queue = %self.key, "failure to build queue");
            }

            if let Err(err) = self.consume(&channel).await {
                error!(error = err.to_string(), queue = %self.key, "failure to consume queue");
                self.state.unregister_channel(&self.key, &channel).await;
                close_quietly(&self.key, channel.as_ref()).await;
                if !self.state.sleep_or_shutdown(retry).await {
                    break;
                }
                continue;
            }

            let event = channel.terminated().await;
            self.state.unregister_channel(&self.key, &channel).await;

            // a cancelled consumer leaves its channel open
            if event == ChannelEvent::Cancelled {
                close_quietly(&self.key, channel.as_ref()).await;
            }

            if self.state.is_shutting_down() {
                break;
            }

            match event {
                ChannelEvent::Cancelled => {
                    info!(queue = %self.key, "consumer cancelled by the broker, recreating queue");
                }
                ChannelEvent::Closed(cause) => {
                    error!(
                        queue = %self.key,
                        cause = cause.as_deref().unwrap_or("unknown"),
                        "queue channel closed, reopening"
                    );
                }
            }
        }

        debug!(queue = %self.key, "queue supervisor stopped");
    }

    /// Registers the consumer and spawns the loop feeding its deliveries to the pipeline.
    async fn consume(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let tag = format!("{}-{}", self.config.name(), Uuid::new_v4());
        let mut deliveries = channel
            .consume(
                &self.key,
                &tag,
                self.config.consume_options(),
                self.config.consume_args(),
            )
            .await?;

        let pipeline = self.pipeline.clone();
        let queue = self.key.clone();
        let spawned = self.state.spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                pipeline.dispatch(delivery).await;
            }
            debug!(queue = %queue, "delivery stream ended");
        });

        if !spawned {
            return Err(AmqpError::ShuttingDown);
        }

        info!(queue = %self.key, consumer_tag = %tag, "consuming queue");
        Ok(())
    }
}

/// Keeps the dead letter queue of `key` declared.
pub(crate) struct DeadLetterSupervisor {
    pub(crate) state: Arc<HostState>,
    pub(crate) key: String,
    pub(crate) exchange: String,
    pub(crate) routes: Routes,
    pub(crate) config: Arc<ConsumerConfig>,
}

impl DeadLetterSupervisor {
    pub(crate) async fn run(self) {
        let interval = self.state.config.deadletter_interval_duration();

        while let Some(connection) = self.state.wait_connected().await {
            if !self.state.sleep_or_shutdown(interval).await {
                break;
            }

            let channel = match connection.create_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = %self.key,
                        "error setting up dead letter channel"
                    );
                    continue;
                }
            };

            if let Err(err) = self
                .config
                .build_deadletter_queue(
                    &self.key,
                    &self.routes,
                    channel.as_ref(),
                    &self.exchange,
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    queue = %self.key,
                    "failure to build dead letter queue"
                );
            }

            close_quietly(&self.key, channel.as_ref()).await;
        }

        debug!(queue = %self.key, "dead letter supervisor stopped");
    }
}

async fn close_quietly(key: &str, channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), queue = key, "failure to close channel");
    }
}

/// Initializes the consumers bound to `exchange` and spawns a supervisor per queue.
///
/// A consumer whose `init` fails is skipped. A queue key already claimed by another
/// consumer is skipped as well, so each queue has a single supervisor.
pub(crate) async fn start_consumers(
    state: Arc<HostState>,
    exchange: String,
    consumers: Vec<Arc<dyn Consumer>>,
) {
    for consumer in consumers {
        let config = match consumer.init() {
            Ok(config) => Arc::new(config),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %exchange,
                    "failure to initialize consumer, skipping it"
                );
                continue;
            }
        };

        let middleware = state.middleware();
        for (key, routes) in consumer.queues() {
            if !state.claim_queue(&key) {
                error!(queue = %key, "queue already consumed by another consumer, skipping it");
                continue;
            }

            let pipeline = Arc::new(Pipeline::build(&routes, consumer.as_ref(), &middleware));

            if config.has_deadletter() {
                state.spawn(
                    DeadLetterSupervisor {
                        state: state.clone(),
                        key: key.clone(),
                        exchange: exchange.clone(),
                        routes: routes.clone(),
                        config: config.clone(),
                    }
                    .run(),
                );
            }

            state.spawn(
                QueueSupervisor {
                    state: state.clone(),
                    key,
                    exchange: exchange.clone(),
                    routes,
                    config: config.clone(),
                    pipeline,
                }
                .run(),
            );
        }
    }
}
