// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! The lapin-backed [`Transport`]. It establishes connections, opens channels and
//! turns lapin's consumer streams and error callbacks into the notifications the
//! supervision loops wait on.

use crate::{
    config::HostConfig,
    errors::AmqpError,
    transport::{
        Acknowledger, BrokerChannel, BrokerConnection, ChannelEvent, Delivery, DeliveryStream,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Publishes `value` unless a value was already published.
fn publish_once<T>(sender: &watch::Sender<Option<T>>, value: T) {
    sender.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(value);
        true
    });
}

/// Dials RabbitMQ with lapin.
pub struct AmqpTransport {
    connection_name: String,
}

impl AmqpTransport {
    /// Creates a transport that names its connections after `cfg.connection_name`.
    pub fn new(cfg: &HostConfig) -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport {
            connection_name: cfg.connection_name.clone(),
        })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn dial(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(address, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError {})
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection::new(conn)))
    }
}

/// A lapin connection with its closure notification.
pub struct AmqpConnection {
    inner: Connection,
    closed: Arc<watch::Sender<Option<String>>>,
}

impl AmqpConnection {
    fn new(inner: Connection) -> AmqpConnection {
        let closed = Arc::new(watch::channel(None).0);

        let notifier = closed.clone();
        inner.on_error(move |err| publish_once(&notifier, err.to_string()));

        AmqpConnection { inner, closed }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError {})
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self.inner.close(REPLY_SUCCESS, "host shutdown").await;
        publish_once(&self.closed, "closed by application".to_owned());

        result.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::CloseConnectionError(err.to_string())
        })
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let cause = match rx.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_owned(),
        };
        cause
    }
}

/// A lapin channel with its termination notification.
pub struct AmqpChannel {
    inner: Channel,
    events: Arc<watch::Sender<Option<ChannelEvent>>>,
}

impl AmqpChannel {
    fn new(inner: Channel) -> AmqpChannel {
        AmqpChannel {
            inner,
            events: Arc::new(watch::channel(None).0),
        }
    }
}

/// How a consumer stream that ended turned out: on a live channel the broker
/// cancelled the consumer, otherwise the channel is gone.
fn end_of_stream(channel_connected: bool) -> ChannelEvent {
    if channel_connected {
        ChannelEvent::Cancelled
    } else {
        ChannelEvent::Closed(None)
    }
}

/// Pulls the next delivery, publishing the channel's fate once the consumer ends.
async fn next_delivery(
    mut consumer: Consumer,
    channel: Channel,
    events: Arc<watch::Sender<Option<ChannelEvent>>>,
) -> Option<(Delivery, (Consumer, Channel, Arc<watch::Sender<Option<ChannelEvent>>>))> {
    match consumer.next().await {
        Some(Ok(delivery)) => Some((into_delivery(delivery), (consumer, channel, events))),
        Some(Err(err)) => {
            error!(error = err.to_string(), "errors consume msg");
            publish_once(&events, ChannelEvent::Closed(Some(err.to_string())));
            None
        }
        None => {
            publish_once(&events, end_of_stream(channel.status().connected()));
            None
        }
    }
}

/// Text headers of a delivery. Non-text values are skipped.
fn text_headers(properties: &BasicProperties) -> BTreeMap<String, String> {
    properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(text) => Some((
                        key.to_string(),
                        String::from_utf8_lossy(text.as_bytes()).into_owned(),
                    )),
                    AMQPValue::ShortString(text) => Some((key.to_string(), text.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn correlation_id(properties: &BasicProperties) -> Option<String> {
    properties.correlation_id().as_ref().map(|id| id.to_string())
}

fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    let headers = text_headers(&delivery.properties);
    let correlation = correlation_id(&delivery.properties);

    let mut converted = Delivery::new(
        delivery.routing_key.to_string(),
        delivery.data,
        Arc::new(AmqpAcker(delivery.acker)),
    )
    .with_delivery_tag(delivery.delivery_tag)
    .with_exchange(delivery.exchange.to_string())
    .with_redelivered(delivery.redelivered)
    .with_headers(headers);

    if let Some(id) = correlation {
        converted = converted.with_correlation_id(id);
    }
    converted
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(name, kind, options, args)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.inner.queue_declare(name, options, args).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(queue, exchange, routing_key, options, args)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .inner
            .basic_consume(queue, consumer_tag, options, args)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let state = (consumer, self.inner.clone(), self.events.clone());
        Ok(stream::unfold(state, |(consumer, channel, events)| {
            next_delivery(consumer, channel, events)
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self.inner.close(REPLY_SUCCESS, "host shutdown").await;
        publish_once(&self.events, ChannelEvent::Closed(None));

        result.map_err(|err| AmqpError::CloseChannelError(err.to_string()))
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

/// Settles lapin deliveries.
struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        match self.0.ack(BasicAckOptions { multiple }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError {})
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        match self.0.nack(BasicNackOptions { multiple, requeue }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError {})
            }
            _ => Ok(()),
        }
    }
}
