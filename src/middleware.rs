// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handling Pipeline
//!
//! Every delivery of a queue runs through one composed [`MessageHandler`]. From the
//! outside in:
//!
//! 1. panic containment ([`panic_handler`])
//! 2. host middleware, first registered outermost
//! 3. consumer middleware ([`Consumer::middleware`])
//! 4. the ack/nack adapter ([`error_handler`])
//! 5. the business [`DeliveryHandler`]
//!
//! The chain is folded once per queue by [`Pipeline::build`]. Each delivery is
//! dispatched with an OpenTelemetry context extracted from its headers.

use crate::{
    consumer::Consumer, errors::HandlerError, otel, queue::Routes, transport::Delivery,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Status, TraceContextExt},
    Context,
};
use std::{
    any::Any, backtrace::Backtrace, borrow::Cow, future::Future, panic::AssertUnwindSafe,
    sync::Arc,
};
use tracing::{debug, error, info};

/// Business handler bound to a queue key.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Processes a delivery. `Ok` acknowledges it, `Err` rejects it without requeue.
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.0)(ctx.clone(), delivery.clone()).await
    }
}

/// Wraps an async closure into a [`DeliveryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeliveryHandler>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// One stage of the pipeline. It owns the delivery and is responsible for settling it.
pub type MessageHandler = Arc<dyn Fn(Context, Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transforms a handler into another, usually by running code around it.
pub type HostMiddleware = Arc<dyn Fn(MessageHandler) -> MessageHandler + Send + Sync>;

/// Wraps an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, delivery| f(ctx, delivery).boxed())
}

/// Wraps a closure into a [`HostMiddleware`].
///
/// # Example
/// ```
/// use rabbitmq_host::middleware::{message_handler, middleware_fn};
///
/// let logging = middleware_fn(|next| {
///     message_handler(move |ctx, delivery| {
///         let next = next.clone();
///         async move {
///             tracing::info!(routing_key = %delivery.routing_key, "received");
///             next(ctx, delivery).await
///         }
///     })
/// });
/// # drop(logging);
/// ```
pub fn middleware_fn<F>(f: F) -> HostMiddleware
where
    F: Fn(MessageHandler) -> MessageHandler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered list of middleware. The first entry ends up outermost.
#[derive(Clone, Default)]
pub struct MiddlewareList(Vec<HostMiddleware>);

impl MiddlewareList {
    pub fn new() -> MiddlewareList {
        MiddlewareList::default()
    }

    pub fn push(&mut self, middleware: HostMiddleware) {
        self.0.push(middleware);
    }

    /// Wraps `handler` with every middleware of the list.
    pub fn wrap(&self, handler: MessageHandler) -> MessageHandler {
        self.0
            .iter()
            .rev()
            .fold(handler, |inner, middleware| middleware(inner))
    }
}

impl Extend<HostMiddleware> for MiddlewareList {
    fn extend<T: IntoIterator<Item = HostMiddleware>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

/// Adapts a [`DeliveryHandler`] into a [`MessageHandler`] that acks on success and
/// nacks without requeue on failure.
pub fn error_handler(handler: Arc<dyn DeliveryHandler>) -> MessageHandler {
    Arc::new(move |ctx: Context, delivery: Delivery| {
        let handler = handler.clone();
        async move {
            let result = handler.handle(&ctx, &delivery).await;
            let span = ctx.span();

            match result {
                Ok(()) => {
                    debug!("message successfully processed");
                    span.set_status(Status::Ok);
                    if let Err(err) = delivery.ack(false).await {
                        error!(error = err.to_string(), "error whiling ack msg");
                    }
                }
                Err(err) => {
                    info!(
                        routing_key = %delivery.routing_key,
                        correlation_id = delivery.correlation_id.as_deref().unwrap_or_default(),
                        error = err.to_string(),
                        "error handling message"
                    );
                    span.record_error(&*err);
                    span.set_status(Status::Error {
                        description: Cow::from("handler failure"),
                    });
                    if let Err(err) = delivery.nack(false, false).await {
                        error!(error = err.to_string(), "error whiling nack msg");
                    }
                }
            }
        }
        .boxed()
    })
}

/// Converts a panic payload into an error.
pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> HandlerError {
    let payload = match payload.downcast::<String>() {
        Ok(msg) => return (*msg).into(),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<&'static str>() {
        Ok(msg) => return (*msg).into(),
        Err(payload) => payload,
    };
    match payload.downcast::<HandlerError>() {
        Ok(err) => *err,
        Err(_) => "unknown error".into(),
    }
}

/// Contains any panic raised beneath it, then nacks the delivery without requeue
/// unless it was already settled.
pub fn panic_handler(handler: MessageHandler) -> MessageHandler {
    Arc::new(move |ctx: Context, delivery: Delivery| {
        let handler = handler.clone();
        async move {
            let settle = delivery.clone();
            let chain = async move { handler(ctx, delivery).await };

            let Err(payload) = AssertUnwindSafe(chain).catch_unwind().await else {
                return;
            };

            let err = panic_to_error(payload);
            error!(
                error = err.to_string(),
                routing_key = %settle.routing_key,
                "panic handler recovered from unexpected panic"
            );
            debug!(stack = %Backtrace::force_capture(), "panic handler stack");

            if settle.is_settled() {
                return;
            }
            if let Err(err) = settle.nack(false, false).await {
                error!(error = err.to_string(), "error whiling nack msg");
            }
        }
        .boxed()
    })
}

/// The composed handler of one queue.
pub struct Pipeline {
    handler: MessageHandler,
    tracer: BoxedTracer,
}

impl Pipeline {
    /// Folds the full chain for `routes` once.
    pub fn build(routes: &Routes, consumer: &dyn Consumer, host: &MiddlewareList) -> Pipeline {
        let inner = consumer.middleware(error_handler(routes.handler.clone()));

        Pipeline {
            handler: panic_handler(host.wrap(inner)),
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Runs the chain for one delivery.
    pub async fn dispatch(&self, delivery: Delivery) {
        let (ctx, span) = otel::new_span(&delivery.headers, &self.tracer, &delivery.routing_key);
        (self.handler)(ctx.with_span(span), delivery).await
    }
}
