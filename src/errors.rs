// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Consumer Host
//!
//! This module provides the error type shared by the host, the supervision loops,
//! the default lapin transport and the topology helpers. Business handlers report
//! failures with [`HandlerError`], which the pipeline turns into a negative
//! acknowledgement instead of propagating it.

use thiserror::Error;

/// Error returned by business delivery handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while hosting RabbitMQ consumers.
///
/// Connectivity and setup variants are normally logged and retried by the
/// supervision loops; only lifecycle errors surface from the host API.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The exchange configuration has no usable name
    #[error("invalid exchange name `{0}`")]
    InvalidExchangeName(String),

    /// The consumer failed to provide its configuration
    #[error("failure to initialize consumer `{0}`")]
    ConsumerInitError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The delivery already received its ack or nack
    #[error("message already acknowledged")]
    AlreadySettled,

    /// Error closing a channel
    #[error("failure to close channel `{0}`")]
    CloseChannelError(String),

    /// Error closing the connection
    #[error("failure to close connection `{0}`")]
    CloseConnectionError(String),

    /// `run` or `start` was called on a host that already started
    #[error("host already started")]
    AlreadyStarted,

    /// The operation was interrupted because the host is shutting down
    #[error("host is shutting down")]
    ShuttingDown,

    /// Error installing the termination signal handlers
    #[error("failure to listen for signals `{0}`")]
    SignalError(String),
}
