// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Host
//!
//! Long-running RabbitMQ consumption for services: a single supervised
//! connection, one supervised channel per queue, a middleware pipeline that
//! settles every delivery exactly once, periodic dead letter queue maintenance
//! and a graceful shutdown.
//!
//! Start with [`host::RabbitHost`].

mod connection;
mod otel;
mod signal;
mod state;
mod supervisor;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod host;
pub mod middleware;
pub mod queue;
pub mod topology;
pub mod transport;

pub use state::{ConnectionState, HostStatus, Lifecycle};

#[cfg(test)]
pub(crate) mod testing;
