// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! Keeps exactly one broker connection alive for the host. Failed dials are retried
//! after the configured delay, and a lost connection is replaced as soon as the
//! closure is observed. Once the host begins shutting down no further dial is made.

use crate::{state::HostState, transport::BrokerConnection};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Dials until a connection is published. Returns `None` once shutdown began.
pub(crate) async fn connect(state: &HostState) -> Option<Arc<dyn BrokerConnection>> {
    let address = state.config.redacted_address();

    loop {
        if state.is_shutting_down() {
            return None;
        }

        match state.transport.dial(&state.config.address).await {
            Ok(connection) => {
                if !state.publish_connection(connection.clone()) {
                    debug!("host shutting down, dropping the new connection");
                    if let Err(err) = connection.close().await {
                        warn!(error = err.to_string(), "failure to close the connection");
                    }
                    return None;
                }

                info!(address = %address, "connected to rabbitmq");
                return Some(connection);
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                info!(address = %address, "trying to reconnect to rabbitmq");

                if !state
                    .sleep_or_shutdown(state.config.reconnect_delay_duration())
                    .await
                {
                    return None;
                }
            }
        }
    }
}

/// Connects, then waits for the connection to close and connects again.
pub(crate) async fn supervise(state: Arc<HostState>) {
    loop {
        let Some(connection) = connect(&state).await else {
            break;
        };

        tokio::select! {
            cause = connection.closed() => {
                if !state.connection_lost() {
                    break;
                }
                error!(cause = %cause, "connection to rabbitmq lost");
            }
            _ = state.wait_shutdown() => break,
        }
    }

    debug!("connection supervisor stopped");
}
