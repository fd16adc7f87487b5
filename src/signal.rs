// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Completes when the process is asked to terminate: SIGINT, SIGTERM, SIGQUIT or
//! Ctrl-C on Unix, Ctrl-C elsewhere.

use crate::errors::AmqpError;

#[cfg(unix)]
pub(crate) async fn wait_for_shutdown_signal() -> Result<(), AmqpError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|err| AmqpError::SignalError(err.to_string()))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|err| AmqpError::SignalError(err.to_string()))?;
    let mut sigquit =
        signal(SignalKind::quit()).map_err(|err| AmqpError::SignalError(err.to_string()))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_shutdown_signal() -> Result<(), AmqpError> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AmqpError::SignalError(err.to_string()))
}
