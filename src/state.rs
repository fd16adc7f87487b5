// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Host State
//!
//! Everything the supervision tasks share: the published [`HostStatus`] together
//! with the current connection, the per-queue channel registry and the tracker of
//! outstanding tasks that `stop` waits on.
//!
//! Status transitions go through a single `watch` channel, so a task waiting for a
//! connection or for shutdown is woken by the transition itself instead of polling.

use crate::{
    config::HostConfig,
    errors::AmqpError,
    middleware::MiddlewareList,
    transport::{BrokerChannel, BrokerConnection, Transport},
};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::{JoinError, JoinSet},
};
use tracing::error;

/// Whether the host currently holds a live broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Lifecycle of the host. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    pub fn is_shutting_down(self) -> bool {
        self >= Lifecycle::ShuttingDown
    }
}

/// Snapshot of the host state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStatus {
    pub connection: ConnectionState,
    pub lifecycle: Lifecycle,
}

struct Snapshot {
    status: HostStatus,
    connection: Option<Arc<dyn BrokerConnection>>,
}

/// The supervision tasks of the host. Closed once shutdown drains it.
struct TaskSet {
    set: Mutex<Option<JoinSet<()>>>,
}

impl TaskSet {
    fn new() -> TaskSet {
        TaskSet {
            set: Mutex::new(Some(JoinSet::new())),
        }
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = guard.as_mut() else {
            return false;
        };

        while let Some(finished) = set.try_join_next() {
            report(finished);
        }
        set.spawn(task);
        true
    }

    async fn close_and_wait(&self) {
        let set = self
            .set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut set) = set else {
            return;
        };
        while let Some(finished) = set.join_next().await {
            report(finished);
        }
    }
}

fn report(finished: Result<(), JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            error!(error = %err, "supervision task panicked");
        }
    }
}

pub(crate) struct HostState {
    pub(crate) config: HostConfig,
    pub(crate) transport: Arc<dyn Transport>,
    snapshot: watch::Sender<Snapshot>,
    channels: tokio::sync::Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
    claimed: Mutex<HashSet<String>>,
    middleware: RwLock<MiddlewareList>,
    tasks: TaskSet,
}

impl HostState {
    pub(crate) fn new(config: HostConfig, transport: Arc<dyn Transport>) -> HostState {
        let snapshot = Snapshot {
            status: HostStatus {
                connection: ConnectionState::Disconnected,
                lifecycle: Lifecycle::Created,
            },
            connection: None,
        };

        HostState {
            config,
            transport,
            snapshot: watch::channel(snapshot).0,
            channels: tokio::sync::Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
            middleware: RwLock::new(MiddlewareList::new()),
            tasks: TaskSet::new(),
        }
    }

    pub(crate) fn status(&self) -> HostStatus {
        self.snapshot.borrow().status
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.status().lifecycle.is_shutting_down()
    }

    /// Created → Running.
    pub(crate) fn begin_running(&self) -> Result<(), AmqpError> {
        let mut outcome = Ok(());
        self.snapshot.send_if_modified(|s| match s.status.lifecycle {
            Lifecycle::Created => {
                s.status.lifecycle = Lifecycle::Running;
                true
            }
            Lifecycle::Running => {
                outcome = Err(AmqpError::AlreadyStarted);
                false
            }
            _ => {
                outcome = Err(AmqpError::ShuttingDown);
                false
            }
        });
        outcome
    }

    /// Publishes a fresh connection. Refused once shutdown began.
    pub(crate) fn publish_connection(&self, connection: Arc<dyn BrokerConnection>) -> bool {
        self.snapshot.send_if_modified(|s| {
            if s.status.lifecycle.is_shutting_down() {
                return false;
            }
            s.status.connection = ConnectionState::Connected;
            s.connection = Some(connection);
            true
        })
    }

    /// Drops the current connection. Returns false when shutdown began.
    pub(crate) fn connection_lost(&self) -> bool {
        self.snapshot.send_if_modified(|s| {
            if s.status.lifecycle.is_shutting_down() {
                return false;
            }
            s.status.connection = ConnectionState::Disconnected;
            s.connection = None;
            true
        })
    }

    /// Running → ShuttingDown, disconnected. Returns false if shutdown already began.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.snapshot.send_if_modified(|s| {
            if s.status.lifecycle.is_shutting_down() {
                return false;
            }
            s.status.lifecycle = Lifecycle::ShuttingDown;
            s.status.connection = ConnectionState::Disconnected;
            true
        })
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut connection = None;
        self.snapshot.send_modify(|s| connection = s.connection.take());
        connection
    }

    pub(crate) fn finish_shutdown(&self) {
        self.snapshot
            .send_modify(|s| s.status.lifecycle = Lifecycle::Stopped);
    }

    /// Waits for a live connection. Returns `None` once shutdown began.
    pub(crate) async fn wait_connected(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut rx = self.snapshot.subscribe();
        let snapshot = rx
            .wait_for(|s| s.status.lifecycle.is_shutting_down() || s.connection.is_some())
            .await
            .ok()?;

        if snapshot.status.lifecycle.is_shutting_down() {
            return None;
        }
        snapshot.connection.clone()
    }

    pub(crate) async fn wait_shutdown(&self) {
        let mut rx = self.snapshot.subscribe();
        let _ = rx
            .wait_for(|s| s.status.lifecycle.is_shutting_down())
            .await;
    }

    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.snapshot.subscribe();
        let _ = rx
            .wait_for(|s| s.status.lifecycle == Lifecycle::Stopped)
            .await;
    }

    /// Sleeps for `duration`. Returns false if shutdown began in the meantime.
    pub(crate) async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutting_down(),
            _ = self.wait_shutdown() => false,
        }
    }

    /// Records the live channel of `key`. Refused once shutdown began.
    pub(crate) async fn register_channel(
        &self,
        key: &str,
        channel: Arc<dyn BrokerChannel>,
    ) -> bool {
        let mut channels = self.channels.lock().await;
        if self.is_shutting_down() {
            return false;
        }
        channels.insert(key.to_owned(), channel);
        true
    }

    /// Removes the entry of `key` if it still points to `channel`.
    pub(crate) async fn unregister_channel(&self, key: &str, channel: &Arc<dyn BrokerChannel>) {
        let mut channels = self.channels.lock().await;
        if channels
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, channel))
        {
            channels.remove(key);
        }
    }

    pub(crate) async fn drain_channels(&self) -> Vec<(String, Arc<dyn BrokerChannel>)> {
        self.channels.lock().await.drain().collect()
    }

    pub(crate) async fn open_channels(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reserves `key` for one supervisor. Returns false if it is already taken.
    pub(crate) fn claim_queue(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned())
    }

    pub(crate) fn add_middleware(&self, middleware: Vec<crate::middleware::HostMiddleware>) {
        self.middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(middleware);
    }

    pub(crate) fn middleware(&self) -> MiddlewareList {
        self.middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawns a task `stop` will wait for. Returns false once the set was drained.
    pub(crate) fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task)
    }

    pub(crate) async fn wait_tasks(&self) {
        self.tasks.close_and_wait().await;
    }
}
