//! A config paired with its live driver.

use async_lock::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use super::traits::{BoxedDriver, Driver};
use crate::error::{Error, Result};
use crate::services::config::{DatabaseKind, DbConfig};
use crate::services::deadline::{Timeouts, with_deadline};

/// Lifecycle of one connection.
///
/// `Unconnected -> Connected -> (Reconnecting <-> Connected) -> Closed`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unconnected = 0,
    Connected = 1,
    Reconnecting = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Reconnecting,
            3 => Self::Closed,
            _ => Self::Unconnected,
        }
    }
}

/// Resets the state to `Unconnected` unless disarmed, so a connect future
/// dropped mid-flight never leaves `Reconnecting` behind.
struct ConnectGuard<'a> {
    state: &'a AtomicU8,
    armed: bool,
}

impl ConnectGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .store(ConnectionState::Unconnected as u8, Ordering::SeqCst);
        }
    }
}

/// Read-only view of one connection, for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub name: String,
    pub kind: DatabaseKind,
    pub state: ConnectionState,
    pub is_default: bool,
}

pub struct DbConnection {
    config: DbConfig,
    driver: BoxedDriver,
    state: AtomicU8,
    /// Serializes ping/reconnect on this entry
    reconnect: Mutex<()>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl DbConnection {
    pub fn new(config: DbConfig, driver: BoxedDriver) -> Self {
        Self {
            config,
            driver,
            state: AtomicU8::new(ConnectionState::Unconnected as u8),
            reconnect: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn kind(&self) -> DatabaseKind {
        self.config.kind
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// The driver, valid only while the caller holds this connection.
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn status(&self, is_default: bool) -> ConnectionStatus {
        ConnectionStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind,
            state: self.state(),
            is_default,
        }
    }

    /// Connect under the connect deadline.
    pub async fn connect(&self, timeouts: &Timeouts) -> Result<()> {
        let guard = ConnectGuard {
            state: &self.state,
            armed: true,
        };
        let result = with_deadline(timeouts.connect, self.driver.connect(&self.config)).await;
        guard.disarm();

        match result {
            Some(Ok(())) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Some(Err(e)) => {
                self.set_state(ConnectionState::Unconnected);
                Err(Error::ConnectFailed {
                    id: self.config.id.clone(),
                    reason: format!("{:#}", e),
                })
            }
            None => {
                self.set_state(ConnectionState::Unconnected);
                Err(Error::ConnectTimeout {
                    id: self.config.id.clone(),
                    secs: timeouts.connect.as_secs(),
                })
            }
        }
    }

    /// Ping under `limit`; a timed-out ping counts as dead.
    pub async fn ping(&self, limit: Duration) -> bool {
        with_deadline(limit, self.driver.ping())
            .await
            .unwrap_or(false)
    }

    /// Ping, and reconnect with the same config if the ping fails.
    pub async fn ensure_live(&self, timeouts: &Timeouts) -> Result<()> {
        let _serial = self.reconnect.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(Error::ManagerClosed);
        }
        if self.ping(timeouts.ping).await {
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }

        tracing::warn!(id = %self.config.id, kind = %self.config.kind, "ping failed, reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        match self.connect(timeouts).await {
            Ok(()) => {
                tracing::info!(id = %self.config.id, "connection restored");
                Ok(())
            }
            Err(e) => Err(Error::ReconnectFailed {
                id: self.config.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Close the driver. The entry is terminal afterwards.
    pub async fn close(&self) -> anyhow::Result<()> {
        let _serial = self.reconnect.lock().await;
        self.set_state(ConnectionState::Closed);
        self.driver.close().await
    }
}
