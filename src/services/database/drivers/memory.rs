//! In-process driver for dry runs and tests.
//!
//! A [`MemoryProbe`] is the shared knob board: every driver built from the
//! same probe sees the same reachability and reports into the same counters.

use anyhow::{Result, bail};
use async_trait::async_trait;
use smol::Timer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::services::config::{DatabaseKind, DbConfig};
use crate::services::database::traits::{BoxedDriver, Driver};

#[derive(Debug)]
struct ProbeState {
    reachable: AtomicBool,
    fail_close: AtomicBool,
    connect_delay_ms: AtomicU64,
    connects: AtomicUsize,
    pings: AtomicUsize,
    closes: AtomicUsize,
}

/// Shared, clonable control handle for memory drivers
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    state: Arc<ProbeState>,
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ProbeState {
                reachable: AtomicBool::new(true),
                fail_close: AtomicBool::new(false),
                connect_delay_ms: AtomicU64::new(0),
                connects: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Whether connects and pings can reach the "server".
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::SeqCst)
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn driver(&self, kind: DatabaseKind) -> BoxedDriver {
        Box::new(MemoryDriver {
            kind,
            probe: self.clone(),
            connected: AtomicBool::new(false),
        })
    }
}

/// Driver that talks to nothing
#[derive(Debug)]
pub struct MemoryDriver {
    kind: DatabaseKind,
    probe: MemoryProbe,
    connected: AtomicBool,
}

#[async_trait]
impl Driver for MemoryDriver {
    fn kind(&self) -> DatabaseKind {
        self.kind
    }

    async fn connect(&self, config: &DbConfig) -> Result<()> {
        let state = &self.probe.state;
        state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            Timer::after(Duration::from_millis(delay)).await;
        }
        if !self.probe.is_reachable() {
            self.connected.store(false, Ordering::SeqCst);
            bail!("connection refused by {}", config.label());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.probe.state.pings.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst) && self.probe.is_reachable()
    }

    async fn close(&self) -> Result<()> {
        let state = &self.probe.state;
        state.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if state.fail_close.load(Ordering::SeqCst) {
            bail!("close failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_controls_driver() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let driver = probe.driver(DatabaseKind::Postgres);
            let config = DbConfig::new("a", DatabaseKind::Postgres);

            assert!(!driver.ping().await);
            driver.connect(&config).await.unwrap();
            assert!(driver.ping().await);

            probe.set_reachable(false);
            assert!(!driver.ping().await);
            assert!(driver.connect(&config).await.is_err());

            driver.close().await.unwrap();
            assert_eq!(probe.connects(), 2);
            assert_eq!(probe.pings(), 3);
            assert_eq!(probe.closes(), 1);
        });
    }
}
