//! In-flight execution tracking
//!
//! At most one execution runs per cache-miss signature. The first caller
//! becomes the leader and gets a [`FlightGuard`]; concurrent callers become
//! followers and wait on a watch channel for the leader's shared result. A
//! leader that goes away without completing (cancelled request) closes the
//! channel, and its followers retry from the top.

use super::CacheEntry;
use crate::error::EngineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Result shared by a leader with its followers.
pub type Shared = std::result::Result<Arc<CacheEntry>, EngineError>;

type Slot = Option<Shared>;

#[derive(Default)]
pub struct InFlight {
    calls: Arc<Mutex<HashMap<String, (u64, watch::Receiver<Slot>)>>>,
    next_id: AtomicU64,
}

pub enum Flight {
    Leader(FlightGuard),
    Follower(watch::Receiver<Slot>),
}

impl InFlight {
    /// Register interest in `signature`.
    pub fn join(&self, signature: &str) -> Flight {
        let mut calls = self.calls.lock();
        if let Some((_, rx)) = calls.get(signature) {
            return Flight::Follower(rx.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        calls.insert(signature.to_string(), (id, rx));
        Flight::Leader(FlightGuard {
            calls: Arc::clone(&self.calls),
            signature: signature.to_string(),
            id,
            tx: Some(tx),
        })
    }

    /// Number of signatures currently executing.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the leader. `None` means the leader was dropped without a
    /// result and the caller should try again.
    pub async fn wait(mut rx: watch::Receiver<Slot>) -> Option<Shared> {
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return Some(result);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Held by the leader for the duration of its execution.
pub struct FlightGuard {
    calls: Arc<Mutex<HashMap<String, (u64, watch::Receiver<Slot>)>>>,
    signature: String,
    id: u64,
    tx: Option<watch::Sender<Slot>>,
}

impl FlightGuard {
    /// Publish the result to every follower and retire the flight. Callers
    /// store successful results in the cache first so that requests arriving
    /// after this point hit the cache instead of starting a new flight.
    pub fn complete(mut self, result: Shared) {
        self.retire();
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }

    fn retire(&self) {
        let mut calls = self.calls.lock();
        if calls.get(&self.signature).map_or(false, |(id, _)| *id == self.id) {
            calls.remove(&self.signature);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!("In-flight leader for {} abandoned", self.signature);
            self.retire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueryRows;

    fn entry() -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new("SELECT 1".into(), QueryRows::default(), 1))
    }

    #[tokio::test]
    async fn test_follower_receives_leader_result() {
        let inflight = InFlight::default();
        let Flight::Leader(guard) = inflight.join("sig") else {
            panic!("first caller must lead");
        };
        let Flight::Follower(rx) = inflight.join("sig") else {
            panic!("second caller must follow");
        };

        let waiter = tokio::spawn(InFlight::wait(rx));
        guard.complete(Ok(entry()));

        let shared = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(shared.sql, "SELECT 1");
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let inflight = InFlight::default();
        let Flight::Leader(guard) = inflight.join("sig") else {
            panic!("first caller must lead");
        };
        let Flight::Follower(rx) = inflight.join("sig") else {
            panic!("second caller must follow");
        };
        guard.complete(Err(EngineError::ExecutionTimeout { after_ms: 10 }));
        let shared = InFlight::wait(rx).await.unwrap();
        assert_eq!(shared.unwrap_err(), EngineError::ExecutionTimeout { after_ms: 10 });
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_followers() {
        let inflight = InFlight::default();
        let Flight::Leader(guard) = inflight.join("sig") else {
            panic!("first caller must lead");
        };
        let Flight::Follower(rx) = inflight.join("sig") else {
            panic!("second caller must follow");
        };
        drop(guard);

        assert!(InFlight::wait(rx).await.is_none());
        assert!(matches!(inflight.join("sig"), Flight::Leader(_)));
    }
}
