//! Backend pool
//!
//! Every configured server owns a single-permit semaphore. Selection sweeps
//! the servers, claims a free permit without waiting, and probes the server
//! while holding it. A failed probe gives the permit back at once so a dead
//! server never blocks anyone else. When a whole sweep comes up empty the
//! caller backs off for the poll interval and sweeps again until its deadline.
//! A single probe is also bounded by the probe timeout, so a server that
//! accepts connections but never answers cannot hold a caller past it.

use crate::llm::ChatBackend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A configured chat server; identity is the URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendServer {
    pub name: String,
    pub url: String,
}

impl BackendServer {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no backend became available within {waited:?}")]
    Timeout { waited: Duration },

    #[error("no backend servers are configured")]
    NoServers,
}

struct Slot {
    server: BackendServer,
    permit: Arc<Semaphore>,
}

/// Exclusive hold on one backend
///
/// Dropping the lease frees the server, on success, on error and when the
/// owning future is cancelled.
#[derive(Debug)]
pub struct BackendLease {
    server: BackendServer,
    _permit: OwnedSemaphorePermit,
}

impl BackendLease {
    pub fn server(&self) -> &BackendServer {
        &self.server
    }
}

pub struct BackendPool {
    model: String,
    slots: Vec<Slot>,
    backend: Arc<dyn ChatBackend>,
    poll_interval: Duration,
    probe_timeout: Duration,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(
        model: impl Into<String>,
        servers: Vec<BackendServer>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let slots = servers
            .into_iter()
            .map(|server| Slot {
                server,
                permit: Arc::new(Semaphore::new(1)),
            })
            .collect();
        Self {
            model: model.into(),
            slots,
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn servers(&self) -> impl Iterator<Item = &BackendServer> {
        self.slots.iter().map(|slot| &slot.server)
    }

    /// Number of servers currently leased out
    pub fn held_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.permit.available_permits() == 0)
            .count()
    }

    pub fn is_held(&self, url: &str) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.server.url == url && slot.permit.available_permits() == 0)
    }

    /// Lease an idle server that answers its probe, or fail once `deadline` passes
    pub async fn select_server(&self, deadline: Instant) -> Result<BackendLease, PoolError> {
        if self.slots.is_empty() {
            return Err(PoolError::NoServers);
        }
        let started = Instant::now();

        loop {
            if let Some(lease) = self.sweep(deadline).await {
                tracing::info!(
                    "Selected backend {} ({})",
                    lease.server.name,
                    lease.server.url
                );
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout {
                    waited: now - started,
                });
            }
            tracing::debug!(
                "All {} backends busy or unreachable, retrying in {:?}",
                self.slots.len(),
                self.poll_interval
            );
            tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }

    /// One pass over every server, starting where the previous pass left off
    async fn sweep(&self, deadline: Instant) -> Option<BackendLease> {
        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;

        for offset in 0..len {
            if Instant::now() >= deadline {
                return None;
            }
            let slot = &self.slots[(start + offset) % len];
            let Ok(permit) = Arc::clone(&slot.permit).try_acquire_owned() else {
                continue;
            };

            let probe = self.backend.probe(&slot.server.url, &self.model);
            let probe_deadline = deadline.min(Instant::now() + self.probe_timeout);
            match tokio::time::timeout_at(probe_deadline, probe).await {
                Ok(Ok(())) => {
                    return Some(BackendLease {
                        server: slot.server.clone(),
                        _permit: permit,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!("Backend {} failed probe: {}", slot.server.name, e);
                }
                Err(_) => {
                    tracing::warn!("Backend {} did not answer its probe in time", slot.server.name);
                }
            }
            drop(permit);
        }
        None
    }
}
