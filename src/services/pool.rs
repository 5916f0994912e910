use crate::errors::ToolError;
use crate::services::logger::Logger;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Builds and tears down the sessions a pool hands out.
#[async_trait]
pub trait SessionFactory<T>: Send + Sync {
    async fn create(&self, key: &str) -> Result<T, ToolError>;
    async fn close(&self, key: &str, session: Arc<T>);
}

struct Entry<T> {
    session: Arc<T>,
    last_used: Instant,
    leases: usize,
}

/// `creating` counts sessions being built; they hold a slot against the cap.
struct PoolState<T> {
    entries: HashMap<String, Entry<T>>,
    creating: usize,
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn release(&self, key: &str) {
        if let Some(entry) = self.state().entries.get_mut(key) {
            entry.leases = entry.leases.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

/// A reserved slot. Dropped unfilled (failed or abandoned create), it is
/// handed back.
struct SlotReservation<T> {
    shared: Arc<Shared<T>>,
    filled: bool,
}

impl<T> SlotReservation<T> {
    fn fill(mut self, key: &str, session: Arc<T>) {
        self.filled = true;
        let mut state = self.shared.state();
        state.creating = state.creating.saturating_sub(1);
        state.entries.insert(
            key.to_string(),
            Entry {
                session,
                last_used: Instant::now(),
                leases: 1,
            },
        );
    }
}

impl<T> Drop for SlotReservation<T> {
    fn drop(&mut self) {
        if !self.filled {
            let mut state = self.shared.state();
            state.creating = state.creating.saturating_sub(1);
        }
    }
}

pub struct Lease<T> {
    key: String,
    session: Arc<T>,
    shared: Arc<Shared<T>>,
    released: bool,
}

impl<T> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<T> Lease<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &Arc<T> {
        &self.session
    }

    /// Safe to call more than once; only the first call counts.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(&self.key);
        }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_entries: usize,
    pub idle_ttl: Duration,
}

pub struct ConnectionPool<T> {
    logger: Logger,
    limits: PoolLimits,
    factory: Arc<dyn SessionFactory<T>>,
    shared: Arc<Shared<T>>,
    /// Serializes session creation per key; other keys proceed.
    create_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl<T: Send + Sync + 'static> ConnectionPool<T> {
    pub fn new(logger: Logger, limits: PoolLimits, factory: Arc<dyn SessionFactory<T>>) -> Self {
        Self {
            logger: logger.child("pool"),
            limits: PoolLimits {
                max_entries: limits.max_entries.max(1),
                idle_ttl: limits.idle_ttl,
            },
            factory,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    creating: 0,
                }),
            }),
            create_gates: DashMap::new(),
        }
    }

    fn try_reuse(&self, key: &str) -> Option<Lease<T>> {
        let mut state = self.shared.state();
        let entry = state.entries.get_mut(key)?;
        entry.leases += 1;
        entry.last_used = Instant::now();
        Some(Lease {
            key: key.to_string(),
            session: entry.session.clone(),
            shared: self.shared.clone(),
            released: false,
        })
    }

    /// Reserves a slot for a new session. When the pool is full, the least
    /// recently used idle entry is unlinked and returned for closing; with
    /// every entry leased the pool reports capacity.
    fn reserve_slot(&self) -> Result<(SlotReservation<T>, Option<(String, Arc<T>)>), ToolError> {
        let mut state = self.shared.state();
        let mut victim = None;
        if state.entries.len() + state.creating >= self.limits.max_entries {
            let key = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.leases == 0)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = key else {
                return Err(ToolError::capacity(format!(
                    "Connection pool is full ({} sessions, all in use)",
                    state.entries.len() + state.creating
                )));
            };
            victim = state.entries.remove(&key).map(|entry| (key, entry.session));
        }
        state.creating += 1;
        Ok((
            SlotReservation {
                shared: self.shared.clone(),
                filled: false,
            },
            victim,
        ))
    }

    pub async fn acquire(&self, key: &str) -> Result<Lease<T>, ToolError> {
        if let Some(lease) = self.try_reuse(key) {
            return Ok(lease);
        }
        let gate = self
            .create_gates
            .entry(key.to_string())
            .or_default()
            .clone();
        let _gate = gate.lock().await;
        if let Some(lease) = self.try_reuse(key) {
            return Ok(lease);
        }
        let (slot, victim) = self.reserve_slot()?;
        if let Some((victim, session)) = victim {
            self.logger.info(
                "evicting idle session",
                Some(&serde_json::json!({ "key": victim, "for": key })),
            );
            self.factory.close(&victim, session).await;
        }

        self.logger
            .debug("creating session", Some(&serde_json::json!({ "key": key })));
        let session = Arc::new(self.factory.create(key).await?);
        slot.fill(key, session.clone());
        Ok(Lease {
            key: key.to_string(),
            session,
            shared: self.shared.clone(),
            released: false,
        })
    }

    pub fn release(&self, lease: &mut Lease<T>) {
        lease.release();
    }

    /// Closes idle entries whose idle time reached the TTL.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(String, Arc<T>)> = {
            let mut state = self.shared.state();
            let keys: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.leases == 0
                        && now.saturating_duration_since(entry.last_used) >= self.limits.idle_ttl
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| state.entries.remove(&key).map(|entry| (key, entry.session)))
                .collect()
        };
        let count = expired.len();
        for (key, session) in expired {
            self.logger
                .debug("closing idle session", Some(&serde_json::json!({ "key": key })));
            self.factory.close(&key, session).await;
        }
        count
    }

    /// Sweeps every `every` until the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.sweep(Instant::now()).await;
            }
        })
    }

    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<T>)> = self
            .shared
            .state()
            .entries
            .drain()
            .map(|(key, entry)| (key, entry.session))
            .collect();
        for (key, session) in drained {
            self.factory.close(&key, session).await;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lease_count(&self, key: &str) -> Option<usize> {
        self.shared.state().entries.get(key).map(|entry| entry.leases)
    }

    pub fn stats(&self) -> serde_json::Value {
        let state = self.shared.state();
        let leased = state.entries.values().filter(|e| e.leases > 0).count();
        serde_json::json!({
            "entries": state.entries.len(),
            "creating": state.creating,
            "leased": leased,
            "idle": state.entries.len() - leased,
            "max_entries": self.limits.max_entries,
            "idle_ttl_seconds": self.limits.idle_ttl.as_secs(),
        })
    }
}
