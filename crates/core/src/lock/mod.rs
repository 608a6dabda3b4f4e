//! Key-granular lease locks with heartbeat and stale takeover.
//!
//! Every mutation of shared state in the engine is gated through this
//! module. A lock is a named lease: it expires on its own, and a holder that
//! stops heartbeating is taken over after a fixed staleness threshold. The
//! takeover path is the designed recovery for crashed holders, not a
//! failure.
//!
//! The store guard is held only across the compare-and-swap window, never
//! across a caller's critical section.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::ApplicationError;

/// Lease duration granted per acquisition and per heartbeat.
pub const LEASE_MS: i64 = 300_000;

/// A holder that has not heartbeat within this window is considered dead.
pub const STALE_THRESHOLD_MS: i64 = 8_000;

/// Extra lifetime on store entries past the lease, so a live record is never
/// evicted out from under its holder.
pub const STORE_TTL_CUSHION_MS: i64 = 30_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub operation: String,
    pub priority: u8,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// A lease is live iff unexpired and recently heartbeat.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
            && now - self.last_heartbeat <= Duration::milliseconds(STALE_THRESHOLD_MS)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Key is held by a live lease; caller backs off and retries.
    Held { holder_id: String },
    /// Previous holder was dead; the candidate record replaced it.
    TakenOver { previous_holder: String },
}

/// Storage seam for lease records. Implementations perform each call
/// atomically under their own short-lived guard.
pub trait LeaseStore: Send + Sync {
    fn try_acquire(&self, key: &str, candidate: LeaseRecord, now: DateTime<Utc>)
        -> AcquireOutcome;

    /// Extends the lease iff the stored holder matches.
    fn heartbeat(
        &self,
        key: &str,
        holder_id: &str,
        beat_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> bool;

    /// Removes the record iff the stored holder matches. Idempotent.
    fn release(&self, key: &str, holder_id: &str) -> bool;

    fn load(&self, key: &str) -> Option<LeaseRecord>;
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    records: Mutex<HashMap<String, LeaseRecord>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LeaseRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire(
        &self,
        key: &str,
        candidate: LeaseRecord,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let mut records = self.lock();

        // Entries past lease + cushion are garbage regardless of liveness.
        records.retain(|_, record| {
            now <= record.expires_at + Duration::milliseconds(STORE_TTL_CUSHION_MS)
        });

        match records.get(key) {
            None => {
                records.insert(key.to_string(), candidate);
                AcquireOutcome::Acquired
            }
            Some(existing) if existing.is_live(now) => {
                AcquireOutcome::Held { holder_id: existing.holder_id.clone() }
            }
            Some(existing) => {
                let previous_holder = existing.holder_id.clone();
                records.insert(key.to_string(), candidate);
                AcquireOutcome::TakenOver { previous_holder }
            }
        }
    }

    fn heartbeat(
        &self,
        key: &str,
        holder_id: &str,
        beat_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> bool {
        let mut records = self.lock();
        match records.get_mut(key) {
            Some(record) if record.holder_id == holder_id => {
                record.last_heartbeat = beat_at;
                record.expires_at = expires_at;
                true
            }
            _ => false,
        }
    }

    fn release(&self, key: &str, holder_id: &str) -> bool {
        let mut records = self.lock();
        match records.get(key) {
            Some(record) if record.holder_id == holder_id => {
                records.remove(key);
                true
            }
            _ => false,
        }
    }

    fn load(&self, key: &str) -> Option<LeaseRecord> {
        self.lock().get(key).cloned()
    }
}

#[derive(Clone, Debug)]
pub struct LockHandle {
    pub key: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Heartbeat hook handed to critical sections running longer than half the
/// lease.
#[derive(Clone)]
pub struct LockBeat {
    store: Arc<dyn LeaseStore>,
    key: String,
    holder_id: String,
}

impl LockBeat {
    /// Returns false when the lock is gone or owned by someone else; the
    /// section should abandon its work in that case.
    pub fn beat(&self) -> bool {
        let now = Utc::now();
        self.store.heartbeat(
            &self.key,
            &self.holder_id,
            now,
            now + Duration::milliseconds(LEASE_MS),
        )
    }
}

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub lease_ms: i64,
    pub default_max_wait_ms: u64,
    /// Base backoff per retry, scaled by priority (lower priority number =
    /// faster retries).
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: LEASE_MS,
            default_max_wait_ms: 10_000,
            backoff_base_ms: 25,
            backoff_cap_ms: 800,
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLeaseStore::new()), LockConfig::default())
    }

    /// Blocks up to `max_wait_ms` for the key. `None` on timeout; callers
    /// treat that as transient and may retry at their own level.
    pub async fn acquire(
        &self,
        key: &str,
        operation: &str,
        priority: u8,
        max_wait_ms: u64,
    ) -> Option<LockHandle> {
        let deadline = tokio::time::Instant::now() + StdDuration::from_millis(max_wait_ms);
        let scale = u64::from(priority) + 1;
        let mut backoff = self.config.backoff_base_ms * scale;
        let cap = self.config.backoff_cap_ms * scale;

        loop {
            let now = Utc::now();
            let candidate = LeaseRecord {
                holder_id: Uuid::new_v4().to_string(),
                operation: operation.to_string(),
                priority,
                acquired_at: now,
                last_heartbeat: now,
                expires_at: now + Duration::milliseconds(self.config.lease_ms),
            };
            let holder_id = candidate.holder_id.clone();
            let expires_at = candidate.expires_at;

            match self.store.try_acquire(key, candidate, now) {
                AcquireOutcome::Acquired => {
                    debug!(event_name = "lock.acquired", key, operation, "lock acquired");
                    return Some(LockHandle { key: key.to_string(), holder_id, expires_at });
                }
                AcquireOutcome::TakenOver { previous_holder } => {
                    warn!(
                        event_name = "lock.takeover",
                        key,
                        operation,
                        previous_holder,
                        "took over stale lock"
                    );
                    return Some(LockHandle { key: key.to_string(), holder_id, expires_at });
                }
                AcquireOutcome::Held { .. } => {
                    let delay = StdDuration::from_millis(backoff.min(cap) + jitter_ms());
                    if tokio::time::Instant::now() + delay >= deadline {
                        debug!(event_name = "lock.timeout", key, operation, "gave up on lock");
                        return None;
                    }
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Idempotent; removes the record only when the handle still owns it.
    pub fn release(&self, handle: &LockHandle) {
        self.store.release(&handle.key, &handle.holder_id);
    }

    pub fn heartbeat(&self, handle: &mut LockHandle) -> bool {
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds(self.config.lease_ms);
        if self.store.heartbeat(&handle.key, &handle.holder_id, now, expires_at) {
            handle.expires_at = expires_at;
            true
        } else {
            false
        }
    }

    /// Runs `f` under the key lock, releasing on every exit path including
    /// unwind. The closure receives a [`LockBeat`] for long sections.
    pub async fn with_key_lock<T, F, Fut>(
        &self,
        key: &str,
        operation: &str,
        priority: u8,
        f: F,
    ) -> Result<T, ApplicationError>
    where
        F: FnOnce(LockBeat) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self
            .acquire(key, operation, priority, self.config.default_max_wait_ms)
            .await
            .ok_or_else(|| ApplicationError::LockTimeout { key: key.to_string() })?;

        let _release = ReleaseGuard {
            store: Arc::clone(&self.store),
            key: handle.key.clone(),
            holder_id: handle.holder_id.clone(),
        };
        let beat = LockBeat {
            store: Arc::clone(&self.store),
            key: handle.key.clone(),
            holder_id: handle.holder_id.clone(),
        };

        Ok(f(beat).await)
    }

    /// Row-granular lock, key `row:<table>:<rowId>`.
    pub async fn with_row_lock<T, F, Fut>(
        &self,
        table: &str,
        row_id: u32,
        operation: &str,
        f: F,
    ) -> Result<T, ApplicationError>
    where
        F: FnOnce(LockBeat) -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_key_lock(&row_lock_key(table, row_id), operation, 3, f).await
    }

    #[doc(hidden)]
    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }
}

pub fn row_lock_key(table: &str, row_id: u32) -> String {
    format!("row:{table}:{row_id}")
}

/// Primary-key lock used when two entry points may race on the same request
/// while its row index shifts.
pub fn row_key_lock_key(table: &str, request_number: &str) -> String {
    format!("rowkey:{table}:{request_number}")
}

struct ReleaseGuard {
    store: Arc<dyn LeaseStore>,
    key: String,
    holder_id: String,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.store.release(&self.key, &self.holder_id);
    }
}

// LCG-style jitter from the wall clock; not worth a rand dependency.
fn jitter_ms() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}
