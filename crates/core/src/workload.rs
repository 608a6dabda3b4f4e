//! Serialized non-negative counters: per-agent workload seconds and the
//! per-prefix request-number sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::domain::agent::{Agent, AgentStatus};
use crate::domain::request::{RequestNumber, RequestPrefix};
use crate::errors::ApplicationError;
use crate::lock::LockManager;

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Agent>, ApplicationError>;

    /// Adds `delta_seconds` (may be negative), clamping the result at zero.
    /// Returns the new total. Callers serialize through [`WorkloadCounter`].
    async fn add_workload(&self, name: &str, delta_seconds: i64)
        -> Result<i64, ApplicationError>;

    /// Every known agent name; the repair sweep walks their tables.
    async fn list_names(&self) -> Result<Vec<String>, ApplicationError>;
}

#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: Mutex<HashMap<String, Agent>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, agent: Agent) {
        if let Ok(mut agents) = self.agents.lock() {
            agents.insert(agent.name.clone(), agent);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Agent>> {
        match self.agents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, name: &str) -> Result<Option<Agent>, ApplicationError> {
        Ok(self.lock().get(name).cloned())
    }

    async fn add_workload(
        &self,
        name: &str,
        delta_seconds: i64,
    ) -> Result<i64, ApplicationError> {
        let mut agents = self.lock();
        let agent = agents.entry(name.to_string()).or_insert_with(|| Agent {
            name: name.to_string(),
            active: true,
            status: AgentStatus::Free,
            workload_seconds: 0,
        });
        // Workload never goes negative.
        agent.workload_seconds = (agent.workload_seconds + delta_seconds).max(0);
        Ok(agent.workload_seconds)
    }

    async fn list_names(&self) -> Result<Vec<String>, ApplicationError> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Global short-lived lock around every workload mutation.
const WORKLOAD_LOCK_KEY: &str = "workload";

#[derive(Clone)]
pub struct WorkloadCounter {
    agents: Arc<dyn AgentStore>,
    locks: LockManager,
}

impl WorkloadCounter {
    pub fn new(agents: Arc<dyn AgentStore>, locks: LockManager) -> Self {
        Self { agents, locks }
    }

    pub async fn add(&self, agent: &str, delta_seconds: i64) -> Result<i64, ApplicationError> {
        self.locks
            .with_key_lock(WORKLOAD_LOCK_KEY, "workload.add", 1, |_| async {
                self.agents.add_workload(agent, delta_seconds).await
            })
            .await?
    }

    pub async fn get(&self, agent: &str) -> Result<Option<Agent>, ApplicationError> {
        self.agents.get(agent).await
    }

    pub async fn agent_names(&self) -> Result<Vec<String>, ApplicationError> {
        self.agents.list_names().await
    }
}

/// Durable integer slot; the request-number sequence reconciles three of
/// these per prefix.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<i64>, ApplicationError>;
    async fn store(&self, key: &str, value: i64) -> Result<(), ApplicationError>;
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    values: Mutex<HashMap<String, i64>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, key: &str, value: i64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn load(&self, key: &str) -> Result<Option<i64>, ApplicationError> {
        Ok(self.values.lock().ok().and_then(|values| values.get(key).copied()))
    }

    async fn store(&self, key: &str, value: i64) -> Result<(), ApplicationError> {
        self.values
            .lock()
            .map(|mut values| {
                values.insert(key.to_string(), value);
            })
            .map_err(|_| ApplicationError::Persistence("counter store poisoned".into()))
    }
}

/// Allocates `<abbr>/MDM/<unit>/<counter>` numbers, strictly monotonic per
/// prefix within a run.
///
/// The next value reconciles three sources (the durable property slot, the
/// tracker-table slot, and the in-process memo) and advances all three. A
/// write failure degrades to a wall-clock-derived number so submission never
/// blocks; the degradation is surfaced in the logs.
pub struct RequestNumberAllocator {
    durable: Arc<dyn CounterStore>,
    tracker: Arc<dyn CounterStore>,
    locks: LockManager,
    memo: Mutex<HashMap<String, i64>>,
}

impl RequestNumberAllocator {
    pub fn new(
        durable: Arc<dyn CounterStore>,
        tracker: Arc<dyn CounterStore>,
        locks: LockManager,
    ) -> Self {
        Self { durable, tracker, locks, memo: Mutex::new(HashMap::new()) }
    }

    pub async fn next(&self, prefix: &RequestPrefix, now: DateTime<Utc>) -> RequestNumber {
        let key = prefix.counter_key();
        let lock_key = format!("reqnum:{key}");

        let outcome = self
            .locks
            .with_key_lock(&lock_key, "reqnum.next", 1, |_| async {
                self.reconcile_and_advance(&key).await
            })
            .await;

        match outcome {
            Ok(Ok(next)) => RequestNumber::format(prefix, next),
            Ok(Err(error)) | Err(error) => {
                let fallback = now.timestamp().rem_euclid(100_000);
                error!(
                    event_name = "reqnum.fallback",
                    counter_key = %key,
                    error = %error,
                    fallback,
                    "request number sources unavailable, issuing wall-clock fallback"
                );
                if let Ok(mut memo) = self.memo.lock() {
                    memo.remove(&key);
                }
                RequestNumber::format(prefix, fallback)
            }
        }
    }

    async fn reconcile_and_advance(&self, key: &str) -> Result<i64, ApplicationError> {
        let durable = self.durable.load(key).await?.unwrap_or(0);
        let tracker = self.tracker.load(key).await?.unwrap_or(0);
        let memo = self.memo.lock().ok().and_then(|memo| memo.get(key).copied()).unwrap_or(0);

        let current = durable.max(tracker).max(memo);
        let next = current + 1;

        if durable != tracker || tracker != memo {
            info!(
                event_name = "reqnum.reconciled",
                counter_key = key,
                durable,
                tracker,
                memo,
                next,
                "request number sources disagreed, advancing all to max + 1"
            );
        }

        self.durable.store(key, next).await?;
        self.tracker.store(key, next).await?;
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(key.to_string(), next);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::{
        AgentStore, CounterStore, InMemoryAgentStore, InMemoryCounterStore,
        RequestNumberAllocator, WorkloadCounter,
    };
    use crate::domain::request::RequestPrefix;
    use crate::errors::ApplicationError;
    use crate::lock::LockManager;

    struct FailingCounterStore;

    #[async_trait]
    impl CounterStore for FailingCounterStore {
        async fn load(&self, _key: &str) -> Result<Option<i64>, ApplicationError> {
            Ok(Some(10))
        }

        async fn store(&self, _key: &str, _value: i64) -> Result<(), ApplicationError> {
            Err(ApplicationError::Persistence("tracker table unreachable".into()))
        }
    }

    fn allocator(
        durable: Arc<InMemoryCounterStore>,
        tracker: Arc<InMemoryCounterStore>,
    ) -> RequestNumberAllocator {
        RequestNumberAllocator::new(durable, tracker, LockManager::in_memory())
    }

    #[tokio::test]
    async fn workload_add_clamps_at_zero() {
        let agents = Arc::new(InMemoryAgentStore::new());
        let counter = WorkloadCounter::new(Arc::clone(&agents) as Arc<_>, LockManager::in_memory());

        assert_eq!(counter.add("anna", 300).await.expect("add"), 300);
        assert_eq!(counter.add("anna", -500).await.expect("subtract"), 0);
        assert_eq!(counter.add("anna", 120).await.expect("add again"), 120);
    }

    #[tokio::test]
    async fn request_numbers_are_monotonic_per_prefix() {
        let durable = Arc::new(InMemoryCounterStore::new());
        let tracker = Arc::new(InMemoryCounterStore::new());
        let allocator = allocator(durable, tracker);
        let prefix = RequestPrefix::new("BOM", "Retail Unit Alpha");

        let first = allocator.next(&prefix, Utc::now()).await;
        let second = allocator.next(&prefix, Utc::now()).await;

        assert_eq!(first.0, "BOM/MDM/Retail Unit Alpha/00001");
        assert_eq!(second.0, "BOM/MDM/Retail Unit Alpha/00002");

        let other = RequestPrefix::new("PRC", "Retail Unit Alpha");
        let unrelated = allocator.next(&other, Utc::now()).await;
        assert_eq!(unrelated.0, "PRC/MDM/Retail Unit Alpha/00001");
    }

    #[tokio::test]
    async fn reconcile_takes_the_maximum_of_all_three_sources() {
        let durable = Arc::new(InMemoryCounterStore::new());
        let tracker = Arc::new(InMemoryCounterStore::new());
        let prefix = RequestPrefix::new("BOM", "Alpha");
        tracker.seed(&prefix.counter_key(), 41);
        durable.seed(&prefix.counter_key(), 7);

        let allocator = allocator(Arc::clone(&durable), Arc::clone(&tracker));
        let next = allocator.next(&prefix, Utc::now()).await;

        assert_eq!(next.0, "BOM/MDM/Alpha/00042");
        assert_eq!(durable.load(&prefix.counter_key()).await.expect("load"), Some(42));
        assert_eq!(tracker.load(&prefix.counter_key()).await.expect("load"), Some(42));
    }

    #[tokio::test]
    async fn write_failure_falls_back_to_wall_clock_number() {
        let allocator = RequestNumberAllocator::new(
            Arc::new(FailingCounterStore),
            Arc::new(InMemoryCounterStore::new()),
            LockManager::in_memory(),
        );
        let prefix = RequestPrefix::new("BOM", "Alpha");
        let now = Utc::now();

        let number = allocator.next(&prefix, now).await;
        let expected = now.timestamp().rem_euclid(100_000);

        assert_eq!(number.counter(), Some(expected));
        assert_eq!(number.prefix(), Some("BOM/MDM/Alpha"));
    }
}
