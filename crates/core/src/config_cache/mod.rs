//! Memoized configuration lookups.
//!
//! Five relations are read from external configuration tables and held in a
//! short-TTL cache: approver rosters, baseline rules, work-allocation
//! fallbacks, the distribution matrix, and priority weights. The cache is
//! read-mostly and tolerates brief staleness; writers invalidate on refresh
//! signals.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::domain::approval::NO_APPROVER;
use crate::domain::request::RequestType;
use crate::domain::rules::{
    AllocationRule, ApproverRule, BaselineHit, BaselineRule, DistributionMatrix, PriorityWeight,
    ALL,
};
use crate::errors::ApplicationError;

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn approver_rules(&self) -> Result<Vec<ApproverRule>, ApplicationError>;
    async fn baseline_rules(&self) -> Result<Vec<BaselineRule>, ApplicationError>;
    async fn allocation_rules(&self) -> Result<Vec<AllocationRule>, ApplicationError>;
    async fn distribution_matrix(&self) -> Result<DistributionMatrix, ApplicationError>;
    async fn priority_weights(&self) -> Result<Vec<PriorityWeight>, ApplicationError>;
}

struct Cached<T> {
    loaded_at: Instant,
    value: T,
}

#[derive(Default)]
struct CacheState {
    approvers: Option<Cached<Vec<ApproverRule>>>,
    baselines: Option<Cached<Vec<BaselineRule>>>,
    allocations: Option<Cached<Vec<AllocationRule>>>,
    matrix: Option<Cached<DistributionMatrix>>,
    priorities: Option<Cached<Vec<PriorityWeight>>>,
}

#[derive(Clone)]
pub struct ConfigCache {
    source: Arc<dyn RuleSource>,
    rule_ttl: Duration,
    matrix_ttl: Duration,
    state: Arc<Mutex<CacheState>>,
}

/// Default priority when the weight table has no row for a type.
pub const DEFAULT_PRIORITY: u8 = 3;

impl ConfigCache {
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        Self::with_ttls(source, Duration::from_secs(300), Duration::from_secs(6 * 3600))
    }

    pub fn with_ttls(source: Arc<dyn RuleSource>, rule_ttl: Duration, matrix_ttl: Duration) -> Self {
        Self { source, rule_ttl, matrix_ttl, state: Arc::new(Mutex::new(CacheState::default())) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn invalidate(&self) {
        *self.lock() = CacheState::default();
    }

    pub fn invalidate_matrix(&self) {
        self.lock().matrix = None;
    }

    async fn approver_rules(&self) -> Result<Vec<ApproverRule>, ApplicationError> {
        if let Some(cached) = &self.lock().approvers {
            if cached.loaded_at.elapsed() < self.rule_ttl {
                return Ok(cached.value.clone());
            }
        }
        let rules = self.source.approver_rules().await?;
        self.lock().approvers = Some(Cached { loaded_at: Instant::now(), value: rules.clone() });
        Ok(rules)
    }

    async fn baseline_rules(&self) -> Result<Vec<BaselineRule>, ApplicationError> {
        if let Some(cached) = &self.lock().baselines {
            if cached.loaded_at.elapsed() < self.rule_ttl {
                return Ok(cached.value.clone());
            }
        }
        let rules = self.source.baseline_rules().await?;
        self.lock().baselines = Some(Cached { loaded_at: Instant::now(), value: rules.clone() });
        Ok(rules)
    }

    async fn allocation_rules(&self) -> Result<Vec<AllocationRule>, ApplicationError> {
        if let Some(cached) = &self.lock().allocations {
            if cached.loaded_at.elapsed() < self.rule_ttl {
                return Ok(cached.value.clone());
            }
        }
        let rules = self.source.allocation_rules().await?;
        self.lock().allocations = Some(Cached { loaded_at: Instant::now(), value: rules.clone() });
        Ok(rules)
    }

    pub async fn matrix(&self) -> Result<DistributionMatrix, ApplicationError> {
        if let Some(cached) = &self.lock().matrix {
            if cached.loaded_at.elapsed() < self.matrix_ttl {
                return Ok(cached.value.clone());
            }
        }
        let matrix = self.source.distribution_matrix().await?;
        self.lock().matrix = Some(Cached { loaded_at: Instant::now(), value: matrix.clone() });
        Ok(matrix)
    }

    /// Roster for one approval level. Precedence: exact key, then (when
    /// `use_default`) Department→ALL, RequestType→ALL, both→ALL; first
    /// non-empty roster wins. A roster containing the `NO_APPROVER` sentinel
    /// resolves to an empty list: the level auto-approves.
    pub async fn approvers(
        &self,
        business_unit: &str,
        department: &str,
        request_type: RequestType,
        level: u8,
        use_default: bool,
    ) -> Result<Vec<String>, ApplicationError> {
        let rules = self.approver_rules().await?;
        let type_name = request_type.as_str();

        let mut probes: Vec<(&str, &str)> = vec![(department, type_name)];
        if use_default {
            probes.push((ALL, type_name));
            probes.push((department, ALL));
            probes.push((ALL, ALL));
        }

        for (probe_department, probe_type) in probes {
            let roster: Vec<String> = rules
                .iter()
                .filter(|rule| rule.matches(business_unit, probe_department, probe_type, level))
                .flat_map(|rule| rule.approvers.iter().cloned())
                .collect();
            if roster.is_empty() {
                continue;
            }
            if roster.iter().any(|name| name == NO_APPROVER) {
                return Ok(Vec::new());
            }
            return Ok(roster);
        }

        Ok(Vec::new())
    }

    /// Baseline for `(type, total_task)`. A miss is not an error: the request
    /// continues without an estimate.
    pub async fn baseline(
        &self,
        request_type: RequestType,
        total_task: u32,
    ) -> Result<Option<BaselineHit>, ApplicationError> {
        let rules = self.baseline_rules().await?;
        Ok(rules
            .iter()
            .find(|rule| rule.request_type == request_type && rule.range.contains(total_task))
            .map(|rule| BaselineHit { seconds: rule.seconds, per_task: rule.per_task }))
    }

    /// BAU allocation rule with the same wildcard precedence as the approver
    /// roster.
    pub async fn allocation_rule(
        &self,
        business_unit: &str,
        request_type: RequestType,
        department: &str,
    ) -> Result<Option<AllocationRule>, ApplicationError> {
        let rules = self.allocation_rules().await?;
        let type_name = request_type.as_str();

        for (probe_department, probe_type) in
            [(department, type_name), (ALL, type_name), (department, ALL), (ALL, ALL)]
        {
            let hit = rules.iter().find(|rule| {
                rule.business_unit == business_unit
                    && rule.department == probe_department
                    && rule.request_type == probe_type
            });
            if let Some(rule) = hit {
                return Ok(Some(rule.clone()));
            }
        }
        Ok(None)
    }

    pub async fn priority(&self, request_type: RequestType) -> Result<u8, ApplicationError> {
        if let Some(cached) = &self.lock().priorities {
            if cached.loaded_at.elapsed() < self.rule_ttl {
                return Ok(priority_for(&cached.value, request_type));
            }
        }
        let weights = self.source.priority_weights().await?;
        let priority = priority_for(&weights, request_type);
        self.lock().priorities = Some(Cached { loaded_at: Instant::now(), value: weights });
        Ok(priority)
    }
}

fn priority_for(weights: &[PriorityWeight], request_type: RequestType) -> u8 {
    weights
        .iter()
        .find(|weight| weight.request_type == request_type.as_str())
        .map(|weight| weight.weight)
        .unwrap_or(DEFAULT_PRIORITY)
}

/// Fixture source with settable relations, for tests and local runs.
#[derive(Default)]
pub struct InMemoryRuleSource {
    pub approvers: Mutex<Vec<ApproverRule>>,
    pub baselines: Mutex<Vec<BaselineRule>>,
    pub allocations: Mutex<Vec<AllocationRule>>,
    pub matrix: Mutex<DistributionMatrix>,
    pub priorities: Mutex<Vec<PriorityWeight>>,
}

impl InMemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleSource for InMemoryRuleSource {
    async fn approver_rules(&self) -> Result<Vec<ApproverRule>, ApplicationError> {
        Ok(self.approvers.lock().map(|rules| rules.clone()).unwrap_or_default())
    }

    async fn baseline_rules(&self) -> Result<Vec<BaselineRule>, ApplicationError> {
        Ok(self.baselines.lock().map(|rules| rules.clone()).unwrap_or_default())
    }

    async fn allocation_rules(&self) -> Result<Vec<AllocationRule>, ApplicationError> {
        Ok(self.allocations.lock().map(|rules| rules.clone()).unwrap_or_default())
    }

    async fn distribution_matrix(&self) -> Result<DistributionMatrix, ApplicationError> {
        Ok(self.matrix.lock().map(|matrix| matrix.clone()).unwrap_or_default())
    }

    async fn priority_weights(&self) -> Result<Vec<PriorityWeight>, ApplicationError> {
        Ok(self.priorities.lock().map(|weights| weights.clone()).unwrap_or_default())
    }
}
