//! Workload allocation: least-loaded matrix assignment with round-robin
//! tie-break, falling back to the BAU candidate groups and finally the
//! default agent. Never returns "nobody".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config_cache::ConfigCache;
use crate::domain::agent::Agent;
use crate::domain::request::RequestType;
use crate::errors::ApplicationError;
use crate::workload::AgentStore;

/// Requests from this department always go to the default agent.
pub const SPECIAL_PROJECT_DEPARTMENT: &str = "SPECIAL PROJECT";

/// Tie-break cursors, one per rule key. Entries expire so a renamed rule
/// does not pin a stale cursor forever.
pub struct RoundRobinCursors {
    ttl: Duration,
    cursors: Mutex<HashMap<String, (Instant, usize)>>,
}

impl Default for RoundRobinCursors {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(600), cursors: Mutex::new(HashMap::new()) }
    }
}

impl RoundRobinCursors {
    /// Returns the current cursor value and advances it by one.
    pub fn advance(&self, rule_key: &str) -> usize {
        let mut cursors = match self.cursors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cursors.retain(|_, (touched, _)| touched.elapsed() < self.ttl);

        let entry = cursors.entry(rule_key.to_string()).or_insert((Instant::now(), 0));
        let current = entry.1;
        *entry = (Instant::now(), current.wrapping_add(1));
        current
    }
}

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub default_agent: String,
}

pub struct Allocator {
    agents: Arc<dyn AgentStore>,
    rules: ConfigCache,
    cursors: RoundRobinCursors,
    config: AllocatorConfig,
}

impl Allocator {
    pub fn new(agents: Arc<dyn AgentStore>, rules: ConfigCache, config: AllocatorConfig) -> Self {
        Self { agents, rules, cursors: RoundRobinCursors::default(), config }
    }

    /// Picks the assignee for an approved request.
    pub async fn allocate(
        &self,
        business_unit: &str,
        department: &str,
        request_type: RequestType,
    ) -> Result<String, ApplicationError> {
        if department.eq_ignore_ascii_case(SPECIAL_PROJECT_DEPARTMENT) {
            return Ok(self.config.default_agent.clone());
        }

        if let Some(agent) = self.allocate_from_matrix(request_type).await? {
            return Ok(agent);
        }

        if let Some(agent) =
            self.allocate_from_bau(business_unit, department, request_type).await?
        {
            return Ok(agent);
        }

        info!(
            event_name = "allocator.default_agent",
            request_type = request_type.as_str(),
            business_unit,
            department,
            "no eligible agent, assigning default"
        );
        Ok(self.config.default_agent.clone())
    }

    async fn allocate_from_matrix(
        &self,
        request_type: RequestType,
    ) -> Result<Option<String>, ApplicationError> {
        let matrix = self.rules.matrix().await?;
        let Some(eligible) = matrix.eligible(request_type) else {
            return Ok(None);
        };

        let mut pool = Vec::new();
        for name in eligible {
            if let Some(agent) = self.agents.get(name).await? {
                if agent.is_allocatable() {
                    pool.push(agent);
                }
            }
        }
        if pool.is_empty() {
            return Ok(None);
        }

        Ok(Some(self.pick_least_loaded(pool, request_type.as_str())))
    }

    async fn allocate_from_bau(
        &self,
        business_unit: &str,
        department: &str,
        request_type: RequestType,
    ) -> Result<Option<String>, ApplicationError> {
        let Some(rule) =
            self.rules.allocation_rule(business_unit, request_type, department).await?
        else {
            return Ok(None);
        };

        let rule_key = format!(
            "bau:{}:{}:{}",
            rule.business_unit, rule.request_type, rule.department
        );

        for group in rule.candidate_groups() {
            let mut pool = Vec::new();
            for name in &group {
                if let Some(agent) = self.agents.get(name).await? {
                    if agent.is_allocatable() {
                        pool.push(agent);
                    }
                }
            }
            if pool.is_empty() {
                debug!(
                    event_name = "allocator.bau_group_busy",
                    group = group.join(","),
                    "every candidate busy, trying next group"
                );
                continue;
            }
            return Ok(Some(self.pick_least_loaded(pool, &rule_key)));
        }

        Ok(None)
    }

    /// Least `workload_seconds` wins; ties rotate through the per-rule
    /// cursor so long runs stay fair without coordination.
    fn pick_least_loaded(&self, mut pool: Vec<Agent>, rule_key: &str) -> String {
        pool.sort_by(|a, b| a.name.cmp(&b.name));
        let min = pool.iter().map(|agent| agent.workload_seconds).min().unwrap_or(0);
        let tied: Vec<&Agent> =
            pool.iter().filter(|agent| agent.workload_seconds == min).collect();

        if tied.len() == 1 {
            return tied[0].name.clone();
        }
        let cursor = self.cursors.advance(rule_key);
        tied[cursor % tied.len()].name.clone()
    }
}
