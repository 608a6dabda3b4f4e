//! Rule source over the five configuration tables. Read-only; the engine
//! consults it through its TTL cache.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use sqlx::Row;

use caseflow_core::config_cache::RuleSource;
use caseflow_core::{
    AllocationRule, ApplicationError, ApproverRule, BaselineRule, DistributionMatrix,
    PriorityWeight, RequestType, TaskRange,
};

use super::RepositoryError;
use crate::DbPool;

pub struct SqlRuleSource {
    pool: DbPool,
}

impl SqlRuleSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleSource for SqlRuleSource {
    async fn approver_rules(&self) -> Result<Vec<ApproverRule>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT business_unit, department, request_type, level, approvers FROM approver_rule",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter()
            .map(|row| {
                let approvers_raw: String =
                    row.try_get("approvers").map_err(RepositoryError::from)?;
                Ok(ApproverRule {
                    business_unit: row.try_get("business_unit").map_err(RepositoryError::from)?,
                    department: row.try_get("department").map_err(RepositoryError::from)?,
                    request_type: row.try_get("request_type").map_err(RepositoryError::from)?,
                    level: row.try_get::<i64, _>("level").map_err(RepositoryError::from)? as u8,
                    approvers: approvers_raw
                        .split(',')
                        .map(str::trim)
                        .filter(|email| !email.is_empty())
                        .map(str::to_string)
                        .collect(),
                })
            })
            .collect()
    }

    async fn baseline_rules(&self) -> Result<Vec<BaselineRule>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT request_type, task_range, seconds, per_task FROM baseline_rule",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter()
            .map(|row| {
                let type_raw: String =
                    row.try_get("request_type").map_err(RepositoryError::from)?;
                let range_raw: String =
                    row.try_get("task_range").map_err(RepositoryError::from)?;
                let request_type = RequestType::parse(&type_raw).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown request type `{type_raw}`"))
                })?;
                let range = TaskRange::parse(&range_raw).ok_or_else(|| {
                    RepositoryError::Decode(format!("invalid task range `{range_raw}`"))
                })?;
                Ok(BaselineRule {
                    request_type,
                    range,
                    seconds: row.try_get("seconds").map_err(RepositoryError::from)?,
                    per_task: row.try_get::<i64, _>("per_task").map_err(RepositoryError::from)?
                        != 0,
                })
            })
            .collect()
    }

    async fn allocation_rules(&self) -> Result<Vec<AllocationRule>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT business_unit, request_type, department, groups_json FROM allocation_rule",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter()
            .map(|row| {
                let groups_raw: String =
                    row.try_get("groups_json").map_err(RepositoryError::from)?;
                let groups: Vec<String> = serde_json::from_str(&groups_raw).map_err(|error| {
                    RepositoryError::Decode(format!("invalid groups json ({error})"))
                })?;
                Ok(AllocationRule {
                    business_unit: row.try_get("business_unit").map_err(RepositoryError::from)?,
                    request_type: row.try_get("request_type").map_err(RepositoryError::from)?,
                    department: row.try_get("department").map_err(RepositoryError::from)?,
                    groups,
                })
            })
            .collect()
    }

    async fn distribution_matrix(&self) -> Result<DistributionMatrix, ApplicationError> {
        let rows = sqlx::query("SELECT request_type, agent_name FROM distribution_entry")
            .fetch_all(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        let mut entries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            let request_type: String =
                row.try_get("request_type").map_err(RepositoryError::from)?;
            let agent: String = row.try_get("agent_name").map_err(RepositoryError::from)?;
            entries.entry(request_type).or_default().insert(agent);
        }
        Ok(DistributionMatrix::new(entries))
    }

    async fn priority_weights(&self) -> Result<Vec<PriorityWeight>, ApplicationError> {
        let rows = sqlx::query("SELECT request_type, weight FROM priority_weight")
            .fetch_all(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        rows.into_iter()
            .map(|row| {
                Ok(PriorityWeight {
                    request_type: row.try_get("request_type").map_err(RepositoryError::from)?,
                    weight: row.try_get::<i64, _>("weight").map_err(RepositoryError::from)? as u8,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use caseflow_core::config_cache::RuleSource;
    use caseflow_core::{RequestType, TaskRange};

    use super::SqlRuleSource;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn seeded_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO approver_rule (business_unit, department, request_type, level, approvers)
             VALUES ('BU01', 'Retail', 'BOM Create', 1, 'a@x, b@x')",
        )
        .execute(&pool)
        .await
        .expect("seed approver rule");

        sqlx::query(
            "INSERT INTO baseline_rule (request_type, task_range, seconds, per_task)
             VALUES ('BOM Create', '5-10', 120, 1)",
        )
        .execute(&pool)
        .await
        .expect("seed baseline rule");

        sqlx::query(
            "INSERT INTO allocation_rule (business_unit, request_type, department, groups_json)
             VALUES ('BU01', 'ALL', 'ALL', '[\"anna\",\"budi, citra\"]')",
        )
        .execute(&pool)
        .await
        .expect("seed allocation rule");

        sqlx::query(
            "INSERT INTO distribution_entry (request_type, agent_name)
             VALUES ('BOM Create', 'anna'), ('BOM Create', 'budi')",
        )
        .execute(&pool)
        .await
        .expect("seed distribution");

        pool
    }

    #[tokio::test]
    async fn relations_decode_from_their_tables() {
        let pool = seeded_pool().await;
        let source = SqlRuleSource::new(pool.clone());

        let approvers = source.approver_rules().await.expect("approver rules");
        assert_eq!(approvers.len(), 1);
        assert_eq!(approvers[0].approvers, vec!["a@x".to_string(), "b@x".to_string()]);

        let baselines = source.baseline_rules().await.expect("baseline rules");
        assert_eq!(baselines[0].range, TaskRange::Bounded { min: 5, max: 10 });
        assert!(baselines[0].per_task);

        let allocations = source.allocation_rules().await.expect("allocation rules");
        assert_eq!(
            allocations[0].candidate_groups(),
            vec![vec!["anna".to_string()], vec!["budi".to_string(), "citra".to_string()]]
        );

        let matrix = source.distribution_matrix().await.expect("matrix");
        assert_eq!(matrix.eligible(RequestType::BomCreate).expect("eligible").len(), 2);
        assert!(matrix.eligible(RequestType::PricingCreate).is_none());

        pool.close().await;
    }
}
