use async_trait::async_trait;
use sqlx::Row;

use caseflow_core::workload::AgentStore;
use caseflow_core::{Agent, AgentStatus, ApplicationError};

use super::RepositoryError;
use crate::DbPool;

pub struct SqlAgentStore {
    pool: DbPool,
}

impl SqlAgentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentStore for SqlAgentStore {
    async fn get(&self, name: &str) -> Result<Option<Agent>, ApplicationError> {
        let row = sqlx::query(
            "SELECT name, active, status, workload_seconds FROM agent WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.map(|row| {
            let status_raw: String = row.try_get("status").map_err(RepositoryError::from)?;
            let status = AgentStatus::parse(&status_raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown agent status `{status_raw}`"))
            })?;
            Ok::<_, RepositoryError>(Agent {
                name: row.try_get("name").map_err(RepositoryError::from)?,
                active: row.try_get::<i64, _>("active").map_err(RepositoryError::from)? != 0,
                status,
                workload_seconds: row
                    .try_get("workload_seconds")
                    .map_err(RepositoryError::from)?,
            })
        })
        .transpose()
        .map_err(Into::into)
    }

    async fn add_workload(
        &self,
        name: &str,
        delta_seconds: i64,
    ) -> Result<i64, ApplicationError> {
        // Clamped at zero in the statement itself so the CHECK constraint
        // never trips on a subtraction.
        let total: i64 = sqlx::query_scalar(
            "INSERT INTO agent (name, active, status, workload_seconds)
             VALUES (?, 1, 'free', MAX(0, ?))
             ON CONFLICT (name) DO UPDATE
             SET workload_seconds = MAX(0, agent.workload_seconds + ?)
             RETURNING workload_seconds",
        )
        .bind(name)
        .bind(delta_seconds)
        .bind(delta_seconds)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(total)
    }

    async fn list_names(&self) -> Result<Vec<String>, ApplicationError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM agent ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
        Ok(names)
    }
}
