use async_trait::async_trait;

use caseflow_core::workload::CounterStore;
use caseflow_core::ApplicationError;

use super::RepositoryError;
use crate::DbPool;

/// One durable integer slot namespace. The request-number allocator uses two
/// instances: the `durable` property scope and the `tracker` table scope.
pub struct SqlCounterStore {
    pool: DbPool,
    scope: &'static str,
}

impl SqlCounterStore {
    pub fn durable(pool: DbPool) -> Self {
        Self { pool, scope: "durable" }
    }

    pub fn tracker(pool: DbPool) -> Self {
        Self { pool, scope: "tracker" }
    }
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    async fn load(&self, key: &str) -> Result<Option<i64>, ApplicationError> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM counter_slot WHERE scope = ? AND key = ?")
                .bind(self.scope)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
        Ok(value)
    }

    async fn store(&self, key: &str, value: i64) -> Result<(), ApplicationError> {
        sqlx::query(
            "INSERT INTO counter_slot (scope, key, value) VALUES (?, ?, ?)
             ON CONFLICT (scope, key) DO UPDATE SET value = excluded.value",
        )
        .bind(self.scope)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }
}
