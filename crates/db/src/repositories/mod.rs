use thiserror::Error;

use caseflow_core::ApplicationError;

pub mod agents;
pub mod audit;
pub mod counters;
pub mod row_store;
pub mod rules;

pub use agents::SqlAgentStore;
pub use audit::{SqlAuditLog, SqlAuditSink};
pub use counters::SqlCounterStore;
pub use row_store::SqlRowStore;
pub use rules::SqlRuleSource;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}
