use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use caseflow_core::allocator::{Allocator, AllocatorConfig};
use caseflow_core::columns;
use caseflow_core::config::{AppConfig, ConfigError, LoadOptions};
use caseflow_core::fsm::RequestEngine;
use caseflow_core::lock::{InMemoryLeaseStore, LockConfig, LockManager};
use caseflow_core::workload::{RequestNumberAllocator, WorkloadCounter};
use caseflow_core::{ApplicationError, FixedHolidayCalendar, MasterTable};
use caseflow_db::{
    connect, migrations, DbPool, SqlAgentStore, SqlAuditSink, SqlCounterStore, SqlRowStore,
    SqlRuleSource,
};
use caseflow_notify::{EmailNotifier, LoggingMailTransport};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<RequestEngine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("table provisioning failed: {0}")]
    Provisioning(#[source] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let config = AppConfig::load(options)?;

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let row_store = Arc::new(SqlRowStore::new(db_pool.clone()));
    for table in MasterTable::all() {
        row_store
            .create_table(
                table.table_name(),
                columns::MASTER_HEADERS.iter().map(|header| header.to_string()),
            )
            .await
            .map_err(BootstrapError::Provisioning)?;
    }

    let locks = LockManager::new(
        Arc::new(InMemoryLeaseStore::new()),
        LockConfig {
            lease_ms: config.locking.lease_ms,
            default_max_wait_ms: config.locking.acquire_wait_ms,
            backoff_base_ms: config.locking.backoff_base_ms,
            backoff_cap_ms: config.locking.backoff_cap_ms,
        },
    );

    let agents = Arc::new(SqlAgentStore::new(db_pool.clone()));
    let rules = caseflow_core::ConfigCache::new(Arc::new(SqlRuleSource::new(db_pool.clone())));

    let engine = Arc::new(RequestEngine {
        rows: row_store,
        attachments: Arc::new(caseflow_core::InMemoryAttachmentStore::new()),
        notifier: Arc::new(EmailNotifier::new(Arc::new(LoggingMailTransport))),
        audit: Arc::new(SqlAuditSink::new(db_pool.clone())),
        rules: rules.clone(),
        locks: locks.clone(),
        workload: WorkloadCounter::new(Arc::clone(&agents) as Arc<_>, locks.clone()),
        allocator: Arc::new(Allocator::new(
            Arc::clone(&agents) as Arc<_>,
            rules,
            AllocatorConfig { default_agent: config.engine.default_agent.clone() },
        )),
        request_numbers: Arc::new(RequestNumberAllocator::new(
            Arc::new(SqlCounterStore::durable(db_pool.clone())),
            Arc::new(SqlCounterStore::tracker(db_pool.clone())),
            locks,
        )),
        calendar: Arc::new(FixedHolidayCalendar::new(config.engine.holidays.clone())),
        config: config.engine.clone(),
    });

    Ok(Application { config, db_pool, engine })
}
