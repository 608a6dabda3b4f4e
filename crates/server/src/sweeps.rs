//! Periodic sweep runner: one task per master table plus the assignee-table
//! repair pass. Each tick replans from current state, so a sweep cut short
//! by its budget or a crash loses nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use caseflow_core::config_cache::DEFAULT_PRIORITY;
use caseflow_core::fsm::{RequestEngine, SubmitOptions};
use caseflow_core::rowstore::RowStore;
use caseflow_core::scheduler::{
    needs_resubmission, needs_send_back_email_retry, plan_sweep, SweepBudget,
};
use caseflow_core::{MasterTable, RequestRecord};

pub fn spawn(engine: Arc<RequestEngine>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for table in MasterTable::all() {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(engine.config.sweep_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(sweep_error) = run_master_sweep(&engine, table).await {
                    error!(
                        event_name = "sweep.failed",
                        table = table.table_name(),
                        error = %sweep_error,
                        "master sweep aborted, next tick retries"
                    );
                }
            }
        }));
    }

    let repair_engine = Arc::clone(&engine);
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            repair_engine.config.sweep_interval_secs * 2,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(sweep_error) = run_child_repair(&repair_engine).await {
                error!(
                    event_name = "sweep.child_repair_failed",
                    error = %sweep_error,
                    "child repair sweep aborted, next tick retries"
                );
            }
        }
    }));

    handles
}

/// One advancement pass over a master table: advancement plan in descending
/// row order, then submission retries, then send-back email retries.
pub async fn run_master_sweep(
    engine: &RequestEngine,
    table: MasterTable,
) -> Result<(), caseflow_core::ApplicationError> {
    let table_name = table.table_name();
    let headers = engine.rows.headers(table_name).await?;
    let count = engine.rows.row_count(table_name).await?;

    let mut rows = Vec::new();
    for row_id in 0..count {
        if let Some(row) = engine.rows.read_row(table_name, row_id).await? {
            rows.push((row_id, RequestRecord::from_row(&row)));
        }
    }

    let budget = SweepBudget::new(Duration::from_millis(engine.config.sweep_budget_ms));
    let now = Utc::now();

    let plan = plan_sweep(&rows, &headers);
    debug!(
        event_name = "sweep.planned",
        table = table_name,
        rows = rows.len(),
        planned = plan.len(),
        "master sweep planned"
    );
    for (row_id, request_number) in plan {
        if budget.exhausted() {
            info!(
                event_name = "sweep.budget_exhausted",
                table = table_name,
                "stopping sweep, next tick resumes"
            );
            return Ok(());
        }
        let priority = match rows
            .iter()
            .find(|(id, _)| *id == row_id)
            .and_then(|(_, record)| record.request_type)
        {
            Some(request_type) => {
                engine.rules.priority(request_type).await.unwrap_or(DEFAULT_PRIORITY)
            }
            None => DEFAULT_PRIORITY,
        };
        if let Err(row_error) = engine
            .handle_on_interval_with_priority(table, row_id, &request_number, priority)
            .await
        {
            error!(
                event_name = "sweep.row_failed",
                table = table_name,
                row_id,
                request_number = %request_number,
                error = %row_error,
                "row advancement failed, continuing"
            );
        }
    }

    for (row_id, record) in &rows {
        if budget.exhausted() {
            return Ok(());
        }
        if needs_resubmission(record, now, engine.config.resubmit_timeout_mins) {
            if let Err(row_error) =
                engine.handle_on_submit(table, *row_id, &SubmitOptions::default()).await
            {
                error!(
                    event_name = "sweep.resubmit_failed",
                    table = table_name,
                    row_id,
                    error = %row_error,
                    "resubmission failed, continuing"
                );
            }
        }
    }

    for (row_id, record) in &rows {
        if budget.exhausted() {
            return Ok(());
        }
        if needs_send_back_email_retry(record) {
            if let Err(row_error) =
                engine.retry_send_back_email(table_name, *row_id, record).await
            {
                error!(
                    event_name = "sweep.send_back_retry_failed",
                    table = table_name,
                    row_id,
                    error = %row_error,
                    "send-back email retry failed, continuing"
                );
            }
        }
    }

    Ok(())
}

/// E4 over every known assignee table.
pub async fn run_child_repair(
    engine: &RequestEngine,
) -> Result<(), caseflow_core::ApplicationError> {
    let agents = engine.workload.agent_names().await?;
    let budget = SweepBudget::new(Duration::from_millis(engine.config.sweep_budget_ms));

    for agent in agents {
        let count = engine.rows.row_count(&agent).await?;
        // Descending: a finished send-back deletes its row.
        for row_id in (0..count).rev() {
            if budget.exhausted() {
                return Ok(());
            }
            match engine.handle_on_child_interval(&agent, row_id).await {
                Ok(repairs) if !repairs.is_empty() => {
                    info!(
                        event_name = "sweep.child_repaired",
                        agent = %agent,
                        row_id,
                        repairs = repairs.join(","),
                        "assignee row repaired"
                    );
                }
                Ok(_) => {}
                Err(row_error) => {
                    error!(
                        event_name = "sweep.child_repair_row_failed",
                        agent = %agent,
                        row_id,
                        error = %row_error,
                        "assignee row repair failed, continuing"
                    );
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use caseflow_core::columns;
    use caseflow_core::config::{ConfigOverrides, LoadOptions};
    use caseflow_core::rowstore::RowStore;
    use caseflow_core::{MasterTable, RequestRecord, RowValues};

    use super::run_master_sweep;
    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn sweep_completes_a_half_submitted_row() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(
                    "sqlite:file:caseflow_sweeps_test?mode=memory&cache=shared".to_string(),
                ),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap");

        // A row whose submission died after the timestamp write.
        let stale = (Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
        let mut values = RowValues::new();
        values.insert(columns::TIMESTAMP.to_string(), stale);
        values.insert(columns::REQUEST_TYPE.to_string(), "BOM Create".to_string());
        values.insert(columns::COMPANY_CODE.to_string(), "BU01".to_string());
        values.insert(columns::COMPANY_NAME.to_string(), "Retail Unit Alpha".to_string());
        values.insert(columns::EMAIL_ADDRESS.to_string(), "u@x".to_string());
        let row_id = app.engine.rows.upsert_row("BOM", &values, false).await.expect("seed");

        run_master_sweep(&app.engine, MasterTable::Bom).await.expect("sweep");

        let row = app
            .engine
            .rows
            .read_row("BOM", row_id)
            .await
            .expect("read")
            .expect("row");
        let record = RequestRecord::from_row(&row);
        assert!(record.request_number.is_some(), "resubmission should assign a number");
        assert!(record.attachment.is_some(), "resubmission should provision an attachment");

        app.db_pool.close().await;
    }
}
