//! SQL audit trail. `emit` is fire-and-forget from the sink's synchronous
//! contract; failures land in the logs, never on the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::error;

use caseflow_core::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, RequestNumber};

use super::RepositoryError;
use crate::DbPool;

#[derive(Clone)]
pub struct SqlAuditSink {
    pool: DbPool,
}

impl SqlAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for SqlAuditSink {
    fn emit(&self, event: AuditEvent) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(db_error) = insert_event(&pool, &event).await {
                error!(
                    event_name = "audit.emit_failed",
                    event_type = %event.event_type,
                    error = %db_error,
                    "audit event could not be persisted"
                );
            }
        });
    }
}

async fn insert_event(pool: &DbPool, event: &AuditEvent) -> Result<(), RepositoryError> {
    let metadata_json =
        serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string());
    sqlx::query(
        "INSERT INTO audit_event (
            event_id,
            request_number,
            correlation_id,
            event_type,
            category,
            actor,
            outcome,
            metadata_json,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.event_id)
    .bind(event.request_number.as_ref().map(|number| number.0.as_str()))
    .bind(&event.correlation_id)
    .bind(&event.event_type)
    .bind(category_str(&event.category))
    .bind(&event.actor)
    .bind(outcome_str(&event.outcome))
    .bind(metadata_json)
    .bind(event.occurred_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Read side of the trail, for operators and tests.
pub struct SqlAuditLog {
    pool: DbPool,
}

impl SqlAuditLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_request(
        &self,
        request_number: &RequestNumber,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                event_id,
                request_number,
                correlation_id,
                event_type,
                category,
                actor,
                outcome,
                metadata_json,
                occurred_at
             FROM audit_event
             WHERE request_number = ?
             ORDER BY occurred_at ASC",
        )
        .bind(&request_number.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category_raw: String = row.try_get("category")?;
    let outcome_raw: String = row.try_get("outcome")?;
    let occurred_raw: String = row.try_get("occurred_at")?;
    let metadata_raw: String = row.try_get("metadata_json")?;

    let occurred_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&occurred_raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| {
            RepositoryError::Decode(format!("invalid occurred_at `{occurred_raw}` ({error})"))
        })?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid metadata json ({error})")))?;

    Ok(AuditEvent {
        event_id: row.try_get("event_id")?,
        request_number: row
            .try_get::<Option<String>, _>("request_number")?
            .map(RequestNumber),
        correlation_id: row.try_get("correlation_id")?,
        event_type: row.try_get("event_type")?,
        category: parse_category(&category_raw)?,
        actor: row.try_get("actor")?,
        outcome: parse_outcome(&outcome_raw)?,
        metadata,
        occurred_at,
    })
}

fn category_str(category: &AuditCategory) -> &'static str {
    match category {
        AuditCategory::Ingress => "ingress",
        AuditCategory::Approval => "approval",
        AuditCategory::Allocation => "allocation",
        AuditCategory::Execution => "execution",
        AuditCategory::SendBack => "send_back",
        AuditCategory::System => "system",
    }
}

fn parse_category(value: &str) -> Result<AuditCategory, RepositoryError> {
    match value {
        "ingress" => Ok(AuditCategory::Ingress),
        "approval" => Ok(AuditCategory::Approval),
        "allocation" => Ok(AuditCategory::Allocation),
        "execution" => Ok(AuditCategory::Execution),
        "send_back" => Ok(AuditCategory::SendBack),
        "system" => Ok(AuditCategory::System),
        other => Err(RepositoryError::Decode(format!("unknown audit category `{other}`"))),
    }
}

fn outcome_str(outcome: &AuditOutcome) -> &'static str {
    match outcome {
        AuditOutcome::Success => "success",
        AuditOutcome::Rejected => "rejected",
        AuditOutcome::Failed => "failed",
    }
}

fn parse_outcome(value: &str) -> Result<AuditOutcome, RepositoryError> {
    match value {
        "success" => Ok(AuditOutcome::Success),
        "rejected" => Ok(AuditOutcome::Rejected),
        "failed" => Ok(AuditOutcome::Failed),
        other => Err(RepositoryError::Decode(format!("unknown audit outcome `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use caseflow_core::{AuditEvent, RequestNumber, SendBackActor};

    use super::{insert_event, SqlAuditLog};
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn send_back_events_round_trip_with_metadata() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");

        let number = RequestNumber("BOM/MDM/Alpha/00042".to_string());
        let event = AuditEvent::send_back(
            Some(number.clone()),
            "sweep-7",
            SendBackActor::Approver,
            "please fix X",
        );

        insert_event(&pool, &event).await.expect("insert");

        let log = SqlAuditLog::new(pool.clone());
        let events = log.list_for_request(&number).await.expect("list");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "APPROVER");
        assert_eq!(
            events[0].metadata.get("reason").map(String::as_str),
            Some("please fix X")
        );

        pool.close().await;
    }
}
