//! The request lifecycle orchestrator.
//!
//! Four entry points drive a request row through its life: submission
//! ([`RequestEngine::handle_on_submit`]), the periodic advancement sweep
//! ([`RequestEngine::handle_on_interval`]), assignee edits
//! ([`RequestEngine::handle_on_edit`]), and the repair pass over assignee
//! tables ([`RequestEngine::handle_on_child_interval`]).
//!
//! Every handler re-reads the row inside its row lock before deciding
//! anything, so invariants hold across the suspension points between
//! external calls. All handlers are idempotent: a second run over a stable
//! row changes nothing and sends nothing.

mod edit;
mod interval;
mod send_back;
pub mod validation;

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::info;

use crate::allocator::Allocator;
use crate::attachment::{AttachmentStore, COMPANY_NAME_CELL, REQUESTER_EMAIL_CELL};
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::business_hours::HolidayCalendar;
use crate::config::EngineConfig;
use crate::config_cache::ConfigCache;
use crate::domain::approval::LEVEL_COUNT;
use crate::domain::request::{
    columns, ApproverStatus, AttachmentRef, MasterTable, RequestNumber, RequestPrefix,
    RequestRecord, RequestType,
};
use crate::errors::ApplicationError;
use crate::lock::LockManager;
use crate::notify::{send_with_retries, Notification, NotificationKind, Notifier};
use crate::rowstore::RowStore;
use crate::workload::{RequestNumberAllocator, WorkloadCounter};

pub use edit::EditOutcome;
pub use interval::IntervalOutcome;

pub(crate) const DEFAULT_DEPARTMENT: &str = "GENERAL";

/// Composition of every port the engine drives. Constructed once at startup
/// and shared; each operation borrows what it needs.
pub struct RequestEngine {
    pub rows: Arc<dyn RowStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditSink>,
    pub rules: ConfigCache,
    pub locks: LockManager,
    pub workload: WorkloadCounter,
    pub allocator: Arc<Allocator>,
    pub request_numbers: Arc<RequestNumberAllocator>,
    pub calendar: Arc<dyn HolidayCalendar>,
    pub config: EngineConfig,
}

/// Pre-approved level carried by a cross-chained submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreApproval {
    pub level: usize,
    pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    pub preapproved: Vec<PreApproval>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub request_number: RequestNumber,
    pub attachment: AttachmentRef,
    pub notified: bool,
}

impl RequestEngine {
    /// Idempotent submission completion: defaults, request number,
    /// attachment provisioning, and the one-shot new-request notification.
    pub async fn handle_on_submit(
        &self,
        table: MasterTable,
        row_id: u32,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, ApplicationError> {
        let table_name = table.table_name();
        self.locks
            .with_row_lock(table_name, row_id, "fsm.submit", |_| async move {
                self.submit_locked(table, row_id, options).await
            })
            .await?
    }

    async fn submit_locked(
        &self,
        table: MasterTable,
        row_id: u32,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, ApplicationError> {
        let table_name = table.table_name();
        let row = self
            .rows
            .read_row(table_name, row_id)
            .await?
            .ok_or_else(|| ApplicationError::Persistence(format!("no row {row_id} in {table_name}")))?;
        let mut record = RequestRecord::from_row(&row);
        let now = Utc::now();
        let mut cells: Vec<(String, String)> = Vec::new();

        let request_type = match record.request_type {
            Some(request_type) => request_type,
            None => {
                let fallback = default_request_type(table);
                cells.push((columns::REQUEST_TYPE.to_string(), fallback.as_str().to_string()));
                fallback
            }
        };
        if record.department.is_empty() {
            record.department = DEFAULT_DEPARTMENT.to_string();
            cells.push((columns::DEPARTMENT.to_string(), DEFAULT_DEPARTMENT.to_string()));
        }
        if record.timestamp.is_none() {
            cells.push((columns::TIMESTAMP.to_string(), now.to_rfc3339()));
        }

        let unit_name = if record.company_name.is_empty() {
            record.business_unit.clone()
        } else {
            record.company_name.clone()
        };

        let request_number = match &record.request_number {
            Some(number) => number.clone(),
            None => {
                let prefix = RequestPrefix::new(table.abbreviation(), unit_name.clone());
                let number = self.request_numbers.next(&prefix, now).await;
                cells.push((columns::REQUEST_NUMBER.to_string(), number.0.clone()));
                number
            }
        };

        let attachment = match &record.attachment {
            Some(attachment) => attachment.clone(),
            None => {
                let attachment =
                    self.attachments.clone_template(request_type, &unit_name).await?;
                self.attachments.write_cell(&attachment, COMPANY_NAME_CELL, &unit_name).await?;
                self.attachments
                    .write_cell(&attachment, REQUESTER_EMAIL_CELL, &record.requester_email)
                    .await?;
                if !record.requester_email.is_empty() {
                    self.attachments.grant_editor(&attachment, &record.requester_email).await?;
                }
                for level in 1..LEVEL_COUNT {
                    let roster = self
                        .rules
                        .approvers(
                            &record.business_unit,
                            &record.department,
                            request_type,
                            level as u8,
                            true,
                        )
                        .await?;
                    if !roster.is_empty() {
                        self.attachments.grant_level_access(&attachment, level, &roster).await?;
                    }
                }
                cells.push((columns::ATTACHMENT.to_string(), attachment.0.clone()));
                attachment
            }
        };

        for pre in &options.preapproved {
            if (1..LEVEL_COUNT).contains(&pre.level) && record.levels[pre.level].is_blank() {
                cells.extend(level_cells(
                    pre.level,
                    ApproverStatus::Approved.as_str(),
                    &pre.name,
                    now,
                ));
            }
        }

        let mut notified = false;
        if record.new_submission_status.is_none() {
            let notification = Notification::new(
                NotificationKind::NewRequest,
                Some(request_number.clone()),
                vec![record.requester_email.clone()],
            )
            .with_metadata("attachment", attachment.0.clone())
            .with_metadata("request_type", request_type.as_str());
            notified = send_with_retries(
                self.notifier.as_ref(),
                &notification,
                self.config.notification_attempts,
            )
            .await;
            // Stamped even when delivery failed so the sweep does not re-send
            // forever; the failure is already in the logs.
            cells.push((columns::NEW_SUBMISSION_STATUS.to_string(), now.to_rfc3339()));

            self.audit.emit(
                AuditEvent::new(
                    Some(request_number.clone()),
                    request_number.0.clone(),
                    "request.submitted",
                    AuditCategory::Ingress,
                    if record.requester_email.is_empty() {
                        "unknown".to_string()
                    } else {
                        record.requester_email.clone()
                    },
                    AuditOutcome::Success,
                )
                .with_metadata("request_type", request_type.as_str()),
            );
            info!(
                event_name = "fsm.submitted",
                request_number = %request_number,
                request_type = request_type.as_str(),
                "submission completed"
            );
        }

        if !cells.is_empty() {
            self.rows.set_cells(table_name, row_id, &cells).await?;
        }

        Ok(SubmitOutcome { request_number, attachment, notified })
    }

    /// Number of approval levels this table actually carries.
    pub(crate) async fn chain_len(&self, table_name: &str) -> Result<usize, ApplicationError> {
        let headers = self.rows.headers(table_name).await?;
        let mut len = 0;
        for level in 0..LEVEL_COUNT {
            if headers.iter().any(|header| header == columns::respon(level)) {
                len = level + 1;
            } else {
                break;
            }
        }
        Ok(len)
    }

    pub(crate) fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        (instant + chrono::Duration::hours(i64::from(self.config.utc_offset_hours))).naive_utc()
    }

    pub(crate) fn from_local(&self, local: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(
            local - chrono::Duration::hours(i64::from(self.config.utc_offset_hours)),
            Utc,
        )
    }

    /// Copies the execution-relevant cells of an assignee row back onto the
    /// master row, under the master row lock. Lock order is always source
    /// table first, master second.
    pub(crate) async fn mirror_to_master(
        &self,
        record: &RequestRecord,
        mirrored: Vec<(String, String)>,
    ) -> Result<(), ApplicationError> {
        let Some(request_number) = &record.request_number else {
            return Ok(());
        };
        let Some(request_type) = record.request_type else {
            return Ok(());
        };
        let master = request_type.master_table().table_name();
        let Some(master_row) = self.rows.find_row(master, &request_number.0).await? else {
            return Ok(());
        };

        self.locks
            .with_row_lock(master, master_row, "fsm.mirror", |_| async {
                self.rows.set_cells(master, master_row, &mirrored).await
            })
            .await?
    }
}

pub(crate) fn default_request_type(table: MasterTable) -> RequestType {
    match table {
        MasterTable::Bom => RequestType::BomCreate,
        MasterTable::Pricing => RequestType::PricingCreate,
        MasterTable::Customer => RequestType::CustomerCreate,
        MasterTable::Vendor => RequestType::VendorCreate,
        MasterTable::Promo => RequestType::PromoCreate,
    }
}

/// Status/name/timestamp cell writes for one approval level.
pub(crate) fn level_cells(
    level: usize,
    status: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    vec![
        (columns::respon(level).to_string(), status.to_string()),
        (columns::name(level).to_string(), name.to_string()),
        (columns::timestamp(level).to_string(), now.to_rfc3339()),
    ]
}


#[cfg(test)]
mod tests {
    use super::testkit::TestHarness;
    use super::{PreApproval, SubmitOptions};
    use crate::domain::request::{columns, MasterTable, RequestRecord};
    use crate::notify::NotificationKind;
    use crate::rowstore::RowStore;

    fn base_cells<'a>() -> Vec<(&'a str, &'a str)> {
        vec![
            (columns::REQUEST_TYPE, "BOM Create"),
            (columns::COMPANY_CODE, "BU01"),
            (columns::COMPANY_NAME, "Retail Unit Alpha"),
            (columns::EMAIL_ADDRESS, "u@x"),
            (columns::TIMESTAMP, "2026-03-02T01:00:00+00:00"),
        ]
    }

    #[tokio::test]
    async fn submit_assigns_number_attachment_and_notification() {
        let harness = TestHarness::new();
        let row_id = harness.seed_row(MasterTable::Bom, &base_cells()).await;

        let outcome = harness
            .engine
            .handle_on_submit(MasterTable::Bom, row_id, &SubmitOptions::default())
            .await
            .expect("submit");

        assert_eq!(outcome.request_number.0, "BOM/MDM/Retail Unit Alpha/00001");
        assert!(outcome.notified);
        assert_eq!(harness.notifier.count_kind(NotificationKind::NewRequest), 1);

        let row = harness
            .rows
            .read_row("BOM", row_id)
            .await
            .expect("read")
            .expect("row");
        let record = RequestRecord::from_row(&row);
        assert_eq!(record.request_number, Some(outcome.request_number));
        assert!(record.attachment.is_some());
        assert!(record.new_submission_status.is_some());

        let doc = harness
            .attachments
            .snapshot(record.attachment.as_ref().expect("attachment"))
            .expect("doc");
        assert_eq!(
            doc.cells.get(crate::attachment::COMPANY_NAME_CELL).map(String::as_str),
            Some("Retail Unit Alpha")
        );
        assert!(doc.editors.contains(&"u@x".to_string()));
    }

    #[tokio::test]
    async fn submit_twice_is_idempotent() {
        let harness = TestHarness::new();
        let row_id = harness.seed_row(MasterTable::Bom, &base_cells()).await;

        let first = harness
            .engine
            .handle_on_submit(MasterTable::Bom, row_id, &SubmitOptions::default())
            .await
            .expect("first submit");
        let second = harness
            .engine
            .handle_on_submit(MasterTable::Bom, row_id, &SubmitOptions::default())
            .await
            .expect("second submit");

        assert_eq!(first.request_number, second.request_number);
        assert_eq!(first.attachment, second.attachment);
        assert_eq!(harness.notifier.count_kind(NotificationKind::NewRequest), 1);
    }

    #[tokio::test]
    async fn submit_applies_type_and_department_defaults() {
        let harness = TestHarness::new();
        let row_id = harness
            .seed_row(
                MasterTable::Pricing,
                &[
                    (columns::COMPANY_CODE, "BU01"),
                    (columns::COMPANY_NAME, "Retail Unit Alpha"),
                    (columns::EMAIL_ADDRESS, "u@x"),
                ],
            )
            .await;

        harness
            .engine
            .handle_on_submit(MasterTable::Pricing, row_id, &SubmitOptions::default())
            .await
            .expect("submit");

        let row = harness
            .rows
            .read_row("PRICING", row_id)
            .await
            .expect("read")
            .expect("row");
        let record = RequestRecord::from_row(&row);
        assert_eq!(record.request_type.map(|t| t.as_str()), Some("Pricing Create"));
        assert_eq!(record.department, "GENERAL");
        assert!(record.timestamp.is_some());
        assert!(record
            .request_number
            .as_ref()
            .expect("number")
            .0
            .starts_with("PRC/MDM/Retail Unit Alpha/"));
    }

    #[tokio::test]
    async fn preapproved_levels_are_written_at_submit_time() {
        let harness = TestHarness::new();
        let row_id = harness.seed_row(MasterTable::Bom, &base_cells()).await;

        harness
            .engine
            .handle_on_submit(
                MasterTable::Bom,
                row_id,
                &SubmitOptions {
                    preapproved: vec![PreApproval { level: 1, name: "chain@x".into() }],
                },
            )
            .await
            .expect("submit");

        let row = harness
            .rows
            .read_row("BOM", row_id)
            .await
            .expect("read")
            .expect("row");
        let record = RequestRecord::from_row(&row);
        assert_eq!(record.levels[1].status, "Approved");
        assert_eq!(record.levels[1].name, "chain@x");
        assert!(record.levels[2].is_blank());
    }
}
