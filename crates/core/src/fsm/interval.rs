//! Periodic advancement of a request row.
//!
//! One pass walks the approval levels in order and performs at most one
//! externally visible step: ask an approver, ingest an action, expire, or
//! run the approved pipeline. The walk re-reads the row after every write so
//! each decision is made against current state.

use chrono::Utc;
use tracing::info;

use crate::approval_sync::{ApprovalSync, LevelOutcome};
use crate::attachment::AttachmentStore;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, SendBackActor};
use crate::business_hours::business_days_between;
use crate::config_cache::DEFAULT_PRIORITY;
use crate::lock::row_lock_key;
use crate::domain::approval::NO_APPROVER;
use crate::domain::request::{
    columns, ApproverStatus, MasterTable, RequestNumber, RequestRecord, RequesterStatus,
};
use crate::errors::ApplicationError;
use crate::fsm::validation::validate_sheets;
use crate::fsm::{level_cells, RequestEngine};
use crate::notify::{send_with_retries, Notification, NotificationKind};
use crate::rowstore::RowStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntervalOutcome {
    /// Row index no longer carries the scheduled request; sweep moves on.
    Reindexed,
    Expired,
    /// Nothing actionable this tick.
    Waiting,
    AskSent { level: usize },
    Invalid { level: usize },
    SentBack { level: usize },
    Rejected { level: usize },
    /// Terminal approval processed end-to-end.
    Allocated { assignee: String },
    /// Approved but the attachment holds no tasks; request was reset.
    MissingTasks,
    NoChange,
}

impl RequestEngine {
    /// Advances one row under its lock.
    pub async fn handle_on_interval(
        &self,
        table: MasterTable,
        row_id: u32,
        expected: &RequestNumber,
    ) -> Result<IntervalOutcome, ApplicationError> {
        self.handle_on_interval_with_priority(table, row_id, expected, DEFAULT_PRIORITY).await
    }

    /// Sweeps pass the request type's configured priority weight: lower
    /// weights retry their lock acquisition faster.
    pub async fn handle_on_interval_with_priority(
        &self,
        table: MasterTable,
        row_id: u32,
        expected: &RequestNumber,
        priority: u8,
    ) -> Result<IntervalOutcome, ApplicationError> {
        let table_name = table.table_name();
        self.locks
            .with_key_lock(
                &row_lock_key(table_name, row_id),
                "fsm.interval",
                priority,
                |_| async move { self.interval_locked(table_name, row_id, expected).await },
            )
            .await?
    }

    async fn interval_locked(
        &self,
        table_name: &str,
        row_id: u32,
        expected: &RequestNumber,
    ) -> Result<IntervalOutcome, ApplicationError> {
        let Some(row) = self.rows.read_row(table_name, row_id).await? else {
            return Ok(IntervalOutcome::Reindexed);
        };
        let record = RequestRecord::from_row(&row);
        if record.request_number.as_ref() != Some(expected) {
            return Ok(IntervalOutcome::Reindexed);
        }
        let Some(attachment) = record.attachment.clone() else {
            return Ok(IntervalOutcome::Waiting);
        };
        let now = Utc::now();

        if let Some(timestamp) = record.timestamp {
            let age = business_days_between(
                self.calendar.as_ref(),
                self.to_local(timestamp).date(),
                self.to_local(now).date(),
            );
            let in_review =
                matches!(record.requester_status(), Some(RequesterStatus::NeedReview));
            let already_closed = matches!(
                record.requester_status(),
                Some(RequesterStatus::Expired) | Some(RequesterStatus::Invalid)
            );
            if age >= self.config.expired_day_limit && !in_review && !already_closed {
                return self.expire(table_name, row_id, &record).await;
            }
        }

        let headers = self.rows.headers(table_name).await?;
        let chain_len = self.chain_len(table_name).await?;
        let sync = ApprovalSync::new(self.attachments.as_ref(), &self.rules);

        for level in 0..chain_len {
            // Fresh view: earlier iterations may have written cells.
            let Some(row) = self.rows.read_row(table_name, row_id).await? else {
                return Ok(IntervalOutcome::Reindexed);
            };
            let record = RequestRecord::from_row(&row);
            let terminal = level + 1 == chain_len;

            let Some(outcome) =
                sync.sync_level(&record, &attachment, &headers, level).await?
            else {
                break;
            };

            match outcome {
                LevelOutcome::Exists => {
                    if level == 0 {
                        match record.requester_status() {
                            Some(RequesterStatus::Completed) => continue,
                            Some(RequesterStatus::NeedReview) => {
                                return Ok(IntervalOutcome::Waiting)
                            }
                            _ => return Ok(IntervalOutcome::NoChange),
                        }
                    }
                    match record.approver_status(level) {
                        Some(ApproverStatus::Approved)
                        | Some(ApproverStatus::PartiallyRejected) => {
                            if terminal && record.processed_by.is_none() {
                                return self.approved_pipeline(table_name, row_id).await;
                            }
                            continue;
                        }
                        _ => return Ok(IntervalOutcome::NoChange),
                    }
                }
                LevelOutcome::AutoApproved => {
                    self.rows
                        .set_cells(
                            table_name,
                            row_id,
                            &level_cells(
                                level,
                                ApproverStatus::Approved.as_str(),
                                NO_APPROVER,
                                now,
                            ),
                        )
                        .await?;
                    if terminal {
                        return self.approved_pipeline(table_name, row_id).await;
                    }
                    continue;
                }
                LevelOutcome::Pending { is_approver } => {
                    if level == 0 || !is_approver {
                        return Ok(IntervalOutcome::Waiting);
                    }
                    if record.ask_approval_sent[level] {
                        return Ok(IntervalOutcome::Waiting);
                    }
                    return self.ask_approval(table_name, row_id, &record, level).await;
                }
                LevelOutcome::Invalid => {
                    let notification = Notification::new(
                        NotificationKind::Invalid,
                        record.request_number.clone(),
                        vec![record.requester_email.clone()],
                    )
                    .with_metadata("level", level.to_string());
                    send_with_retries(
                        self.notifier.as_ref(),
                        &notification,
                        self.config.notification_attempts,
                    )
                    .await;
                    return Ok(IntervalOutcome::Invalid { level });
                }
                LevelOutcome::Actioned { status, name, notes } => {
                    if level == 0 {
                        match self
                            .ingest_requester_action(table_name, row_id, &record, &status, &name)
                            .await?
                        {
                            Some(outcome) => return Ok(outcome),
                            None => continue,
                        }
                    }
                    match ApproverStatus::parse(&status) {
                        Some(ApproverStatus::Approved)
                        | Some(ApproverStatus::PartiallyRejected) => {
                            self.rows
                                .set_cells(
                                    table_name,
                                    row_id,
                                    &level_cells(level, &status, &name, now),
                                )
                                .await?;
                            if terminal {
                                return self.approved_pipeline(table_name, row_id).await;
                            }
                            continue;
                        }
                        Some(ApproverStatus::Rejected) => {
                            return self
                                .reject(table_name, row_id, &record, level, &status, &name)
                                .await;
                        }
                        Some(ApproverStatus::SendBack) => {
                            let reason = if notes.trim().is_empty() {
                                format!("sent back by {name}")
                            } else {
                                notes
                            };
                            self.send_back(
                                table_name,
                                row_id,
                                &record,
                                SendBackActor::Approver,
                                &reason,
                            )
                            .await?;
                            return Ok(IntervalOutcome::SentBack { level });
                        }
                        None => return Ok(IntervalOutcome::Invalid { level }),
                    }
                }
            }
        }

        Ok(IntervalOutcome::NoChange)
    }

    /// Level 0 ingestion. `None` means the walk continues to the approver
    /// levels.
    async fn ingest_requester_action(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
        status: &str,
        name: &str,
    ) -> Result<Option<IntervalOutcome>, ApplicationError> {
        let now = Utc::now();
        match RequesterStatus::parse(status) {
            Some(RequesterStatus::Completed) => {
                if let Some(attachment) = &record.attachment {
                    let sheets = self.attachments.task_sheets(attachment).await?;
                    let report = validate_sheets(&sheets);
                    if !report.is_clean() {
                        self.send_back(
                            table_name,
                            row_id,
                            record,
                            SendBackActor::System,
                            &report.summary(),
                        )
                        .await?;
                        return Ok(Some(IntervalOutcome::SentBack { level: 0 }));
                    }
                }
                self.rows
                    .set_cells(
                        table_name,
                        row_id,
                        &level_cells(0, RequesterStatus::Completed.as_str(), name, now),
                    )
                    .await?;
                Ok(None)
            }
            Some(RequesterStatus::NeedReview) => {
                self.rows
                    .set_cells(table_name, row_id, &level_cells(0, status, name, now))
                    .await?;
                Ok(Some(IntervalOutcome::Waiting))
            }
            _ => {
                self.rows
                    .set_cells(table_name, row_id, &level_cells(0, status, name, now))
                    .await?;
                Ok(Some(IntervalOutcome::NoChange))
            }
        }
    }

    async fn ask_approval(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
        level: usize,
    ) -> Result<IntervalOutcome, ApplicationError> {
        let Some(request_type) = record.request_type else {
            return Ok(IntervalOutcome::Waiting);
        };
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
        if roster.is_empty() {
            return Ok(IntervalOutcome::Waiting);
        }

        let notification = Notification::new(
            NotificationKind::AskApproval,
            record.request_number.clone(),
            roster,
        )
        .with_metadata("level", level.to_string());
        send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;
        // Guard cell: one ask per level per chain pass.
        self.rows
            .set_cell(table_name, row_id, columns::ask_status(level), &Utc::now().to_rfc3339())
            .await?;
        Ok(IntervalOutcome::AskSent { level })
    }

    async fn expire(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
    ) -> Result<IntervalOutcome, ApplicationError> {
        let now = Utc::now();
        self.rows
            .set_cells(
                table_name,
                row_id,
                &level_cells(0, RequesterStatus::Expired.as_str(), "SYSTEM", now),
            )
            .await?;
        if let Some(attachment) = &record.attachment {
            self.attachments.set_protected(attachment, true).await?;
        }

        let notification = Notification::new(
            NotificationKind::Expired,
            record.request_number.clone(),
            vec![record.requester_email.clone()],
        );
        send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;

        let correlation =
            record.request_number.as_ref().map(|n| n.0.clone()).unwrap_or_default();
        self.audit.emit(AuditEvent::new(
            record.request_number.clone(),
            correlation,
            "request.expired",
            AuditCategory::System,
            "SYSTEM",
            AuditOutcome::Success,
        ));
        info!(
            event_name = "fsm.expired",
            request_number = %record
                .request_number
                .as_ref()
                .map(|n| n.0.as_str())
                .unwrap_or("unknown"),
            "request expired without approval activity"
        );
        Ok(IntervalOutcome::Expired)
    }

    async fn reject(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
        level: usize,
        status: &str,
        name: &str,
    ) -> Result<IntervalOutcome, ApplicationError> {
        let now = Utc::now();
        self.rows
            .set_cells(table_name, row_id, &level_cells(level, status, name, now))
            .await?;
        if let Some(attachment) = &record.attachment {
            self.attachments.set_protected(attachment, true).await?;
        }

        let notification = Notification::new(
            NotificationKind::Rejected,
            record.request_number.clone(),
            vec![record.requester_email.clone()],
        )
        .with_metadata("level", level.to_string())
        .with_metadata("approver", name);
        send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;

        let correlation =
            record.request_number.as_ref().map(|n| n.0.clone()).unwrap_or_default();
        self.audit.emit(
            AuditEvent::new(
                record.request_number.clone(),
                correlation,
                "request.rejected",
                AuditCategory::Approval,
                name,
                AuditOutcome::Rejected,
            )
            .with_metadata("level", level.to_string()),
        );
        Ok(IntervalOutcome::Rejected { level })
    }

    /// The transactional approved pipeline, run under the row lock
    /// already held by the caller.
    async fn approved_pipeline(
        &self,
        table_name: &str,
        row_id: u32,
    ) -> Result<IntervalOutcome, ApplicationError> {
        let Some(row) = self.rows.read_row(table_name, row_id).await? else {
            return Ok(IntervalOutcome::Reindexed);
        };
        let record = RequestRecord::from_row(&row);
        if record.processed_by.is_some() {
            return Ok(IntervalOutcome::NoChange);
        }
        let Some(request_type) = record.request_type else {
            return Ok(IntervalOutcome::NoChange);
        };
        let Some(attachment) = record.attachment.clone() else {
            return Ok(IntervalOutcome::NoChange);
        };

        let mut cells: Vec<(String, String)> = Vec::new();

        let total_task = match record.total_task.filter(|count| *count > 0) {
            Some(count) => count,
            None => {
                let counted = self.attachments.count_task_rows(&attachment).await?;
                if counted == 0 {
                    return self.abort_for_missing_tasks(table_name, row_id, &record).await;
                }
                cells.push((columns::TOTAL_TASK.to_string(), counted.to_string()));
                counted
            }
        };

        let mut estimated_time = 0i64;
        if let Some(hit) = self.rules.baseline(request_type, total_task).await? {
            estimated_time = hit.estimated_time(total_task);
            cells.push((columns::BASELINE.to_string(), hit.seconds.to_string()));
            cells.push((columns::ESTIMATED_TIME.to_string(), estimated_time.to_string()));
        }

        let assignee = self
            .allocator
            .allocate(&record.business_unit, &record.department, request_type)
            .await?;
        cells.push((columns::PROCESSED_BY.to_string(), assignee.clone()));

        self.rows.set_cells(table_name, row_id, &cells).await?;

        if estimated_time > 0 {
            self.workload.add(&assignee, estimated_time).await?;
        }

        self.attachments.set_protected(&attachment, true).await?;

        let notification = Notification::new(
            NotificationKind::Approved,
            record.request_number.clone(),
            vec![record.requester_email.clone(), assignee.clone()],
        )
        .with_metadata("assignee", assignee.clone());
        send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;

        // Mirror the completed row onto the assignee's own table.
        if let Some(updated) = self.rows.read_row(table_name, row_id).await? {
            self.rows.upsert_row(&assignee, &updated, false).await?;
        }

        let correlation =
            record.request_number.as_ref().map(|n| n.0.clone()).unwrap_or_default();
        self.audit.emit(
            AuditEvent::new(
                record.request_number.clone(),
                correlation,
                "request.allocated",
                AuditCategory::Allocation,
                "SYSTEM",
                AuditOutcome::Success,
            )
            .with_metadata("assignee", assignee.clone())
            .with_metadata("estimated_time", estimated_time.to_string()),
        );
        info!(
            event_name = "fsm.allocated",
            request_number = %record
                .request_number
                .as_ref()
                .map(|n| n.0.as_str())
                .unwrap_or("unknown"),
            assignee = %assignee,
            estimated_time,
            "approved request allocated"
        );

        Ok(IntervalOutcome::Allocated { assignee })
    }

    async fn abort_for_missing_tasks(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
    ) -> Result<IntervalOutcome, ApplicationError> {
        // Cannot proceed without tasks: hand the request back to the
        // requester by clearing their completion.
        self.rows
            .set_cells(
                table_name,
                row_id,
                &[
                    (columns::respon(0).to_string(), String::new()),
                    (columns::name(0).to_string(), String::new()),
                    (columns::timestamp(0).to_string(), String::new()),
                ],
            )
            .await?;

        let notification = Notification::new(
            NotificationKind::MissingTasks,
            record.request_number.clone(),
            vec![record.requester_email.clone()],
        );
        send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;
        Ok(IntervalOutcome::MissingTasks)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};

    use super::IntervalOutcome;
    use crate::attachment::{TaskColumn, TaskSheet};
    use crate::audit::AuditCategory;
    use crate::domain::agent::{Agent, AgentStatus};
    use crate::domain::approval::NO_APPROVER;
    use crate::domain::request::{
        columns, AttachmentRef, MasterTable, RequestNumber, RequestRecord, RequestType,
    };
    use crate::domain::rules::{ApproverRule, BaselineRule, DistributionMatrix, TaskRange};
    use crate::fsm::testkit::TestHarness;
    use crate::fsm::SubmitOptions;
    use crate::notify::NotificationKind;
    use crate::rowstore::RowStore;
    use crate::workload::AgentStore;

    fn sheet_with_tasks(count: usize) -> TaskSheet {
        let rows = (0..count)
            .map(|index| {
                let mut row = BTreeMap::new();
                row.insert("Material".to_string(), format!("M-{index:04}"));
                row
            })
            .collect();
        TaskSheet {
            name: "Tasks".into(),
            columns: vec![TaskColumn { name: "Material".into(), mandatory: true, rule: None }],
            rows,
        }
    }

    /// Submits a row and returns (row_id, number, attachment).
    async fn submitted(harness: &TestHarness) -> (u32, RequestNumber, AttachmentRef) {
        let row_id = harness
            .seed_row(
                MasterTable::Bom,
                &[
                    (columns::REQUEST_TYPE, "BOM Create"),
                    (columns::COMPANY_CODE, "BU01"),
                    (columns::COMPANY_NAME, "Retail Unit Alpha"),
                    (columns::EMAIL_ADDRESS, "u@x"),
                    (columns::TIMESTAMP, Utc::now().to_rfc3339().as_str()),
                ],
            )
            .await;
        let outcome = harness
            .engine
            .handle_on_submit(MasterTable::Bom, row_id, &SubmitOptions::default())
            .await
            .expect("submit");
        (row_id, outcome.request_number, outcome.attachment)
    }

    fn configure_two_level_chain(harness: &TestHarness) {
        *harness.source.approvers.lock().expect("mutex") = vec![
            ApproverRule {
                business_unit: "BU01".into(),
                department: "GENERAL".into(),
                request_type: "BOM Create".into(),
                level: 1,
                approvers: vec!["a@x".into()],
            },
            ApproverRule {
                business_unit: "BU01".into(),
                department: "GENERAL".into(),
                request_type: "BOM Create".into(),
                level: 2,
                approvers: vec!["b@x".into()],
            },
            ApproverRule {
                business_unit: "BU01".into(),
                department: "GENERAL".into(),
                request_type: "BOM Create".into(),
                level: 3,
                approvers: vec![NO_APPROVER.into()],
            },
        ];
        *harness.source.baselines.lock().expect("mutex") = vec![BaselineRule {
            request_type: RequestType::BomCreate,
            range: TaskRange::Bounded { min: 1, max: 10 },
            seconds: 120,
            per_task: true,
        }];
        let mut matrix = DistributionMatrix::default();
        matrix.insert(RequestType::BomCreate, ["anna".to_string(), "budi".to_string()]);
        *harness.source.matrix.lock().expect("mutex") = matrix;
        harness.agents.seed(Agent {
            name: "anna".into(),
            active: true,
            status: AgentStatus::Free,
            workload_seconds: 100,
        });
        harness.agents.seed(Agent {
            name: "budi".into(),
            active: true,
            status: AgentStatus::Free,
            workload_seconds: 900,
        });
    }

    #[tokio::test]
    async fn mismatched_request_number_aborts_the_pass() {
        let harness = TestHarness::new();
        let (row_id, _, _) = submitted(&harness).await;

        let outcome = harness
            .engine
            .handle_on_interval(
                MasterTable::Bom,
                row_id,
                &RequestNumber("BOM/MDM/Other/00099".into()),
            )
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::Reindexed);
    }

    #[tokio::test]
    async fn pending_requester_level_waits() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, _) = submitted(&harness).await;

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::Waiting);
    }

    #[tokio::test]
    async fn completed_requester_triggers_ask_approval_once() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;
        harness.attachments.set_sheets(&attachment, vec![sheet_with_tasks(5)]);
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");

        let first = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(first, IntervalOutcome::AskSent { level: 1 });
        assert_eq!(harness.notifier.count_kind(NotificationKind::AskApproval), 1);

        // Second pass is a no-op: the ask guard cell is stamped.
        let second = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(second, IntervalOutcome::Waiting);
        assert_eq!(harness.notifier.count_kind(NotificationKind::AskApproval), 1);
    }

    #[tokio::test]
    async fn full_chain_approval_allocates_and_mirrors() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;
        harness.attachments.set_sheets(&attachment, vec![sheet_with_tasks(5)]);
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");
        harness.attachments.record_action(&attachment, 1, "Approved", "a@x");
        harness.attachments.record_action(&attachment, 2, "Approved", "b@x");

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        // Least-loaded matrix agent wins; level 3 auto-approves via sentinel.
        assert_eq!(outcome, IntervalOutcome::Allocated { assignee: "anna".into() });

        let row = harness.rows.read_row("BOM", row_id).await.expect("read").expect("row");
        let record = RequestRecord::from_row(&row);
        assert_eq!(record.processed_by.as_deref(), Some("anna"));
        assert_eq!(record.baseline, Some(120));
        assert_eq!(record.estimated_time, Some(600));
        assert_eq!(record.levels[3].name, NO_APPROVER);

        let anna = harness.agents.get("anna").await.expect("get").expect("agent");
        assert_eq!(anna.workload_seconds, 700);

        // Mirrored to the assignee's table and the attachment is protected.
        assert_eq!(
            harness.rows.find_row("anna", &number.0).await.expect("find"),
            Some(0)
        );
        assert!(harness.attachments.snapshot(&attachment).expect("doc").protected);
        assert_eq!(harness.notifier.count_kind(NotificationKind::Approved), 1);
    }

    #[tokio::test]
    async fn rerunning_after_allocation_does_not_double_increment() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;
        harness.attachments.set_sheets(&attachment, vec![sheet_with_tasks(5)]);
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");
        harness.attachments.record_action(&attachment, 1, "Approved", "a@x");
        harness.attachments.record_action(&attachment, 2, "Approved", "b@x");

        harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("first interval");
        let again = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("second interval");
        assert_eq!(again, IntervalOutcome::NoChange);

        let anna = harness.agents.get("anna").await.expect("get").expect("agent");
        assert_eq!(anna.workload_seconds, 700);
        assert_eq!(harness.notifier.count_kind(NotificationKind::Approved), 1);
    }

    #[tokio::test]
    async fn rejection_finalizes_and_protects() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;
        harness.attachments.set_sheets(&attachment, vec![sheet_with_tasks(3)]);
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");
        harness.attachments.record_action(&attachment, 1, "Rejected", "a@x");

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::Rejected { level: 1 });
        assert!(harness.attachments.snapshot(&attachment).expect("doc").protected);
        assert_eq!(harness.notifier.count_kind(NotificationKind::Rejected), 1);
    }

    #[tokio::test]
    async fn send_back_resets_to_need_review_with_reason() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;
        harness.attachments.set_sheets(&attachment, vec![sheet_with_tasks(3)]);
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");
        harness.attachments.record_action(&attachment, 1, "Approved", "a@x");

        harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("ingest level 1");

        harness.attachments.record_action(&attachment, 2, "Send Back", "b@x");
        harness.attachments.record_notes(&attachment, 2, "please fix X");

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::SentBack { level: 2 });

        let row = harness.rows.read_row("BOM", row_id).await.expect("read").expect("row");
        let record = RequestRecord::from_row(&row);
        assert_eq!(record.levels[0].status, "Need Review");
        assert!(record.levels[1].is_blank());
        assert!(record.levels[2].is_blank());
        assert_eq!(record.sent_back_count, 1);
        assert_eq!(record.sent_back_emails, 1);

        let send_backs: Vec<_> = harness
            .audit
            .events()
            .into_iter()
            .filter(|event| event.category == AuditCategory::SendBack)
            .collect();
        assert_eq!(send_backs.len(), 1);
        assert_eq!(send_backs[0].actor, "APPROVER");
        assert_eq!(
            send_backs[0].metadata.get("reason").map(String::as_str),
            Some("please fix X")
        );
        assert_eq!(harness.notifier.count_kind(NotificationKind::SendBack), 1);
    }

    #[tokio::test]
    async fn dirty_attachment_causes_system_send_back() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;

        let mut incomplete = BTreeMap::new();
        incomplete.insert("Material".to_string(), String::new());
        incomplete.insert("Plant".to_string(), "P-100".to_string());
        harness.attachments.set_sheets(
            &attachment,
            vec![TaskSheet {
                name: "Tasks".into(),
                columns: vec![
                    TaskColumn { name: "Material".into(), mandatory: true, rule: None },
                    TaskColumn { name: "Plant".into(), mandatory: false, rule: None },
                ],
                rows: vec![incomplete],
            }],
        );
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::SentBack { level: 0 });

        let send_backs = harness.audit.count_send_backs(&number);
        assert_eq!(send_backs, 1);
    }

    #[tokio::test]
    async fn stale_request_expires_and_notifies() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let stale = (Utc::now() - Duration::days(14)).to_rfc3339();
        let row_id = harness
            .seed_row(
                MasterTable::Bom,
                &[
                    (columns::REQUEST_TYPE, "BOM Create"),
                    (columns::COMPANY_CODE, "BU01"),
                    (columns::COMPANY_NAME, "Retail Unit Alpha"),
                    (columns::EMAIL_ADDRESS, "u@x"),
                    (columns::TIMESTAMP, stale.as_str()),
                ],
            )
            .await;
        let submit = harness
            .engine
            .handle_on_submit(MasterTable::Bom, row_id, &SubmitOptions::default())
            .await
            .expect("submit");

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &submit.request_number)
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::Expired);

        let row = harness.rows.read_row("BOM", row_id).await.expect("read").expect("row");
        let record = RequestRecord::from_row(&row);
        assert_eq!(record.levels[0].status, "Expired");
        assert!(harness.attachments.snapshot(&submit.attachment).expect("doc").protected);
        assert_eq!(harness.notifier.count_kind(NotificationKind::Expired), 1);
    }

    #[tokio::test]
    async fn approved_chain_without_tasks_resets_the_requester() {
        let harness = TestHarness::new();
        configure_two_level_chain(&harness);
        let (row_id, number, attachment) = submitted(&harness).await;
        harness.attachments.set_sheets(&attachment, vec![sheet_with_tasks(0)]);
        harness.attachments.record_action(&attachment, 0, "Completed", "u@x");
        harness.attachments.record_action(&attachment, 1, "Approved", "a@x");
        harness.attachments.record_action(&attachment, 2, "Approved", "b@x");

        let outcome = harness
            .engine
            .handle_on_interval(MasterTable::Bom, row_id, &number)
            .await
            .expect("interval");
        assert_eq!(outcome, IntervalOutcome::MissingTasks);

        let row = harness.rows.read_row("BOM", row_id).await.expect("read").expect("row");
        let record = RequestRecord::from_row(&row);
        assert!(record.levels[0].is_blank());
        assert!(record.processed_by.is_none());
        assert_eq!(harness.notifier.count_kind(NotificationKind::MissingTasks), 1);
    }
}
