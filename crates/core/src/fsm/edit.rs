//! The execution phase on assignee tables.
//!
//! Assignees claim a request by filling `Processed By` on their own table and
//! drive it to a terminal status through `Process Status` edits. Every edit
//! is validated against the state machine inside the row lock; rejected
//! edits revert the cell and surface a toast. Accepted transitions mirror
//! back to the master table.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::attachment::AttachmentStore;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, SendBackActor};
use crate::business_hours::add_business_seconds;
use crate::domain::request::{columns, ProcessStatus, RequestRecord};
use crate::errors::{ApplicationError, DomainError};
use crate::fsm::RequestEngine;
use crate::notify::{send_with_retries, Notification, NotificationKind};
use crate::rowstore::RowStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    /// Assignee claimed the request; deadline computed.
    Claimed { estimated_finish: Option<DateTime<Utc>> },
    Accepted,
    /// Edit violated the state machine; the cell was restored.
    Reverted { previous: String, toast: String },
    /// MDM send-back ran; the assignee row is gone.
    SentBack,
    NoChange,
}

const FEEDBACK_SENT: &str = "Sent";

impl RequestEngine {
    /// Handles one cell change on an assignee table.
    pub async fn handle_on_edit(
        &self,
        assignee_table: &str,
        row_id: u32,
        edited_column: &str,
        old_value: &str,
        user_email: &str,
    ) -> Result<EditOutcome, ApplicationError> {
        self.locks
            .with_row_lock(assignee_table, row_id, "fsm.edit", |_| async move {
                self.edit_locked(assignee_table, row_id, edited_column, old_value, user_email)
                    .await
            })
            .await?
    }

    async fn edit_locked(
        &self,
        assignee_table: &str,
        row_id: u32,
        edited_column: &str,
        old_value: &str,
        user_email: &str,
    ) -> Result<EditOutcome, ApplicationError> {
        let Some(row) = self.rows.read_row(assignee_table, row_id).await? else {
            return Ok(EditOutcome::NoChange);
        };
        let record = RequestRecord::from_row(&row);

        match edited_column {
            columns::PROCESSED_BY => {
                if record.processed_by.is_none() || !old_value.trim().is_empty() {
                    return Ok(EditOutcome::NoChange);
                }
                self.claim(assignee_table, row_id, &record, user_email).await
            }
            columns::PROCESS_STATUS => {
                self.process_status_edit(assignee_table, row_id, &record, old_value).await
            }
            _ => Ok(EditOutcome::NoChange),
        }
    }

    async fn claim(
        &self,
        assignee_table: &str,
        row_id: u32,
        record: &RequestRecord,
        user_email: &str,
    ) -> Result<EditOutcome, ApplicationError> {
        let now = Utc::now();
        let mut cells = vec![(columns::TAKEN_DATE.to_string(), now.to_rfc3339())];

        let estimated_finish = record
            .estimated_time
            .filter(|estimate| *estimate > 0)
            .map(|estimate| {
                self.from_local(add_business_seconds(
                    self.calendar.as_ref(),
                    self.to_local(now),
                    estimate,
                ))
            });
        if let Some(finish) = estimated_finish {
            cells.push((columns::ESTIMATED_TIME_FINISHED.to_string(), finish.to_rfc3339()));
        }

        if let Some(attachment) = &record.attachment {
            if !user_email.trim().is_empty() {
                self.attachments.grant_editor(attachment, user_email).await?;
            }
        }

        self.rows.set_cells(assignee_table, row_id, &cells).await?;

        let mut mirrored = cells.clone();
        mirrored.push((
            columns::PROCESSED_BY.to_string(),
            record.processed_by.clone().unwrap_or_default(),
        ));
        self.mirror_to_master(record, mirrored).await?;

        info!(
            event_name = "fsm.claimed",
            request_number = %record
                .request_number
                .as_ref()
                .map(|n| n.0.as_str())
                .unwrap_or("unknown"),
            assignee = assignee_table,
            "request claimed"
        );
        Ok(EditOutcome::Claimed { estimated_finish })
    }

    async fn process_status_edit(
        &self,
        assignee_table: &str,
        row_id: u32,
        record: &RequestRecord,
        old_value: &str,
    ) -> Result<EditOutcome, ApplicationError> {
        let raw = record
            .process_status
            .map(|status| status.as_str().to_string());
        let old_status = ProcessStatus::parse(old_value);

        // The cell may hold arbitrary text after a manual edit; anything
        // outside the vocabulary reverts.
        let current_cell = self
            .rows
            .read_row(assignee_table, row_id)
            .await?
            .and_then(|row| row.get(columns::PROCESS_STATUS).cloned())
            .unwrap_or_default();
        if !current_cell.trim().is_empty() && raw.is_none() {
            return self
                .revert_status(
                    assignee_table,
                    row_id,
                    old_value,
                    format!("`{}` is not a valid process status", current_cell.trim()),
                )
                .await;
        }

        let Some(new_status) = record.process_status else {
            return Ok(EditOutcome::NoChange);
        };

        if new_status == ProcessStatus::Completed && record.taken_date.is_none() {
            return self
                .revert_status(
                    assignee_table,
                    row_id,
                    old_value,
                    DomainError::CompletedWithoutTakenDate.to_string(),
                )
                .await;
        }
        if old_status.map(|status| status.is_terminal()).unwrap_or(false)
            && new_status == ProcessStatus::OnGoing
        {
            return self
                .revert_status(
                    assignee_table,
                    row_id,
                    old_value,
                    DomainError::InvalidProcessTransition {
                        from: old_status,
                        to: ProcessStatus::OnGoing,
                    }
                    .to_string(),
                )
                .await;
        }
        if old_status == Some(ProcessStatus::SendBack) && new_status != ProcessStatus::SendBack {
            return self
                .revert_status(
                    assignee_table,
                    row_id,
                    old_value,
                    DomainError::SendBackIsSticky.to_string(),
                )
                .await;
        }

        match new_status {
            ProcessStatus::SendBack => {
                self.mdm_send_back(assignee_table, row_id, record).await?;
                Ok(EditOutcome::SentBack)
            }
            ProcessStatus::OnGoing => {
                self.mirror_to_master(
                    record,
                    vec![(
                        columns::PROCESS_STATUS.to_string(),
                        ProcessStatus::OnGoing.as_str().to_string(),
                    )],
                )
                .await?;
                Ok(EditOutcome::Accepted)
            }
            terminal => {
                self.finalize_status(assignee_table, row_id, record, terminal).await
            }
        }
    }

    async fn revert_status(
        &self,
        assignee_table: &str,
        row_id: u32,
        old_value: &str,
        toast: String,
    ) -> Result<EditOutcome, ApplicationError> {
        self.rows
            .set_cell(assignee_table, row_id, columns::PROCESS_STATUS, old_value)
            .await?;
        Ok(EditOutcome::Reverted { previous: old_value.to_string(), toast })
    }

    /// Every terminal transition arriving here has a Taken Date.
    async fn finalize_status(
        &self,
        assignee_table: &str,
        row_id: u32,
        record: &RequestRecord,
        status: ProcessStatus,
    ) -> Result<EditOutcome, ApplicationError> {
        let now = Utc::now();
        let mut cells = Vec::new();
        if record.processed_date.is_none() {
            cells.push((columns::PROCESSED_DATE.to_string(), now.to_rfc3339()));
        }

        let already_notified = !record.feedback_status.is_empty();
        if !already_notified {
            let notification = Notification::new(
                NotificationKind::Processed,
                record.request_number.clone(),
                vec![record.requester_email.clone()],
            )
            .with_metadata("status", status.as_str());
            send_with_retries(
                self.notifier.as_ref(),
                &notification,
                self.config.notification_attempts,
            )
            .await;
            cells.push((columns::FEEDBACK_STATUS.to_string(), FEEDBACK_SENT.to_string()));
        }

        if !cells.is_empty() {
            self.rows.set_cells(assignee_table, row_id, &cells).await?;
        }

        let mut mirrored = cells;
        mirrored.push((columns::PROCESS_STATUS.to_string(), status.as_str().to_string()));
        if let Some(taken) = record.taken_date {
            mirrored.push((columns::TAKEN_DATE.to_string(), taken.to_rfc3339()));
        }
        self.mirror_to_master(record, mirrored).await?;

        let correlation =
            record.request_number.as_ref().map(|n| n.0.clone()).unwrap_or_default();
        self.audit.emit(
            AuditEvent::new(
                record.request_number.clone(),
                correlation,
                "request.processed",
                AuditCategory::Execution,
                assignee_table,
                AuditOutcome::Success,
            )
            .with_metadata("status", status.as_str()),
        );
        Ok(EditOutcome::Accepted)
    }

    /// The assignee rejects the work back to the requester: rewind the
    /// master row, then drop the assignee's copy.
    async fn mdm_send_back(
        &self,
        assignee_table: &str,
        row_id: u32,
        record: &RequestRecord,
    ) -> Result<(), ApplicationError> {
        let master_info = match (&record.request_number, record.request_type) {
            (Some(number), Some(request_type)) => {
                let master = request_type.master_table().table_name();
                self.rows.find_row(master, &number.0).await?.map(|master_row| (master, master_row))
            }
            _ => None,
        };

        if let Some((master, master_row)) = master_info {
            // Lock order: assignee row (held by caller) then master row.
            self.locks
                .with_row_lock(master, master_row, "fsm.mdm_send_back", |_| async {
                    let Some(row) = self.rows.read_row(master, master_row).await? else {
                        return Ok::<_, ApplicationError>(());
                    };
                    let master_record = RequestRecord::from_row(&row);
                    self.send_back(
                        master,
                        master_row,
                        &master_record,
                        SendBackActor::Mdm,
                        "sent back during processing",
                    )
                    .await?;
                    // The mirrored execution cells are part of the rewind.
                    self.rows
                        .set_cells(
                            master,
                            master_row,
                            &[
                                (columns::PROCESSED_BY.to_string(), String::new()),
                                (columns::PROCESS_STATUS.to_string(), String::new()),
                                (columns::TAKEN_DATE.to_string(), String::new()),
                            ],
                        )
                        .await?;
                    Ok(())
                })
                .await??;
        }

        self.rows.delete_row(assignee_table, row_id).await?;
        Ok(())
    }

    /// Repair pass over one assignee row. Returns the names of the
    /// fixes applied, empty when the row was consistent.
    pub async fn handle_on_child_interval(
        &self,
        assignee_table: &str,
        row_id: u32,
    ) -> Result<Vec<&'static str>, ApplicationError> {
        self.locks
            .with_row_lock(assignee_table, row_id, "fsm.child_repair", |_| async move {
                self.child_repair_locked(assignee_table, row_id).await
            })
            .await?
    }

    async fn child_repair_locked(
        &self,
        assignee_table: &str,
        row_id: u32,
    ) -> Result<Vec<&'static str>, ApplicationError> {
        let Some(row) = self.rows.read_row(assignee_table, row_id).await? else {
            return Ok(Vec::new());
        };
        let record = RequestRecord::from_row(&row);
        let mut repairs = Vec::new();

        // A send-back the edit handler never finished: rewind and drop.
        if record.process_status == Some(ProcessStatus::SendBack) {
            self.mdm_send_back(assignee_table, row_id, &record).await?;
            repairs.push("send_back_completed");
            return Ok(repairs);
        }

        if record.taken_date.is_some()
            && record.estimated_time.filter(|estimate| *estimate > 0).is_some()
            && record.estimated_time_finished.is_none()
        {
            let taken = record.taken_date.unwrap_or_else(Utc::now);
            let estimate = record.estimated_time.unwrap_or(0);
            let finish = self.from_local(add_business_seconds(
                self.calendar.as_ref(),
                self.to_local(taken),
                estimate,
            ));
            self.rows
                .set_cell(
                    assignee_table,
                    row_id,
                    columns::ESTIMATED_TIME_FINISHED,
                    &finish.to_rfc3339(),
                )
                .await?;
            self.mirror_to_master(
                &record,
                vec![(columns::ESTIMATED_TIME_FINISHED.to_string(), finish.to_rfc3339())],
            )
            .await?;
            repairs.push("estimated_time_finished");
        }

        if record.process_status.map(|status| status.is_terminal()).unwrap_or(false) {
            if record.processed_date.is_none() {
                self.rows
                    .set_cell(
                        assignee_table,
                        row_id,
                        columns::PROCESSED_DATE,
                        &Utc::now().to_rfc3339(),
                    )
                    .await?;
                repairs.push("processed_date");
            }
            if record.feedback_status.is_empty() {
                let notification = Notification::new(
                    NotificationKind::Processed,
                    record.request_number.clone(),
                    vec![record.requester_email.clone()],
                );
                send_with_retries(
                    self.notifier.as_ref(),
                    &notification,
                    self.config.notification_attempts,
                )
                .await;
                self.rows
                    .set_cell(assignee_table, row_id, columns::FEEDBACK_STATUS, FEEDBACK_SENT)
                    .await?;
                self.mirror_to_master(
                    &record,
                    vec![(columns::FEEDBACK_STATUS.to_string(), FEEDBACK_SENT.to_string())],
                )
                .await?;
                repairs.push("feedback_status");
            }
        }

        Ok(repairs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::EditOutcome;
    use crate::domain::request::{columns, MasterTable, ProcessStatus, RequestRecord};
    use crate::fsm::testkit::TestHarness;
    use crate::notify::NotificationKind;
    use crate::rowstore::RowStore;

    const NUMBER: &str = "BOM/MDM/Retail Unit Alpha/00001";
    const ASSIGNEE: &str = "anna";

    /// Seeds a master row plus its mirrored assignee row, as the approved
    /// pipeline leaves them.
    async fn allocated_pair(harness: &TestHarness, extra_child: &[(&str, &str)]) -> (u32, u32) {
        let attachment = {
            use crate::attachment::AttachmentStore;
            harness
                .attachments
                .clone_template(crate::domain::request::RequestType::BomCreate, "Alpha")
                .await
                .expect("clone template")
        };

        let base = vec![
            (columns::REQUEST_NUMBER, NUMBER),
            (columns::REQUEST_TYPE, "BOM Create"),
            (columns::COMPANY_CODE, "BU01"),
            (columns::EMAIL_ADDRESS, "u@x"),
            (columns::PROCESSED_BY, ASSIGNEE),
            (columns::ESTIMATED_TIME, "3600"),
        ];
        let attachment_cell = attachment.0.clone();
        let mut master_cells = base.clone();
        master_cells.push((columns::ATTACHMENT, attachment_cell.as_str()));
        let master_row = harness.seed_row(MasterTable::Bom, &master_cells).await;

        harness.rows.create_table(
            ASSIGNEE,
            columns::MASTER_HEADERS.iter().map(|header| header.to_string()),
        );
        let mut child_values = crate::domain::request::RowValues::new();
        for column in columns::MASTER_HEADERS {
            child_values.insert(column.to_string(), String::new());
        }
        for (column, value) in &master_cells {
            child_values.insert(column.to_string(), value.to_string());
        }
        for (column, value) in extra_child {
            child_values.insert(column.to_string(), value.to_string());
        }
        let child_row = harness
            .rows
            .upsert_row(ASSIGNEE, &child_values, false)
            .await
            .expect("seed child");
        (master_row, child_row)
    }

    #[tokio::test]
    async fn claim_stamps_taken_date_and_deadline_and_mirrors() {
        let harness = TestHarness::new();
        let (master_row, child_row) = allocated_pair(&harness, &[]).await;

        let outcome = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESSED_BY, "", "anna@x")
            .await
            .expect("edit");

        let EditOutcome::Claimed { estimated_finish } = outcome else {
            panic!("expected claim outcome, got {outcome:?}");
        };
        assert!(estimated_finish.is_some());

        let child = harness
            .rows
            .read_row(ASSIGNEE, child_row)
            .await
            .expect("read")
            .expect("row");
        let child_record = RequestRecord::from_row(&child);
        assert!(child_record.taken_date.is_some());
        assert!(child_record.estimated_time_finished.is_some());

        let master = harness
            .rows
            .read_row("BOM", master_row)
            .await
            .expect("read")
            .expect("row");
        let master_record = RequestRecord::from_row(&master);
        assert!(master_record.taken_date.is_some());
        assert_eq!(master_record.processed_by.as_deref(), Some(ASSIGNEE));
    }

    #[tokio::test]
    async fn completed_without_taken_date_reverts_with_toast() {
        let harness = TestHarness::new();
        let (_, child_row) =
            allocated_pair(&harness, &[(columns::PROCESS_STATUS, "Completed")]).await;

        let outcome = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESS_STATUS, "", "anna@x")
            .await
            .expect("edit");

        let EditOutcome::Reverted { previous, toast } = outcome else {
            panic!("expected revert, got {outcome:?}");
        };
        assert_eq!(previous, "");
        assert!(toast.contains("Taken Date"));

        let child = harness
            .rows
            .read_row(ASSIGNEE, child_row)
            .await
            .expect("read")
            .expect("row");
        assert_eq!(child.get(columns::PROCESS_STATUS).map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn terminal_status_cannot_reopen() {
        let harness = TestHarness::new();
        let taken = Utc::now().to_rfc3339();
        let (_, child_row) = allocated_pair(
            &harness,
            &[
                (columns::TAKEN_DATE, taken.as_str()),
                (columns::PROCESS_STATUS, "On Going"),
            ],
        )
        .await;

        let outcome = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESS_STATUS, "Completed", "anna@x")
            .await
            .expect("edit");

        assert!(matches!(outcome, EditOutcome::Reverted { .. }));
        let child = harness
            .rows
            .read_row(ASSIGNEE, child_row)
            .await
            .expect("read")
            .expect("row");
        assert_eq!(child.get(columns::PROCESS_STATUS).map(String::as_str), Some("Completed"));
    }

    #[tokio::test]
    async fn send_back_status_is_sticky() {
        let harness = TestHarness::new();
        let taken = Utc::now().to_rfc3339();
        let (_, child_row) = allocated_pair(
            &harness,
            &[
                (columns::TAKEN_DATE, taken.as_str()),
                (columns::PROCESS_STATUS, "On Going"),
            ],
        )
        .await;

        let outcome = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESS_STATUS, "Send Back", "anna@x")
            .await
            .expect("edit");

        assert!(matches!(outcome, EditOutcome::Reverted { .. }));
    }

    #[tokio::test]
    async fn completing_with_taken_date_notifies_once_and_mirrors() {
        let harness = TestHarness::new();
        let taken = Utc::now().to_rfc3339();
        let (master_row, child_row) = allocated_pair(
            &harness,
            &[
                (columns::TAKEN_DATE, taken.as_str()),
                (columns::PROCESS_STATUS, "Completed"),
            ],
        )
        .await;

        let outcome = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESS_STATUS, "On Going", "anna@x")
            .await
            .expect("edit");
        assert_eq!(outcome, EditOutcome::Accepted);
        assert_eq!(harness.notifier.count_kind(NotificationKind::Processed), 1);

        let master = harness
            .rows
            .read_row("BOM", master_row)
            .await
            .expect("read")
            .expect("row");
        let master_record = RequestRecord::from_row(&master);
        assert_eq!(master_record.process_status, Some(ProcessStatus::Completed));
        assert!(!master_record.feedback_status.is_empty());

        // A second identical edit does not re-notify.
        let again = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESS_STATUS, "On Going", "anna@x")
            .await
            .expect("edit");
        assert_eq!(again, EditOutcome::Accepted);
        assert_eq!(harness.notifier.count_kind(NotificationKind::Processed), 1);
    }

    #[tokio::test]
    async fn mdm_send_back_rewinds_master_and_deletes_child_row() {
        let harness = TestHarness::new();
        let taken = Utc::now().to_rfc3339();
        let (master_row, child_row) = allocated_pair(
            &harness,
            &[
                (columns::TAKEN_DATE, taken.as_str()),
                (columns::PROCESS_STATUS, "Send Back"),
            ],
        )
        .await;

        let outcome = harness
            .engine
            .handle_on_edit(ASSIGNEE, child_row, columns::PROCESS_STATUS, "On Going", "anna@x")
            .await
            .expect("edit");
        assert_eq!(outcome, EditOutcome::SentBack);

        assert_eq!(harness.rows.row_count(ASSIGNEE).await.expect("count"), 0);

        let master = harness
            .rows
            .read_row("BOM", master_row)
            .await
            .expect("read")
            .expect("row");
        let master_record = RequestRecord::from_row(&master);
        assert_eq!(master_record.levels[0].status, "Need Review");
        assert!(master_record.processed_by.is_none());
        assert_eq!(harness.notifier.count_kind(NotificationKind::SendBack), 1);
    }

    #[tokio::test]
    async fn child_repair_fills_missing_deadline_and_feedback() {
        let harness = TestHarness::new();
        let taken = Utc::now().to_rfc3339();
        let (_, child_row) = allocated_pair(
            &harness,
            &[
                (columns::TAKEN_DATE, taken.as_str()),
                (columns::PROCESS_STATUS, "Completed"),
                (columns::PROCESSED_DATE, taken.as_str()),
            ],
        )
        .await;

        let repairs = harness
            .engine
            .handle_on_child_interval(ASSIGNEE, child_row)
            .await
            .expect("repair");

        assert!(repairs.contains(&"estimated_time_finished"));
        assert!(repairs.contains(&"feedback_status"));
        assert_eq!(harness.notifier.count_kind(NotificationKind::Processed), 1);

        // Second pass finds nothing left to fix.
        let second = harness
            .engine
            .handle_on_child_interval(ASSIGNEE, child_row)
            .await
            .expect("repair");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn child_repair_finishes_a_stuck_send_back() {
        let harness = TestHarness::new();
        let (master_row, child_row) =
            allocated_pair(&harness, &[(columns::PROCESS_STATUS, "Send Back")]).await;

        let repairs = harness
            .engine
            .handle_on_child_interval(ASSIGNEE, child_row)
            .await
            .expect("repair");
        assert_eq!(repairs, vec!["send_back_completed"]);
        assert_eq!(harness.rows.row_count(ASSIGNEE).await.expect("count"), 0);

        let master = harness
            .rows
            .read_row("BOM", master_row)
            .await
            .expect("read")
            .expect("row");
        assert_eq!(
            RequestRecord::from_row(&master).levels[0].status,
            "Need Review"
        );
    }
}
