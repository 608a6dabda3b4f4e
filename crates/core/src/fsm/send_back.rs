//! The send-back rewind: clears the approval chain, resets the requester to
//! Need Review, releases the attachment, and records who asked for the
//! rewind and why.

use tracing::info;

use crate::attachment::AttachmentStore;
use crate::audit::{AuditEvent, AuditSink, SendBackActor};
use crate::domain::request::{columns, RequestRecord, RequesterStatus};
use crate::errors::ApplicationError;
use crate::fsm::RequestEngine;
use crate::notify::{send_with_retries, Notification, NotificationKind};
use crate::rowstore::RowStore;

impl RequestEngine {
    /// Rewinds a master row. Caller holds the row lock.
    pub(crate) async fn send_back(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
        actor: SendBackActor,
        reason: &str,
    ) -> Result<(), ApplicationError> {
        // Everything after the submission anchor is the approval chain;
        // wipe it in one range write.
        let headers = self.rows.headers(table_name).await?;
        let anchor = headers.iter().position(|header| header == columns::CLEAR_ANCHOR);
        if let Some(anchor) = anchor {
            if let Some(first_chain_column) = headers.get(anchor + 1) {
                self.rows
                    .clear_range(table_name, row_id, first_chain_column, None)
                    .await?;
            }
        }

        self.rows
            .set_cells(
                table_name,
                row_id,
                &[
                    (
                        columns::respon(0).to_string(),
                        RequesterStatus::NeedReview.as_str().to_string(),
                    ),
                    (
                        columns::SENT_BACK_COUNT.to_string(),
                        (record.sent_back_count + 1).to_string(),
                    ),
                ],
            )
            .await?;

        if let Some(attachment) = &record.attachment {
            self.attachments.set_protected(attachment, false).await?;
            self.attachments.clear_approval_cells(attachment).await?;
        }

        let correlation = record
            .request_number
            .as_ref()
            .map(|number| number.0.clone())
            .unwrap_or_else(|| format!("row:{table_name}:{row_id}"));
        self.audit.emit(AuditEvent::send_back(
            record.request_number.clone(),
            correlation,
            actor,
            reason,
        ));
        info!(
            event_name = "fsm.sent_back",
            request_number = %record
                .request_number
                .as_ref()
                .map(|number| number.0.as_str())
                .unwrap_or("unknown"),
            actor = actor.as_str(),
            reason,
            "request rewound to Need Review"
        );

        let notification = Notification::new(
            NotificationKind::SendBack,
            record.request_number.clone(),
            vec![record.requester_email.clone()],
        )
        .with_reason(reason)
        .with_metadata("actor", actor.as_str());
        let delivered = send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;
        if delivered {
            self.rows
                .set_cell(
                    table_name,
                    row_id,
                    columns::SENT_BACK_EMAIL_STATUS,
                    &(record.sent_back_emails + 1).to_string(),
                )
                .await?;
        }

        Ok(())
    }

    /// Re-sends the send-back email for a row whose event count is ahead of
    /// its delivered count. Used by the retry sweep.
    pub async fn retry_send_back_email(
        &self,
        table_name: &str,
        row_id: u32,
        record: &RequestRecord,
    ) -> Result<bool, ApplicationError> {
        if record.sent_back_count <= record.sent_back_emails {
            return Ok(false);
        }

        let notification = Notification::new(
            NotificationKind::SendBack,
            record.request_number.clone(),
            vec![record.requester_email.clone()],
        )
        .with_metadata("retry", "true");
        let delivered = send_with_retries(
            self.notifier.as_ref(),
            &notification,
            self.config.notification_attempts,
        )
        .await;
        if delivered {
            self.rows
                .set_cell(
                    table_name,
                    row_id,
                    columns::SENT_BACK_EMAIL_STATUS,
                    &record.sent_back_count.to_string(),
                )
                .await?;
        }
        Ok(delivered)
    }
}
