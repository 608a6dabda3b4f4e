//! Per-level reconciliation between external attachment cells and the
//! internal request row.
//!
//! Each sweep walks the levels strictly in ascending order and stops at the
//! first one that is pending, invalid, or rejecting. The internal row is
//! authoritative once it carries a status for a level; the attachment only
//! feeds levels the row has not ingested yet. Re-running the sync on a stable
//! row is a no-op.

use tracing::warn;

use crate::attachment::{status_cell, AttachmentStore};
use crate::config_cache::ConfigCache;
use crate::domain::approval::LEVEL_COUNT;
use crate::domain::request::{
    columns, ApproverStatus, AttachmentRef, RequestRecord, RequesterStatus,
};
use crate::errors::ApplicationError;

/// Outcome of reconciling one approval level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LevelOutcome {
    /// The internal row already carries this level; nothing to ingest.
    Exists,
    /// Nobody has acted yet. `is_approver` distinguishes a level that is
    /// waiting on a configured roster from one the requester still owns.
    Pending { is_approver: bool },
    /// External cells were inconsistent; the status cell has been cleared.
    Invalid,
    /// No approver is configured for this level; the engine synthesizes an
    /// approval under the sentinel name.
    AutoApproved,
    /// A clean external action, ready for ingestion by the FSM.
    Actioned { status: String, name: String, notes: String },
}

pub struct ApprovalSync<'a> {
    attachments: &'a dyn AttachmentStore,
    rules: &'a ConfigCache,
}

impl<'a> ApprovalSync<'a> {
    pub fn new(attachments: &'a dyn AttachmentStore, rules: &'a ConfigCache) -> Self {
        Self { attachments, rules }
    }

    /// Reconciles one level. `Ok(None)` means the table has no column for
    /// this level; the request type runs a shorter chain and the caller
    /// stops walking.
    pub async fn sync_level(
        &self,
        record: &RequestRecord,
        attachment: &AttachmentRef,
        headers: &[String],
        level: usize,
    ) -> Result<Option<LevelOutcome>, ApplicationError> {
        debug_assert!(level < LEVEL_COUNT);

        if !headers.iter().any(|header| header == columns::respon(level)) {
            return Ok(None);
        }

        let is_approver = if level == 0 {
            false
        } else {
            let Some(request_type) = record.request_type else {
                return Ok(Some(LevelOutcome::Pending { is_approver: false }));
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
                return Ok(Some(LevelOutcome::AutoApproved));
            }
            true
        };

        // The internal row wins over whatever the attachment says now. The
        // `Need Review` marker is the one exception: it is a system reset,
        // not an ingested action, and the requester's next completion must
        // get through.
        let in_review = level == 0
            && RequesterStatus::parse(&record.levels[0].status)
                == Some(RequesterStatus::NeedReview);
        if !record.levels[level].is_blank() && !in_review {
            return Ok(Some(LevelOutcome::Exists));
        }

        let external = self.attachments.read_level(attachment, level).await?;
        let status = external.status.trim().to_string();
        let name = external.name.trim().to_string();

        if status.is_empty() && name.is_empty() {
            return Ok(Some(LevelOutcome::Pending { is_approver }));
        }

        if name.is_empty() || !valid_status(level, &status) {
            warn!(
                event_name = "approval_sync.invalid_cells",
                attachment = %attachment.0,
                level,
                status,
                "clearing inconsistent approval cells"
            );
            self.attachments.write_cell(attachment, &status_cell(level), "").await?;
            return Ok(Some(LevelOutcome::Invalid));
        }

        Ok(Some(LevelOutcome::Actioned { status, name, notes: external.notes }))
    }
}

/// Enumerated status set differs between the requester level and approver
/// tiers.
pub fn valid_status(level: usize, status: &str) -> bool {
    if level == 0 {
        RequesterStatus::parse(status).is_some()
    } else {
        ApproverStatus::parse(status).is_some()
    }
}
