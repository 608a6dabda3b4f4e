//! Sweep planning: which rows a periodic pass must touch, in which order,
//! and for how long.
//!
//! The predicates are pure so the sweeps stay idempotent: a row that needs
//! nothing is skipped, and a sweep cut short by its time budget loses no
//! progress because the next tick recomputes the same plan.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::domain::approval::LEVEL_COUNT;
use crate::domain::request::{
    columns, ApproverStatus, RequestNumber, RequestRecord, RequesterStatus,
};

/// A row needs advancement when its identity is established and some level of
/// the chain is still open.
pub fn needs_advancement(record: &RequestRecord, headers: &[String]) -> bool {
    if record.request_number.is_none() || record.attachment.is_none() {
        return false;
    }

    match record.requester_status() {
        None | Some(RequesterStatus::NeedReview) => return true,
        Some(RequesterStatus::Expired) | Some(RequesterStatus::Invalid) => return false,
        Some(RequesterStatus::Completed) => {}
    }

    for level in 1..LEVEL_COUNT {
        if !headers.iter().any(|header| header == columns::respon(level)) {
            break;
        }
        match record.approver_status(level) {
            None if record.levels[level].status.is_empty() => return true,
            Some(ApproverStatus::Rejected) => return false,
            _ => {}
        }
    }

    false
}

/// Submission never completed: the row has a timestamp but is still missing
/// its number or attachment past the resubmit window.
pub fn needs_resubmission(
    record: &RequestRecord,
    now: DateTime<Utc>,
    resubmit_timeout_mins: i64,
) -> bool {
    let Some(timestamp) = record.timestamp else {
        return false;
    };
    if (now - timestamp).num_minutes() < resubmit_timeout_mins {
        return false;
    }
    record.request_number.is_none() || record.attachment.is_none()
}

/// More send-backs recorded than emails delivered.
pub fn needs_send_back_email_retry(record: &RequestRecord) -> bool {
    record.sent_back_count > record.sent_back_emails
}

/// Rows needing advancement, highest row index first so deletions and
/// appends during the sweep cannot shift rows still in the plan.
pub fn plan_sweep(
    rows: &[(u32, RequestRecord)],
    headers: &[String],
) -> Vec<(u32, RequestNumber)> {
    let mut plan: Vec<(u32, RequestNumber)> = rows
        .iter()
        .filter(|(_, record)| needs_advancement(record, headers))
        .filter_map(|(row_id, record)| {
            record.request_number.clone().map(|number| (*row_id, number))
        })
        .collect();
    plan.sort_by(|a, b| b.0.cmp(&a.0));
    plan
}

/// Cooperative per-sweep time budget. When exceeded the sweep stops and the
/// next tick resumes.
pub struct SweepBudget {
    started: Instant,
    budget: Duration,
}

impl SweepBudget {
    pub fn new(budget: Duration) -> Self {
        Self { started: Instant::now(), budget }
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{needs_advancement, needs_resubmission, needs_send_back_email_retry, plan_sweep};
    use crate::domain::request::{columns, RequestRecord, RowValues};

    fn record(cells: &[(&str, &str)]) -> RequestRecord {
        let values: RowValues =
            cells.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RequestRecord::from_row(&values)
    }

    fn full_headers() -> Vec<String> {
        let mut headers = vec![
            columns::REQUEST_NUMBER.to_string(),
            columns::ATTACHMENT.to_string(),
        ];
        for level in 0..4 {
            headers.push(columns::respon(level).to_string());
        }
        headers
    }

    fn submitted(extra: &[(&str, &str)]) -> RequestRecord {
        let mut cells = vec![
            (columns::REQUEST_NUMBER, "BOM/MDM/Alpha/00001"),
            (columns::ATTACHMENT, "att-1"),
        ];
        cells.extend_from_slice(extra);
        record(&cells)
    }

    #[test]
    fn rows_without_identity_are_never_advanced() {
        let headers = full_headers();
        assert!(!needs_advancement(&record(&[]), &headers));
        assert!(!needs_advancement(
            &record(&[(columns::REQUEST_NUMBER, "BOM/MDM/Alpha/00001")]),
            &headers
        ));
    }

    #[test]
    fn fresh_and_need_review_rows_are_advanced() {
        let headers = full_headers();
        assert!(needs_advancement(&submitted(&[]), &headers));
        assert!(needs_advancement(
            &submitted(&[(columns::respon(0), "Need Review")]),
            &headers
        ));
    }

    #[test]
    fn open_approver_levels_keep_the_row_in_the_plan() {
        let headers = full_headers();
        let mid_chain = submitted(&[
            (columns::respon(0), "Completed"),
            (columns::respon(1), "Approved"),
        ]);
        assert!(needs_advancement(&mid_chain, &headers));
    }

    #[test]
    fn rejected_expired_and_invalid_rows_drop_out() {
        let headers = full_headers();
        assert!(!needs_advancement(
            &submitted(&[
                (columns::respon(0), "Completed"),
                (columns::respon(1), "Rejected"),
            ]),
            &headers
        ));
        assert!(!needs_advancement(&submitted(&[(columns::respon(0), "Expired")]), &headers));
        assert!(!needs_advancement(&submitted(&[(columns::respon(0), "Invalid")]), &headers));
    }

    #[test]
    fn fully_approved_chain_needs_no_advancement() {
        let headers = full_headers();
        let done = submitted(&[
            (columns::respon(0), "Completed"),
            (columns::respon(1), "Approved"),
            (columns::respon(2), "Approved"),
            (columns::respon(3), "Approved"),
        ]);
        assert!(!needs_advancement(&done, &headers));
    }

    #[test]
    fn resubmission_requires_age_and_a_missing_piece() {
        let now = Utc::now();
        let stale = (now - Duration::minutes(11)).to_rfc3339();
        let fresh = (now - Duration::minutes(2)).to_rfc3339();

        let incomplete_old = record(&[(columns::TIMESTAMP, stale.as_str())]);
        assert!(needs_resubmission(&incomplete_old, now, 10));

        let incomplete_fresh = record(&[(columns::TIMESTAMP, fresh.as_str())]);
        assert!(!needs_resubmission(&incomplete_fresh, now, 10));

        let complete = record(&[
            (columns::TIMESTAMP, stale.as_str()),
            (columns::REQUEST_NUMBER, "BOM/MDM/Alpha/00001"),
            (columns::ATTACHMENT, "att-1"),
        ]);
        assert!(!needs_resubmission(&complete, now, 10));
    }

    #[test]
    fn send_back_email_retry_compares_counts() {
        assert!(needs_send_back_email_retry(&record(&[
            (columns::SENT_BACK_COUNT, "2"),
            (columns::SENT_BACK_EMAIL_STATUS, "1"),
        ])));
        assert!(!needs_send_back_email_retry(&record(&[
            (columns::SENT_BACK_COUNT, "2"),
            (columns::SENT_BACK_EMAIL_STATUS, "2"),
        ])));
    }

    #[test]
    fn sweep_plan_runs_in_descending_row_order() {
        let headers = full_headers();
        let rows = vec![
            (0, submitted(&[])),
            (1, record(&[])),
            (2, submitted(&[])),
        ];

        let plan = plan_sweep(&rows, &headers);
        let ids: Vec<u32> = plan.iter().map(|(row_id, _)| *row_id).collect();
        assert_eq!(ids, vec![2, 0]);
    }
}
