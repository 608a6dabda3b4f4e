use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Level 0 is the requester; levels 1..3 are approver tiers.
pub const LEVEL_COUNT: usize = 4;

/// Sentinel roster entry meaning "this level has nobody to ask"; the sync
/// auto-approves it instead of waiting forever.
pub const NO_APPROVER: &str = "NO_APPROVER";

/// One approval level as read off a request row. `status` is the raw cell
/// text; the typed accessors live on `RequestRecord` because the enumerated
/// set differs between level 0 and levels 1..3.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub status: String,
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ApprovalLevel {
    pub fn is_blank(&self) -> bool {
        self.status.is_empty() && self.name.is_empty()
    }

    pub fn is_auto_approved(&self) -> bool {
        self.name == NO_APPROVER
    }
}

/// What a single level looks like from the external attachment, before the
/// engine has ingested it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalLevelCells {
    pub status: String,
    pub name: String,
    pub notes: String,
}

impl ExternalLevelCells {
    pub fn blank() -> Self {
        Self { status: String::new(), name: String::new(), notes: String::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalLevel, NO_APPROVER};

    #[test]
    fn blank_level_has_no_status_and_no_name() {
        let level = ApprovalLevel::default();
        assert!(level.is_blank());

        let taken = ApprovalLevel { status: "Approved".into(), ..ApprovalLevel::default() };
        assert!(!taken.is_blank());
    }

    #[test]
    fn auto_approved_levels_carry_the_sentinel_name() {
        let level = ApprovalLevel {
            status: "Approved".into(),
            name: NO_APPROVER.into(),
            timestamp: None,
        };
        assert!(level.is_auto_approved());
    }
}
