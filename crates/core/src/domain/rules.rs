//! Configuration relations consulted through the rule cache: approver
//! rosters, SLA baselines, work-allocation fallbacks, the distribution
//! matrix, and priority weights.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::request::RequestType;

/// Wildcard accepted in any key field of a rule row.
pub const ALL: &str = "ALL";

/// Roster row: who approves at `level` for a given unit/department/type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverRule {
    pub business_unit: String,
    pub department: String,
    pub request_type: String,
    pub level: u8,
    pub approvers: Vec<String>,
}

impl ApproverRule {
    pub fn matches(&self, business_unit: &str, department: &str, request_type: &str, level: u8) -> bool {
        self.level == level
            && self.business_unit == business_unit
            && self.department == department
            && self.request_type == request_type
    }
}

/// `n-m` or `n+` task-count band of a baseline rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRange {
    Bounded { min: u32, max: u32 },
    OpenEnded { min: u32 },
}

impl TaskRange {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(min) = value.strip_suffix('+') {
            return Some(Self::OpenEnded { min: min.trim().parse().ok()? });
        }
        let (min, max) = value.split_once('-')?;
        let min: u32 = min.trim().parse().ok()?;
        let max: u32 = max.trim().parse().ok()?;
        (min <= max).then_some(Self::Bounded { min, max })
    }

    pub fn contains(&self, total_task: u32) -> bool {
        match self {
            Self::Bounded { min, max } => (*min..=*max).contains(&total_task),
            Self::OpenEnded { min } => total_task >= *min,
        }
    }
}

impl std::fmt::Display for TaskRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounded { min, max } => write!(f, "{min}-{max}"),
            Self::OpenEnded { min } => write!(f, "{min}+"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineRule {
    pub request_type: RequestType,
    pub range: TaskRange,
    pub seconds: i64,
    pub per_task: bool,
}

/// Resolved baseline for a concrete `(type, total_task)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BaselineHit {
    pub seconds: i64,
    pub per_task: bool,
}

impl BaselineHit {
    /// Estimated time is per-task times count, or flat.
    pub fn estimated_time(&self, total_task: u32) -> i64 {
        if self.per_task {
            self.seconds * i64::from(total_task)
        } else {
            self.seconds
        }
    }
}

/// BAU fallback row. Each group is a comma-separated candidate pool tried in
/// order: primary group first, then backups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRule {
    pub business_unit: String,
    pub request_type: String,
    pub department: String,
    pub groups: Vec<String>,
}

impl AllocationRule {
    pub fn candidate_groups(&self) -> Vec<Vec<String>> {
        self.groups
            .iter()
            .map(|group| {
                group
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .filter(|group: &Vec<String>| !group.is_empty())
            .collect()
    }
}

/// `RequestType → {eligible agents}` permission map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMatrix {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl DistributionMatrix {
    pub fn new(entries: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self { entries }
    }

    pub fn eligible(&self, request_type: RequestType) -> Option<&BTreeSet<String>> {
        self.entries.get(request_type.as_str()).filter(|agents| !agents.is_empty())
    }

    pub fn insert(&mut self, request_type: RequestType, agents: impl IntoIterator<Item = String>) {
        self.entries.insert(request_type.as_str().to_string(), agents.into_iter().collect());
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeight {
    pub request_type: String,
    pub weight: u8,
}

#[cfg(test)]
mod tests {
    use super::{AllocationRule, BaselineHit, DistributionMatrix, TaskRange};
    use crate::domain::request::RequestType;

    #[test]
    fn task_range_parses_bounded_and_open_ended_specs() {
        assert_eq!(TaskRange::parse("5-10"), Some(TaskRange::Bounded { min: 5, max: 10 }));
        assert_eq!(TaskRange::parse("11+"), Some(TaskRange::OpenEnded { min: 11 }));
        assert_eq!(TaskRange::parse("10-5"), None);
        assert_eq!(TaskRange::parse("banana"), None);
    }

    #[test]
    fn task_range_bounds_are_inclusive() {
        let range = TaskRange::Bounded { min: 5, max: 10 };
        assert!(range.contains(5));
        assert!(range.contains(10));
        assert!(!range.contains(4));
        assert!(!range.contains(11));

        let open = TaskRange::OpenEnded { min: 11 };
        assert!(open.contains(11));
        assert!(open.contains(5000));
        assert!(!open.contains(10));
    }

    #[test]
    fn per_task_baseline_scales_with_total_task() {
        let hit = BaselineHit { seconds: 120, per_task: true };
        assert_eq!(hit.estimated_time(10), 1200);

        let flat = BaselineHit { seconds: 3600, per_task: false };
        assert_eq!(flat.estimated_time(10), 3600);
    }

    #[test]
    fn allocation_rule_splits_comma_separated_groups() {
        let rule = AllocationRule {
            business_unit: "ALL".into(),
            request_type: "BOM Create".into(),
            department: "ALL".into(),
            groups: vec!["anna, budi".into(), "citra".into(), " ".into()],
        };

        assert_eq!(
            rule.candidate_groups(),
            vec![vec!["anna".to_string(), "budi".to_string()], vec!["citra".to_string()]]
        );
    }

    #[test]
    fn matrix_lookup_ignores_empty_rosters() {
        let mut matrix = DistributionMatrix::default();
        matrix.insert(RequestType::BomCreate, ["anna".to_string()]);
        matrix.insert(RequestType::PricingCreate, []);

        assert!(matrix.eligible(RequestType::BomCreate).is_some());
        assert!(matrix.eligible(RequestType::PricingCreate).is_none());
        assert!(matrix.eligible(RequestType::VendorCreate).is_none());
    }
}
