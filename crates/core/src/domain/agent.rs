use serde::{Deserialize, Serialize};

/// A worker in the allocation pool. `status` is the busy/free bit toggled by
/// the agents themselves; `workload_seconds` is maintained transactionally by
/// the workload counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub active: bool,
    pub status: AgentStatus,
    pub workload_seconds: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Free,
    Busy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Busy => "busy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "busy" => Some(Self::Busy),
            _ => None,
        }
    }
}

impl Agent {
    pub fn is_allocatable(&self) -> bool {
        self.active && self.status == AgentStatus::Free
    }
}
