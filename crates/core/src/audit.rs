use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::RequestNumber;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Ingress,
    Approval,
    Allocation,
    Execution,
    SendBack,
    System,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

/// Who initiated a send-back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendBackActor {
    System,
    Approver,
    Mdm,
}

impl SendBackActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Approver => "APPROVER",
            Self::Mdm => "MDM",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub request_number: Option<RequestNumber>,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(
        request_number: Option<RequestNumber>,
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            request_number,
            correlation_id: correlation_id.into(),
            actor: actor.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub request_number: Option<RequestNumber>,
    pub correlation_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        request_number: Option<RequestNumber>,
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            request_number,
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The send-back ledger entry: who rewound the request and why.
    pub fn send_back(
        request_number: Option<RequestNumber>,
        correlation_id: impl Into<String>,
        actor: SendBackActor,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            request_number,
            correlation_id,
            "request.sent_back",
            AuditCategory::SendBack,
            actor.as_str(),
            AuditOutcome::Success,
        )
        .with_metadata("reason", reason)
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_send_backs(&self, request_number: &RequestNumber) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                event.category == AuditCategory::SendBack
                    && event.request_number.as_ref() == Some(request_number)
            })
            .count()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::{
        AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, SendBackActor,
    };
    use crate::domain::request::RequestNumber;

    #[test]
    fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryAuditSink::default();
        sink.emit(
            AuditEvent::new(
                Some(RequestNumber("BOM/MDM/Alpha/00042".to_owned())),
                "req-123",
                "request.submitted",
                AuditCategory::Ingress,
                "http-ingress",
                AuditOutcome::Success,
            )
            .with_metadata("request_type", "BOM Create"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "req-123");
        assert!(events[0].metadata.contains_key("request_type"));
    }

    #[test]
    fn send_back_entries_carry_actor_and_reason() {
        let sink = InMemoryAuditSink::default();
        let number = RequestNumber("BOM/MDM/Alpha/00042".to_owned());
        sink.emit(AuditEvent::send_back(
            Some(number.clone()),
            "sweep-7",
            SendBackActor::Approver,
            "please fix X",
        ));

        let events = sink.events();
        assert_eq!(events[0].actor, "APPROVER");
        assert_eq!(events[0].metadata.get("reason").map(String::as_str), Some("please fix X"));
        assert_eq!(sink.count_send_backs(&number), 1);
    }
}
