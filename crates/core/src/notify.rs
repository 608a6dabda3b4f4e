//! Outbound notification port. Delivery is at-least-once; every state
//! transition that triggers a send is guarded by a row cell so re-running a
//! sweep never duplicates an email.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::request::RequestNumber;
use crate::errors::ApplicationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewRequest,
    AskApproval,
    Approved,
    Rejected,
    SendBack,
    Expired,
    Invalid,
    Processed,
    MissingTasks,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewRequest => "new_request",
            Self::AskApproval => "ask_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::SendBack => "send_back",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
            Self::Processed => "processed",
            Self::MissingTasks => "missing_tasks",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub request_number: Option<RequestNumber>,
    pub recipients: Vec<String>,
    pub reason: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        request_number: Option<RequestNumber>,
        recipients: Vec<String>,
    ) -> Self {
        Self { kind, request_number, recipients, reason: None, metadata: BTreeMap::new() }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), ApplicationError>;
}

/// Bounded retry around a send. Exhaustion is logged and swallowed: the
/// caller stamps its guard cell regardless so the sweep does not loop on a
/// dead channel.
pub async fn send_with_retries(
    notifier: &dyn Notifier,
    notification: &Notification,
    attempts: u32,
) -> bool {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match notifier.send(notification).await {
            Ok(()) => return true,
            Err(error) if attempt == attempts => {
                warn!(
                    event_name = "notify.exhausted",
                    kind = notification.kind.as_str(),
                    attempts,
                    error = %error,
                    "notification failed after final retry, continuing"
                );
                return false;
            }
            Err(error) => {
                warn!(
                    event_name = "notify.retry",
                    kind = notification.kind.as_str(),
                    attempt,
                    error = %error,
                    "notification attempt failed, retrying"
                );
            }
        }
    }
    false
}

/// Recording notifier for tests; optionally fails the first N sends.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failures_remaining: Arc<Mutex<u32>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        let notifier = Self::default();
        if let Ok(mut remaining) = notifier.failures_remaining.lock() {
            *remaining = failures;
        }
        notifier
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_kind(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|notification| notification.kind == kind).count()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), ApplicationError> {
        {
            let mut remaining = match self.failures_remaining.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ApplicationError::Integration("simulated channel failure".into()));
            }
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
        Ok(())
    }
}
