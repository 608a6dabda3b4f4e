use serde::Serialize;
use sha2::{Digest, Sha256};
use tera::{Context, Tera};
use thiserror::Error;

use caseflow_core::{Notification, NotificationKind};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("template rendering failed: {0}")]
    Render(#[from] tera::Error),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: String,
    pub recipients: Vec<String>,
    /// Content hash used as the outbox identity of this send.
    pub fingerprint: String,
}

pub struct EmailRenderer {
    tera: Tera,
}

impl Default for EmailRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailRenderer {
    pub fn new() -> Self {
        let mut tera = Tera::default();
        // Embedded fallback template; a deployment can override it on disk.
        if let Err(error) =
            tera.add_raw_template("email.html", include_str!("../templates/email.html"))
        {
            tracing::warn!(error = %error, "embedded email template failed to load");
        }
        Self { tera }
    }

    pub fn render(&self, notification: &Notification) -> Result<RenderedEmail, NotifyError> {
        let number = notification.request_number.as_ref().map(|number| number.0.as_str());

        let (title, message) = copy_for(notification.kind, number);
        let subject = match number {
            Some(number) => format!("[MDM] {title}: {number}"),
            None => format!("[MDM] {title}"),
        };

        let detail_rows: Vec<(String, String)> = notification
            .metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut context = Context::new();
        context.insert("title", &title);
        context.insert("message", &message);
        context.insert("request_number", &number);
        context.insert("reason", &notification.reason);
        context.insert("detail_rows", &detail_rows);

        let html_body = self.tera.render("email.html", &context)?;

        Ok(RenderedEmail {
            subject,
            html_body,
            recipients: notification.recipients.clone(),
            fingerprint: fingerprint(notification),
        })
    }
}

fn copy_for(kind: NotificationKind, number: Option<&str>) -> (String, String) {
    let number = number.unwrap_or("your request");
    match kind {
        NotificationKind::NewRequest => (
            "Request received".to_string(),
            format!("{number} has been registered and is awaiting completion of its attachment."),
        ),
        NotificationKind::AskApproval => (
            "Approval needed".to_string(),
            format!("{number} is waiting for your approval."),
        ),
        NotificationKind::Approved => (
            "Request approved".to_string(),
            format!("{number} has been approved and assigned for processing."),
        ),
        NotificationKind::Rejected => (
            "Request rejected".to_string(),
            format!("{number} was rejected by an approver."),
        ),
        NotificationKind::SendBack => (
            "Request sent back".to_string(),
            format!("{number} was sent back and needs your review."),
        ),
        NotificationKind::Expired => (
            "Request expired".to_string(),
            format!("{number} expired without approval activity."),
        ),
        NotificationKind::Invalid => (
            "Approval entry invalid".to_string(),
            format!("An approval entry on {number} was invalid and has been cleared."),
        ),
        NotificationKind::Processed => (
            "Request processed".to_string(),
            format!("{number} has been processed."),
        ),
        NotificationKind::MissingTasks => (
            "No tasks found".to_string(),
            format!("{number} was approved but its attachment contains no task rows."),
        ),
    }
}

fn fingerprint(notification: &Notification) -> String {
    let mut hasher = Sha256::new();
    hasher.update(notification.kind.as_str().as_bytes());
    if let Some(number) = &notification.request_number {
        hasher.update(number.0.as_bytes());
    }
    for recipient in &notification.recipients {
        hasher.update(recipient.as_bytes());
    }
    if let Some(reason) = &notification.reason {
        hasher.update(reason.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
