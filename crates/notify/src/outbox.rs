use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use caseflow_core::{ApplicationError, Notification, Notifier};

use crate::message::{EmailRenderer, NotifyError, RenderedEmail};

/// Delivery seam. The SMTP implementation lives at the deployment edge; the
/// in-memory transport backs tests and dry runs.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: &RenderedEmail) -> Result<(), NotifyError>;
}

#[derive(Clone, Default)]
pub struct InMemoryMailTransport {
    delivered: Arc<Mutex<Vec<RenderedEmail>>>,
}

impl InMemoryMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<RenderedEmail> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl MailTransport for InMemoryMailTransport {
    async fn deliver(&self, email: &RenderedEmail) -> Result<(), NotifyError> {
        match self.delivered.lock() {
            Ok(mut delivered) => delivered.push(email.clone()),
            Err(poisoned) => poisoned.into_inner().push(email.clone()),
        }
        Ok(())
    }
}

/// Dry-run transport: every delivery goes to the structured log. Used until
/// a deployment wires a real SMTP relay behind [`MailTransport`].
#[derive(Clone, Default)]
pub struct LoggingMailTransport;

#[async_trait]
impl MailTransport for LoggingMailTransport {
    async fn deliver(&self, email: &RenderedEmail) -> Result<(), NotifyError> {
        info!(
            event_name = "notify.dry_run",
            subject = %email.subject,
            recipients = email.recipients.join(",").as_str(),
            "email delivery (dry run)"
        );
        Ok(())
    }
}

/// Production [`Notifier`]: render, then deliver. Recipients are filtered to
/// non-empty addresses; a notification without any is dropped silently (the
/// guard cells upstream still get stamped).
pub struct EmailNotifier {
    renderer: EmailRenderer,
    transport: Arc<dyn MailTransport>,
}

impl EmailNotifier {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { renderer: EmailRenderer::new(), transport }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), ApplicationError> {
        let mut email = self
            .renderer
            .render(notification)
            .map_err(|error| ApplicationError::Integration(error.to_string()))?;
        email.recipients.retain(|recipient| recipient.contains('@'));
        if email.recipients.is_empty() {
            return Ok(());
        }

        self.transport
            .deliver(&email)
            .await
            .map_err(|error| ApplicationError::Integration(error.to_string()))?;
        info!(
            event_name = "notify.delivered",
            kind = notification.kind.as_str(),
            fingerprint = %email.fingerprint,
            recipients = email.recipients.len(),
            "notification delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use caseflow_core::{Notification, NotificationKind, Notifier, RequestNumber};

    use super::{EmailNotifier, InMemoryMailTransport};

    #[tokio::test]
    async fn notifier_renders_and_delivers_through_the_transport() {
        let transport = InMemoryMailTransport::new();
        let notifier = EmailNotifier::new(Arc::new(transport.clone()));

        notifier
            .send(
                &Notification::new(
                    NotificationKind::Approved,
                    Some(RequestNumber("BOM/MDM/Alpha/00001".into())),
                    vec!["u@x".into(), "".into()],
                )
                .with_metadata("assignee", "anna"),
            )
            .await
            .expect("send");

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].recipients, vec!["u@x".to_string()]);
        assert!(delivered[0].subject.contains("approved"));
    }

    #[tokio::test]
    async fn notification_without_recipients_is_dropped() {
        let transport = InMemoryMailTransport::new();
        let notifier = EmailNotifier::new(Arc::new(transport.clone()));

        notifier
            .send(&Notification::new(NotificationKind::NewRequest, None, vec!["".into()]))
            .await
            .expect("send");

        assert!(transport.delivered().is_empty());
    }
}
