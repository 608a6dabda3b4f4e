//! Outbound email boundary: rendering, fingerprints, and the delivery seam.
//!
//! The engine talks to [`caseflow_core::Notifier`]; this crate provides the
//! production implementation that renders a [`RenderedEmail`] per
//! notification and hands it to a [`MailTransport`]. Actual SMTP delivery
//! lives behind the transport trait.

pub mod message;
pub mod outbox;

pub use message::{EmailRenderer, NotifyError, RenderedEmail};
pub use outbox::{EmailNotifier, InMemoryMailTransport, LoggingMailTransport, MailTransport};
