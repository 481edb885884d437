//! Fire-and-forget logging facade over a [`Notifier`].

use crate::notifier::Notifier;

/// Detached delivery: `log` hands the message to the notifier and returns
/// immediately. Failures are traced, never surfaced.
#[derive(Clone)]
pub struct NotifyLogger {
    notifier: Notifier,
}

impl NotifyLogger {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }

    /// Deliver `message` in the background. Duplicate and throttled
    /// messages get the notifier's usual coalescing and deferral.
    pub fn log(&self, message: impl Into<String>) {
        let notifier = self.notifier.clone();
        let message = message.into();
        tokio::spawn(async move {
            if let Err(err) = notifier.send(&message).await {
                tracing::warn!(target: "notigram", error = %err, "notification delivery failed");
            }
        });
    }
}
