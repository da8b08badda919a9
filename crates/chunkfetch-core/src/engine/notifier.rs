//! User-facing notifications for finished downloads

use std::sync::Arc;
use tracing::{debug, info};

/// Body of the notification sent when a download completes
pub const COMPLETE_BODY: &str = "download complete";

/// Body of the notification sent when a download fails
pub const FAILED_BODY: &str = "download failed";

/// Sink for completion and failure notifications
pub trait Notifier: Send + Sync {
    /// Negotiate permission to notify; called once when the manager is built
    fn request_permission(&self) -> bool {
        true
    }

    fn notify(&self, title: &str, body: &str);
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("{}: {}", title, body);
    }
}

/// A notifier together with the outcome of its permission request
#[derive(Clone)]
pub(crate) struct Notifications {
    notifier: Arc<dyn Notifier>,
    allowed: bool,
}

impl Notifications {
    pub(crate) fn negotiate(notifier: Arc<dyn Notifier>) -> Self {
        let allowed = notifier.request_permission();
        if !allowed {
            info!("Notification permission denied, notifications disabled");
        }
        Self { notifier, allowed }
    }

    #[cfg(test)]
    pub(crate) fn allowed(&self) -> bool {
        self.allowed
    }

    pub(crate) fn completed(&self, title: &str) {
        self.send(title, COMPLETE_BODY);
    }

    pub(crate) fn failed(&self, title: &str) {
        self.send(title, FAILED_BODY);
    }

    fn send(&self, title: &str, body: &str) {
        if !self.allowed {
            debug!("Skipping notification for {}: {}", title, body);
            return;
        }
        self.notifier.notify(title, body);
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::Notifier;
    use parking_lot::Mutex;

    /// Notifier that remembers everything it was asked to show
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) permitted: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        pub(crate) fn permitted() -> Self {
            Self {
                permitted: true,
                sent: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn request_permission(&self) -> bool {
            self.permitted
        }

        fn notify(&self, title: &str, body: &str) {
            self.sent.lock().push((title.to_string(), body.to_string()));
        }
    }
}
