//! Terminal notifications for finished downloads

use chunkfetch_core::{Notifier, COMPLETE_BODY};
use console::{style, Term};
use indicatif::MultiProgress;

/// Prints notifications above the progress bars
pub struct ConsoleNotifier {
    multi: MultiProgress,
    quiet: bool,
}

impl ConsoleNotifier {
    /// `quiet` declines permission, e.g. for machine-readable output
    pub fn new(multi: MultiProgress, quiet: bool) -> Self {
        Self { multi, quiet }
    }
}

impl Notifier for ConsoleNotifier {
    fn request_permission(&self) -> bool {
        !self.quiet && Term::stdout().is_term()
    }

    fn notify(&self, title: &str, body: &str) {
        let icon = if body == COMPLETE_BODY {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        };
        let line = format!("{} {}: {}", icon, style(title).cyan(), body);
        if self.multi.println(&line).is_err() {
            eprintln!("{}", line);
        }
    }
}
