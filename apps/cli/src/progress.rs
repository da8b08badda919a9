//! Progress bar utilities for CLI downloads

use chunkfetch_types::{CoreEvent, DownloadId, DownloadState};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<DownloadId, ProgressBar>>,
}

impl DownloadProgress {
    /// Bars are drawn only when `visible`
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn multi(&self) -> MultiProgress {
        self.multi.clone()
    }

    /// Create a progress bar for a download
    pub fn add_download(&self, id: &str, name: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:20!} {prefix:.dim} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_message(name.to_string());

        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(id.to_string(), pb.clone());
        }
        pb
    }

    fn bar(&self, id: &str) -> Option<ProgressBar> {
        self.bars.lock().ok().and_then(|bars| bars.get(id).cloned())
    }

    /// Set the length once the size is known
    pub fn set_total(&self, id: &str, total: u64) {
        if let Some(pb) = self.bar(id) {
            pb.set_length(total);
        }
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &CoreEvent) {
        let Some(pb) = self.bar(event.id()) else {
            return;
        };

        match event {
            CoreEvent::Progress(progress) => {
                pb.set_position(progress.downloaded);
            }

            CoreEvent::Queued { .. } => {
                pb.set_prefix("queued");
                pb.tick();
            }

            CoreEvent::StateChanged { state, error, .. } => match state {
                DownloadState::Completed => {
                    pb.finish_with_message(format!("{} done", style("✓").green().bold()));
                }
                DownloadState::Failed => {
                    pb.abandon_with_message(format!(
                        "{} {}",
                        style("✗").red().bold(),
                        error.as_deref().unwrap_or("failed")
                    ));
                }
                DownloadState::Paused => {
                    pb.set_message(format!("{} paused", style("⏸").yellow()));
                }
                DownloadState::Cancelled => {
                    pb.abandon_with_message(format!("{} cancelled", style("○").dim()));
                }
                DownloadState::Active => pb.set_prefix(""),
                DownloadState::Planning => {}
            },

            CoreEvent::Completed { size, .. } => {
                pb.set_length(*size);
                pb.set_position(*size);
            }

            CoreEvent::Failed { .. } | CoreEvent::Removed { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkfetch_types::ProgressEvent;

    #[test]
    fn test_events_drive_bar() {
        let progress = DownloadProgress::new(false);
        let pb = progress.add_download("a", "file.bin");

        progress.set_total("a", 100);
        progress.handle_event(&CoreEvent::Progress(ProgressEvent {
            id: "a".into(),
            progress: 40.0,
            speed: 10.0,
            downloaded: 40,
        }));
        assert_eq!(pb.position(), 40);
        assert_eq!(pb.length(), Some(100));

        progress.handle_event(&CoreEvent::StateChanged {
            id: "a".into(),
            state: DownloadState::Completed,
            error: None,
        });
        assert!(pb.is_finished());

        // Unknown ids are ignored
        progress.handle_event(&CoreEvent::Removed { id: "zzz".into() });
    }
}
