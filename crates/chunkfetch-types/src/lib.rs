//! Shared types for chunkfetch
//!
//! This crate contains the data structures exchanged between the
//! download engine and whatever program embeds it (the CLI included).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a download, supplied by the caller
pub type DownloadId = String;

// ============================================================================
// Download Types
// ============================================================================

/// Description of a file to download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: DownloadId,
    pub source_url: String,
    /// Size announced by the caller (0 if unknown); the size probe result wins when they disagree
    pub declared_size: u64,
    /// Display name, used as the notification title
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl DownloadInfo {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>, declared_size: u64) -> Self {
        let source_url = source_url.into();
        let name = source_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
            .to_string();

        Self {
            id: id.into(),
            source_url,
            declared_size,
            name,
            version: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Inclusive byte interval `[start, end]` of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a range; `start` must not exceed `end`
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "byte range start {} past end {}", start, end);
        Self { start, end }
    }

    /// Range starting at `start` covering `len` bytes (`len` > 0)
    pub fn from_len(start: u64, len: u64) -> Self {
        Self::new(start, start + len - 1)
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range always covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for an HTTP `Range` request header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// State of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Planning,
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadState {
    /// Whether the task reached an end state of its current run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Cancelled | DownloadState::Failed
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::Planning => "planning",
            DownloadState::Active => "active",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Cancelled => "cancelled",
            DownloadState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub name: String,
    pub version: Option<String>,
    pub state: DownloadState,
    pub downloaded: u64,
    pub total: u64,
    /// Effective speed limit in bytes per second (0 = unlimited)
    pub speed_limit: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DownloadSnapshot {
    pub fn progress(&self) -> f64 {
        percent(self.downloaded, self.total)
    }
}

/// Percentage of `total` covered by `done`, clamped to `[0, 100]`
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}

// ============================================================================
// Event Types
// ============================================================================

/// Progress notification for a single download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: DownloadId,
    /// Percentage in `[0, 100]`
    pub progress: f64,
    /// Average bytes per second since the transfer started
    pub speed: f64,
    pub downloaded: u64,
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Progress(ProgressEvent),
    StateChanged {
        id: DownloadId,
        state: DownloadState,
        error: Option<String>,
    },
    /// Registered but waiting for a free slot
    Queued {
        id: DownloadId,
    },
    Completed {
        id: DownloadId,
        size: u64,
    },
    Failed {
        id: DownloadId,
        error: String,
    },
    Removed {
        id: DownloadId,
    },
}

impl CoreEvent {
    /// Id of the download the event belongs to
    pub fn id(&self) -> &str {
        match self {
            CoreEvent::Progress(p) => &p.id,
            CoreEvent::StateChanged { id, .. }
            | CoreEvent::Queued { id }
            | CoreEvent::Completed { id, .. }
            | CoreEvent::Failed { id, .. }
            | CoreEvent::Removed { id } => id,
        }
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per planned range
    pub chunk_size: u64,
    /// Ceiling on simultaneously active downloads
    pub max_concurrent: usize,
    /// Default per-download speed limit in bytes per second (0 = unlimited)
    pub speed_limit: u64,
    /// Minimum spacing between progress events of one download
    pub progress_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

/// 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent: 3,
            speed_limit: 0,
            progress_interval_ms: 1000,
            connect_timeout_secs: 30,
            request_timeout_secs: 120,
            user_agent: format!("chunkfetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_name_from_url() {
        let info = DownloadInfo::new("a", "https://example.com/files/tool-1.2.zip", 10);
        assert_eq!(info.name, "tool-1.2.zip");

        let info = DownloadInfo::new("b", "https://example.com/", 10).with_name("Tool");
        assert_eq!(info.name, "Tool");
    }

    #[test]
    fn test_byte_range_header() {
        let range = ByteRange::new(1_048_576, 2_097_151);
        assert_eq!(range.len(), 1_048_576);
        assert_eq!(range.header_value(), "bytes=1048576-2097151");
        assert_eq!(ByteRange::from_len(10, 1), ByteRange::new(10, 10));
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = CoreEvent::Progress(ProgressEvent {
            id: "x".into(),
            progress: 50.0,
            speed: 1024.0,
            downloaded: 512,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Progress");
        assert_eq!(json["payload"]["downloaded"], 512);
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent": 5}"#).unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.speed_limit, 0);
    }

    #[test]
    fn test_percent_clamps() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 100), 50.0);
        assert_eq!(percent(150, 100), 100.0);
    }
}
