//! Download Engine
//!
//! Segmented downloads held in memory:
//! - Byte-range planning and resume gaps
//! - Concurrent range fetches per download
//! - Token bucket rate limiting
//! - Throttled progress events
//! - Pause/resume/cancel with a ceiling on active downloads

mod chunk_buffer;
mod chunk_scheduler;
mod download_task;
mod manager;
mod notifier;
mod progress;
mod rate_limiter;
mod slots;
mod transport;

pub use chunk_buffer::*;
pub use chunk_scheduler::*;
pub use download_task::*;
pub use manager::*;
pub use notifier::{LogNotifier, Notifier, COMPLETE_BODY, FAILED_BODY};
pub(crate) use notifier::Notifications;
pub use progress::*;
pub use rate_limiter::*;
pub use slots::*;
pub use transport::{HttpTransport, Transport};
