//! HTTP transport for size probes and range fetches

use crate::error::{EngineError, FetchFailure};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chunkfetch_types::{ByteRange, EngineConfig};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

/// Network operations a download needs.
///
/// Kept behind a trait so the engine can be driven by any range-capable
/// source, including in-memory fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Total size of the resource in bytes
    async fn probe_size(&self, url: &str) -> Result<u64, FetchFailure>;

    /// Bytes `range.start..=range.end` of the resource
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, FetchFailure>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client from engine settings
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Client(e.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Ask for the first byte and read the total from `Content-Range`
    async fn probe_with_range_get(&self, url: &str) -> Result<u64, FetchFailure> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = response.status();
        debug!("Partial GET probe status for {}: {}", url, status);

        if status == StatusCode::PARTIAL_CONTENT {
            return response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(total_from_content_range)
                .ok_or(FetchFailure::MissingLength);
        }
        if status.is_success() {
            // Server ignored the range and sent everything
            return header_length(response.headers()).ok_or(FetchFailure::MissingLength);
        }
        Err(FetchFailure::Status(status.as_u16()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe_size(&self, url: &str) -> Result<u64, FetchFailure> {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                // Read the header, reqwest reports a zero body length for HEAD
                if let Some(size) = header_length(response.headers()).filter(|&s| s > 0) {
                    return Ok(size);
                }
                info!("HEAD for {} had no Content-Length, trying partial GET", url);
            }
            Ok(response) => {
                info!("HEAD for {} returned {}, trying partial GET", url, response.status());
            }
            Err(e) => {
                info!("HEAD for {} failed ({}), trying partial GET", url, e);
            }
        }

        self.probe_with_range_get(url).await
    }

    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, FetchFailure> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, range.header_value())
            .send()
            .await?;

        let status = response.status();
        let whole_body = status == StatusCode::OK && range.start == 0;
        if status != StatusCode::PARTIAL_CONTENT && !whole_body {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let expected = range.len();
        let mut body = BytesMut::with_capacity(expected as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > expected {
                return Err(FetchFailure::ShortBody {
                    expected,
                    actual: body.len() as u64 + chunk.len() as u64,
                });
            }
            body.extend_from_slice(&chunk);
        }

        if body.len() as u64 != expected {
            return Err(FetchFailure::ShortBody {
                expected,
                actual: body.len() as u64,
            });
        }
        Ok(body.freeze())
    }
}

fn header_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total from a `Content-Range` value such as `bytes 0-0/12345`
fn total_from_content_range(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok().filter(|&t| t > 0)
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport with controllable failures and stalls

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    pub(crate) struct MockTransport {
        data: Bytes,
        probe_result: Mutex<Result<u64, FetchFailure>>,
        failing_starts: Mutex<HashSet<u64>>,
        /// Ranges starting at or after this offset wait for the gate
        hold_from: Mutex<Option<u64>>,
        hold_probe: Mutex<bool>,
        probes: AtomicUsize,
        gate: watch::Sender<bool>,
        requests: Mutex<Vec<ByteRange>>,
        /// Call time and length of every fetch
        calls: Mutex<Vec<(tokio::time::Instant, u64)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn new(data: impl Into<Bytes>) -> Self {
            let data = data.into();
            let size = data.len() as u64;
            Self {
                data,
                probe_result: Mutex::new(Ok(size)),
                failing_starts: Mutex::new(HashSet::new()),
                hold_from: Mutex::new(None),
                hold_probe: Mutex::new(false),
                probes: AtomicUsize::new(0),
                gate: watch::channel(true).0,
                requests: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        /// Deterministic test payload of `len` bytes
        pub(crate) fn sequential(len: usize) -> Self {
            Self::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
        }

        pub(crate) fn data(&self) -> Bytes {
            self.data.clone()
        }

        pub(crate) fn set_probe_result(&self, result: Result<u64, FetchFailure>) {
            *self.probe_result.lock() = result;
        }

        pub(crate) fn fail_range_at(&self, start: u64) {
            self.failing_starts.lock().insert(start);
        }

        /// Stall every fetch whose range starts at or after `offset`
        pub(crate) fn hold_from(&self, offset: u64) {
            *self.hold_from.lock() = Some(offset);
            self.gate.send_replace(false);
        }

        /// Stall every fetch
        pub(crate) fn hold_all(&self) {
            self.hold_from(0);
        }

        /// Stall size probes until `release`
        pub(crate) fn hold_probe(&self) {
            *self.hold_probe.lock() = true;
            self.gate.send_replace(false);
        }

        pub(crate) fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        pub(crate) fn release(&self) {
            self.gate.send_replace(true);
        }

        pub(crate) fn take_requests(&self) -> Vec<ByteRange> {
            let mut requests = std::mem::take(&mut *self.requests.lock());
            requests.sort();
            requests
        }

        pub(crate) fn calls(&self) -> Vec<(tokio::time::Instant, u64)> {
            self.calls.lock().clone()
        }

        pub(crate) fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        pub(crate) fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn probe_size(&self, _url: &str) -> Result<u64, FetchFailure> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let held = *self.hold_probe.lock();
            if held {
                let mut gate = self.gate.subscribe();
                let _ = gate.wait_for(|open| *open).await;
            }
            self.probe_result.lock().clone()
        }

        async fn fetch_range(&self, _url: &str, range: ByteRange) -> Result<Bytes, FetchFailure> {
            self.requests.lock().push(range);
            self.calls.lock().push((tokio::time::Instant::now(), range.len()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let held = matches!(*self.hold_from.lock(), Some(from) if range.start >= from);
            if held {
                let mut gate = self.gate.subscribe();
                let _ = gate.wait_for(|open| *open).await;
            }
            tokio::task::yield_now().await;

            if self.failing_starts.lock().contains(&range.start) {
                return Err(FetchFailure::Status(500));
            }
            if range.end >= self.data.len() as u64 {
                return Err(FetchFailure::Status(416));
            }
            Ok(self.data.slice(range.start as usize..=range.end as usize))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method;
    use tokio_test::{assert_err, assert_ok};

    fn transport() -> HttpTransport {
        assert_ok!(HttpTransport::new(&EngineConfig::default()))
    }

    #[test]
    fn test_total_from_content_range() {
        assert_eq!(total_from_content_range("bytes 0-0/2500000"), Some(2_500_000));
        assert_eq!(total_from_content_range("bytes 0-0/*"), None);
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_range_get() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(Method::HEAD).path("/file.bin");
                then.status(405);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/file.bin").header("range", "bytes=0-0");
                then.status(206)
                    .header("content-range", "bytes 0-0/2500000")
                    .body("x");
            })
            .await;

        let size = transport().probe_size(&server.url("/file.bin")).await;
        assert_eq!(size, Ok(2_500_000));
    }

    #[tokio::test]
    async fn test_probe_fails_without_length() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/missing");
                then.status(404);
            })
            .await;

        let result = transport().probe_size(&server.url("/missing")).await;
        assert_eq!(result, Err(FetchFailure::Status(404)));
    }

    #[tokio::test]
    async fn test_fetch_range_sends_inclusive_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/file.bin").header("range", "bytes=10-19");
                then.status(206).body("0123456789");
            })
            .await;

        let body = transport()
            .fetch_range(&server.url("/file.bin"), ByteRange::new(10, 19))
            .await;
        assert_eq!(assert_ok!(body), Bytes::from_static(b"0123456789"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_range_rejects_wrong_length_and_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/short");
                then.status(206).body("abc");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/full");
                then.status(200).body("abcdefghij");
            })
            .await;

        let t = transport();
        let short = t.fetch_range(&server.url("/short"), ByteRange::new(0, 9)).await;
        assert_eq!(short, Err(FetchFailure::ShortBody { expected: 10, actual: 3 }));

        // A 200 for an interior range means the server ignored `Range`
        let ignored = t.fetch_range(&server.url("/full"), ByteRange::new(5, 9)).await;
        assert_err!(ignored);
    }
}
