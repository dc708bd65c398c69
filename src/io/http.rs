//! HTTP Range request reader for remote archives.
//!
//! Implements random-access reading from HTTP servers using the Range
//! request header (RFC 7233), so individual entries can be pulled out of
//! a large remote archive without downloading the whole file.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::ReadAt;
use crate::error::{ZipError, ZipResult};

/// First retry delay; later attempts double it up to [`BACKOFF_CAP`].
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Consecutive failed attempts tolerated for one byte range. The budget
/// resets whenever a request delivers data, so a long extraction over a
/// flaky link is not bounded by a single global counter.
const MAX_ATTEMPTS: u32 = 6;

/// HTTP Range reader for remote archives.
///
/// The remote server must support Range requests (`Accept-Ranges: bytes`)
/// and report a `Content-Length` on HEAD. Timeouts and connection drops
/// are retried with capped exponential backoff; transfer volume is
/// tracked for statistics.
pub struct HttpRangeReader {
    /// HTTP client with connection pooling.
    client: Client,
    url: String,
    size: u64,
    /// Cumulative bytes transferred from the network.
    transferred_bytes: AtomicU64,
}

impl HttpRangeReader {
    /// Probe `url` with a HEAD request and build a reader for it.
    ///
    /// Fails if the server does not advertise Range support or omits
    /// `Content-Length` (both are required for parsing from the end).
    pub async fn new(url: String) -> ZipResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let resp = client.head(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ZipError::BadFormat("HTTP HEAD request failed"));
        }

        let accept_ranges = resp
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        if !accept_ranges.contains("bytes") {
            return Err(ZipError::BadFormat(
                "remote server does not support Range requests",
            ));
        }

        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or(ZipError::BadFormat(
                "remote server did not return Content-Length",
            ))?;

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
        })
    }

    /// Total bytes received from the server so far.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Issue a single `Range: bytes=start-end` request and return its
    /// body. Anything other than 206 Partial Content means the server
    /// served the whole resource or an error page; neither is usable for
    /// random access.
    async fn fetch_range(&self, start: u64, end: u64) -> ZipResult<Vec<u8>> {
        let resp = self
            .client
            .get(&self.url)
            .header(header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(ZipError::BadFormat(
                "remote server ignored the Range request",
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Errors worth another attempt: the connection died or timed out.
/// Protocol-level failures (bad status, malformed response) are final.
fn transient(err: &ZipError) -> bool {
    matches!(err, ZipError::Http(e) if e.is_timeout() || e.is_connect() || e.is_body())
}

fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1 << attempt.min(16))
        .min(BACKOFF_CAP)
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    /// Fill `buf` from `offset`, re-requesting the unreceived remainder
    /// after short bodies and backing off on transient failures.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> ZipResult<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        // Never request past EOF; servers differ on how they answer.
        let want = (self.size - offset).min(buf.len() as u64) as usize;
        let last = offset + want as u64 - 1;

        let mut filled = 0;
        let mut attempt = 0u32;
        while filled < want {
            match self.fetch_range(offset + filled as u64, last).await {
                Ok(body) if body.is_empty() => {
                    // A 206 with no payload would loop forever.
                    return Err(ZipError::BadFormat("empty partial-content response"));
                }
                Ok(body) => {
                    let n = body.len().min(want - filled);
                    buf[filled..filled + n].copy_from_slice(&body[..n]);
                    filled += n;
                    self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    // Data arrived, so the link is alive again.
                    attempt = 0;
                }
                Err(e) if transient(&e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "range fetch retry");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(5), Duration::from_secs(8));
        assert_eq!(backoff_delay(40), BACKOFF_CAP);
    }
}
