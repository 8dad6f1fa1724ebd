use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::blocking::Client;
use reqwest::header::{ETAG, HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER};
use tracing::{debug, warn};

use crate::config::SourceSettings;
use crate::error::{Result, SyncError};
use crate::http_cache::HttpCache;
use crate::http_client::{REQUEST_TIMEOUT_SECS, build_client, http_client};
use crate::model::SourceTag;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Parsed from `Retry-After` or `X-RateLimit-Reset` when present.
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "timeout: {msg}"),
            TransportError::Connect(msg) => write!(f, "connect: {msg}"),
            TransportError::Other(msg) => f.write_str(msg),
        }
    }
}

/// Single GET round trip. Everything above this seam (pacing, retries,
/// rate-limit waits) is shared by real and scripted transports.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> std::result::Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
    cache: HttpCache,
}

impl ReqwestTransport {
    pub fn new(timeout_secs: u64, cache: HttpCache) -> anyhow::Result<Self> {
        let client = if timeout_secs == REQUEST_TIMEOUT_SECS {
            http_client()?.clone()
        } else {
            build_client(Duration::from_secs(timeout_secs.max(1)))?
        };
        Ok(Self { client, cache })
    }
}

impl Transport for ReqwestTransport {
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> std::result::Result<HttpResponse, TransportError> {
        let cached = self.cache.lookup(url);
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(entry) = cached.as_ref() {
            if let Some(etag) = entry.etag.as_deref() {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = entry.last_modified.as_deref() {
                req = req.header(IF_MODIFIED_SINCE, modified);
            }
        }

        let resp = req.send().map_err(transport_error)?;
        let status = resp.status().as_u16();
        if status == 304
            && let Some(entry) = cached
        {
            debug!(url, "not modified; serving cached body");
            return Ok(HttpResponse::ok(entry.body));
        }

        let retry_after = rate_limit_wait(resp.headers(), epoch_secs());
        let etag = header_string(resp.headers(), ETAG.as_str());
        let last_modified = header_string(resp.headers(), LAST_MODIFIED.as_str());
        let body = resp.text().map_err(transport_error)?;
        if (200..300).contains(&status) {
            self.cache.store(url, &body, etag, last_modified);
        }
        Ok(HttpResponse {
            status,
            body,
            retry_after,
        })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn rate_limit_wait(headers: &HeaderMap, now_epoch: u64) -> Option<Duration> {
    parse_rate_limit_wait(
        header_string(headers, RETRY_AFTER.as_str()).as_deref(),
        header_string(headers, "x-ratelimit-reset").as_deref(),
        now_epoch,
    )
}

/// `Retry-After` in delta seconds wins; otherwise `X-RateLimit-Reset` as a
/// unix epoch.
pub fn parse_rate_limit_wait(
    retry_after: Option<&str>,
    reset_epoch: Option<&str>,
    now_epoch: u64,
) -> Option<Duration> {
    if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = reset_epoch.and_then(|v| v.trim().parse::<u64>().ok())?;
    Some(Duration::from_secs(reset.saturating_sub(now_epoch)))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Minimum spacing between requests to one source, shared by every task
/// that talks to it.
pub struct RateGate {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn acquire(&self) {
        let wait = {
            let Ok(mut next) = self.next_slot.lock() else {
                return;
            };
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.interval;
            slot - now
        };
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }

    /// Pushes the next slot out to `until`; used after a 429.
    pub fn hold_until(&self, until: Instant) {
        if let Ok(mut next) = self.next_slot.lock()
            && *next < until
        {
            *next = until;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_rate_limit_waits: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            max_rate_limit_waits: settings.max_rate_limit_waits,
        }
    }

    /// Delay after the `failures`-th failed attempt.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF)
    }
}

/// Paced, retrying GET client for one source.
pub struct SourceClient {
    source: SourceTag,
    transport: Arc<dyn Transport>,
    gate: Arc<RateGate>,
    policy: RetryPolicy,
    headers: Vec<(String, String)>,
    requests: AtomicU64,
}

impl SourceClient {
    pub fn new(settings: &SourceSettings, transport: Arc<dyn Transport>) -> Self {
        let gate = Arc::new(RateGate::new(settings.min_interval()));
        Self::with_gate(settings, transport, gate)
    }

    pub fn with_gate(
        settings: &SourceSettings,
        transport: Arc<dyn Transport>,
        gate: Arc<RateGate>,
    ) -> Self {
        let mut headers = Vec::new();
        if let Some(key) = settings.api_key.as_ref() {
            headers.push(("X-API-KEY".to_string(), key.clone()));
        }
        Self {
            source: settings.source,
            transport,
            gate,
            policy: RetryPolicy::from_settings(settings),
            headers,
            requests: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> SourceTag {
        self.source
    }

    /// Requests actually sent, including retries and 429s.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_text(&self, url: &str) -> Result<String> {
        let mut failures = 0u32;
        let mut rate_waits = 0u32;
        loop {
            self.gate.acquire();
            self.requests.fetch_add(1, Ordering::Relaxed);

            let failure = match self.transport.get(url, &self.headers) {
                Ok(resp) if (200..300).contains(&resp.status) => return Ok(resp.body),
                Ok(resp) if resp.status == 429 => {
                    rate_waits += 1;
                    let wait = resp.retry_after.unwrap_or(self.policy.backoff_base);
                    let limited = SyncError::RateLimited {
                        source_tag: self.source,
                        wait_secs: wait.as_secs(),
                    };
                    if rate_waits > self.policy.max_rate_limit_waits {
                        return Err(SyncError::SourceUnavailable {
                            source_tag: self.source,
                            attempts: failures + 1,
                            message: format!("{limited} (wait cap reached)"),
                        });
                    }
                    warn!(source = %self.source, url, wait_secs = wait.as_secs(), "rate limited");
                    self.gate.hold_until(Instant::now() + wait);
                    continue;
                }
                Ok(resp) if resp.status >= 500 => SyncError::TransientNetwork {
                    source_tag: self.source,
                    message: format!("http {} for {url}", resp.status),
                },
                Ok(resp) => {
                    return Err(SyncError::SourceUnavailable {
                        source_tag: self.source,
                        attempts: failures + 1,
                        message: format!("http {} for {url}", resp.status),
                    });
                }
                Err(err) => SyncError::TransientNetwork {
                    source_tag: self.source,
                    message: format!("{err} for {url}"),
                },
            };

            failures += 1;
            if failures >= self.policy.max_attempts {
                return Err(SyncError::SourceUnavailable {
                    source_tag: self.source,
                    attempts: failures,
                    message: failure.to_string(),
                });
            }
            let delay = self.policy.backoff(failures);
            debug!(source = %self.source, attempt = failures, delay_ms = delay.as_millis() as u64, error = %failure, "retrying");
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<HttpResponse, TransportError>>>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<HttpResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    impl Transport for Scripted {
        fn get(
            &self,
            _url: &str,
            _headers: &[(String, String)],
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::status(599)))
        }
    }

    fn fast_settings(max_attempts: u32) -> SourceSettings {
        let mut s = SourceSettings::defaults(SourceTag::Espn);
        s.min_interval_ms = 0;
        s.backoff_base_ms = 1;
        s.max_attempts = max_attempts;
        s.max_rate_limit_waits = 2;
        s
    }

    #[test]
    fn server_errors_are_retried_until_success() {
        let t = Scripted::new(vec![
            Ok(HttpResponse::status(503)),
            Err(TransportError::Timeout("slow".into())),
            Ok(HttpResponse::ok("done")),
        ]);
        let client = SourceClient::new(&fast_settings(4), t);
        assert_eq!(client.get_text("u").expect("body"), "done");
        assert_eq!(client.request_count(), 3);
    }

    #[test]
    fn exhausted_retries_become_source_unavailable() {
        let t = Scripted::new(vec![
            Ok(HttpResponse::status(500)),
            Ok(HttpResponse::status(502)),
        ]);
        let client = SourceClient::new(&fast_settings(2), t);
        let err = client.get_text("u").expect_err("should fail");
        assert!(matches!(err, SyncError::SourceUnavailable { attempts: 2, .. }));
    }

    #[test]
    fn client_errors_fail_fast() {
        let t = Scripted::new(vec![Ok(HttpResponse::status(404))]);
        let client = SourceClient::new(&fast_settings(4), t);
        assert!(client.get_text("u").is_err());
        assert_eq!(client.request_count(), 1);
    }

    #[test]
    fn rate_limit_waits_do_not_consume_attempts() {
        let limited = HttpResponse {
            status: 429,
            body: String::new(),
            retry_after: Some(Duration::from_millis(1)),
        };
        let t = Scripted::new(vec![
            Ok(limited.clone()),
            Ok(limited),
            Ok(HttpResponse::ok("fine")),
        ]);
        let client = SourceClient::new(&fast_settings(1), t);
        assert_eq!(client.get_text("u").expect("body"), "fine");
    }

    #[test]
    fn rate_limit_wait_cap_is_enforced() {
        let limited = || {
            Ok(HttpResponse {
                status: 429,
                body: String::new(),
                retry_after: Some(Duration::ZERO),
            })
        };
        let t = Scripted::new(vec![limited(), limited(), limited(), Ok(HttpResponse::ok("late"))]);
        let client = SourceClient::new(&fast_settings(4), t);
        assert!(client.get_text("u").is_err());
    }

    #[test]
    fn shared_gate_spaces_concurrent_callers() {
        let interval = Duration::from_millis(40);
        let start = Instant::now();
        let gate = RateGate::new(interval);
        let mut admitted: Vec<Instant> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        gate.acquire();
                        Instant::now()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("caller thread"))
                .collect()
        });
        admitted.sort();
        // the n-th admission cannot precede the n-th slot
        for (n, at) in admitted.iter().enumerate() {
            assert!(*at >= start + interval * n as u32, "caller {n} admitted early");
        }
    }

    #[test]
    fn clients_sharing_a_gate_share_its_pacing() {
        let mut settings = fast_settings(1);
        settings.min_interval_ms = 30;
        let gate = Arc::new(RateGate::new(settings.min_interval()));
        let first = SourceClient::with_gate(&settings, Scripted::new(vec![Ok(HttpResponse::ok("a"))]), Arc::clone(&gate));
        let second = SourceClient::with_gate(&settings, Scripted::new(vec![Ok(HttpResponse::ok("b"))]), gate);
        let start = Instant::now();
        first.get_text("u").expect("first");
        second.get_text("u").expect("second");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn rate_limit_headers_parse() {
        assert_eq!(
            parse_rate_limit_wait(Some("7"), Some("999"), 100),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            parse_rate_limit_wait(None, Some("130"), 100),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_rate_limit_wait(None, Some("50"), 100), Some(Duration::ZERO));
        assert_eq!(parse_rate_limit_wait(Some("soon"), None, 100), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            max_rate_limit_waits: 1,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(3), Duration::from_millis(2000));
        assert_eq!(p.backoff(40), MAX_BACKOFF);
    }
}
