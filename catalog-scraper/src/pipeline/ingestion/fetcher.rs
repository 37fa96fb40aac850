use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::ports::{HttpClientPort, HttpPageResponse};
use crate::common::error::{FetchError, PipelineError};
use crate::observability::metrics;
use crate::pipeline::ingestion::envelope::{Cursor, PageEnvelopeV1, RawPage};
use crate::pipeline::ingestion::rate_limiter::RateLimiter;
use crate::registry::source_loader::{EndpointSpec, RetrySpec};

/// Retry schedule for transient page-fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Overall wall-clock budget across attempts and backoff waits.
    pub total_budget: Duration,
    pub attempt_timeout: Duration,
}

impl From<&RetrySpec> for RetryPolicy {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max_attempts,
            base_backoff: Duration::from_millis(spec.base_backoff_ms),
            max_backoff: Duration::from_millis(spec.max_backoff_ms),
            total_budget: Duration::from_millis(spec.total_budget_ms),
            attempt_timeout: Duration::from_millis(spec.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): the capped
    /// exponential delay with equal jitter (half fixed, half uniformly
    /// random) so synchronized clients fan out.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let exponential = self.base_backoff.saturating_mul(1u32 << exponent);
        let capped = exponential.min(self.max_backoff);
        let half_ms = capped.as_millis() as u64 / 2;
        Duration::from_millis(half_ms + rand::thread_rng().gen_range(0..=half_ms))
    }
}

/// Fetches single pages with rate limiting, per-attempt timeouts, and
/// bounded retry with exponential backoff.
///
/// Precondition on the upstream API, not enforced here: re-fetching the
/// same cursor after a retry returns the same page content.
pub struct PageFetcher {
    http: Arc<dyn HttpClientPort>,
    limiter: Arc<RateLimiter>,
    endpoint: EndpointSpec,
    base_url: reqwest::Url,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PageFetcher {
    pub fn new(
        http: Arc<dyn HttpClientPort>,
        limiter: Arc<RateLimiter>,
        endpoint: EndpointSpec,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let base_url = reqwest::Url::parse(&endpoint.url)
            .map_err(|e| PipelineError::Config(format!("endpoint url: {e}")))?;
        Ok(Self { http, limiter, endpoint, base_url, policy, cancel })
    }

    /// Fetch one page, retrying transient failures per the policy.
    pub async fn fetch(&self, cursor: &Cursor) -> Result<RawPage, FetchError> {
        let url = self.page_url(cursor);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.attempt(&url, cursor).await {
                Ok(page) => {
                    metrics::fetch::request_success();
                    return Ok(page);
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(err) if !err.is_transient() => {
                    metrics::fetch::request_error();
                    return Err(err);
                }
                Err(err) => {
                    metrics::fetch::request_error();
                    if attempt >= self.policy.max_attempts {
                        return Err(FetchError::BudgetExhausted { attempts: attempt, last: Box::new(err) });
                    }
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.policy.backoff_for(attempt));
                    if started.elapsed() + delay > self.policy.total_budget {
                        return Err(FetchError::BudgetExhausted { attempts: attempt, last: Box::new(err) });
                    }
                    metrics::fetch::retry();
                    warn!(
                        "⏳ transient failure at cursor {} (attempt {}/{}): {}; backing off {:?}",
                        cursor, attempt, self.policy.max_attempts, err, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(&self, url: &str, cursor: &Cursor) -> Result<RawPage, FetchError> {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = self.limiter.acquire() => permit,
        };

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            outcome = timeout(self.policy.attempt_timeout, self.http.get(url)) => match outcome {
                Ok(result) => result?,
                Err(_) => return Err(FetchError::AttemptTimeout(self.policy.attempt_timeout)),
            },
        };
        drop(permit);

        decode_page(cursor.clone(), response)
    }

    fn page_url(&self, cursor: &Cursor) -> String {
        if cursor.is_start() && self.endpoint.page_size.is_none() {
            return self.base_url.to_string();
        }
        let mut url = self.base_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            if !cursor.is_start() {
                pairs.append_pair(&self.endpoint.cursor_param, cursor.as_str());
            }
            if let Some(size) = self.endpoint.page_size {
                pairs.append_pair(&self.endpoint.page_size_param, &size.to_string());
            }
        }
        url.to_string()
    }
}

/// Decode one HTTP response into a raw page. Non-2xx statuses and bodies
/// that do not parse as the page envelope are fetch errors, classified by
/// `FetchError::is_transient`.
fn decode_page(cursor: Cursor, response: HttpPageResponse) -> Result<RawPage, FetchError> {
    if !(200..300).contains(&response.status) {
        return Err(FetchError::Status {
            status: response.status,
            retry_after: response.retry_after,
        });
    }
    metrics::fetch::payload_bytes(response.bytes.len());

    let envelope: PageEnvelopeV1 = serde_json::from_slice(&response.bytes)
        .map_err(|e| FetchError::Envelope(e.to_string()))?;
    debug!(
        "📦 page at cursor {}: {} records, next={:?}",
        cursor,
        envelope.products.len(),
        envelope.next_cursor
    );
    Ok(RawPage::from_envelope(cursor, envelope, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeHttp {
        responses: Mutex<VecDeque<Result<HttpPageResponse, FetchError>>>,
        calls: AtomicUsize,
    }

    impl FakeHttp {
        fn new(responses: Vec<Result<HttpPageResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClientPort for FakeHttp {
        async fn get(&self, _url: &str) -> Result<HttpPageResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Http("script exhausted".into())))
        }
    }

    fn ok_page(records: usize, next: Option<&str>) -> Result<HttpPageResponse, FetchError> {
        let products: Vec<serde_json::Value> = (0..records)
            .map(|i| serde_json::json!({ "id": format!("p-{i}") }))
            .collect();
        let mut body = serde_json::json!({ "products": products });
        if let Some(next) = next {
            body["next_cursor"] = serde_json::json!(next);
        }
        Ok(HttpPageResponse {
            status: 200,
            bytes: serde_json::to_vec(&body).unwrap(),
            retry_after: None,
        })
    }

    fn status(code: u16) -> Result<HttpPageResponse, FetchError> {
        Ok(HttpPageResponse { status: code, bytes: Vec::new(), retry_after: None })
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(8000),
            total_budget: Duration::from_secs(120),
            attempt_timeout: Duration::from_secs(10),
        }
    }

    fn endpoint() -> EndpointSpec {
        serde_json::from_value(serde_json::json!({
            "url": "https://catalog.example.com/api/v1/products"
        }))
        .unwrap()
    }

    fn fetcher(http: Arc<FakeHttp>, policy: RetryPolicy, cancel: CancellationToken) -> PageFetcher {
        PageFetcher::new(
            http,
            Arc::new(RateLimiter::unlimited()),
            endpoint(),
            policy,
            cancel,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_twice_then_success_follows_the_backoff_schedule() {
        let http = FakeHttp::new(vec![status(500), status(503), ok_page(3, Some("tok-2"))]);
        let fetcher = fetcher(http.clone(), policy(), CancellationToken::new());

        let before = Instant::now();
        let page = fetcher.fetch(&Cursor::start()).await.unwrap();
        let elapsed = before.elapsed();

        assert_eq!(http.calls(), 3);
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.next_cursor, Some(Cursor::new("tok-2")));

        // Equal jitter: first delay in [0.5s, 1s], second in [1s, 2s].
        assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_status_fails_without_retry() {
        let http = FakeHttp::new(vec![status(404)]);
        let fetcher = fetcher(http.clone(), policy(), CancellationToken::new());

        let err = fetcher.fetch(&Cursor::new("tok")).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_envelope_fails_without_retry() {
        let http = FakeHttp::new(vec![Ok(HttpPageResponse {
            status: 200,
            bytes: b"<html>oops</html>".to_vec(),
            retry_after: None,
        })]);
        let fetcher = fetcher(http.clone(), policy(), CancellationToken::new());

        let err = fetcher.fetch(&Cursor::start()).await.unwrap_err();
        assert!(matches!(err, FetchError::Envelope(_)));
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_response_honors_retry_after_hint() {
        let http = FakeHttp::new(vec![
            Ok(HttpPageResponse {
                status: 429,
                bytes: Vec::new(),
                retry_after: Some(Duration::from_secs(7)),
            }),
            ok_page(1, None),
        ]);
        let fetcher = fetcher(http.clone(), policy(), CancellationToken::new());

        let before = Instant::now();
        fetcher.fetch(&Cursor::start()).await.unwrap();
        let elapsed = before.elapsed();

        assert_eq!(http.calls(), 2);
        assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(7500), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_converts_to_budget_exhausted() {
        let mut policy = policy();
        policy.max_attempts = 2;
        let http = FakeHttp::new(vec![status(503), status(503)]);
        let fetcher = fetcher(http.clone(), policy, CancellationToken::new());

        let err = fetcher.fetch(&Cursor::start()).await.unwrap_err();
        match err {
            FetchError::BudgetExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, FetchError::Status { status: 503, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(http.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn total_wait_budget_stops_retrying_early() {
        let mut policy = policy();
        policy.total_budget = Duration::from_millis(200);
        let http = FakeHttp::new(vec![status(500), status(500)]);
        let fetcher = fetcher(http.clone(), policy, CancellationToken::new());

        // First backoff (>= 500ms) would blow the 200ms budget.
        let err = fetcher.fetch(&Cursor::start()).await.unwrap_err();
        assert!(matches!(err, FetchError::BudgetExhausted { attempts: 1, .. }));
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_a_pending_backoff() {
        let http = FakeHttp::new(vec![status(500), ok_page(1, None)]);
        let cancel = CancellationToken::new();
        let fetcher = fetcher(http.clone(), policy(), cancel.clone());

        let handle = tokio::spawn(async move { fetcher.fetch(&Cursor::start()).await });
        // Let the first attempt fail and the backoff start, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_url_carries_cursor_and_page_size() {
        let endpoint: EndpointSpec = serde_json::from_value(serde_json::json!({
            "url": "https://catalog.example.com/api/v1/products",
            "page_size": 50
        }))
        .unwrap();
        let fetcher = PageFetcher::new(
            FakeHttp::new(vec![]),
            Arc::new(RateLimiter::unlimited()),
            endpoint,
            policy(),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(
            fetcher.page_url(&Cursor::start()),
            "https://catalog.example.com/api/v1/products?limit=50"
        );
        assert_eq!(
            fetcher.page_url(&Cursor::new("tok 2")),
            "https://catalog.example.com/api/v1/products?cursor=tok+2&limit=50"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_cursor_without_page_size_keeps_the_bare_url() {
        let http = FakeHttp::new(vec![]);
        let fetcher = fetcher(http, policy(), CancellationToken::new());
        assert_eq!(
            fetcher.page_url(&Cursor::start()),
            "https://catalog.example.com/api/v1/products"
        );
    }
}
