use std::collections::HashSet;

use tracing::debug;

use crate::common::error::{FetchError, PipelineError};
use crate::pipeline::ingestion::envelope::{Cursor, RawPage};
use crate::pipeline::ingestion::fetcher::PageFetcher;

/// Lazily walks a paginated listing from an initial cursor until
/// exhaustion, a terminal fetch failure, or a pagination protocol
/// violation.
///
/// Not restartable mid-stream on its own: resuming after a crash requires
/// the orchestrator to checkpoint the next cursor after each consumed page
/// and construct a fresh `Paginator` from it.
pub struct Paginator {
    fetcher: PageFetcher,
    next: Option<Cursor>,
    seen: HashSet<Cursor>,
    pages_fetched: u64,
}

impl Paginator {
    pub fn new(fetcher: PageFetcher, initial: Cursor) -> Self {
        let mut seen = HashSet::new();
        seen.insert(initial.clone());
        Self {
            fetcher,
            next: Some(initial),
            seen,
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// The next page in cursor order; `Ok(None)` once the listing is
    /// exhausted. After any error the sequence stays terminated.
    pub async fn next_page(&mut self) -> Result<Option<RawPage>, PipelineError> {
        let Some(cursor) = self.next.take() else {
            return Ok(None);
        };

        let page = match self.fetcher.fetch(&cursor).await {
            Ok(page) => page,
            Err(FetchError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(source) => return Err(PipelineError::Fetch { cursor, source }),
        };
        self.pages_fetched += 1;

        if page.records.is_empty() {
            debug!("📭 page at cursor {} is empty; listing exhausted", page.cursor);
            return Ok(None);
        }

        if let Some(next) = &page.next_cursor {
            if !self.seen.insert(next.clone()) {
                return Err(PipelineError::Pagination(format!(
                    "next cursor '{next}' repeats an earlier cursor; stopping instead of looping"
                )));
            }
            self.next = Some(next.clone());
        }

        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{HttpClientPort, HttpPageResponse};
    use crate::pipeline::ingestion::fetcher::RetryPolicy;
    use crate::pipeline::ingestion::rate_limiter::RateLimiter;
    use crate::registry::source_loader::EndpointSpec;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FakeHttp {
        responses: Mutex<VecDeque<HttpPageResponse>>,
        calls: AtomicUsize,
    }

    impl FakeHttp {
        fn new(bodies: Vec<serde_json::Value>) -> Arc<Self> {
            let responses = bodies
                .into_iter()
                .map(|body| HttpPageResponse {
                    status: 200,
                    bytes: serde_json::to_vec(&body).unwrap(),
                    retry_after: None,
                })
                .collect();
            Arc::new(Self { responses: Mutex::new(responses), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClientPort for FakeHttp {
        async fn get(&self, _url: &str) -> Result<HttpPageResponse, crate::common::error::FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.lock().unwrap().pop_front() {
                Some(resp) => Ok(resp),
                None => Ok(HttpPageResponse {
                    status: 404,
                    bytes: Vec::new(),
                    retry_after: None,
                }),
            }
        }
    }

    fn paginator(http: Arc<FakeHttp>) -> Paginator {
        let endpoint: EndpointSpec = serde_json::from_value(serde_json::json!({
            "url": "https://catalog.example.com/api/v1/products"
        }))
        .unwrap();
        let policy = RetryPolicy {
            max_attempts: 1,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            total_budget: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(5),
        };
        let fetcher = PageFetcher::new(
            http,
            Arc::new(RateLimiter::unlimited()),
            endpoint,
            policy,
            CancellationToken::new(),
        )
        .unwrap();
        Paginator::new(fetcher, Cursor::start())
    }

    fn page(ids: &[&str], next: Option<&str>) -> serde_json::Value {
        let products: Vec<serde_json::Value> =
            ids.iter().map(|id| serde_json::json!({ "id": id })).collect();
        match next {
            Some(next) => serde_json::json!({ "products": products, "next_cursor": next }),
            None => serde_json::json!({ "products": products }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn walks_pages_until_no_next_cursor() {
        let http = FakeHttp::new(vec![
            page(&["a", "b"], Some("p2")),
            page(&["c"], None),
        ]);
        let mut paginator = paginator(http.clone());

        let first = paginator.next_page().await.unwrap().unwrap();
        assert_eq!(first.records.len(), 2);
        let second = paginator.next_page().await.unwrap().unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(paginator.next_page().await.unwrap().is_none());

        assert_eq!(http.calls(), 2);
        assert_eq!(paginator.pages_fetched(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_ends_the_listing_even_with_a_next_cursor() {
        let http = FakeHttp::new(vec![page(&[], Some("p2"))]);
        let mut paginator = paginator(http.clone());

        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(http.calls(), 1);
        assert_eq!(paginator.pages_fetched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_cursor_is_a_pagination_error() {
        let http = FakeHttp::new(vec![
            page(&["a"], Some("p2")),
            page(&["b"], Some("p2")),
        ]);
        let mut paginator = paginator(http.clone());

        paginator.next_page().await.unwrap().unwrap();
        let err = paginator.next_page().await.unwrap_err();
        assert!(matches!(err, PipelineError::Pagination(_)));

        // No further fetches after the protocol violation.
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(http.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_fetch_error_surfaces_and_ends_the_sequence() {
        let http = FakeHttp::new(vec![page(&["a"], Some("p2"))]);
        let mut paginator = paginator(http.clone());

        paginator.next_page().await.unwrap().unwrap();
        // Script exhausted: the fake answers 404, a terminal status.
        let err = paginator.next_page().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Fetch { source: FetchError::Status { status: 404, .. }, .. }
        ));
        assert!(paginator.next_page().await.unwrap().is_none());
    }
}
