use std::time::Duration;

use async_trait::async_trait;

use crate::common::error::FetchError;

/// One raw HTTP page response, as seen by the fetch stage.
#[derive(Debug, Clone)]
pub struct HttpPageResponse {
    pub status: u16,
    pub bytes: Vec<u8>,
    /// Parsed `Retry-After` hint, when the server sent one.
    pub retry_after: Option<Duration>,
}

/// Transport seam for the fetch stage. The pipeline only ever talks to the
/// network through this trait, so tests drive it with a scripted fake.
#[async_trait]
pub trait HttpClientPort: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpPageResponse, FetchError>;
}
