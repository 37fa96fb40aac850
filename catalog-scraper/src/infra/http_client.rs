use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;

use crate::app::ports::{HttpClientPort, HttpPageResponse};
use crate::common::error::FetchError;

const USER_AGENT: &str = "catalog-scraper/0.1";

// One shared client; reqwest pools connections per host internally.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

pub struct ReqwestHttp;

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn get(&self, url: &str) -> Result<HttpPageResponse, FetchError> {
        tracing::debug!("HTTP GET {}", url);
        let resp = HTTP_CLIENT
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| FetchError::Http(describe(&e)))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Http(describe(&e)))?
            .to_vec();

        Ok(HttpPageResponse { status, bytes, retry_after })
    }
}

// Classify without formatting the error itself, which would leak the
// endpoint URL into logs.
fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "transport timeout".to_string()
    } else if err.is_connect() {
        "connection error".to_string()
    } else if err.is_body() || err.is_decode() {
        "body read error".to_string()
    } else {
        "request error".to_string()
    }
}
