//! Counter instrumentation for the ingestion pipeline.
//!
//! These record through the `metrics` facade; mounting a sink (or not) is
//! the embedder's choice, and without one every call is a no-op.

pub mod fetch {
    pub fn request_success() {
        metrics::counter!("catalog_fetch_requests_total", "outcome" => "success").increment(1);
    }

    pub fn request_error() {
        metrics::counter!("catalog_fetch_requests_total", "outcome" => "error").increment(1);
    }

    pub fn retry() {
        metrics::counter!("catalog_fetch_retries_total").increment(1);
    }

    pub fn payload_bytes(n: usize) {
        metrics::counter!("catalog_fetch_payload_bytes_total").increment(n as u64);
    }
}

pub mod pipeline {
    pub fn page_consumed() {
        metrics::counter!("catalog_pipeline_pages_total").increment(1);
    }

    pub fn record_accepted() {
        metrics::counter!("catalog_pipeline_records_total", "outcome" => "accepted").increment(1);
    }

    pub fn record_duplicate() {
        metrics::counter!("catalog_pipeline_records_total", "outcome" => "duplicate").increment(1);
    }

    pub fn record_rejected(reason: &'static str) {
        metrics::counter!("catalog_pipeline_records_total", "outcome" => "rejected", "reason" => reason)
            .increment(1);
    }
}
