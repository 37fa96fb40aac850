use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque pagination token. The empty token marks the start of a listing
/// (the request carries no cursor parameter); offset-based APIs put the
/// numeric offset in the token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn start() -> Self {
        Self(String::new())
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<start>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Upstream page wrapper. The record list is required; the aliases absorb
/// the drift variants this API family has been seen to ship.
#[derive(Debug, Clone, Deserialize)]
pub struct PageEnvelopeV1 {
    #[serde(alias = "items", alias = "data")]
    pub products: Vec<serde_json::Value>,
    #[serde(default, alias = "next", alias = "next_page")]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// One fetched page, decoded but not yet split into records.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub cursor: Cursor,
    pub records: Vec<serde_json::Value>,
    pub next_cursor: Option<Cursor>,
    pub fetched_at: DateTime<Utc>,
}

impl RawPage {
    pub fn from_envelope(cursor: Cursor, envelope: PageEnvelopeV1, fetched_at: DateTime<Utc>) -> Self {
        // An empty next-cursor string is normalized to "no next page".
        let next_cursor = envelope
            .next_cursor
            .filter(|token| !token.is_empty())
            .map(Cursor::new);
        Self {
            cursor,
            records: envelope.products,
            next_cursor,
            fetched_at,
        }
    }
}
