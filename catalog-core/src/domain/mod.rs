use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A validated, normalized product listing.
///
/// Invariant: instances only exist for records that passed validation, so
/// every field has been type-coerced and range-checked. `id` is `None` only
/// for sources configured to admit records without a stable identifier;
/// those deduplicate by content hash instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Option<String>,
    pub name: String,
    /// Price rescaled to two decimal places.
    pub price: Decimal,
    /// Three-letter uppercase currency code.
    pub currency: String,
    pub available: bool,
    pub url: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Product {
    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity::from_record(self)
    }
}

/// Deduplication key derived from a normalized record.
///
/// Prefers the upstream identifier; falls back to a content hash over the
/// stable descriptive fields when no identifier exists. Never used for
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentity(String);

impl RecordIdentity {
    pub fn from_record(product: &Product) -> Self {
        match &product.id {
            Some(id) if !id.is_empty() => Self(format!("id:{id}")),
            _ => Self::content_hash(product),
        }
    }

    /// Rehydrate an identity previously persisted by the ingest store.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    fn content_hash(product: &Product) -> Self {
        // Canonical string over the stable descriptive fields. Availability
        // and the retrieval timestamp are volatile per fetch and excluded.
        let mut s = String::new();
        s.push_str(&product.name);
        s.push('|');
        s.push_str(&product.price.to_string());
        s.push('|');
        s.push_str(&product.currency);
        s.push('|');
        if let Some(url) = &product.url {
            s.push_str(url);
        }

        let mut hasher = Sha256::new();
        hasher.update(s.as_bytes());
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of why a raw record failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// A required field is absent (or null).
    MissingField,
    /// A field carries a value of the wrong shape (e.g. object where a
    /// scalar was expected).
    TypeMismatch,
    /// A field parsed but is out of range or otherwise implausible.
    InvalidValue,
    /// Text that cannot be canonicalized (replacement characters, embedded
    /// control bytes).
    MalformedEncoding,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingField => "missing_field",
            Self::TypeMismatch => "type_mismatch",
            Self::InvalidValue => "invalid_value",
            Self::MalformedEncoding => "malformed_encoding",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected record: the reason plus which field tripped it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub field: String,
    pub detail: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { reason, field: field.into(), detail: detail.into() }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.reason, self.field, self.detail)
    }
}

/// Per-reason rejection tallies for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectCounts {
    pub missing_field: u64,
    pub type_mismatch: u64,
    pub invalid_value: u64,
    pub malformed_encoding: u64,
}

impl RejectCounts {
    pub fn bump(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::MissingField => self.missing_field += 1,
            RejectReason::TypeMismatch => self.type_mismatch += 1,
            RejectReason::InvalidValue => self.invalid_value += 1,
            RejectReason::MalformedEncoding => self.malformed_encoding += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.missing_field + self.type_mismatch + self.invalid_value + self.malformed_encoding
    }
}

/// Structured outcome summary of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub pages_fetched: u64,
    pub records_seen: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub rejects: RejectCounts,
}

impl IngestSummary {
    /// Every raw record observed is accounted for exactly once.
    pub fn is_balanced(&self) -> bool {
        self.records_seen == self.accepted + self.duplicates + self.rejects.total()
    }
}
