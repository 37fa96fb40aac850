use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

use catalog_core::{Product, RejectReason, Rejection};

use crate::registry::source_loader::ValidationSpec;

static CURRENCY_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}$").expect("currency pattern"));

// Field aliases tolerated per canonical field, first match wins.
const ID_FIELDS: &[&str] = &["id", "product_id", "sku"];
const NAME_FIELDS: &[&str] = &["name", "title"];
const PRICE_FIELDS: &[&str] = &["price", "current_price"];
const CURRENCY_FIELDS: &[&str] = &["currency", "currency_code"];
const AVAILABILITY_FIELDS: &[&str] = &["available", "in_stock", "availability"];
const URL_FIELDS: &[&str] = &["url", "link", "product_url"];

/// Bounds and toggles for record validation.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Plausibility ceiling; prices above it are upstream corruption.
    pub max_price: Decimal,
    pub currencies: Option<Vec<String>>,
    pub require_identifier: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_price: Decimal::new(1_000_000, 0),
            currencies: None,
            require_identifier: true,
        }
    }
}

impl From<&ValidationSpec> for ValidationConfig {
    fn from(spec: &ValidationSpec) -> Self {
        Self {
            max_price: spec.max_price,
            currencies: spec.currencies.clone(),
            require_identifier: spec.require_identifier,
        }
    }
}

/// Validates and normalizes raw catalog records.
///
/// Pure and deterministic: the same raw record and retrieval timestamp
/// always produce the same outcome, so the validator is reusable and
/// testable without any network access.
pub struct RecordValidator {
    config: ValidationConfig,
}

impl RecordValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, raw: &Value, fetched_at: DateTime<Utc>) -> Result<Product, Rejection> {
        let Some(record) = raw.as_object() else {
            return Err(Rejection::new(
                RejectReason::TypeMismatch,
                "$",
                "record is not a JSON object",
            ));
        };

        let id = self.extract_id(record)?;
        let name = extract_name(record)?;
        let price = self.extract_price(record)?;
        let currency = self.extract_currency(record)?;
        let available = extract_availability(record)?;
        let url = extract_url(record)?;

        Ok(Product { id, name, price, currency, available, url, fetched_at })
    }

    fn extract_id(&self, record: &Map<String, Value>) -> Result<Option<String>, Rejection> {
        let missing = || {
            Rejection::new(RejectReason::MissingField, "id", "required field is absent")
        };
        match field(record, ID_FIELDS) {
            None => {
                if self.config.require_identifier {
                    Err(missing())
                } else {
                    Ok(None)
                }
            }
            Some((name, Value::String(s))) => {
                ensure_clean(name, s)?;
                let id = s.trim();
                if id.is_empty() {
                    if self.config.require_identifier {
                        Err(missing())
                    } else {
                        Ok(None)
                    }
                } else {
                    Ok(Some(id.to_string()))
                }
            }
            Some((_, Value::Number(n))) => Ok(Some(n.to_string())),
            Some((name, _)) => Err(Rejection::new(
                RejectReason::TypeMismatch,
                name,
                "identifier must be a string or number",
            )),
        }
    }

    fn extract_price(&self, record: &Map<String, Value>) -> Result<Decimal, Rejection> {
        let (name, value) = field(record, PRICE_FIELDS).ok_or_else(|| {
            Rejection::new(RejectReason::MissingField, "price", "required field is absent")
        })?;

        let parsed = match value {
            Value::Number(n) => parse_decimal(&n.to_string()),
            Value::String(s) => parse_decimal(s.trim()),
            _ => None,
        };
        let Some(mut price) = parsed else {
            return Err(Rejection::new(
                RejectReason::InvalidValue,
                name,
                "price is not a numeric value",
            ));
        };

        price.rescale(2);
        if price <= Decimal::ZERO {
            return Err(Rejection::new(
                RejectReason::InvalidValue,
                name,
                "price must be positive",
            ));
        }
        if price > self.config.max_price {
            return Err(Rejection::new(
                RejectReason::InvalidValue,
                name,
                format!("price {} exceeds the plausibility ceiling {}", price, self.config.max_price),
            ));
        }
        Ok(price)
    }

    fn extract_currency(&self, record: &Map<String, Value>) -> Result<String, Rejection> {
        let (name, value) = field(record, CURRENCY_FIELDS).ok_or_else(|| {
            Rejection::new(RejectReason::MissingField, "currency", "required field is absent")
        })?;
        let Value::String(s) = value else {
            return Err(Rejection::new(
                RejectReason::TypeMismatch,
                name,
                "currency must be a string",
            ));
        };
        let code = canonical_text(name, s)?.to_uppercase();
        if !CURRENCY_CODE.is_match(&code) {
            return Err(Rejection::new(
                RejectReason::InvalidValue,
                name,
                format!("'{code}' is not a three-letter currency code"),
            ));
        }
        if let Some(allowed) = &self.config.currencies {
            if !allowed.iter().any(|c| c.eq_ignore_ascii_case(&code)) {
                return Err(Rejection::new(
                    RejectReason::InvalidValue,
                    name,
                    format!("currency '{code}' is not in the allow-list"),
                ));
            }
        }
        Ok(code)
    }
}

fn extract_name(record: &Map<String, Value>) -> Result<String, Rejection> {
    let (name, value) = field(record, NAME_FIELDS).ok_or_else(|| {
        Rejection::new(RejectReason::MissingField, "name", "required field is absent")
    })?;
    let Value::String(s) = value else {
        return Err(Rejection::new(RejectReason::TypeMismatch, name, "name must be a string"));
    };
    let text = canonical_text(name, s)?;
    if text.is_empty() {
        return Err(Rejection::new(
            RejectReason::InvalidValue,
            name,
            "name is empty after trimming",
        ));
    }
    Ok(text)
}

fn extract_availability(record: &Map<String, Value>) -> Result<bool, Rejection> {
    match field(record, AVAILABILITY_FIELDS) {
        // Listings are presumed active when the API omits the flag.
        None => Ok(true),
        Some((_, Value::Bool(b))) => Ok(*b),
        Some((name, Value::String(s))) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "in_stock" | "instock" | "available" => Ok(true),
            "false" | "no" | "n" | "0" | "out_of_stock" | "outofstock" | "unavailable"
            | "sold_out" | "soldout" => Ok(false),
            _ => Err(Rejection::new(
                RejectReason::TypeMismatch,
                name,
                "unrecognized availability value",
            )),
        },
        Some((name, Value::Number(n))) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(Rejection::new(
                RejectReason::TypeMismatch,
                name,
                "numeric availability must be 0 or 1",
            )),
        },
        Some((name, _)) => Err(Rejection::new(
            RejectReason::TypeMismatch,
            name,
            "availability must be a boolean, string, or 0/1",
        )),
    }
}

fn extract_url(record: &Map<String, Value>) -> Result<Option<String>, Rejection> {
    match field(record, URL_FIELDS) {
        None => Ok(None),
        Some((name, Value::String(s))) => {
            ensure_clean(name, s)?;
            let url = s.trim();
            if url.is_empty() {
                return Ok(None);
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Rejection::new(
                    RejectReason::InvalidValue,
                    name,
                    "listing URL must be http(s)",
                ));
            }
            Ok(Some(url.to_string()))
        }
        Some((name, _)) => Err(Rejection::new(
            RejectReason::TypeMismatch,
            name,
            "url must be a string",
        )),
    }
}

/// First present, non-null alias for a canonical field.
fn field<'a>(
    record: &'a Map<String, Value>,
    aliases: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    for &alias in aliases {
        if let Some(value) = record.get(alias) {
            if !value.is_null() {
                return Some((alias, value));
            }
        }
    }
    None
}

/// Reject text that survived transport with broken encoding: replacement
/// characters, or control characters that are not whitespace.
fn ensure_clean(name: &'static str, raw: &str) -> Result<(), Rejection> {
    let broken = raw
        .chars()
        .any(|c| c == '\u{FFFD}' || (c.is_control() && !c.is_whitespace()));
    if broken {
        return Err(Rejection::new(
            RejectReason::MalformedEncoding,
            name,
            "text contains replacement or control characters",
        ));
    }
    Ok(())
}

/// Trim and collapse interior whitespace runs to single spaces.
fn canonical_text(name: &'static str, raw: &str) -> Result<String, Rejection> {
    ensure_clean(name, raw)?;
    Ok(raw.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}
