// src/ingest/types.rs
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One logical fetch against one provider. Built fresh for every call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub provider_id: String,
    pub entity_key: String,
    pub data_type: String,
    /// Ordered so cache keys and URLs are deterministic.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(
        provider_id: impl Into<String>,
        entity_key: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            entity_key: entity_key.into(),
            data_type: data_type.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.params.insert(k.into(), v.into());
        self
    }

    /// Stable cache key: provider, data type, entity and sorted params.
    pub fn cache_key(&self) -> String {
        let mut key = format!(
            "{}:{}:{}",
            self.provider_id, self.data_type, self.entity_key
        );
        for (k, v) in &self.params {
            key.push_str(&format!(":{k}={v}"));
        }
        key
    }
}

/// Unparsed provider answer, whatever the status code.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status_code: u16,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub provider_id: String,
    /// Seconds from a `Retry-After` header, when the provider sent one.
    pub retry_after_secs: Option<u64>,
}

impl RawResponse {
    pub fn ok(provider_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::with_status(provider_id, 200, body)
    }

    pub fn with_status(provider_id: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            status_code: status,
            body: body.into(),
            received_at: Utc::now(),
            provider_id: provider_id.into(),
            retry_after_secs: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A normalized field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Canonical string form fed into the content hash.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Number(n) => {
                // -0.0 and 0.0 must hash the same.
                let n = if *n == 0.0 { 0.0 } else { *n };
                format!("n:{n}")
            }
            FieldValue::Text(s) => format!("s:{s}"),
            FieldValue::Date(d) => format!("d:{}", d.format("%Y-%m-%d")),
            FieldValue::Timestamp(t) => format!("t:{}", t.to_rfc3339()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Granularity of the observation; part of the storage identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Instant,
    Daily,
    Quarterly,
    Annual,
    Event,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Instant => "instant",
            PeriodType::Daily => "daily",
            PeriodType::Quarterly => "quarterly",
            PeriodType::Annual => "annual",
            PeriodType::Event => "event",
        }
    }

    /// Accepts the provider spellings seen in fundamentals feeds ("Q", "FY", ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Some(PeriodType::Instant),
            "daily" | "d" | "1d" => Some(PeriodType::Daily),
            "quarterly" | "q" | "q1" | "q2" | "q3" | "q4" => Some(PeriodType::Quarterly),
            "annual" | "fy" | "y" | "yearly" => Some(PeriodType::Annual),
            "event" => Some(PeriodType::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the validator. Only validated records reach dedup and storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedRecord {
    /// `None` for keyless records (free-text news); those dedup by hash only.
    pub natural_key: Option<String>,
    pub content_hash: String,
    pub fields: FieldMap,
    pub observed_at: DateTime<Utc>,
    pub period_type: PeriodType,
    pub data_type: String,
    pub provider_id: String,
    /// Completeness and bound conformance, 0..=1.
    pub quality: f64,
}

impl ValidatedRecord {
    /// Unique storage identity of this record.
    pub fn record_key(&self) -> RecordKey {
        let natural_key = match &self.natural_key {
            Some(k) => k.clone(),
            None => format!("sha256:{}", self.content_hash),
        };
        RecordKey {
            natural_key,
            period_type: self.period_type,
            observed_at: self.observed_at,
        }
    }
}

/// The UNIQUE (natural_key, period_type, observed_at) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub natural_key: String,
    pub period_type: PeriodType,
    pub observed_at: DateTime<Utc>,
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.natural_key,
            self.period_type,
            self.observed_at.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DedupDecision {
    Insert,
    UpdateChanged,
    SkipUnchanged,
    SkipDuplicate,
}

/// Durable row. Identity fields never change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub natural_key: String,
    pub period_type: PeriodType,
    pub observed_at: DateTime<Utc>,
    pub data_type: String,
    pub created_at: DateTime<Utc>,
    // mutable
    pub content_hash: String,
    pub fields: FieldMap,
    pub confidence: f64,
    pub provider_id: String,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl PersistedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            natural_key: self.natural_key.clone(),
            period_type: self.period_type,
            observed_at: self.observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_order_independent() {
        let a = FetchRequest::new("av", "AAPL", "quote")
            .with_param("interval", "1d")
            .with_param("adjusted", "true");
        let b = FetchRequest::new("av", "AAPL", "quote")
            .with_param("adjusted", "true")
            .with_param("interval", "1d");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "av:quote:AAPL:adjusted=true:interval=1d");
    }

    #[test]
    fn negative_zero_canonicalizes() {
        assert_eq!(
            FieldValue::Number(-0.0).canonical(),
            FieldValue::Number(0.0).canonical()
        );
    }

    #[test]
    fn period_aliases() {
        assert_eq!(PeriodType::parse("FY"), Some(PeriodType::Annual));
        assert_eq!(PeriodType::parse(" q3 "), Some(PeriodType::Quarterly));
        assert_eq!(PeriodType::parse("weekly"), None);
    }
}
