// src/ingest/validate.rs
//! Schema, range and freshness checks on raw provider payloads.
//!
//! Each data type has a [`RecordSchema`]: the declared fields with their kind
//! and bounds, how the natural key is formed, which field carries the
//! observation time, and how the period type is chosen. Only declared fields
//! survive validation, so undeclared provider noise never changes the
//! content hash.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ProviderConfig;
use crate::error::ValidationError;
use crate::ingest::normalize_text;
use crate::ingest::types::{FieldMap, FieldValue, PeriodType, RawResponse, ValidatedRecord};

/// Default cap for free-text fields.
pub const MAX_TEXT_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Number { min: Option<f64>, max: Option<f64> },
    /// Identifier-like string, whitespace collapsed.
    Text,
    /// Prose: HTML decoded, tags stripped, length capped.
    FreeText,
    /// `YYYY-MM-DD`; may not be later than today.
    Date,
    /// RFC 3339 (or naive, read as UTC); small clock skew tolerated.
    Timestamp,
}

impl FieldKind {
    pub fn non_negative() -> Self {
        FieldKind::Number {
            min: Some(0.0),
            max: None,
        }
    }

    pub fn any_number() -> Self {
        FieldKind::Number { min: None, max: None }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// How the provider-independent natural key is formed.
#[derive(Debug, Clone, PartialEq)]
pub enum NaturalKey {
    /// A single identifying field (accession number).
    Field(String),
    /// Several fields joined; period and observation time complete the key.
    Composite(Vec<String>),
    /// Free text without identity; deduplicated by content hash.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeriodRule {
    Fixed(PeriodType),
    /// Read from a field, falling back to `default` when absent or unknown.
    FromField { field: String, default: PeriodType },
}

#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub data_type: String,
    pub fields: Vec<FieldSpec>,
    pub natural_key: NaturalKey,
    pub observed_at: String,
    pub period: PeriodRule,
    /// Also check the content hash for duplicates under other keys.
    pub content_dedup: bool,
}

impl RecordSchema {
    pub fn new(data_type: impl Into<String>, observed_at: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            fields: Vec::new(),
            natural_key: NaturalKey::None,
            observed_at: observed_at.into(),
            period: PeriodRule::Fixed(PeriodType::Event),
            content_dedup: false,
        }
    }

    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn keyed_by(mut self, key: NaturalKey) -> Self {
        self.natural_key = key;
        self
    }

    pub fn period(mut self, rule: PeriodRule) -> Self {
        self.period = rule;
        self
    }

    pub fn content_dedup(mut self, on: bool) -> Self {
        self.content_dedup = on;
        self
    }

    /// Whether dedup should consult the content-hash index.
    pub fn dedups_by_content(&self) -> bool {
        self.content_dedup || self.natural_key == NaturalKey::None
    }

    fn natural_key_of(&self, fields: &FieldMap) -> Result<Option<String>, ValidationError> {
        let parts: Vec<&String> = match &self.natural_key {
            NaturalKey::None => return Ok(None),
            NaturalKey::Field(f) => vec![f],
            NaturalKey::Composite(fs) => fs.iter().collect(),
        };
        let mut key = self.data_type.clone();
        for name in parts {
            let v = fields.get(name).ok_or_else(|| ValidationError::MissingField {
                field: name.clone(),
            })?;
            key.push(':');
            match v {
                FieldValue::Text(s) => key.push_str(s),
                other => key.push_str(&other.canonical()),
            }
        }
        Ok(Some(key))
    }

    fn period_of(&self, fields: &FieldMap) -> PeriodType {
        match &self.period {
            PeriodRule::Fixed(p) => *p,
            PeriodRule::FromField { field, default } => fields
                .get(field)
                .and_then(|v| v.as_text())
                .and_then(PeriodType::parse)
                .unwrap_or(*default),
        }
    }
}

/// Schemas by data type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, RecordSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filings, quotes, fundamentals and news.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(
            RecordSchema::new("filing", "filed_at")
                .required("accession_number", FieldKind::Text)
                .required("form_type", FieldKind::Text)
                .required("filed_at", FieldKind::Date)
                .optional("company_name", FieldKind::FreeText)
                .optional("cik", FieldKind::Text)
                .optional("period_of_report", FieldKind::Date)
                .keyed_by(NaturalKey::Field("accession_number".into()))
                .period(PeriodRule::Fixed(PeriodType::Event)),
        );
        reg.register(
            RecordSchema::new("quote", "date")
                .required("symbol", FieldKind::Text)
                .required("date", FieldKind::Date)
                .required("close", FieldKind::non_negative())
                .optional("open", FieldKind::non_negative())
                .optional("high", FieldKind::non_negative())
                .optional("low", FieldKind::non_negative())
                .optional("volume", FieldKind::non_negative())
                .keyed_by(NaturalKey::Composite(vec!["symbol".into()]))
                .period(PeriodRule::Fixed(PeriodType::Daily)),
        );
        reg.register(
            RecordSchema::new("fundamental", "period_end")
                .required("symbol", FieldKind::Text)
                .required("metric", FieldKind::Text)
                .required("value", FieldKind::any_number())
                .required("period_end", FieldKind::Date)
                .optional("fiscal_period", FieldKind::Text)
                .optional("currency", FieldKind::Text)
                .keyed_by(NaturalKey::Composite(vec!["symbol".into(), "metric".into()]))
                .period(PeriodRule::FromField {
                    field: "fiscal_period".into(),
                    default: PeriodType::Quarterly,
                }),
        );
        reg.register(
            RecordSchema::new("news", "published_at")
                .required("headline", FieldKind::FreeText)
                .required("published_at", FieldKind::Timestamp)
                .optional("source", FieldKind::Text)
                .optional("url", FieldKind::Text)
                .optional("summary", FieldKind::FreeText)
                .keyed_by(NaturalKey::None)
                .period(PeriodRule::Fixed(PeriodType::Instant))
                .content_dedup(true),
        );
        reg
    }

    pub fn register(&mut self, schema: RecordSchema) {
        self.schemas.insert(schema.data_type.clone(), schema);
    }

    pub fn get(&self, data_type: &str) -> Option<&RecordSchema> {
        self.schemas.get(data_type)
    }
}

/// Per-provider validator: shared schemas plus the provider's epoch and
/// quality floor.
#[derive(Debug, Clone)]
pub struct ResponseValidator {
    schemas: std::sync::Arc<SchemaRegistry>,
    epoch: NaiveDate,
    min_quality: f64,
    timestamp_skew: chrono::Duration,
    max_text_chars: usize,
}

impl ResponseValidator {
    pub fn new(schemas: std::sync::Arc<SchemaRegistry>, epoch: NaiveDate, min_quality: f64) -> Self {
        Self {
            schemas,
            epoch,
            min_quality,
            timestamp_skew: chrono::Duration::minutes(5),
            max_text_chars: MAX_TEXT_CHARS,
        }
    }

    pub fn for_provider(schemas: std::sync::Arc<SchemaRegistry>, cfg: &ProviderConfig) -> Self {
        Self::new(schemas, cfg.epoch, cfg.min_quality)
    }

    pub fn schema(&self, data_type: &str) -> Option<&RecordSchema> {
        self.schemas.get(data_type)
    }

    /// Validate a single-record payload.
    pub fn validate(
        &self,
        data_type: &str,
        raw: &RawResponse,
    ) -> Result<ValidatedRecord, ValidationError> {
        let value = parse_body(raw)?;
        if value.is_array() {
            return Err(ValidationError::Malformed(
                "expected a single record, got an array".into(),
            ));
        }
        self.validate_value(data_type, &raw.provider_id, &value, Utc::now())
    }

    /// Validate a payload holding many records (a bare array, or an object
    /// wrapping one under `data` / `records`). A single object counts as a
    /// batch of one. The outer error means the payload as a whole is unusable.
    pub fn validate_batch(
        &self,
        data_type: &str,
        raw: &RawResponse,
    ) -> Result<Vec<Result<ValidatedRecord, ValidationError>>, ValidationError> {
        if self.schemas.get(data_type).is_none() {
            return Err(ValidationError::UnknownDataType(data_type.to_string()));
        }
        let value = parse_body(raw)?;
        let now = Utc::now();
        let items: Vec<&Value> = match &value {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => match map.get("data").or_else(|| map.get("records")) {
                Some(Value::Array(items)) => items.iter().collect(),
                _ => vec![&value],
            },
            _ => {
                return Err(ValidationError::Malformed(
                    "expected a JSON object or array".into(),
                ))
            }
        };
        Ok(items
            .into_iter()
            .map(|v| self.validate_value(data_type, &raw.provider_id, v, now))
            .collect())
    }

    /// Validate one JSON record against `data_type`'s schema as of `now`.
    pub fn validate_value(
        &self,
        data_type: &str,
        provider_id: &str,
        value: &Value,
        now: DateTime<Utc>,
    ) -> Result<ValidatedRecord, ValidationError> {
        let schema = self
            .schemas
            .get(data_type)
            .ok_or_else(|| ValidationError::UnknownDataType(data_type.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::Malformed("expected a JSON object".into()))?;

        let mut fields = FieldMap::new();
        let mut present = 0usize;
        let mut conforming = 0usize;
        for spec in &schema.fields {
            let Some(raw) = obj.get(&spec.name).filter(|v| !v.is_null()) else {
                if spec.required {
                    return Err(ValidationError::MissingField {
                        field: spec.name.clone(),
                    });
                }
                continue;
            };
            present += 1;
            match self.check_field(spec, raw, now) {
                Ok(v) => {
                    conforming += 1;
                    fields.insert(spec.name.clone(), v);
                }
                Err(e) if spec.required => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        target: "ingest",
                        data_type,
                        field = %spec.name,
                        error = %e,
                        "dropping invalid optional field"
                    );
                }
            }
        }

        let completeness = present as f64 / schema.fields.len().max(1) as f64;
        let conformance = if present == 0 {
            1.0
        } else {
            conforming as f64 / present as f64
        };
        let quality = 0.5 * completeness + 0.5 * conformance;
        if quality < self.min_quality {
            return Err(ValidationError::LowQuality {
                score: quality,
                min: self.min_quality,
            });
        }

        let observed_at = match fields.get(&schema.observed_at) {
            Some(FieldValue::Date(d)) => d.and_time(NaiveTime::MIN).and_utc(),
            Some(FieldValue::Timestamp(t)) => *t,
            _ => {
                return Err(ValidationError::MissingField {
                    field: schema.observed_at.clone(),
                })
            }
        };

        Ok(ValidatedRecord {
            natural_key: schema.natural_key_of(&fields)?,
            content_hash: content_hash(&fields),
            period_type: schema.period_of(&fields),
            observed_at,
            data_type: schema.data_type.clone(),
            provider_id: provider_id.to_string(),
            quality,
            fields,
        })
    }

    fn check_field(
        &self,
        spec: &FieldSpec,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<FieldValue, ValidationError> {
        let name = &spec.name;
        match &spec.kind {
            FieldKind::Number { min, max } => {
                let n = match raw {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|n| n.is_finite())
                .ok_or_else(|| wrong_type(name, "number"))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(ValidationError::OutOfBounds {
                        field: name.clone(),
                        value: n,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(FieldValue::Number(n))
            }
            FieldKind::Text => {
                let s = match raw {
                    Value::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
                    Value::Number(n) => n.to_string(),
                    _ => return Err(wrong_type(name, "string")),
                };
                non_empty(name, s)
            }
            FieldKind::FreeText => {
                let s = raw.as_str().ok_or_else(|| wrong_type(name, "string"))?;
                non_empty(name, normalize_text(s, self.max_text_chars))
            }
            FieldKind::Date => {
                let d = parse_date(raw).ok_or_else(|| wrong_type(name, "date (YYYY-MM-DD)"))?;
                if d > now.date_naive() {
                    return Err(ValidationError::FutureDate {
                        field: name.clone(),
                        value: d.to_string(),
                    });
                }
                self.check_epoch(name, d, d.to_string())?;
                Ok(FieldValue::Date(d))
            }
            FieldKind::Timestamp => {
                let t = parse_timestamp(raw).ok_or_else(|| wrong_type(name, "timestamp"))?;
                if t > now + self.timestamp_skew {
                    return Err(ValidationError::FutureDate {
                        field: name.clone(),
                        value: t.to_rfc3339(),
                    });
                }
                self.check_epoch(name, t.date_naive(), t.to_rfc3339())?;
                Ok(FieldValue::Timestamp(t))
            }
        }
    }

    fn check_epoch(&self, name: &str, d: NaiveDate, shown: String) -> Result<(), ValidationError> {
        if d < self.epoch {
            return Err(ValidationError::BeforeEpoch {
                field: name.to_string(),
                value: shown,
                epoch: self.epoch.to_string(),
            });
        }
        Ok(())
    }
}

/// SHA-256 hex over `name=canonical` lines in field-name order.
pub fn content_hash(fields: &FieldMap) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.canonical().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn parse_body(raw: &RawResponse) -> Result<Value, ValidationError> {
    if !raw.is_success() {
        return Err(ValidationError::Malformed(format!(
            "unexpected HTTP status {}",
            raw.status_code
        )));
    }
    serde_json::from_str(&raw.body)
        .map_err(|e| ValidationError::Malformed(format!("invalid JSON: {e}")))
}

fn wrong_type(field: &str, expected: &'static str) -> ValidationError {
    ValidationError::WrongType {
        field: field.to_string(),
        expected,
    }
}

fn non_empty(field: &str, s: String) -> Result<FieldValue, ValidationError> {
    if s.is_empty() {
        Err(ValidationError::EmptyField {
            field: field.to_string(),
        })
    } else {
        Ok(FieldValue::Text(s))
    }
}

fn parse_date(v: &Value) -> Option<NaiveDate> {
    let s = v.as_str()?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.date_naive()))
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                        .ok()
                        .map(|n| n.and_utc())
                })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn validator() -> ResponseValidator {
        ResponseValidator::new(
            Arc::new(SchemaRegistry::builtin()),
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            0.6,
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn filing_validates_with_natural_key() {
        let rec = validator()
            .validate_value(
                "filing",
                "edgar",
                &json!({
                    "accession_number": "0000320193-24-000069",
                    "form_type": "10-Q",
                    "filed_at": "2024-05-03",
                    "company_name": "Apple&nbsp;Inc.",
                    "ignored": "noise"
                }),
                now(),
            )
            .unwrap();
        assert_eq!(rec.natural_key.as_deref(), Some("filing:0000320193-24-000069"));
        assert_eq!(rec.period_type, PeriodType::Event);
        assert_eq!(rec.observed_at, Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap());
        assert_eq!(
            rec.fields.get("company_name"),
            Some(&FieldValue::Text("Apple Inc.".into()))
        );
        assert!(!rec.fields.contains_key("ignored"));
        assert_eq!(rec.content_hash.len(), 64);
    }

    #[test]
    fn filing_ten_years_ahead_is_rejected() {
        let err = validator()
            .validate_value(
                "filing",
                "edgar",
                &json!({"accession_number": "x", "form_type": "8-K", "filed_at": "2034-06-01"}),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::FutureDate { .. }));
    }

    #[test]
    fn dates_before_epoch_are_rejected() {
        let err = validator()
            .validate_value(
                "quote",
                "av",
                &json!({"symbol": "IBM", "date": "1980-01-02", "close": 10.0}),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::BeforeEpoch { .. }));
    }

    #[test]
    fn required_bound_violation_is_fatal_optional_is_dropped() {
        let v = validator();
        let err = v
            .validate_value(
                "quote",
                "av",
                &json!({"symbol": "IBM", "date": "2024-05-31", "close": -1}),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfBounds { .. }));

        let rec = v
            .validate_value(
                "quote",
                "av",
                &json!({"symbol": "IBM", "date": "2024-05-31", "close": "171.5", "volume": -5}),
                now(),
            )
            .unwrap();
        assert!(!rec.fields.contains_key("volume"));
        assert_eq!(rec.fields.get("close"), Some(&FieldValue::Number(171.5)));
        // 4 of 7 present, 3 of 4 conforming.
        let expected = 0.5 * (4.0 / 7.0) + 0.5 * 0.75;
        assert!((rec.quality - expected).abs() < 1e-9);
    }

    #[test]
    fn low_quality_is_rejected() {
        let v = ResponseValidator::new(
            Arc::new(SchemaRegistry::builtin()),
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            0.9,
        );
        let err = v
            .validate_value(
                "quote",
                "av",
                &json!({"symbol": "IBM", "date": "2024-05-31", "close": 1}),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::LowQuality { .. }));
    }

    #[test]
    fn missing_and_empty_required_fields() {
        let v = validator();
        let err = v
            .validate_value("quote", "av", &json!({"symbol": "IBM", "close": 1}), now())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "date".into() });

        let err = v
            .validate_value(
                "news",
                "wire",
                &json!({"headline": "  <b> </b> ", "published_at": "2024-06-01T10:00:00Z"}),
                now(),
            )
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptyField { field: "headline".into() });
    }

    #[test]
    fn hash_ignores_key_order_and_noise() {
        let v = validator();
        let a = v
            .validate_value(
                "quote",
                "av",
                &json!({"symbol": "IBM", "date": "2024-05-31", "close": 171.5, "x": 1}),
                now(),
            )
            .unwrap();
        let b = v
            .validate_value(
                "quote",
                "other",
                &json!({"close": 171.50, "date": "2024-05-31", "symbol": " IBM "}),
                now(),
            )
            .unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.record_key(), b.record_key());
    }

    #[test]
    fn fundamental_period_comes_from_field() {
        let rec = validator()
            .validate_value(
                "fundamental",
                "av",
                &json!({
                    "symbol": "MSFT", "metric": "revenue", "value": 6.1e10,
                    "period_end": "2023-12-31", "fiscal_period": "FY"
                }),
                now(),
            )
            .unwrap();
        assert_eq!(rec.period_type, PeriodType::Annual);
        assert_eq!(rec.natural_key.as_deref(), Some("fundamental:MSFT:revenue"));
    }

    #[test]
    fn news_is_keyless_and_tolerates_small_skew() {
        let rec = validator()
            .validate_value(
                "news",
                "wire",
                &json!({"headline": "Fed holds rates", "published_at": "2024-06-01T12:03:00Z"}),
                now(),
            )
            .unwrap();
        assert!(rec.natural_key.is_none());
        assert!(rec.record_key().natural_key.starts_with("sha256:"));

        let err = validator()
            .validate_value(
                "news",
                "wire",
                &json!({"headline": "Fed holds rates", "published_at": "2024-06-01T13:00:00Z"}),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::FutureDate { .. }));
    }

    #[test]
    fn batch_accepts_envelopes_and_keeps_per_item_results() {
        let raw = RawResponse::ok(
            "av",
            r#"{"data": [
                {"symbol": "IBM", "date": "2020-01-02", "close": 1},
                {"symbol": "IBM", "date": "2020-01-03"}
            ]}"#,
        );
        let out = validator().validate_batch("quote", &raw).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
    }

    #[test]
    fn non_json_and_error_status_are_malformed() {
        let v = validator();
        let err = v.validate("quote", &RawResponse::ok("av", "<html>")).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
        let err = v
            .validate("quote", &RawResponse::with_status("av", 500, "{}"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
        let err = v.validate("crypto", &RawResponse::ok("av", "{}")).unwrap_err();
        assert_eq!(err, ValidationError::UnknownDataType("crypto".into()));
    }
}
