// src/ingest/dedup.rs
//! Insert / update / skip decisions for validated records.

use std::sync::Arc;

use crate::error::IngestError;
use crate::ingest::store::RecordStore;
use crate::ingest::types::{DedupDecision, PersistedRecord, ValidatedRecord};
use crate::ingest::validate::SchemaRegistry;

/// A decision plus the row it was made against, so skips can return it
/// without another read.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: DedupDecision,
    pub existing: Option<PersistedRecord>,
}

impl Resolution {
    fn new(decision: DedupDecision, existing: Option<PersistedRecord>) -> Self {
        Self { decision, existing }
    }
}

/// One deduplicator for every data type. The natural-key strategy comes from
/// the record's schema (already applied by the validator); the schema also
/// says whether the content-hash index is consulted.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn RecordStore>,
    schemas: Arc<SchemaRegistry>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn RecordStore>, schemas: Arc<SchemaRegistry>) -> Self {
        Self { store, schemas }
    }

    pub async fn resolve(&self, rec: &ValidatedRecord) -> Result<Resolution, IngestError> {
        let by_content = rec.natural_key.is_none()
            || self
                .schemas
                .get(&rec.data_type)
                .is_some_and(|s| s.dedups_by_content());

        // Keyless records have no identity beyond their content.
        if rec.natural_key.is_none() {
            if let Some(dup) = self.content_match(rec).await? {
                return Ok(Resolution::new(DedupDecision::SkipDuplicate, Some(dup)));
            }
            return Ok(Resolution::new(DedupDecision::Insert, None));
        }

        if let Some(existing) = self.store.get(&rec.record_key()).await? {
            let decision = if existing.content_hash == rec.content_hash {
                DedupDecision::SkipUnchanged
            } else {
                DedupDecision::UpdateChanged
            };
            return Ok(Resolution::new(decision, Some(existing)));
        }

        if by_content {
            if let Some(dup) = self.content_match(rec).await? {
                return Ok(Resolution::new(DedupDecision::SkipDuplicate, Some(dup)));
            }
        }
        Ok(Resolution::new(DedupDecision::Insert, None))
    }

    async fn content_match(
        &self,
        rec: &ValidatedRecord,
    ) -> Result<Option<PersistedRecord>, IngestError> {
        self.store
            .find_by_content_hash(&rec.data_type, &rec.content_hash)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::store::{MemoryStore, RecordDraft};
    use crate::ingest::types::{FieldMap, FieldValue, PeriodType};
    use chrono::{TimeZone, Utc};

    fn record(key: Option<&str>, hash: &str, data_type: &str) -> ValidatedRecord {
        ValidatedRecord {
            natural_key: key.map(str::to_string),
            content_hash: hash.into(),
            fields: FieldMap::from([("headline".to_string(), FieldValue::Text("x".into()))]),
            observed_at: Utc.with_ymd_and_hms(2024, 5, 31, 9, 30, 0).unwrap(),
            period_type: PeriodType::Instant,
            data_type: data_type.into(),
            provider_id: "wire".into(),
            quality: 1.0,
        }
    }

    fn dedup(store: Arc<MemoryStore>) -> Deduplicator {
        Deduplicator::new(store, Arc::new(SchemaRegistry::builtin()))
    }

    #[tokio::test]
    async fn keyed_decisions() {
        let store = Arc::new(MemoryStore::new());
        let d = dedup(store.clone());
        let rec = record(Some("filing:1"), "h1", "filing");
        assert_eq!(d.resolve(&rec).await.unwrap().decision, DedupDecision::Insert);

        store.upsert(&RecordDraft::from(&rec), None).await.unwrap();
        let res = d.resolve(&rec).await.unwrap();
        assert_eq!(res.decision, DedupDecision::SkipUnchanged);
        assert_eq!(res.existing.unwrap().content_hash, "h1");

        let changed = record(Some("filing:1"), "h2", "filing");
        assert_eq!(
            d.resolve(&changed).await.unwrap().decision,
            DedupDecision::UpdateChanged
        );
    }

    #[tokio::test]
    async fn keyless_records_dedup_by_content() {
        let store = Arc::new(MemoryStore::new());
        let d = dedup(store.clone());
        let a = record(None, "same", "news");
        store.upsert(&RecordDraft::from(&a), None).await.unwrap();

        let mut b = record(None, "same", "news");
        b.provider_id = "other-wire".into();
        assert_eq!(d.resolve(&b).await.unwrap().decision, DedupDecision::SkipDuplicate);

        let c = record(None, "different", "news");
        assert_eq!(d.resolve(&c).await.unwrap().decision, DedupDecision::Insert);
    }

    #[tokio::test]
    async fn content_dedup_applies_to_opted_in_keyed_types() {
        let store = Arc::new(MemoryStore::new());
        let d = dedup(store.clone());
        let a = record(Some("news:a"), "same", "news");
        store.upsert(&RecordDraft::from(&a), None).await.unwrap();
        let b = record(Some("news:b"), "same", "news");
        assert_eq!(d.resolve(&b).await.unwrap().decision, DedupDecision::SkipDuplicate);

        // Quotes do not opt in: equal content under a new key is a new row.
        let q1 = record(Some("quote:A"), "q", "quote");
        store.upsert(&RecordDraft::from(&q1), None).await.unwrap();
        let q2 = record(Some("quote:B"), "q", "quote");
        assert_eq!(d.resolve(&q2).await.unwrap().decision, DedupDecision::Insert);
    }
}
