// src/ingest/store.rs
//! Durable record storage and the idempotent upsert writer.
//!
//! Every write goes through one primitive, [`RecordStore::upsert`]: insert,
//! or on a key conflict update *only if* the stored content hash still equals
//! the hash the writer last saw. Concurrent writers therefore never create
//! duplicate rows and never silently overwrite each other; the loser gets
//! `StorageConflict` and [`UpsertRepository`] resolves it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;

use crate::error::{FinalError, IngestError};
use crate::ingest::dedup::Resolution;
use crate::ingest::types::{DedupDecision, FieldMap, PersistedRecord, RecordKey, ValidatedRecord};
use crate::limits::retry::{BackoffPolicy, RetryExecutor};

/// Identity plus the mutable content of a row about to be written.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub key: RecordKey,
    pub data_type: String,
    pub content_hash: String,
    pub fields: FieldMap,
    pub confidence: f64,
    pub provider_id: String,
}

impl From<&ValidatedRecord> for RecordDraft {
    fn from(rec: &ValidatedRecord) -> Self {
        Self {
            key: rec.record_key(),
            data_type: rec.data_type.clone(),
            content_hash: rec.content_hash.clone(),
            fields: rec.fields.clone(),
            confidence: rec.quality,
            provider_id: rec.provider_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upserted {
    pub record: PersistedRecord,
    pub inserted: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<PersistedRecord>, IngestError>;

    async fn find_by_content_hash(
        &self,
        data_type: &str,
        content_hash: &str,
    ) -> Result<Option<PersistedRecord>, IngestError>;

    /// Insert, or update on key conflict when the stored hash equals
    /// `expected_hash`. `None` expects no row. A failed precondition is
    /// `StorageConflict`.
    async fn upsert(
        &self,
        draft: &RecordDraft,
        expected_hash: Option<&str>,
    ) -> Result<Upserted, IngestError>;

    async fn count(&self) -> Result<usize, IngestError>;
}

/// In-process store. The per-key DashMap entry lock is the conflict primitive.
#[derive(Debug)]
pub struct MemoryStore {
    rows: DashMap<RecordKey, PersistedRecord>,
    by_hash: DashMap<(String, String), RecordKey>,
    next_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
            by_hash: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<PersistedRecord> {
        let mut rows: Vec<_> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.id);
        rows
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<PersistedRecord>, IngestError> {
        Ok(self.rows.get(key).map(|r| r.value().clone()))
    }

    async fn find_by_content_hash(
        &self,
        data_type: &str,
        content_hash: &str,
    ) -> Result<Option<PersistedRecord>, IngestError> {
        let key = self
            .by_hash
            .get(&(data_type.to_string(), content_hash.to_string()))
            .map(|k| k.value().clone());
        Ok(key.and_then(|k| self.rows.get(&k).map(|r| r.value().clone())))
    }

    async fn upsert(
        &self,
        draft: &RecordDraft,
        expected_hash: Option<&str>,
    ) -> Result<Upserted, IngestError> {
        let now = Utc::now();
        let (record, inserted, old_hash) = match self.rows.entry(draft.key.clone()) {
            Entry::Vacant(slot) => {
                let row = PersistedRecord {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    natural_key: draft.key.natural_key.clone(),
                    period_type: draft.key.period_type,
                    observed_at: draft.key.observed_at,
                    data_type: draft.data_type.clone(),
                    created_at: now,
                    content_hash: draft.content_hash.clone(),
                    fields: draft.fields.clone(),
                    confidence: draft.confidence,
                    provider_id: draft.provider_id.clone(),
                    updated_at: now,
                    version: 1,
                };
                slot.insert(row.clone());
                (row, true, None)
            }
            Entry::Occupied(mut slot) => {
                if expected_hash != Some(slot.get().content_hash.as_str()) {
                    return Err(IngestError::StorageConflict {
                        key: draft.key.to_string(),
                    });
                }
                let row = slot.get_mut();
                let old = std::mem::replace(&mut row.content_hash, draft.content_hash.clone());
                row.fields = draft.fields.clone();
                row.confidence = draft.confidence;
                row.provider_id = draft.provider_id.clone();
                row.updated_at = now;
                row.version += 1;
                (row.clone(), false, Some(old))
            }
        };

        if let Some(old) = old_hash {
            self.by_hash
                .remove_if(&(draft.data_type.clone(), old), |_, k| *k == draft.key);
        }
        self.by_hash
            .entry((draft.data_type.clone(), draft.content_hash.clone()))
            .or_insert_with(|| draft.key.clone());
        Ok(Upserted { record, inserted })
    }

    async fn count(&self) -> Result<usize, IngestError> {
        Ok(self.rows.len())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgRecordStore;

#[cfg(feature = "postgres")]
mod pg {
    //! Postgres-backed store. [`PgRecordStore::ensure_schema`] creates the
    //! table and its indexes when missing.

    use super::*;
    use chrono::DateTime;
    use sqlx::types::Json;
    use sqlx::PgPool;

    use crate::ingest::types::PeriodType;

    const COLUMNS: &str = "id, natural_key, period_type, observed_at, data_type, created_at, \
                           content_hash, fields, confidence, provider_id, updated_at, version";

    #[derive(Debug, sqlx::FromRow)]
    struct Row {
        id: i64,
        natural_key: String,
        period_type: String,
        observed_at: DateTime<Utc>,
        data_type: String,
        created_at: DateTime<Utc>,
        content_hash: String,
        fields: Json<FieldMap>,
        confidence: f64,
        provider_id: String,
        updated_at: DateTime<Utc>,
        version: i32,
    }

    #[derive(Debug, sqlx::FromRow)]
    struct UpsertRow {
        #[sqlx(flatten)]
        row: Row,
        inserted: bool,
    }

    impl TryFrom<Row> for PersistedRecord {
        type Error = IngestError;

        fn try_from(r: Row) -> Result<Self, Self::Error> {
            let period_type = PeriodType::parse(&r.period_type).ok_or_else(|| {
                IngestError::Storage(format!("unknown period_type '{}'", r.period_type))
            })?;
            Ok(PersistedRecord {
                id: r.id,
                natural_key: r.natural_key,
                period_type,
                observed_at: r.observed_at,
                data_type: r.data_type,
                created_at: r.created_at,
                content_hash: r.content_hash,
                fields: r.fields.0,
                confidence: r.confidence,
                provider_id: r.provider_id,
                updated_at: r.updated_at,
                version: r.version,
            })
        }
    }

    const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS ingested_records (
        id           BIGSERIAL PRIMARY KEY,
        natural_key  TEXT NOT NULL,
        period_type  TEXT NOT NULL,
        observed_at  TIMESTAMPTZ NOT NULL,
        data_type    TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        fields       JSONB NOT NULL,
        confidence   DOUBLE PRECISION NOT NULL,
        provider_id  TEXT NOT NULL,
        version      INTEGER NOT NULL DEFAULT 1,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (natural_key, period_type, observed_at)
    )";

    const CREATE_HASH_INDEX: &str = "CREATE INDEX IF NOT EXISTS ingested_records_hash_idx \
                                     ON ingested_records (data_type, content_hash)";

    fn storage_err(e: sqlx::Error) -> IngestError {
        IngestError::Storage(e.to_string())
    }

    #[derive(Debug, Clone)]
    pub struct PgRecordStore {
        pool: PgPool,
    }

    impl PgRecordStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn connect(url: &str) -> Result<Self, IngestError> {
            let pool = PgPool::connect(url).await.map_err(storage_err)?;
            Ok(Self::new(pool))
        }

        /// Idempotent; safe to run on every start.
        pub async fn ensure_schema(&self) -> Result<(), IngestError> {
            for ddl in [CREATE_TABLE, CREATE_HASH_INDEX] {
                sqlx::query(ddl)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordStore for PgRecordStore {
        async fn get(&self, key: &RecordKey) -> Result<Option<PersistedRecord>, IngestError> {
            let sql = format!(
                "SELECT {COLUMNS} FROM ingested_records \
                 WHERE natural_key = $1 AND period_type = $2 AND observed_at = $3"
            );
            let row: Option<Row> = sqlx::query_as(&sql)
                .bind(&key.natural_key)
                .bind(key.period_type.as_str())
                .bind(key.observed_at)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
            row.map(PersistedRecord::try_from).transpose()
        }

        async fn find_by_content_hash(
            &self,
            data_type: &str,
            content_hash: &str,
        ) -> Result<Option<PersistedRecord>, IngestError> {
            let sql = format!(
                "SELECT {COLUMNS} FROM ingested_records \
                 WHERE data_type = $1 AND content_hash = $2 ORDER BY id LIMIT 1"
            );
            let row: Option<Row> = sqlx::query_as(&sql)
                .bind(data_type)
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
            row.map(PersistedRecord::try_from).transpose()
        }

        async fn upsert(
            &self,
            draft: &RecordDraft,
            expected_hash: Option<&str>,
        ) -> Result<Upserted, IngestError> {
            // `content_hash = NULL` never matches, so an insert-intent write
            // that hits an existing row returns nothing.
            let sql = format!(
                r#"
                INSERT INTO ingested_records
                    (natural_key, period_type, observed_at, data_type,
                     content_hash, fields, confidence, provider_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (natural_key, period_type, observed_at)
                DO UPDATE SET
                    content_hash = EXCLUDED.content_hash,
                    fields       = EXCLUDED.fields,
                    confidence   = EXCLUDED.confidence,
                    provider_id  = EXCLUDED.provider_id,
                    updated_at   = now(),
                    version      = ingested_records.version + 1
                WHERE ingested_records.content_hash = $9
                RETURNING {COLUMNS}, (xmax = 0) AS inserted
                "#
            );
            let row: Option<UpsertRow> = sqlx::query_as(&sql)
                .bind(&draft.key.natural_key)
                .bind(draft.key.period_type.as_str())
                .bind(draft.key.observed_at)
                .bind(&draft.data_type)
                .bind(&draft.content_hash)
                .bind(Json(&draft.fields))
                .bind(draft.confidence)
                .bind(&draft.provider_id)
                .bind(expected_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
            match row {
                Some(r) => Ok(Upserted {
                    inserted: r.inserted,
                    record: r.row.try_into()?,
                }),
                None => Err(IngestError::StorageConflict {
                    key: draft.key.to_string(),
                }),
            }
        }

        async fn count(&self) -> Result<usize, IngestError> {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ingested_records")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?;
            Ok(n.max(0) as usize)
        }
    }
}

/// Effective result of [`UpsertRepository::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Inserted,
    Updated,
    /// Same key, same content: nothing written.
    Unchanged,
    /// Same content already stored under another key: nothing written.
    Duplicate,
}

impl WriteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteAction::Inserted => "inserted",
            WriteAction::Updated => "updated",
            WriteAction::Unchanged => "unchanged",
            WriteAction::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub record: PersistedRecord,
    pub action: WriteAction,
}

pub struct UpsertRepository {
    store: Arc<dyn RecordStore>,
    retry: RetryExecutor,
}

impl UpsertRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_policy(store, BackoffPolicy::storage())
    }

    pub fn with_policy(store: Arc<dyn RecordStore>, policy: BackoffPolicy) -> Self {
        Self {
            store,
            retry: RetryExecutor::new("storage", policy),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Apply a dedup resolution. Skips return the existing row untouched.
    pub async fn write(
        &self,
        rec: &ValidatedRecord,
        resolution: &Resolution,
    ) -> Result<WriteResult, FinalError> {
        let result = match resolution.decision {
            DedupDecision::SkipUnchanged | DedupDecision::SkipDuplicate => {
                let action = if resolution.decision == DedupDecision::SkipUnchanged {
                    WriteAction::Unchanged
                } else {
                    WriteAction::Duplicate
                };
                match &resolution.existing {
                    Some(existing) => WriteResult {
                        record: existing.clone(),
                        action,
                    },
                    // Resolution without its row: fall back to a guarded write.
                    None => self.upsert(rec, None).await?,
                }
            }
            DedupDecision::Insert => self.upsert(rec, None).await?,
            DedupDecision::UpdateChanged => {
                let expected = resolution.existing.as_ref().map(|e| e.content_hash.clone());
                self.upsert(rec, expected).await?
            }
        };
        counter!("ingest_records_total", "action" => result.action.as_str()).increment(1);
        Ok(result)
    }

    async fn upsert(
        &self,
        rec: &ValidatedRecord,
        expected: Option<String>,
    ) -> Result<WriteResult, FinalError> {
        let draft = RecordDraft::from(rec);
        let expected = Mutex::new(expected);
        let store = &self.store;
        let draft = &draft;
        let expected = &expected;

        self.retry
            .run(|_| {
                let guess = expected.lock().expect("expected-hash mutex poisoned").clone();
                async move {
                    match store.upsert(draft, guess.as_deref()).await {
                        Ok(up) => Ok(WriteResult {
                            action: if up.inserted {
                                WriteAction::Inserted
                            } else {
                                WriteAction::Updated
                            },
                            record: up.record,
                        }),
                        Err(IngestError::StorageConflict { key }) => {
                            // Lost a race: look at the winner's row.
                            let winner = store.get(&draft.key).await?;
                            match winner {
                                Some(w) if w.content_hash == draft.content_hash => Ok(WriteResult {
                                    record: w,
                                    action: WriteAction::Unchanged,
                                }),
                                other => {
                                    *expected.lock().expect("expected-hash mutex poisoned") =
                                        other.map(|w| w.content_hash);
                                    tracing::debug!(target: "ingest", %key, "write conflict, retrying as update");
                                    Err(IngestError::StorageConflict { key })
                                }
                            }
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .await
    }
}
