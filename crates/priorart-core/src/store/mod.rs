//! SQLite metadata store
//!
//! One row per record. `classification_codes` holds a JSON array of CPC code
//! strings so that CPC predicates can be evaluated with `json_each` and bound
//! parameters only.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder};

use crate::error::{PriorArtError, Result};
use crate::record::{CpcFilter, DateRange, Record, RecordId};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SELECT_RECORDS: &str =
    "SELECT id, patent_number, date, title, classification_codes, claim_text FROM records";

const SELECT_RECORD_BY_ID: &str = "SELECT id, patent_number, date, title, classification_codes, \
     claim_text FROM records WHERE id = ?";

#[derive(Debug, FromRow)]
struct DbRecord {
    id: i64,
    patent_number: String,
    date: String,
    title: String,
    classification_codes: String,
    claim_text: String,
}

impl TryFrom<DbRecord> for Record {
    type Error = PriorArtError;

    fn try_from(row: DbRecord) -> Result<Self> {
        let date = NaiveDate::parse_from_str(&row.date, DATE_FORMAT).map_err(|e| {
            PriorArtError::MalformedRecord {
                id: row.id,
                reason: format!("invalid date '{}': {}", row.date, e),
            }
        })?;
        let classification_codes: Vec<String> = serde_json::from_str(&row.classification_codes)
            .map_err(|e| PriorArtError::MalformedRecord {
                id: row.id,
                reason: format!("invalid classification codes: {}", e),
            })?;
        Ok(Record {
            id: RecordId(row.id),
            patent_number: row.patent_number,
            date,
            title: row.title,
            classification_codes,
            claim_text: row.claim_text,
        })
    }
}

/// Read access to record metadata, plus the writes ingestion needs
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open an existing database for queries only
    pub async fn open_read_only(url: &str) -> Result<Self> {
        tracing::info!("Opening metadata store (read-only): {}", url);
        let options = SqliteConnectOptions::from_str(url)?.read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Open or create a database and make sure the schema exists
    pub async fn open_writable(url: &str) -> Result<Self> {
        tracing::info!("Opening metadata store: {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        tracing::info!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY,
                patent_number TEXT NOT NULL,
                date TEXT NOT NULL,
                title TEXT NOT NULL,
                classification_codes TEXT NOT NULL DEFAULT '[]',
                claim_text TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_date ON records(date)
            "#,
        )
        .execute(pool)
        .await?;

        tracing::info!("Migrations complete");
        Ok(())
    }

    /// Insert or replace records in one transaction
    pub async fn insert_records(&self, records: &[Record]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let codes = serde_json::to_string(&record.classification_codes).map_err(|e| {
                PriorArtError::MalformedRecord {
                    id: record.id.0,
                    reason: e.to_string(),
                }
            })?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO records
                    (id, patent_number, date, title, classification_codes, claim_text)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id.0)
            .bind(&record.patent_number)
            .bind(record.date.format(DATE_FORMAT).to_string())
            .bind(&record.title)
            .bind(codes)
            .bind(&record.claim_text)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!("Inserted {} records", records.len());
        Ok(())
    }

    /// Fetch the records among `ids` that pass the date window and CPC filter.
    ///
    /// Ids that do not exist or do not pass are absent from the map. An empty
    /// `ids` slice returns an empty map without touching the database.
    pub async fn get_records(
        &self,
        ids: &[RecordId],
        dates: &DateRange,
        cpc: Option<&CpcFilter>,
    ) -> Result<HashMap<RecordId, Record>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let id_list = serde_json::to_string(&ids.iter().map(|id| id.0).collect::<Vec<_>>())
            .map_err(|e| PriorArtError::Input(format!("cannot encode id list: {}", e)))?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_RECORDS);
        query.push(" WHERE id IN (SELECT value FROM json_each(");
        query.push_bind(id_list);
        query.push(")) AND date >= ");
        query.push_bind(dates.lower().format(DATE_FORMAT).to_string());
        query.push(" AND date <= ");
        query.push_bind(dates.upper().format(DATE_FORMAT).to_string());

        if let Some(filter) = cpc.filter(|f| !f.is_empty()) {
            query.push(" AND (");
            for (i, code) in filter.codes().iter().enumerate() {
                if i > 0 {
                    query.push(filter.operator().sql_keyword());
                }
                query.push(
                    "EXISTS (SELECT 1 FROM json_each(records.classification_codes) AS cpc \
                     WHERE instr(upper(cpc.value), upper(",
                );
                query.push_bind(code.clone());
                query.push(")) > 0)");
            }
            query.push(")");
        }

        let rows: Vec<DbRecord> = query.build_query_as().fetch_all(&self.pool).await?;

        let mut records = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = Record::try_from(row)?;
            records.insert(record.id, record);
        }

        tracing::debug!(
            "Store returned {} of {} requested records",
            records.len(),
            ids.len()
        );
        Ok(records)
    }

    pub async fn get_record(&self, id: RecordId) -> Result<Option<Record>> {
        let row: Option<DbRecord> = sqlx::query_as(SELECT_RECORD_BY_ID)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Record::try_from).transpose()
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Largest record id, `None` when the table is empty
    pub async fn max_id(&self) -> Result<Option<RecordId>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(RecordId))
    }

    /// Claim texts with id greater than `after`, in id order
    pub async fn claim_batch(&self, after: RecordId, limit: usize) -> Result<Vec<(RecordId, String)>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, claim_text FROM records WHERE id > ? ORDER BY id LIMIT ?")
                .bind(after.0)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id, text)| (RecordId(id), text)).collect())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
