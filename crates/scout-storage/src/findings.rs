//! SQLite-backed findings archive and keyword/site registry.
//!
//! Every read goes to the database; nothing is cached in memory. The unique
//! index on `findings.url` is the only dedup mechanism.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use scout_core::{Finding, Keyword, Registry, RegistryError, SourceDescriptor, Target};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("invalid retention window: {0}")]
    InvalidRetention(String),
}

#[derive(Debug, Clone)]
pub struct ScoutStore {
    pool: SqlitePool,
}

impl ScoutStore {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            // a dropped connection would take the whole database with it
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Archive `finding` unless its URL is already stored. Returns whether a row was written.
    pub async fn insert_if_new(&self, finding: &Finding) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO findings (url, target, source, title, price, discovered_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(finding.url.as_str())
        .bind(finding.target.as_str())
        .bind(finding.source_label.as_str())
        .bind(finding.title.as_str())
        .bind(finding.price.as_str())
        .bind(finding.discovered_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(url = %finding.url, inserted, "insert_if_new");
        Ok(inserted)
    }

    /// Newest first. `since` is inclusive.
    pub async fn query(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Finding>, StoreError> {
        let since_ms = since.map(|ts| ts.timestamp_millis()).unwrap_or(i64::MIN);
        let limit = limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT url, target, source, title, price, discovered_at_ms
              FROM findings
             WHERE discovered_at_ms >= ?1
             ORDER BY discovered_at_ms DESC, id DESC
             LIMIT ?2
            "#,
        )
        .bind(since_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_finding).collect()
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM findings")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    /// Delete findings discovered more than `older_than` ago. The window must
    /// be positive; use [`ScoutStore::wipe`] to clear everything.
    pub async fn purge(&self, older_than: TimeDelta) -> Result<u64, StoreError> {
        if older_than <= TimeDelta::zero() {
            return Err(StoreError::InvalidRetention(format!(
                "window must be positive, got {} days",
                older_than.num_days()
            )));
        }
        let cutoff = Utc::now()
            .checked_sub_signed(older_than)
            .ok_or_else(|| StoreError::InvalidRetention(format!("{} days is out of range", older_than.num_days())))?;
        self.purge_before(cutoff).await
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM findings WHERE discovered_at_ms < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        info!(%cutoff, removed, "purged expired findings");
        Ok(removed)
    }

    pub async fn wipe(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM findings").execute(&self.pool).await?;
        let removed = result.rows_affected();
        info!(removed, "wiped findings archive");
        Ok(removed)
    }

    /// Close the pool; later calls on any clone fail with a database error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn add_target(&self, target: &Target) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO targets (name, schedule_hint, added_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(target.name.as_str())
        .bind(target.schedule_hint.as_deref())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_target(&self, name: &Keyword) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM targets WHERE name = ?1")
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn targets(&self) -> Result<Vec<Target>, StoreError> {
        let rows = sqlx::query("SELECT name, schedule_hint FROM targets ORDER BY added_at_ms, rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Target, StoreError> {
                let name: String = row.try_get("name")?;
                let name = Keyword::parse(&name).map_err(|e| StoreError::Corrupt {
                    table: "targets",
                    detail: e.to_string(),
                })?;
                Ok(Target {
                    name,
                    schedule_hint: row.try_get("schedule_hint")?,
                })
            })
            .collect()
    }

    pub async fn add_source(&self, source: &SourceDescriptor) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sources (label, added_at_ms) VALUES (?1, ?2) ON CONFLICT(label) DO NOTHING",
        )
        .bind(source.label())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_source(&self, source: &SourceDescriptor) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sources WHERE label = ?1")
            .bind(source.label())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn sources(&self) -> Result<Vec<SourceDescriptor>, StoreError> {
        let rows = sqlx::query("SELECT label FROM sources ORDER BY added_at_ms, rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<SourceDescriptor, StoreError> {
                let label: String = row.try_get("label")?;
                SourceDescriptor::parse(&label).map_err(|e| StoreError::Corrupt {
                    table: "sources",
                    detail: e.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Registry for ScoutStore {
    async fn list_targets(&self) -> Result<Vec<Target>, RegistryError> {
        self.targets()
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))
    }

    async fn list_sources(&self) -> Result<Vec<SourceDescriptor>, RegistryError> {
        self.sources()
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))
    }
}

fn row_to_finding(row: &SqliteRow) -> Result<Finding, StoreError> {
    let discovered_at_ms: i64 = row.try_get("discovered_at_ms")?;
    let discovered_at =
        DateTime::<Utc>::from_timestamp_millis(discovered_at_ms).ok_or_else(|| StoreError::Corrupt {
            table: "findings",
            detail: format!("discovered_at_ms out of range: {discovered_at_ms}"),
        })?;

    Ok(Finding {
        target: row.try_get("target")?,
        source_label: row.try_get("source")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        url: row.try_get("url")?,
        discovered_at,
    })
}
