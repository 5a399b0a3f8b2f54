//! HTTP page fetching + durable announcement storage for promowatch.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promowatch_core::{AnnouncementRecord, EffectivePeriod, IngestedAnnouncement};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "promowatch-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Anything that can turn an address into raw markup.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single GET per call. Retries are deliberately absent at this layer.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "fetched page");
            // The site serves UTF-8 regardless of what the headers claim.
            Ok(String::from_utf8_lossy(&body).into_owned())
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store i/o failure: {0}")]
    Io(#[source] sqlx::Error),
    #[error("row {identifier} is corrupt: {message}")]
    Corrupt { identifier: i64, message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if matches!(
                db.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            ) {
                return StoreError::Constraint(db.message().to_string());
            }
        }
        StoreError::Io(err)
    }
}

/// Durable owner of ingested announcements.
#[async_trait]
pub trait AnnouncementStore: Send + Sync {
    /// Highest identifier persisted so far, `0` for an empty store.
    async fn max_identifier(&self) -> Result<i64, StoreError>;

    /// Persist one announcement atomically. Nothing is written on error.
    async fn append(&self, item: &IngestedAnnouncement) -> Result<(), StoreError>;
}

/// Open a pool for `database_url`, creating the database file when missing.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    // Each in-memory connection is its own database, so pin the pool to one.
    let pool_options = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };

    pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

/// Apply the embedded schema migrations. Safe to call on every start.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("applying schema migrations")
}

#[derive(Debug, Clone)]
pub struct SqliteAnnouncementStore {
    pool: SqlitePool,
}

impl SqliteAnnouncementStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM web_scraping")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get(&self, identifier: i64) -> Result<Option<IngestedAnnouncement>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT scraping_id, external_url, scraping_date, content_title, content_date,
                   period_start, period_end, content_text, content_note
              FROM web_scraping
             WHERE scraping_id = ?
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let identifier: i64 = row.try_get("scraping_id")?;
        let date_text: String = row.try_get("content_date")?;
        let period_start: Option<i64> = row.try_get("period_start")?;
        let period_end: Option<i64> = row.try_get("period_end")?;
        let period = match (period_start, period_end) {
            (Some(start), Some(end)) => EffectivePeriod::Range {
                start: from_unix(identifier, "period_start", start)?,
                end: from_unix(identifier, "period_end", end)?,
            },
            _ => EffectivePeriod::Raw(date_text.clone()),
        };
        let scraping_date: i64 = row.try_get("scraping_date")?;

        Ok(Some(IngestedAnnouncement {
            identifier,
            source_url: row.try_get("external_url")?,
            fetched_at: from_unix(identifier, "scraping_date", scraping_date)?,
            record: AnnouncementRecord {
                title: row.try_get("content_title")?,
                date_text,
                period,
                body: row.try_get("content_text")?,
                note: row.try_get("content_note")?,
            },
        }))
    }
}

#[async_trait]
impl AnnouncementStore for SqliteAnnouncementStore {
    async fn max_identifier(&self) -> Result<i64, StoreError> {
        let max = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(scraping_id), 0) FROM web_scraping",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn append(&self, item: &IngestedAnnouncement) -> Result<(), StoreError> {
        let record = &item.record;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO web_scraping (
                scraping_id, external_url, scraping_date, content_title, content_date,
                period_start, period_end, content_text, content_note
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.identifier)
        .bind(&item.source_url)
        .bind(item.fetched_at.timestamp())
        .bind(&record.title)
        .bind(&record.date_text)
        .bind(record.period.start().map(|t| t.timestamp()))
        .bind(record.period.end().map(|t| t.timestamp()))
        .bind(&record.body)
        .bind(&record.note)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn from_unix(identifier: i64, column: &str, secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| StoreError::Corrupt {
        identifier,
        message: format!("{column} {secs} is not a valid timestamp"),
    })
}
