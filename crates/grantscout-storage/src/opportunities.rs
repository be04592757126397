//! SQLite persistence for discovered and scored opportunities.
//!
//! `url` is the natural key: discovery inserts are insert-or-ignore, scoring
//! writes update the row that already carries the same URL.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use grantscout_core::{Opportunity, ScoredOpportunity};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS opportunities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT,
    description TEXT,
    source TEXT,
    agency TEXT,
    sector TEXT,
    published_date TEXT,
    open_date TEXT,
    close_date TEXT,
    url TEXT UNIQUE,
    feasibility_score REAL,
    impact_score REAL,
    alignment_score REAL,
    total_score REAL,
    justification TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Row as exposed to API callers; missing scores read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOpportunity {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub source: String,
    pub agency: Option<String>,
    pub sector: Option<String>,
    pub published_date: Option<String>,
    pub open_date: Option<String>,
    pub close_date: Option<String>,
    pub url: Option<String>,
    pub feasibility_score: f64,
    pub impact_score: f64,
    pub alignment_score: f64,
    pub total_score: f64,
    pub justification: Option<String>,
    pub created_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct OpportunityRow {
    id: i64,
    title: Option<String>,
    description: Option<String>,
    source: Option<String>,
    agency: Option<String>,
    sector: Option<String>,
    published_date: Option<String>,
    open_date: Option<String>,
    close_date: Option<String>,
    url: Option<String>,
    feasibility_score: Option<f64>,
    impact_score: Option<f64>,
    alignment_score: Option<f64>,
    total_score: Option<f64>,
    justification: Option<String>,
    created_at: Option<String>,
}

impl From<OpportunityRow> for StoredOpportunity {
    fn from(row: OpportunityRow) -> Self {
        Self {
            id: row.id,
            title: row.title.unwrap_or_default(),
            description: row.description.unwrap_or_default(),
            source: row.source.unwrap_or_default(),
            agency: row.agency,
            sector: row.sector,
            published_date: row.published_date,
            open_date: row.open_date,
            close_date: row.close_date,
            url: row.url,
            feasibility_score: row.feasibility_score.unwrap_or(0.0),
            impact_score: row.impact_score.unwrap_or(0.0),
            alignment_score: row.alignment_score.unwrap_or(0.0),
            total_score: row.total_score.unwrap_or(0.0),
            justification: row.justification,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub written: usize,
    pub ignored: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpportunityQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sector: Option<String>,
    pub source: Option<String>,
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpportunityPage {
    pub count: i64,
    pub opportunities: Vec<StoredOpportunity>,
    pub average_score: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreStatistics {
    pub average: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpportunityStatistics {
    pub total_opportunities: i64,
    pub score_statistics: ScoreStatistics,
    pub by_sector: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
}

pub const DEFAULT_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct OpportunityStore {
    pool: SqlitePool,
}

impl OpportunityStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        info!(path = %path.as_ref().display(), "opportunity store ready");
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it shared.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert-or-ignore keyed by URL. Items with neither URL nor title are rejected.
    pub async fn save_discovered(&self, items: &[Opportunity]) -> Result<SaveOutcome, StoreError> {
        let mut outcome = SaveOutcome::default();
        let mut tx = self.pool.begin().await?;
        for item in items {
            if !item.is_persistable() {
                outcome.rejected += 1;
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO opportunities
                    (title, description, source, agency, sector, published_date, open_date, close_date, url)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.source)
            .bind(&item.agency)
            .bind(&item.category)
            .bind(&item.published_date)
            .bind(&item.open_date)
            .bind(&item.close_date)
            .bind(item.url_key())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                outcome.written += 1;
            } else {
                outcome.ignored += 1;
            }
        }
        tx.commit().await?;
        if outcome.rejected > 0 {
            warn!(rejected = outcome.rejected, "skipped opportunities without url or title");
        }
        Ok(outcome)
    }

    /// Upsert keyed by URL: an existing row keeps its id and gets the new values.
    pub async fn save_scored(&self, items: &[ScoredOpportunity]) -> Result<SaveOutcome, StoreError> {
        let mut outcome = SaveOutcome::default();
        let mut tx = self.pool.begin().await?;
        for item in items {
            let opp = &item.opportunity;
            if !opp.is_persistable() {
                outcome.rejected += 1;
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO opportunities
                    (title, description, source, agency, sector, published_date, open_date, close_date, url,
                     feasibility_score, impact_score, alignment_score, total_score, justification)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    source = excluded.source,
                    agency = excluded.agency,
                    sector = excluded.sector,
                    published_date = excluded.published_date,
                    open_date = excluded.open_date,
                    close_date = excluded.close_date,
                    feasibility_score = excluded.feasibility_score,
                    impact_score = excluded.impact_score,
                    alignment_score = excluded.alignment_score,
                    total_score = excluded.total_score,
                    justification = excluded.justification
                "#,
            )
            .bind(&opp.title)
            .bind(&opp.description)
            .bind(&opp.source)
            .bind(&opp.agency)
            .bind(&opp.category)
            .bind(&opp.published_date)
            .bind(&opp.open_date)
            .bind(&opp.close_date)
            .bind(opp.url_key())
            .bind(item.feasibility_score)
            .bind(item.impact_score)
            .bind(item.alignment_score)
            .bind(item.total_score)
            .bind(&item.justification)
            .execute(&mut *tx)
            .await?;
            outcome.written += 1;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Filtered page ordered by total score, then published date.
    pub async fn list(&self, query: &OpportunityQuery) -> Result<OpportunityPage, StoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(0);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM opportunities WHERE 1=1");
        push_filters(&mut select, query);
        select
            .push(" ORDER BY total_score DESC, published_date DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<OpportunityRow> = select.build_query_as().fetch_all(&self.pool).await?;

        let mut counter = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM opportunities WHERE 1=1");
        push_filters(&mut counter, query);
        let count: i64 = counter.build().fetch_one(&self.pool).await?.try_get("n")?;

        let scores: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.total_score)
            .filter(|s| *s != 0.0)
            .collect();
        let average_score = (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);

        Ok(OpportunityPage {
            count,
            opportunities: rows.into_iter().map(StoredOpportunity::from).collect(),
            average_score,
            generated_at: Utc::now(),
        })
    }

    pub async fn top(&self, limit: i64, min_score: f64) -> Result<OpportunityPage, StoreError> {
        self.list(&OpportunityQuery {
            limit: Some(limit),
            min_score: Some(min_score),
            ..Default::default()
        })
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<StoredOpportunity>, StoreError> {
        let row: Option<OpportunityRow> = sqlx::query_as("SELECT * FROM opportunities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(StoredOpportunity::from))
    }

    pub async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM opportunities WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn sector_counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.group_counts("sector").await
    }

    pub async fn source_counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.group_counts("source").await
    }

    async fn group_counts(&self, column: &'static str) -> Result<BTreeMap<String, i64>, StoreError> {
        let sql = format!(
            "SELECT {column} AS k, COUNT(*) AS n FROM opportunities WHERE {column} IS NOT NULL GROUP BY {column}"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.try_get::<String, _>("k")?, row.try_get::<i64, _>("n")?);
        }
        Ok(out)
    }

    pub async fn statistics(&self) -> Result<OpportunityStatistics, StoreError> {
        let total_opportunities = self.count().await?;
        let row = sqlx::query(
            r#"
            SELECT AVG(total_score) AS avg_score,
                   MAX(total_score) AS max_score,
                   MIN(total_score) AS min_score
              FROM opportunities
             WHERE total_score IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let round2 = |v: Option<f64>| v.map(|x| (x * 100.0).round() / 100.0);

        Ok(OpportunityStatistics {
            total_opportunities,
            score_statistics: ScoreStatistics {
                average: round2(row.try_get("avg_score")?),
                max: round2(row.try_get("max_score")?),
                min: round2(row.try_get("min_score")?),
            },
            by_sector: self.sector_counts().await?,
            by_source: self.source_counts().await?,
        })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &OpportunityQuery) {
    if let Some(sector) = &query.sector {
        builder.push(" AND sector LIKE ").push_bind(format!("%{sector}%"));
    }
    if let Some(source) = &query.source {
        builder.push(" AND source LIKE ").push_bind(format!("%{source}%"));
    }
    if let Some(min_score) = query.min_score {
        builder.push(" AND total_score >= ").push_bind(min_score);
    }
}
