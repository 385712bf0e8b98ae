// =============================================================================
// PredictionStore — durable, concurrent-safe persistence of jobs, predictions,
// and failures (SQLite via sqlx).
// =============================================================================
//
// Schema and query shapes mirror the original `db.py` (three tables, the same
// indexes, the same partial index on pending predictions). Every write goes
// through the pool; SQLite itself serializes writers, so no additional
// app-level lock is needed. `VerifyPrediction`'s at-most-once guarantee is a
// conditional `UPDATE ... WHERE verified_at IS NULL` — the same statement the
// original issues.
//
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::StoreError;
use crate::types::{Direction, FailureCode, JobStatus, SortBy};

/// Frozen parameters a job was created with (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub symbols: Vec<String>,
    pub k: u32,
    pub horizon: i64,
    pub alpha: f64,
    pub min_edge: f64,
    pub cross_asset: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub completed: i64,
    pub total: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub params: JobParams,
    pub total_symbols: i64,
    pub completed_symbols: i64,
    pub failed_symbols: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub results: Vec<Prediction>,
    pub failures: Vec<Failure>,
    pub params: JobParams,
}

/// A single scored (or pending-scoring) prediction.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub id: String,
    pub job_id: String,
    pub symbol: String,
    pub scan_time: DateTime<Utc>,
    pub horizon: i64,
    pub prob_up: f64,
    pub prob_down: f64,
    pub mean_return: f64,
    pub edge: f64,
    pub direction: Direction,
    pub n_neighbors: i64,
    pub dist1: Option<f64>,
    pub p10: Option<f64>,
    pub p90: Option<f64>,
    pub price_at_scan: f64,
    pub price_at_horizon: Option<f64>,
    pub actual_return: Option<f64>,
    pub was_correct: Option<bool>,
    pub pnl: Option<f64>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn is_pending(&self) -> bool {
        self.verified_at.is_none()
    }

    pub fn matures_at(&self) -> DateTime<Utc> {
        self.scan_time + chrono::Duration::minutes(self.horizon)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub symbol: String,
    pub scan_time: DateTime<Utc>,
    pub error_code: FailureCode,
    pub reason: String,
    pub bars_since_open: Option<i64>,
    pub bars_until_close: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BucketStats {
    pub n: i64,
    pub long_count: i64,
    pub short_count: i64,
    pub win_rate: Option<f64>,
    pub mean_pnl: Option<f64>,
    pub median_pnl: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub period: String,
    pub total_predictions: i64,
    pub verified: i64,
    pub pending: i64,
    pub all_stats: Option<BucketStats>,
    pub top_1pct: Option<BucketStats>,
    pub top_5pct: Option<BucketStats>,
    pub top_10pct: Option<BucketStats>,
    pub long_stats: Option<BucketStats>,
    pub short_stats: Option<BucketStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentJob {
    pub id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_symbols: i64,
    pub completed_symbols: i64,
    pub failed_symbols: i64,
}

/// Durable store for jobs, predictions, and failures.
pub struct PredictionStore {
    pool: SqlitePool,
}

impl PredictionStore {
    /// Open (creating if absent) the SQLite database at `path` and apply the
    /// schema. `path` may be `:memory:` for tests.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);

        // A single shared in-memory database only exists for the lifetime of
        // one connection, so tests (and any other `:memory:` caller) must
        // pin the pool to exactly one connection.
        let max_connections = if path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await.ok();
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;

        let store = Self { pool };
        store.create_tables().await?;
        info!(path, "prediction store connected");
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                params TEXT NOT NULL,
                total_symbols INTEGER NOT NULL,
                completed_symbols INTEGER NOT NULL DEFAULT 0,
                failed_symbols INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                scan_time TEXT NOT NULL,
                horizon INTEGER NOT NULL,
                prob_up REAL NOT NULL,
                prob_down REAL NOT NULL,
                mean_return REAL NOT NULL,
                edge REAL NOT NULL,
                direction TEXT NOT NULL,
                n_neighbors INTEGER NOT NULL,
                dist1 REAL,
                p10 REAL,
                p90 REAL,
                price_at_scan REAL NOT NULL,
                price_at_horizon REAL,
                actual_return REAL,
                was_correct INTEGER,
                pnl REAL,
                verified_at TEXT,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failures (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                scan_time TEXT NOT NULL,
                error_code TEXT NOT NULL,
                reason TEXT NOT NULL,
                bars_since_open INTEGER,
                bars_until_close INTEGER,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_predictions_job ON predictions(job_id)",
            "CREATE INDEX IF NOT EXISTS idx_predictions_symbol ON predictions(symbol)",
            "CREATE INDEX IF NOT EXISTS idx_predictions_pending ON predictions(scan_time) WHERE verified_at IS NULL",
            "CREATE INDEX IF NOT EXISTS idx_predictions_scan_time ON predictions(scan_time)",
            "CREATE INDEX IF NOT EXISTS idx_failures_job ON failures(job_id)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Job operations
    // ------------------------------------------------------------------

    pub async fn create_job(
        &self,
        id: &str,
        params: &JobParams,
        total_symbols: i64,
    ) -> Result<(), StoreError> {
        let params_json = serde_json::to_string(params).expect("JobParams always serializes");
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs (id, status, started_at, params, total_symbols) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(JobStatus::Running.to_string())
        .bind(now.to_rfc3339())
        .bind(params_json)
        .bind(total_symbols)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateId(format!("duplicate job id {id}")));
        }

        info!(job_id = id, total_symbols, "job created");
        Ok(())
    }

    pub async fn update_job_progress(
        &self,
        id: &str,
        completed: i64,
        failed: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET completed_symbols = ?, failed_symbols = ? WHERE id = ?")
            .bind(completed)
            .bind(failed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_job(&self, id: &str, terminal: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, completed_at = ? WHERE id = ? AND completed_at IS NULL",
        )
        .bind(terminal.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(job_id = id, status = %terminal, "job completed");
        }
        Ok(())
    }

    pub async fn get_job_status(
        &self,
        id: &str,
        sort_by: SortBy,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<Option<JobStatusView>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let started_at = parse_ts(row.try_get::<String, _>("started_at")?)?;
        let completed_at = row
            .try_get::<Option<String>, _>("completed_at")?
            .map(parse_ts)
            .transpose()?;
        let params: JobParams = serde_json::from_str(&row.try_get::<String, _>("params")?)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let status: JobStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .unwrap_or(JobStatus::Running);

        let results = self
            .get_predictions_for_job(id, sort_by, direction, limit)
            .await?;
        let failures = self.get_failures_for_job(id).await?;

        let duration_seconds = completed_at.map(|c| (c - started_at).num_milliseconds() as f64 / 1000.0);

        Ok(Some(JobStatusView {
            job_id: id.to_string(),
            status,
            progress: JobProgress {
                completed: row.try_get("completed_symbols")?,
                total: row.try_get("total_symbols")?,
                failed: row.try_get("failed_symbols")?,
            },
            started_at,
            completed_at,
            duration_seconds,
            results,
            failures,
            params,
        }))
    }

    // ------------------------------------------------------------------
    // Prediction operations
    // ------------------------------------------------------------------

    pub async fn insert_prediction(&self, p: &Prediction) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO predictions (
                id, job_id, symbol, scan_time, horizon,
                prob_up, prob_down, mean_return, edge, direction,
                n_neighbors, dist1, p10, p90, price_at_scan
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&p.id)
        .bind(&p.job_id)
        .bind(&p.symbol)
        .bind(p.scan_time.to_rfc3339())
        .bind(p.horizon)
        .bind(p.prob_up)
        .bind(p.prob_down)
        .bind(p.mean_return)
        .bind(p.edge)
        .bind(p.direction.to_string())
        .bind(p.n_neighbors)
        .bind(p.dist1)
        .bind(p.p10)
        .bind(p.p90)
        .bind(p.price_at_scan)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateId(format!(
                "duplicate prediction id {}",
                p.id
            )));
        }
        Ok(())
    }

    pub async fn get_predictions_for_job(
        &self,
        job_id: &str,
        sort_by: SortBy,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<Vec<Prediction>, StoreError> {
        let sort_column = match sort_by {
            SortBy::Edge => "edge DESC",
            SortBy::ProbUp => "prob_up DESC",
            SortBy::MeanReturn => "mean_return DESC",
            SortBy::Symbol => "symbol ASC",
        };

        let mut query = String::from("SELECT * FROM predictions WHERE job_id = ?");
        if direction.is_some() {
            query.push_str(" AND direction = ?");
        }
        query.push_str(&format!(" ORDER BY {sort_column} LIMIT ?"));

        let mut q = sqlx::query(&query).bind(job_id);
        if let Some(dir) = direction {
            q = q.bind(dir.to_string());
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_prediction).collect()
    }

    pub async fn get_pending_predictions(&self, limit: i64) -> Result<Vec<Prediction>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT * FROM predictions
            WHERE verified_at IS NULL
            AND datetime(scan_time, '+' || horizon || ' minutes') < datetime(?)
            ORDER BY scan_time ASC
            LIMIT ?
            "#,
        )
        .bind(&now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_prediction).collect()
    }

    pub async fn get_active_predictions(&self) -> Result<Vec<Prediction>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT * FROM predictions
            WHERE verified_at IS NULL
            AND datetime(scan_time, '+' || horizon || ' minutes') >= datetime(?)
            "#,
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_prediction).collect()
    }

    /// At-most-once verification. Returns `Err(AlreadyVerified)` if another
    /// caller already wrote the result for this prediction.
    pub async fn verify_prediction(
        &self,
        id: &str,
        price_at_horizon: f64,
        actual_return: f64,
        was_correct: bool,
        pnl: f64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE predictions
            SET price_at_horizon = ?, actual_return = ?, was_correct = ?, pnl = ?, verified_at = ?
            WHERE id = ? AND verified_at IS NULL
            "#,
        )
        .bind(price_at_horizon)
        .bind(actual_return)
        .bind(was_correct)
        .bind(pnl)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyVerified(id.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure operations
    // ------------------------------------------------------------------

    pub async fn insert_failure(&self, job_id: &str, f: &Failure) -> Result<String, StoreError> {
        let failure_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO failures (
                id, job_id, symbol, scan_time, error_code, reason,
                bars_since_open, bars_until_close
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&failure_id)
        .bind(job_id)
        .bind(&f.symbol)
        .bind(f.scan_time.to_rfc3339())
        .bind(f.error_code.to_string())
        .bind(&f.reason)
        .bind(f.bars_since_open)
        .bind(f.bars_until_close)
        .execute(&self.pool)
        .await?;
        Ok(failure_id)
    }

    pub async fn get_failures_for_job(&self, job_id: &str) -> Result<Vec<Failure>, StoreError> {
        let rows = sqlx::query("SELECT * FROM failures WHERE job_id = ?")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(Failure {
                    symbol: row.try_get("symbol")?,
                    scan_time: parse_ts(row.try_get("scan_time")?)?,
                    error_code: row
                        .try_get::<String, _>("error_code")?
                        .parse()
                        .unwrap_or(FailureCode::Unknown),
                    reason: row.try_get("reason")?,
                    bars_since_open: row.try_get("bars_since_open")?,
                    bars_until_close: row.try_get("bars_until_close")?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Performance statistics
    // ------------------------------------------------------------------

    pub async fn get_performance_stats(&self, period: &str) -> Result<PerformanceStats, StoreError> {
        let since = period_cutoff(period);

        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                SUM(CASE WHEN verified_at IS NOT NULL THEN 1 ELSE 0 END) as verified,
                SUM(CASE WHEN verified_at IS NULL THEN 1 ELSE 0 END) as pending
            FROM predictions WHERE scan_time >= ?
            "#,
        )
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT direction, was_correct, pnl, edge
            FROM predictions
            WHERE scan_time >= ? AND verified_at IS NOT NULL
            ORDER BY edge DESC
            "#,
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<BucketRow> = rows
            .iter()
            .map(|r| BucketRow {
                direction: r.try_get::<String, _>("direction").unwrap_or_default(),
                was_correct: r.try_get::<Option<i64>, _>("was_correct").unwrap_or(None),
                pnl: r.try_get::<Option<f64>, _>("pnl").unwrap_or(None),
            })
            .collect();

        let n = records.len();
        let all_stats = calculate_bucket_stats(&records);
        let top_1pct = if n > 0 {
            calculate_bucket_stats(&records[..(n / 100).max(1)])
        } else {
            None
        };
        let top_5pct = if n > 0 {
            calculate_bucket_stats(&records[..(n / 20).max(1)])
        } else {
            None
        };
        let top_10pct = if n > 0 {
            calculate_bucket_stats(&records[..(n / 10).max(1)])
        } else {
            None
        };

        let long_rows: Vec<BucketRow> = records.iter().filter(|r| r.direction == "UP").cloned().collect();
        let short_rows: Vec<BucketRow> = records.iter().filter(|r| r.direction == "DOWN").cloned().collect();
        let long_stats = calculate_bucket_stats(&long_rows);
        let short_stats = calculate_bucket_stats(&short_rows);

        Ok(PerformanceStats {
            period: period.to_string(),
            total_predictions: counts.try_get::<Option<i64>, _>("total")?.unwrap_or(0),
            verified: counts.try_get::<Option<i64>, _>("verified")?.unwrap_or(0),
            pending: counts.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            all_stats,
            top_1pct,
            top_5pct,
            top_10pct,
            long_stats,
            short_stats,
        })
    }

    // ------------------------------------------------------------------
    // History / retention
    // ------------------------------------------------------------------

    pub async fn get_recent_jobs(&self, limit: i64) -> Result<Vec<RecentJob>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(RecentJob {
                    id: row.try_get("id")?,
                    status: row
                        .try_get::<String, _>("status")?
                        .parse()
                        .unwrap_or(JobStatus::Running),
                    started_at: parse_ts(row.try_get("started_at")?)?,
                    completed_at: row
                        .try_get::<Option<String>, _>("completed_at")?
                        .map(parse_ts)
                        .transpose()?,
                    total_symbols: row.try_get("total_symbols")?,
                    completed_symbols: row.try_get("completed_symbols")?,
                    failed_symbols: row.try_get("failed_symbols")?,
                })
            })
            .collect()
    }

    /// Delete predictions/failures older than `days`, then orphan jobs with
    /// no remaining predictions. Returns the number of predictions deleted.
    pub async fn cleanup_old_data(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();

        let deleted = sqlx::query("DELETE FROM predictions WHERE scan_time < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM failures WHERE scan_time < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE started_at < ?
            AND id NOT IN (SELECT DISTINCT job_id FROM predictions)
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        info!(days, deleted, "retention sweep completed");
        Ok(deleted)
    }

    /// Job/prediction counts used by the health endpoint.
    pub async fn health_counts(&self) -> Result<(i64, i64), StoreError> {
        let jobs: i64 = sqlx::query("SELECT COUNT(*) as c FROM jobs")
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
        let pending: i64 = sqlx::query("SELECT COUNT(*) as c FROM predictions WHERE verified_at IS NULL")
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
        Ok((jobs, pending))
    }
}

#[derive(Debug, Clone)]
struct BucketRow {
    direction: String,
    was_correct: Option<i64>,
    pnl: Option<f64>,
}

fn calculate_bucket_stats(rows: &[BucketRow]) -> Option<BucketStats> {
    if rows.is_empty() {
        return None;
    }

    let n = rows.len() as i64;
    let long_count = rows.iter().filter(|r| r.direction == "UP").count() as i64;
    let short_count = n - long_count;
    let wins = rows.iter().filter(|r| r.was_correct == Some(1)).count() as i64;
    let mut pnls: Vec<f64> = rows.iter().filter_map(|r| r.pnl).collect();

    let win_rate = Some(crate::types::round4(wins as f64 / n as f64));
    let mean_pnl = if pnls.is_empty() {
        None
    } else {
        Some(crate::types::round4(pnls.iter().sum::<f64>() / pnls.len() as f64))
    };
    let median_pnl = if pnls.is_empty() {
        None
    } else {
        pnls.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = pnls.len() / 2;
        let m = if pnls.len() % 2 == 1 {
            pnls[mid]
        } else {
            (pnls[mid - 1] + pnls[mid]) / 2.0
        };
        Some(crate::types::round4(m))
    };

    Some(BucketStats {
        n,
        long_count,
        short_count,
        win_rate,
        mean_pnl,
        median_pnl,
    })
}

fn period_cutoff(period: &str) -> DateTime<Utc> {
    let now = Utc::now();
    match period {
        "1h" => now - chrono::Duration::hours(1),
        "today" => now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc(),
        "week" => now - chrono::Duration::days(7),
        _ => DateTime::parse_from_rfc3339("2000-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    }
}

fn parse_ts(s: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn row_to_prediction(row: &sqlx::sqlite::SqliteRow) -> Result<Prediction, StoreError> {
    Ok(Prediction {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        symbol: row.try_get("symbol")?,
        scan_time: parse_ts(row.try_get("scan_time")?)?,
        horizon: row.try_get("horizon")?,
        prob_up: row.try_get("prob_up")?,
        prob_down: row.try_get("prob_down")?,
        mean_return: row.try_get("mean_return")?,
        edge: row.try_get("edge")?,
        direction: row
            .try_get::<String, _>("direction")?
            .parse()
            .unwrap_or(Direction::UP),
        n_neighbors: row.try_get("n_neighbors")?,
        dist1: row.try_get("dist1")?,
        p10: row.try_get("p10")?,
        p90: row.try_get("p90")?,
        price_at_scan: row.try_get("price_at_scan")?,
        price_at_horizon: row.try_get("price_at_horizon")?,
        actual_return: row.try_get("actual_return")?,
        was_correct: row
            .try_get::<Option<i64>, _>("was_correct")?
            .map(|v| v != 0),
        pnl: row.try_get("pnl")?,
        verified_at: row
            .try_get::<Option<String>, _>("verified_at")?
            .map(parse_ts)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> JobParams {
        JobParams {
            symbols: vec!["AAA".into(), "BBB".into()],
            k: 50,
            horizon: 10,
            alpha: 0.05,
            min_edge: 0.0,
            cross_asset: false,
        }
    }

    fn sample_prediction(id: &str, job_id: &str, direction: Direction) -> Prediction {
        Prediction {
            id: id.to_string(),
            job_id: job_id.to_string(),
            symbol: "AAA".into(),
            scan_time: Utc::now(),
            horizon: 10,
            prob_up: 0.7,
            prob_down: 0.3,
            mean_return: 0.8,
            edge: 0.56,
            direction,
            n_neighbors: 50,
            dist1: Some(0.1),
            p10: Some(-0.5),
            p90: Some(1.4),
            price_at_scan: 100.0,
            price_at_horizon: None,
            actual_return: None,
            was_correct: None,
            pnl: None,
            verified_at: None,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_job_roundtrips() {
        let store = PredictionStore::connect(":memory:").await.unwrap();
        store.create_job("job-1", &sample_params(), 2).await.unwrap();

        let view = store
            .get_job_status("job-1", SortBy::Edge, None, 500)
            .await
            .unwrap()
            .expect("job exists");

        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.progress.total, 2);
        assert!(view.results.is_empty());
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let store = PredictionStore::connect(":memory:").await.unwrap();
        store.create_job("dup", &sample_params(), 1).await.unwrap();
        let second = store.create_job("dup", &sample_params(), 1).await;
        assert!(matches!(second, Err(StoreError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn duplicate_prediction_id_is_rejected() {
        let store = PredictionStore::connect(":memory:").await.unwrap();
        store.create_job("job-dup", &sample_params(), 1).await.unwrap();
        let p = sample_prediction("pred-dup", "job-dup", Direction::UP);
        store.insert_prediction(&p).await.unwrap();
        let second = store.insert_prediction(&p).await;
        assert!(matches!(second, Err(StoreError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn verify_prediction_is_exactly_once() {
        let store = PredictionStore::connect(":memory:").await.unwrap();
        store.create_job("job-1", &sample_params(), 1).await.unwrap();
        let p = sample_prediction("pred-1", "job-1", Direction::UP);
        store.insert_prediction(&p).await.unwrap();

        store
            .verify_prediction("pred-1", 101.0, 1.0, true, 1.0)
            .await
            .unwrap();

        let second = store.verify_prediction("pred-1", 102.0, 2.0, true, 2.0).await;
        assert!(matches!(second, Err(StoreError::AlreadyVerified(_))));
    }

    #[tokio::test]
    async fn get_predictions_for_job_roundtrips_fields() {
        let store = PredictionStore::connect(":memory:").await.unwrap();
        store.create_job("job-1", &sample_params(), 1).await.unwrap();
        let p = sample_prediction("pred-1", "job-1", Direction::DOWN);
        store.insert_prediction(&p).await.unwrap();

        let fetched = store
            .get_predictions_for_job("job-1", SortBy::Edge, None, 10)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].symbol, "AAA");
        assert_eq!(fetched[0].direction, Direction::DOWN);
        assert!((fetched[0].price_at_scan - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cleanup_old_data_removes_stale_predictions() {
        let store = PredictionStore::connect(":memory:").await.unwrap();
        store.create_job("job-1", &sample_params(), 1).await.unwrap();
        let mut p = sample_prediction("pred-1", "job-1", Direction::UP);
        p.scan_time = Utc::now() - chrono::Duration::days(40);
        store.insert_prediction(&p).await.unwrap();

        let deleted = store.cleanup_old_data(30).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
