//! Strategy reports repository

use std::collections::BTreeMap;

use crate::{DbError, DbResult};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use stratlab_engine::{ParamSet, StrategyReport};
use tracing::debug;

/// A stored strategy report, metrics and parameters as JSON text
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StrategyReportRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub strategy_id: String,
    pub kind: String,
    pub parameters: String,
    pub metrics: String,
    /// ms since epoch
    pub period_start: i64,
    pub period_end: i64,
    /// s since epoch
    pub created_at: Option<i64>,
}

#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct MetricsJson(#[serde(with = "stratlab_engine::export::non_finite_map")] BTreeMap<String, f64>);

impl StrategyReportRecord {
    pub fn from_report(report: &StrategyReport) -> DbResult<Self> {
        let metrics = serde_json::to_string(&MetricsJson(report.metrics.clone()))
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let parameters =
            serde_json::to_string(&report.parameters).map_err(|e| DbError::Serialization(e.to_string()))?;
        Ok(Self {
            id: None,
            params_hash: report.params_hash.clone(),
            strategy_id: report.strategy_id.clone(),
            kind: report.kind.as_str().to_string(),
            parameters,
            metrics,
            period_start: report.period_start.timestamp_millis(),
            period_end: report.period_end.timestamp_millis(),
            created_at: None,
        })
    }

    pub fn to_report(&self) -> DbResult<StrategyReport> {
        let MetricsJson(metrics) =
            serde_json::from_str(&self.metrics).map_err(|e| DbError::Serialization(e.to_string()))?;
        let parameters: ParamSet =
            serde_json::from_str(&self.parameters).map_err(|e| DbError::Serialization(e.to_string()))?;
        let kind = self
            .kind
            .parse()
            .map_err(|e: stratlab_engine::EngineError| DbError::Serialization(e.to_string()))?;
        let period = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| DbError::Serialization(format!("timestamp {ms} out of range")))
        };
        Ok(StrategyReport {
            strategy_id: self.strategy_id.clone(),
            params_hash: self.params_hash.clone(),
            kind,
            metrics,
            parameters,
            period_start: period(self.period_start)?,
            period_end: period(self.period_end)?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, params_hash, strategy_id, kind, parameters, metrics,
           period_start, period_end, created_at
    FROM strategy_reports
"#;

/// Repository for exported strategy reports
pub struct ReportRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ReportRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a report (INSERT OR IGNORE - skips if params_hash already exists).
    /// Returns true when a new row was written.
    pub async fn save(&self, report: &StrategyReport) -> DbResult<bool> {
        let record = StrategyReportRecord::from_report(report)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO strategy_reports (
                params_hash, strategy_id, kind, parameters, metrics, period_start, period_end
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.strategy_id)
        .bind(&record.kind)
        .bind(&record.parameters)
        .bind(&record.metrics)
        .bind(record.period_start)
        .bind(record.period_end)
        .execute(self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(hash = %record.params_hash, strategy = %record.strategy_id, inserted, "Report saved");
        Ok(inserted)
    }

    /// Get a report by its params_hash
    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<StrategyReport>> {
        let sql = format!("{SELECT_COLUMNS} WHERE params_hash = ?");
        let record = sqlx::query_as::<_, StrategyReportRecord>(&sql)
            .bind(hash)
            .fetch_optional(self.pool)
            .await?;

        record.map(|r| r.to_report()).transpose()
    }

    /// Reports for one strategy, newest first
    pub async fn list_by_strategy(&self, strategy_id: &str, limit: i64) -> DbResult<Vec<StrategyReport>> {
        let sql = format!("{SELECT_COLUMNS} WHERE strategy_id = ? ORDER BY created_at DESC, id DESC LIMIT ?");
        let records = sqlx::query_as::<_, StrategyReportRecord>(&sql)
            .bind(strategy_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        records.iter().map(|r| r.to_report()).collect()
    }

    /// Reports ranked by one metric, highest first. `+inf` ranks above every
    /// finite value; reports without the metric or with NaN are left out.
    pub async fn top_by_metric(
        &self,
        metric: &str,
        limit: i64,
        strategy_id: Option<&str>,
    ) -> DbResult<Vec<StrategyReport>> {
        if metric.is_empty() || !metric.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::Query(format!("invalid metric name '{metric}'")));
        }
        let path = format!("$.{metric}");

        let mut sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE json_extract(metrics, ?) IS NOT NULL
              AND json_extract(metrics, ?) != 'nan'
            "#
        );
        if strategy_id.is_some() {
            sql.push_str(" AND strategy_id = ?");
        }
        sql.push_str(
            r#"
            ORDER BY CASE json_extract(metrics, ?) WHEN 'inf' THEN 1 WHEN '-inf' THEN -1 ELSE 0 END DESC,
                     CAST(json_extract(metrics, ?) AS REAL) DESC
            LIMIT ?
            "#,
        );

        let mut query = sqlx::query_as::<_, StrategyReportRecord>(&sql)
            .bind(&path)
            .bind(&path);
        if let Some(id) = strategy_id {
            query = query.bind(id);
        }
        let records = query
            .bind(&path)
            .bind(&path)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        records.iter().map(|r| r.to_report()).collect()
    }

    /// Total number of stored reports
    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM strategy_reports")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::Utc;
    use stratlab_engine::{params_hash, ReportKind};

    fn report(strategy: &str, fast: i64, sharpe: f64) -> StrategyReport {
        let parameters = ParamSet::new().with("fast_period", fast);
        let mut metrics = BTreeMap::new();
        metrics.insert("sharpe".to_string(), sharpe);
        metrics.insert("trade_count".to_string(), 12.0);
        StrategyReport {
            strategy_id: strategy.to_string(),
            params_hash: params_hash(strategy, ReportKind::Backtest, &parameters, 0, 86_400_000),
            kind: ReportKind::Backtest,
            metrics,
            parameters,
            period_start: DateTime::<Utc>::from_timestamp_millis(0).unwrap(),
            period_end: DateTime::<Utc>::from_timestamp_millis(86_400_000).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.reports();
        let r = report("ema_crossover", 12, 1.5);
        assert!(repo.save(&r).await.unwrap());
        assert!(!repo.save(&r).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_by_hash_round_trips() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.reports();
        let r = report("ema_crossover", 12, f64::INFINITY);
        repo.save(&r).await.unwrap();
        let back = repo.get_by_hash(&r.params_hash).await.unwrap().unwrap();
        assert_eq!(back, r);
        assert!(repo.get_by_hash("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_strategy_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.reports();
        for fast in [5, 8, 12] {
            repo.save(&report("ema_crossover", fast, 1.0)).await.unwrap();
        }
        repo.save(&report("rsi_reversion", 14, 1.0)).await.unwrap();
        let listed = repo.list_by_strategy("ema_crossover", 10).await.unwrap();
        let fasts: Vec<f64> = listed
            .iter()
            .filter_map(|r| r.parameters.get_f64("fast_period"))
            .collect();
        assert_eq!(fasts, vec![12.0, 8.0, 5.0]);
    }

    #[tokio::test]
    async fn test_top_by_metric_ranks_infinity_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.reports();
        repo.save(&report("a", 1, 0.5)).await.unwrap();
        repo.save(&report("a", 2, f64::INFINITY)).await.unwrap();
        repo.save(&report("a", 3, 2.0)).await.unwrap();
        repo.save(&report("a", 4, f64::NAN)).await.unwrap();
        repo.save(&report("b", 5, 9.0)).await.unwrap();

        let top = repo.top_by_metric("sharpe", 10, Some("a")).await.unwrap();
        let sharpes: Vec<f64> = top.iter().filter_map(|r| r.metric("sharpe")).collect();
        assert_eq!(sharpes, vec![f64::INFINITY, 2.0, 0.5]);

        let all = repo.top_by_metric("sharpe", 2, None).await.unwrap();
        assert_eq!(all[0].metric("sharpe"), Some(f64::INFINITY));
        assert_eq!(all[1].metric("sharpe"), Some(9.0));

        assert!(repo.top_by_metric("sharpe'; --", 1, None).await.is_err());
    }
}
