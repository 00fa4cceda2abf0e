//! Exported report shape for storage collaborators
//!
//! `{strategy_id, metrics, parameters, period_start, period_end}` plus a
//! deterministic hash used for deduplication. Non-finite metric values are
//! written as the strings `"inf"`, `"-inf"` and `"nan"` since JSON has no
//! representation for them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::params::ParamSet;
use crate::types::BacktestResult;
use crate::walk_forward::WalkForwardResult;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    #[default]
    Backtest,
    /// Stitched out-of-sample performance of a walk-forward analysis
    WalkForward,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Backtest => "backtest",
            ReportKind::WalkForward => "walk_forward",
        }
    }
}

impl std::str::FromStr for ReportKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backtest" => Ok(ReportKind::Backtest),
            "walk_forward" => Ok(ReportKind::WalkForward),
            other => Err(EngineError::InvalidInput(format!("unknown report kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub strategy_id: String,
    pub params_hash: String,
    pub kind: ReportKind,
    #[serde(with = "non_finite_map")]
    pub metrics: BTreeMap<String, f64>,
    pub parameters: ParamSet,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl StrategyReport {
    pub fn from_result(result: &BacktestResult) -> Result<Self> {
        Self::build(
            &result.strategy_name,
            ReportKind::Backtest,
            result.metrics_map(),
            result.params.clone(),
            result.start_time,
            result.end_time,
        )
    }

    /// Report over the stitched out-of-sample curve. Parameters are those of
    /// the most recent window.
    pub fn from_walk_forward(result: &WalkForwardResult) -> Result<Self> {
        let (Some(first), Some(last)) = (result.stitched_equity.first(), result.stitched_equity.last()) else {
            return Err(EngineError::InvalidInput(
                "walk-forward result has no completed window".into(),
            ));
        };
        let parameters = result
            .windows
            .last()
            .map(|w| w.optimized_params.clone())
            .unwrap_or_default();
        let mut metrics = result.oos_metrics.to_map();
        metrics.insert("consistency_score".into(), result.consistency_score);
        metrics.insert("mean_degradation".into(), result.degradation.mean);
        metrics.insert("windows".into(), result.windows.len() as f64);
        Self::build(
            &result.strategy_name,
            ReportKind::WalkForward,
            metrics,
            parameters,
            first.time,
            last.time,
        )
    }

    fn build(
        strategy_id: &str,
        kind: ReportKind,
        metrics: BTreeMap<String, f64>,
        parameters: ParamSet,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Self> {
        Ok(Self {
            strategy_id: strategy_id.to_string(),
            params_hash: params_hash(strategy_id, kind, &parameters, start_ms, end_ms),
            kind,
            metrics,
            parameters,
            period_start: timestamp(start_ms)?,
            period_end: timestamp(end_ms)?,
        })
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::InvalidInput(e.to_string()))
    }
}

/// Deterministic hash of strategy, parameters and period
pub fn params_hash(strategy_id: &str, kind: ReportKind, params: &ParamSet, start_ms: i64, end_ms: i64) -> String {
    let input = format!("{}:{}:{}:{}:{}", strategy_id, kind.as_str(), params.key(), start_ms, end_ms);
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::InvalidInput(format!("timestamp {ms} out of range")))
}

// ============================================================================
// Non-finite serde helpers
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

impl Repr {
    fn encode(value: f64) -> Self {
        if value.is_nan() {
            Repr::Text("nan".into())
        } else if value == f64::INFINITY {
            Repr::Text("inf".into())
        } else if value == f64::NEG_INFINITY {
            Repr::Text("-inf".into())
        } else {
            Repr::Number(value)
        }
    }

    fn decode<E: serde::de::Error>(self) -> std::result::Result<f64, E> {
        match self {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("expected a number, 'inf', '-inf' or 'nan', got '{other}'"))),
            },
        }
    }
}

/// `f64` fields that may hold a sentinel
pub mod non_finite {
    use super::Repr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        Repr::encode(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Repr::deserialize(deserializer)?.decode()
    }
}

pub mod non_finite_option {
    use super::Repr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(Repr::encode).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Option::<Repr>::deserialize(deserializer)?
            .map(Repr::decode)
            .transpose()
    }
}

pub mod non_finite_map {
    use std::collections::BTreeMap;

    use super::Repr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(map: &BTreeMap<String, f64>, serializer: S) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k, Repr::encode(*v)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error> {
        BTreeMap::<String, Repr>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| v.decode().map(|v| (k, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BacktestEngine;
    use crate::types::{BacktestConfig, Bar, Direction, Signal};

    fn make_bars(prices: &[f64]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Bar::new(1_700_000_000_000 + i as i64 * 3_600_000, p, p + 1.0, p - 1.0, p, 1_000.0))
            .collect()
    }

    fn winning_result() -> BacktestResult {
        let bars = make_bars(&[100.0, 100.0, 110.0, 110.0]);
        let signals = vec![
            Signal::new(bars[1].timestamp, "", Direction::Long),
            Signal::new(bars[2].timestamp, "", Direction::Flat),
        ];
        let params = ParamSet::new().with("position_pct", 0.1);
        BacktestEngine::run(&BacktestConfig::default(), &bars, &signals, "ema_crossover", &params).unwrap()
    }

    #[test]
    fn test_report_shape() {
        let result = winning_result();
        let report = StrategyReport::from_result(&result).unwrap();
        assert_eq!(report.strategy_id, "ema_crossover");
        assert_eq!(report.params_hash.len(), 64);
        assert_eq!(report.period_start.timestamp_millis(), result.start_time);
        assert_eq!(report.period_end.timestamp_millis(), result.end_time);
        assert_eq!(report.metric("trade_count"), Some(1.0));
        assert_eq!(report.parameters.get_f64("position_pct"), Some(0.1));
    }

    #[test]
    fn test_infinite_metrics_survive_json() {
        let report = StrategyReport::from_result(&winning_result()).unwrap();
        assert_eq!(report.metric("profit_factor"), Some(f64::INFINITY));
        let json = report.to_json().unwrap();
        assert!(json.contains("\"inf\""));
        let back: StrategyReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metric("profit_factor"), Some(f64::INFINITY));
        assert_eq!(back.params_hash, report.params_hash);
    }

    #[test]
    fn test_hash_depends_on_params_and_period() {
        let params = ParamSet::new().with("fast_period", 12i64);
        let a = params_hash("ema", ReportKind::Backtest, &params, 0, 10);
        assert_eq!(a, params_hash("ema", ReportKind::Backtest, &params, 0, 10));
        assert_ne!(a, params_hash("ema", ReportKind::Backtest, &params, 0, 11));
        assert_ne!(a, params_hash("ema", ReportKind::WalkForward, &params, 0, 10));
        let other = ParamSet::new().with("fast_period", 13i64);
        assert_ne!(a, params_hash("ema", ReportKind::Backtest, &other, 0, 10));
    }

    #[test]
    fn test_nan_round_trips_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "non_finite")]
            value: f64,
            #[serde(with = "non_finite_option")]
            maybe: Option<f64>,
        }
        let json = serde_json::to_string(&Wrapper {
            value: f64::NAN,
            maybe: Some(f64::NEG_INFINITY),
        })
        .unwrap();
        assert_eq!(json, r#"{"value":"nan","maybe":"-inf"}"#);
        let back: Wrapper = serde_json::from_str(r#"{"value":1.5,"maybe":null}"#).unwrap();
        assert_eq!(back.value, 1.5);
        assert_eq!(back.maybe, None);
        assert!(serde_json::from_str::<Wrapper>(r#"{"value":"huge","maybe":null}"#).is_err());
    }
}
