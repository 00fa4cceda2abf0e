//! Market regime classification from a trailing window of bars
//!
//! A regime is a (trend × volatility) bucket: bull/bear/sideways crossed with
//! high/low realized volatility. The classifier is a plain value; the engine asks it
//! for a regime on every bar and passes the answer along, nothing is kept globally.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::Bar;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bull,
    Bear,
    #[default]
    Sideways,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityLevel {
    High,
    #[default]
    Low,
}

/// Market condition bucket used for performance attribution
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Regime {
    pub trend: Trend,
    pub volatility: VolatilityLevel,
}

impl Regime {
    pub fn new(trend: Trend, volatility: VolatilityLevel) -> Self {
        Self { trend, volatility }
    }

    /// Stable key used in per-regime metric maps, e.g. `bull_high_vol`
    pub fn label(&self) -> String {
        self.to_string()
    }

    pub fn all() -> [Regime; 6] {
        [
            Regime::new(Trend::Bull, VolatilityLevel::High),
            Regime::new(Trend::Bull, VolatilityLevel::Low),
            Regime::new(Trend::Bear, VolatilityLevel::High),
            Regime::new(Trend::Bear, VolatilityLevel::Low),
            Regime::new(Trend::Sideways, VolatilityLevel::High),
            Regime::new(Trend::Sideways, VolatilityLevel::Low),
        ]
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trend = match self.trend {
            Trend::Bull => "bull",
            Trend::Bear => "bear",
            Trend::Sideways => "sideways",
        };
        let vol = match self.volatility {
            VolatilityLevel::High => "high_vol",
            VolatilityLevel::Low => "low_vol",
        };
        write!(f, "{trend}_{vol}")
    }
}

/// Classifier thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Trailing bars considered (including the current one)
    pub window: usize,
    /// Window return above +threshold is bull, below -threshold is bear
    pub trend_threshold: f64,
    /// Per-bar return stdev above this is high volatility
    pub volatility_threshold: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            window: 20,
            trend_threshold: 0.02,
            volatility_threshold: 0.01,
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(EngineError::Config(format!(
                "regime window must be >= 2, got {}",
                self.window
            )));
        }
        if !(self.trend_threshold >= 0.0 && self.volatility_threshold >= 0.0) {
            return Err(EngineError::Config(
                "regime thresholds must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Classifies the regime of the latest bar from its trailing window
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    /// Classify the bar at `index` using `bars[index + 1 - window ..= index]`
    pub fn classify_at(&self, bars: &[Bar], index: usize) -> Regime {
        let start = (index + 1).saturating_sub(self.config.window);
        self.classify(&bars[start..=index])
    }

    /// Classify a trailing window whose last element is the current bar
    pub fn classify(&self, window: &[Bar]) -> Regime {
        if window.len() < 2 {
            return Regime::default();
        }
        let first = window[0].close;
        let last = window[window.len() - 1].close;
        let window_return = if first > 0.0 { last / first - 1.0 } else { 0.0 };

        let trend = if window_return > self.config.trend_threshold {
            Trend::Bull
        } else if window_return < -self.config.trend_threshold {
            Trend::Bear
        } else {
            Trend::Sideways
        };

        let returns: Vec<f64> = window
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect();
        let volatility = if std_dev(&returns) > self.config.volatility_threshold {
            VolatilityLevel::High
        } else {
            VolatilityLevel::Low
        };

        Regime { trend, volatility }
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}
