//! Core data model shared by the engine, optimizer, walk-forward and Monte Carlo layers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::metrics::PerformanceReport;
use crate::params::ParamSet;
use crate::regime::{Regime, RegimeConfig};

/// Milliseconds per 8-hour funding interval
pub const FUNDING_INTERVAL_MS: i64 = 8 * 60 * 60 * 1000;

/// A single OHLCV bar with its derived short-window volatility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, milliseconds since epoch
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Realized volatility over a short trailing window (fraction, not annualized)
    #[serde(default)]
    pub volatility: f64,
}

impl Bar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            volatility: 0.0,
        }
    }
}

/// Direction requested by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

/// A trading signal produced by an external strategy, time-aligned to a bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: i64,
    pub symbol: String,
    pub direction: Direction,
    /// Requested quantity in base units
    #[serde(default)]
    pub size_hint: Option<f64>,
}

impl Signal {
    pub fn new(timestamp: i64, symbol: impl Into<String>, direction: Direction) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            direction,
            size_hint: None,
        }
    }

    pub fn with_size(mut self, quantity: f64) -> Self {
        self.size_hint = Some(quantity);
        self
    }
}

/// Side of an open position or closed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

/// Liquidity style of signal-driven orders
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStyle {
    Maker,
    #[default]
    Taker,
}

/// Fee schedule, all rates as fractions of notional
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub maker: f64,
    pub taker: f64,
    /// Charged on notional for every 8h boundary a leveraged position crosses
    pub funding_per_8h: f64,
    pub order_style: OrderStyle,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker: 0.0002,
            taker: 0.0004,
            funding_per_8h: 0.0001,
            order_style: OrderStyle::Taker,
        }
    }
}

/// Slippage coefficients, all in basis points
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageModel {
    pub fixed_bps: f64,
    /// bps per unit of order-quantity / bar-volume
    pub volume_factor: f64,
    /// bps per unit of realized volatility
    pub volatility_factor: f64,
    /// Added on stop-triggered and circuit-breaker fills
    pub stop_extra_bps: f64,
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self {
            fixed_bps: 5.0,
            volume_factor: 10.0,
            volatility_factor: 50.0,
            stop_extra_bps: 10.0,
        }
    }
}

/// Risk limits enforced by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Maximum committed capital as a fraction of equity
    pub max_position_pct: f64,
    pub max_leverage: f64,
    /// Drawdown from peak (fraction) that trips the circuit breaker
    pub circuit_breaker_drawdown: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_pct: 0.25,
            max_leverage: 1.0,
            circuit_breaker_drawdown: 0.30,
        }
    }
}

/// Configuration for a backtest run. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub symbol: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub initial_capital: f64,
    pub fees: FeeSchedule,
    pub slippage: SlippageModel,
    pub risk: RiskLimits,
    pub allow_short: bool,
    pub regime: RegimeConfig,
    /// Annual risk-free rate used by Sharpe/Sortino
    pub risk_free_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            start_time: None,
            end_time: None,
            initial_capital: 100_000.0,
            fees: FeeSchedule::default(),
            slippage: SlippageModel::default(),
            risk: RiskLimits::default(),
            allow_short: true,
            regime: RegimeConfig::default(),
            risk_free_rate: 0.0,
        }
    }
}

impl BacktestConfig {
    /// Check every field that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(EngineError::Config(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if !(self.risk.max_leverage >= 1.0) {
            return Err(EngineError::Config(format!(
                "max_leverage must be >= 1, got {}",
                self.risk.max_leverage
            )));
        }
        if !(self.risk.max_position_pct > 0.0 && self.risk.max_position_pct <= 1.0) {
            return Err(EngineError::Config(format!(
                "max_position_pct must be in (0, 1], got {}",
                self.risk.max_position_pct
            )));
        }
        if !(self.risk.circuit_breaker_drawdown > 0.0 && self.risk.circuit_breaker_drawdown <= 1.0)
        {
            return Err(EngineError::Config(format!(
                "circuit_breaker_drawdown must be in (0, 1], got {}",
                self.risk.circuit_breaker_drawdown
            )));
        }
        let rates = [
            ("maker", self.fees.maker),
            ("taker", self.fees.taker),
            ("funding_per_8h", self.fees.funding_per_8h),
            ("fixed_bps", self.slippage.fixed_bps),
            ("volume_factor", self.slippage.volume_factor),
            ("volatility_factor", self.slippage.volatility_factor),
            ("stop_extra_bps", self.slippage.stop_extra_bps),
        ];
        for (name, value) in rates {
            if !(value.is_finite() && value >= 0.0) {
                return Err(EngineError::Config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(EngineError::Config(format!(
                    "start_time {start} must be before end_time {end}"
                )));
            }
        }
        self.regime.validate()
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    Stop,
    TakeProfit,
    CircuitBreaker,
    EndOfData,
}

/// An open position, owned by the engine state for its whole life
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub quantity: f64,
    /// Entry fill price (slippage included)
    pub entry_price: f64,
    /// Reference price before slippage
    pub entry_reference: f64,
    pub opened_at: i64,
    pub entry_index: usize,
    pub leverage: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Worst unrealized pnl seen (<= 0)
    pub mae: f64,
    /// Best unrealized pnl seen (>= 0)
    pub mfe: f64,
    pub regime_at_entry: Regime,
    pub entry_fee: f64,
    pub entry_slippage: f64,
    pub funding_paid: f64,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.quantity * self.entry_price
    }

    /// Capital committed to the position
    pub fn margin(&self) -> f64 {
        self.notional() / self.leverage
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    pub fn is_leveraged(&self) -> bool {
        self.leverage > 1.0
    }
}

/// A closed trade. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub quantity: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_index: usize,
    pub exit_index: usize,
    /// Price-driven pnl between fills, before fees and funding
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub slippage_paid: f64,
    pub funding_paid: f64,
    /// Holding period in bars, always >= 1
    pub duration: usize,
    pub exit_reason: ExitReason,
    pub regime_at_entry: Regime,
    pub mae: f64,
    pub mfe: f64,
}

impl Trade {
    pub fn net_pnl(&self) -> f64 {
        self.realized_pnl - self.fees_paid - self.funding_paid
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl() > 0.0
    }
}

/// A point on the equity curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: f64,
}

/// Performance attributed to one market regime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    pub bars: usize,
    pub pnl: f64,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
}

/// Result of a backtest run. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub symbol: String,
    pub params: ParamSet,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PerformanceReport,
    pub regime_metrics: BTreeMap<String, RegimeStats>,
    pub total_fees: f64,
    pub total_funding: f64,
    pub total_slippage: f64,
    pub circuit_breaker_tripped_at: Option<i64>,
}

impl BacktestResult {
    /// Derived metrics as a name → value map
    pub fn metrics_map(&self) -> BTreeMap<String, f64> {
        self.metrics.to_map()
    }

    pub fn total_return(&self) -> f64 {
        self.metrics.total_return
    }
}

/// Fill `volatility` on every bar with the stdev of log returns over the
/// trailing `window` bars
pub fn annotate_volatility(bars: &mut [Bar], window: usize) {
    let window = window.max(2);
    let log_returns: Vec<f64> = std::iter::once(0.0)
        .chain(bars.windows(2).map(|w| {
            if w[0].close > 0.0 && w[1].close > 0.0 {
                (w[1].close / w[0].close).ln()
            } else {
                0.0
            }
        }))
        .collect();

    for i in 0..bars.len() {
        let start = (i + 1).saturating_sub(window).max(1);
        let slice = if i >= 1 { &log_returns[start..=i] } else { &[][..] };
        bars[i].volatility = sample_std(slice);
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BacktestConfig::default().validate().is_ok());
    }

    #[test]
    fn test_leverage_below_one_rejected() {
        let mut config = BacktestConfig::default();
        config.risk.max_leverage = 0.5;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let config = BacktestConfig {
            start_time: Some(10),
            end_time: Some(5),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_annotate_volatility() {
        let mut flat: Vec<Bar> = (0..10)
            .map(|i| Bar::new(i, 100.0, 100.0, 100.0, 100.0, 1.0))
            .collect();
        annotate_volatility(&mut flat, 5);
        assert!(flat.iter().all(|b| b.volatility == 0.0));

        let mut choppy: Vec<Bar> = (0..10)
            .map(|i| {
                let p = if i % 2 == 0 { 100.0 } else { 110.0 };
                Bar::new(i, p, p, p, p, 1.0)
            })
            .collect();
        annotate_volatility(&mut choppy, 5);
        assert_eq!(choppy[0].volatility, 0.0);
        assert!(choppy[9].volatility > 0.05);
    }

    #[test]
    fn test_trade_net_pnl() {
        let trade = Trade {
            side: Side::Long,
            quantity: 1.0,
            entry_time: 0,
            exit_time: 1,
            entry_price: 100.0,
            exit_price: 110.0,
            entry_index: 0,
            exit_index: 1,
            realized_pnl: 10.0,
            fees_paid: 0.5,
            slippage_paid: 0.1,
            funding_paid: 0.25,
            duration: 1,
            exit_reason: ExitReason::Signal,
            regime_at_entry: Regime::default(),
            mae: 0.0,
            mfe: 10.0,
        };
        assert!((trade.net_pnl() - 9.25).abs() < 1e-12);
        assert!(trade.is_win());
    }
}
