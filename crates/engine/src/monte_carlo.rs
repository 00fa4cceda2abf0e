//! Monte Carlo robustness analysis of a completed backtest
//!
//! Trade randomization and return bootstrapping replay the realized trade list
//! in a different order (or a resampled one) onto the initial capital. Parameter
//! sensitivity re-runs the whole engine with perturbed parameters. Every run is
//! an independent unit on the worker pool with its own seeded RNG.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::BacktestEngine;
use crate::error::{EngineError, Result};
use crate::export::non_finite;
use crate::export::non_finite_option;
use crate::indicators::StrategyFactory;
use crate::metrics::{
    drawdown_profile, finite_or, mean, median, percentile_sorted, period_returns, ratio, stability,
    std_dev,
};
use crate::params::ParamSet;
use crate::pool::{unit_rng, unit_seed, BatchControl, WorkerPool};
use crate::types::{BacktestConfig, BacktestResult, Bar};

const YEAR_MS: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Percentiles reported for every distribution
pub const PERCENTILES: [f64; 5] = [5.0, 25.0, 50.0, 75.0, 95.0];

/// Score used for parameter sensitivity when it was not measured
pub const NEUTRAL_SENSITIVITY: f64 = 0.5;

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMethod {
    /// Random permutations of the trade pnl sequence
    #[default]
    TradeRandomization,
    /// Per-trade returns resampled with replacement
    ReturnBootstrapping,
    /// Full engine re-runs with perturbed numeric parameters
    ParameterSensitivity,
}

impl std::fmt::Display for SimulationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SimulationMethod::TradeRandomization => "trade_randomization",
            SimulationMethod::ReturnBootstrapping => "return_bootstrapping",
            SimulationMethod::ParameterSensitivity => "parameter_sensitivity",
        })
    }
}

impl std::str::FromStr for SimulationMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trade_randomization" | "trades" => Ok(SimulationMethod::TradeRandomization),
            "return_bootstrapping" | "bootstrap" => Ok(SimulationMethod::ReturnBootstrapping),
            "parameter_sensitivity" | "params" => Ok(SimulationMethod::ParameterSensitivity),
            other => Err(EngineError::Config(format!("unknown simulation method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub method: SimulationMethod,
    pub n_simulations: usize,
    pub seed: u64,
    /// Max drawdown beyond which a run counts as ruined
    pub ruin_threshold: f64,
    /// Half-width of the uniform parameter perturbation, as a fraction
    pub perturbation_range: f64,
    pub threads: Option<usize>,
    pub timeout_secs: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            method: SimulationMethod::TradeRandomization,
            n_simulations: 1000,
            seed: 42,
            ruin_threshold: 0.5,
            perturbation_range: 0.10,
            threads: None,
            timeout_secs: None,
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_simulations == 0 {
            return Err(EngineError::Config("n_simulations must be > 0".into()));
        }
        if !(self.ruin_threshold > 0.0 && self.ruin_threshold <= 1.0) {
            return Err(EngineError::Config(format!(
                "ruin_threshold must be in (0, 1], got {}",
                self.ruin_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.perturbation_range) {
            return Err(EngineError::Config(format!(
                "perturbation_range must be in [0, 1), got {}",
                self.perturbation_range
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// One simulated alternate history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloRun {
    pub index: usize,
    pub seed: u64,
    pub final_equity: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    #[serde(with = "non_finite")]
    pub sharpe: f64,
    /// Steps from the deepest trough back to the prior peak, `None` if never recovered
    pub recovery_time: Option<usize>,
    pub total_pnl: f64,
    pub equity_curve: Vec<f64>,
    /// Perturbed parameters, for sensitivity runs
    pub params: Option<ParamSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    /// Values at [`PERCENTILES`], in order
    pub percentiles: Vec<(f64, f64)>,
}

impl Distribution {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            mean: mean(values),
            median: median(values),
            std: std_dev(values),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            percentiles: PERCENTILES
                .iter()
                .map(|&p| (p, percentile_sorted(&sorted, p)))
                .collect(),
        }
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|(q, _)| (*q - p).abs() < f64::EPSILON)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub method: SimulationMethod,
    pub strategy_name: String,
    pub n_simulations: usize,
    pub runs: Vec<MonteCarloRun>,
    pub returns: Distribution,
    /// Over finite run Sharpe ratios only
    pub sharpe: Distribution,
    pub max_drawdown: Distribution,
    pub probability_of_profit: f64,
    pub probability_of_ruin: f64,
    pub var_95: f64,
    pub cvar_95: f64,
    pub return_stability: f64,
    pub sharpe_stability: f64,
    pub param_sensitivity_score: f64,
    pub robustness_score: f64,
    pub original_return: f64,
    #[serde(with = "non_finite_option")]
    pub original_sharpe: Option<f64>,
    pub failed_runs: usize,
    pub partial: bool,
}

// ============================================================================
// Simulator
// ============================================================================

pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
    pool: WorkerPool,
    control: Arc<BatchControl>,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.threads)?;
        let control = match config.timeout_secs {
            Some(secs) => BatchControl::with_timeout(Duration::from_secs(secs)),
            None => BatchControl::new(),
        };
        Ok(Self {
            config,
            pool,
            control: Arc::new(control),
        })
    }

    pub fn with_control(mut self, control: Arc<BatchControl>) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> &Arc<BatchControl> {
        &self.control
    }

    /// Resample the realized trades of `result`.
    ///
    /// Parameter sensitivity needs the original bars; use [`Self::simulate_sensitivity`].
    pub fn simulate(&self, result: &BacktestResult) -> Result<MonteCarloResult> {
        let pnls: Vec<f64> = result.trades.iter().map(|t| t.net_pnl()).collect();
        if pnls.is_empty() {
            return Err(EngineError::InvalidInput(
                "backtest has no trades to resample".into(),
            ));
        }
        let periods = trades_per_year(result);
        let capital = result.initial_capital;

        let outcome = match self.config.method {
            SimulationMethod::TradeRandomization => {
                info!(runs = self.config.n_simulations, trades = pnls.len(), "Starting trade randomization");
                self.pool.map(&self.units(), &self.control, |_, &i| {
                    let mut rng = unit_rng(self.config.seed, i);
                    let mut order = pnls.clone();
                    order.shuffle(&mut rng);
                    Ok(replay_pnls(i, unit_seed(self.config.seed, i), capital, &order, periods))
                })
            }
            SimulationMethod::ReturnBootstrapping => {
                let returns = trade_returns(capital, &pnls);
                info!(runs = self.config.n_simulations, trades = returns.len(), "Starting return bootstrapping");
                self.pool.map(&self.units(), &self.control, |_, &i| {
                    let mut rng = unit_rng(self.config.seed, i);
                    let sample: Vec<f64> = (0..returns.len())
                        .map(|_| returns[rng.gen_range(0..returns.len())])
                        .collect();
                    Ok(replay_returns(i, unit_seed(self.config.seed, i), capital, &sample, periods))
                })
            }
            SimulationMethod::ParameterSensitivity => {
                return Err(EngineError::Config(
                    "parameter sensitivity re-runs the engine and needs the original bars".into(),
                ));
            }
        };

        let failed = outcome.failures.len();
        let partial = outcome.is_partial();
        let runs = outcome.into_values();
        self.aggregate(result, runs, None, failed, partial)
    }

    /// Re-run the engine on `bars` with every numeric parameter of
    /// `result.params` perturbed per run
    pub fn simulate_sensitivity(
        &self,
        result: &BacktestResult,
        config: &BacktestConfig,
        bars: &[Bar],
        factory: &dyn StrategyFactory,
    ) -> Result<MonteCarloResult> {
        config.validate()?;
        if result.params.numeric().next().is_none() {
            return Err(EngineError::InvalidInput(
                "no numeric parameters to perturb".into(),
            ));
        }
        info!(
            runs = self.config.n_simulations,
            strategy = factory.name(),
            range = self.config.perturbation_range,
            "Starting parameter sensitivity"
        );

        let outcome = self.pool.map(&self.units(), &self.control, |_, &i| {
            let mut rng = unit_rng(self.config.seed, i);
            let params = result.params.perturbed(self.config.perturbation_range, &mut rng);
            let signals = factory.signals(bars, &params)?;
            let rerun = BacktestEngine::run(config, bars, &signals, factory.name(), &params)?;
            let equity: Vec<f64> = rerun.equity_curve.iter().map(|p| p.equity).collect();
            let dd = drawdown_profile(&equity);
            debug!(run = i, params = %params, total_return = rerun.total_return(), "Sensitivity run complete");
            Ok(MonteCarloRun {
                index: i,
                seed: unit_seed(self.config.seed, i),
                final_equity: rerun.final_equity,
                total_return: rerun.total_return(),
                max_drawdown: dd.max_drawdown,
                sharpe: rerun.metrics.sharpe,
                recovery_time: dd.recovery_bars,
                total_pnl: rerun.trades.iter().map(|t| t.net_pnl()).sum(),
                equity_curve: equity,
                params: Some(params),
            })
        });

        let failed = outcome.failures.len();
        let partial = outcome.is_partial();
        let runs = outcome.into_values();
        let sensitivity = sensitivity_score(result.total_return(), &runs);
        self.aggregate(result, runs, Some(sensitivity), failed, partial)
    }

    fn units(&self) -> Vec<usize> {
        (0..self.config.n_simulations).collect()
    }

    fn aggregate(
        &self,
        original: &BacktestResult,
        runs: Vec<MonteCarloRun>,
        sensitivity: Option<f64>,
        failed_runs: usize,
        partial: bool,
    ) -> Result<MonteCarloResult> {
        if runs.is_empty() {
            return Err(if self.control.should_stop() {
                EngineError::Cancelled
            } else {
                EngineError::SimulationDivergence(format!("all {failed_runs} runs failed"))
            });
        }

        let returns: Vec<f64> = runs.iter().map(|r| r.total_return).collect();
        let drawdowns: Vec<f64> = runs.iter().map(|r| r.max_drawdown).collect();
        let sharpes: Vec<f64> = runs.iter().map(|r| r.sharpe).filter(|s| s.is_finite()).collect();
        if sharpes.len() < runs.len() {
            warn!(
                excluded = runs.len() - sharpes.len(),
                "Non-finite run Sharpe ratios excluded from distribution"
            );
        }

        let n = runs.len() as f64;
        let probability_of_profit = returns.iter().filter(|&&r| r > 0.0).count() as f64 / n;
        let probability_of_ruin = drawdowns
            .iter()
            .filter(|&&d| d > self.config.ruin_threshold)
            .count() as f64
            / n;
        let (var_95, cvar_95) = value_at_risk(&returns);

        let return_stability = stability(&returns);
        let sharpe_stability = if sharpes.is_empty() { 0.0 } else { stability(&sharpes) };
        let param_sensitivity_score = sensitivity.unwrap_or(NEUTRAL_SENSITIVITY);
        let robustness_score = robustness(
            return_stability,
            sharpe_stability,
            param_sensitivity_score,
            probability_of_profit,
        );

        let original_sharpe = Some(original.metrics.sharpe).filter(|s| s.is_finite());
        let result = MonteCarloResult {
            method: self.config.method,
            strategy_name: original.strategy_name.clone(),
            n_simulations: self.config.n_simulations,
            returns: Distribution::from_values(&returns),
            sharpe: Distribution::from_values(&sharpes),
            max_drawdown: Distribution::from_values(&drawdowns),
            runs,
            probability_of_profit,
            probability_of_ruin,
            var_95,
            cvar_95,
            return_stability,
            sharpe_stability,
            param_sensitivity_score,
            robustness_score,
            original_return: original.total_return(),
            original_sharpe,
            failed_runs,
            partial,
        };
        info!(
            method = %result.method,
            runs = result.runs.len(),
            mean_return = result.returns.mean,
            p_profit = result.probability_of_profit,
            p_ruin = result.probability_of_ruin,
            var_95 = result.var_95,
            robustness = result.robustness_score,
            "Monte Carlo complete"
        );
        Ok(result)
    }
}

/// Run a trade-based simulation with a fresh pool
pub fn simulate(mc_config: &MonteCarloConfig, backtest_result: &BacktestResult) -> Result<MonteCarloResult> {
    MonteCarloSimulator::new(mc_config.clone())?.simulate(backtest_result)
}

// ============================================================================
// Replay and statistics
// ============================================================================

/// Replay absolute pnls additively onto `capital`
fn replay_pnls(index: usize, seed: u64, capital: f64, pnls: &[f64], periods: f64) -> MonteCarloRun {
    let mut equity = Vec::with_capacity(pnls.len() + 1);
    equity.push(capital);
    let mut current = capital;
    for pnl in pnls {
        current += pnl;
        equity.push(current);
    }
    finish_run(index, seed, capital, pnls.iter().sum(), equity, periods)
}

/// Replay fractional returns compounding onto `capital`
fn replay_returns(index: usize, seed: u64, capital: f64, returns: &[f64], periods: f64) -> MonteCarloRun {
    let mut equity = Vec::with_capacity(returns.len() + 1);
    equity.push(capital);
    let mut current = capital;
    for r in returns {
        current *= 1.0 + r;
        equity.push(current);
    }
    finish_run(index, seed, capital, current - capital, equity, periods)
}

fn finish_run(index: usize, seed: u64, capital: f64, total_pnl: f64, equity: Vec<f64>, periods: f64) -> MonteCarloRun {
    let final_equity = equity.last().copied().unwrap_or(capital);
    let dd = drawdown_profile(&equity);
    let steps = period_returns(&equity);
    let sharpe = finite_or(
        "mc_sharpe",
        ratio(mean(&steps), std_dev(&steps)) * periods.sqrt(),
        0.0,
    );
    MonteCarloRun {
        index,
        seed,
        final_equity,
        total_return: ratio(final_equity - capital, capital),
        max_drawdown: dd.max_drawdown,
        sharpe,
        recovery_time: dd.recovery_bars,
        total_pnl,
        equity_curve: equity,
        params: None,
    }
}

/// Per-trade returns on the equity each trade started from
fn trade_returns(capital: f64, pnls: &[f64]) -> Vec<f64> {
    let mut equity = capital;
    pnls.iter()
        .map(|pnl| {
            let r = if equity > 0.0 { pnl / equity } else { 0.0 };
            equity += pnl;
            r
        })
        .collect()
}

/// Trades per year over the backtest span, 1 when the span is empty
fn trades_per_year(result: &BacktestResult) -> f64 {
    let years = (result.end_time - result.start_time) as f64 / YEAR_MS;
    if years > 0.0 {
        result.trades.len() as f64 / years
    } else {
        1.0
    }
}

/// 95% VaR (5th percentile of returns) and CVaR (mean of returns at or below it)
pub fn value_at_risk(returns: &[f64]) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let var = percentile_sorted(&sorted, 5.0);
    let tail: Vec<f64> = sorted.iter().copied().filter(|&r| r <= var).collect();
    let cvar = if tail.is_empty() { var } else { mean(&tail) };
    (var, cvar)
}

/// Weighted robustness in [0, 1]
pub fn robustness(return_stability: f64, sharpe_stability: f64, param_sensitivity: f64, p_profit: f64) -> f64 {
    0.3 * return_stability + 0.3 * sharpe_stability + 0.2 * param_sensitivity + 0.2 * p_profit
}

/// 1 minus the mean relative deviation of perturbed returns from the original, floored at 0
fn sensitivity_score(original_return: f64, runs: &[MonteCarloRun]) -> f64 {
    if runs.is_empty() {
        return NEUTRAL_SENSITIVITY;
    }
    let deviations: Vec<f64> = runs
        .iter()
        .map(|r| (r.total_return - original_return).abs())
        .collect();
    let relative = ratio(mean(&deviations), original_return.abs());
    finite_or("param_sensitivity", (1.0 - relative).max(0.0), 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::StaticSignals;
    use crate::types::{Direction, Signal};

    fn make_bars(prices: &[f64]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Bar::new(i as i64 * 3_600_000, p, p + 1.0, p - 1.0, p, 1_000.0))
            .collect()
    }

    /// Backtest with several winning and losing round trips
    fn traded_result() -> (Vec<Bar>, Vec<Signal>, BacktestResult) {
        let prices = [
            100.0, 104.0, 104.0, 101.0, 101.0, 97.0, 97.0, 103.0, 103.0, 99.0, 99.0, 106.0, 106.0,
            102.0, 102.0, 105.0,
        ];
        let bars = make_bars(&prices);
        let signals: Vec<Signal> = (0..prices.len() - 1)
            .step_by(2)
            .flat_map(|i| {
                [
                    Signal::new(bars[i].timestamp, "", Direction::Long),
                    Signal::new(bars[i + 1].timestamp, "", Direction::Flat),
                ]
            })
            .collect();
        let params = ParamSet::new().with("position_pct", 0.2);
        let result = BacktestEngine::run(&BacktestConfig::default(), &bars, &signals, "test", &params).unwrap();
        (bars, signals, result)
    }

    fn config(method: SimulationMethod) -> MonteCarloConfig {
        MonteCarloConfig {
            method,
            n_simulations: 200,
            threads: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_trade_randomization_preserves_total_pnl() {
        let (_, _, result) = traded_result();
        assert!(result.trades.len() >= 4);
        let total: f64 = result.trades.iter().map(|t| t.net_pnl()).sum();
        let mc = simulate(&config(SimulationMethod::TradeRandomization), &result).unwrap();
        assert_eq!(mc.runs.len(), 200);
        for run in &mc.runs {
            assert!((run.total_pnl - total).abs() < 1e-9);
            assert!((run.final_equity - result.final_equity).abs() < 1e-6);
        }
        // Paths differ even though the end point does not
        let drawdowns: Vec<f64> = mc.runs.iter().map(|r| r.max_drawdown).collect();
        assert!(drawdowns.iter().any(|d| (d - drawdowns[0]).abs() > 1e-12));
    }

    #[test]
    fn test_bootstrapping_varies_total_return() {
        let (_, _, result) = traded_result();
        let mc = simulate(&config(SimulationMethod::ReturnBootstrapping), &result).unwrap();
        let first = mc.runs[0].total_return;
        assert!(mc.runs.iter().any(|r| (r.total_return - first).abs() > 1e-9));
        assert!(mc.returns.min < mc.returns.max);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let (_, _, result) = traded_result();
        let a = simulate(&config(SimulationMethod::ReturnBootstrapping), &result).unwrap();
        let b = simulate(&config(SimulationMethod::ReturnBootstrapping), &result).unwrap();
        let ra: Vec<f64> = a.runs.iter().map(|r| r.total_return).collect();
        let rb: Vec<f64> = b.runs.iter().map(|r| r.total_return).collect();
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_aggregate_statistics_are_bounded() {
        let (_, _, result) = traded_result();
        let mc = simulate(&config(SimulationMethod::ReturnBootstrapping), &result).unwrap();
        assert!((0.0..=1.0).contains(&mc.probability_of_profit));
        assert!((0.0..=1.0).contains(&mc.probability_of_ruin));
        assert!(mc.cvar_95 <= mc.var_95);
        assert_eq!(mc.returns.percentile(5.0), Some(mc.var_95));
        assert_eq!(mc.param_sensitivity_score, NEUTRAL_SENSITIVITY);
        assert!((0.0..=1.0).contains(&mc.robustness_score));
        let p: Vec<f64> = mc.returns.percentiles.iter().map(|(_, v)| *v).collect();
        assert!(p.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_parameter_sensitivity_reruns_engine() {
        let (bars, signals, result) = traded_result();
        let factory = StaticSignals::new(signals);
        let simulator = MonteCarloSimulator::new(MonteCarloConfig {
            n_simulations: 20,
            ..config(SimulationMethod::ParameterSensitivity)
        })
        .unwrap();
        let mc = simulator
            .simulate_sensitivity(&result, &BacktestConfig::default(), &bars, &factory)
            .unwrap();
        assert_eq!(mc.runs.len(), 20);
        for run in &mc.runs {
            let pct = run.params.as_ref().and_then(|p| p.get_f64("position_pct")).unwrap();
            assert!((0.18..=0.22).contains(&pct));
        }
        assert!((0.0..=1.0).contains(&mc.param_sensitivity_score));
    }

    #[test]
    fn test_sensitivity_needs_bars() {
        let (_, _, result) = traded_result();
        let err = simulate(&config(SimulationMethod::ParameterSensitivity), &result).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_no_trades_is_rejected() {
        let bars = make_bars(&[100.0, 101.0, 102.0]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &bars, &[], "flat", &ParamSet::new()).unwrap();
        let err = simulate(&config(SimulationMethod::TradeRandomization), &result).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_value_at_risk() {
        let returns: Vec<f64> = (0..100).map(|i| i as f64 / 100.0 - 0.5).collect();
        let (var, cvar) = value_at_risk(&returns);
        assert!((var - -0.4505).abs() < 1e-9);
        assert!(cvar < var);
    }

    #[test]
    fn test_robustness_weights() {
        assert!((robustness(1.0, 1.0, 1.0, 1.0) - 1.0).abs() < 1e-12);
        assert!((robustness(0.0, 0.0, 0.5, 0.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_cancelled_simulation() {
        let (_, _, result) = traded_result();
        let control = Arc::new(BatchControl::new());
        control.cancel();
        let simulator = MonteCarloSimulator::new(config(SimulationMethod::TradeRandomization))
            .unwrap()
            .with_control(control);
        assert_eq!(simulator.simulate(&result).unwrap_err(), EngineError::Cancelled);
    }
}
