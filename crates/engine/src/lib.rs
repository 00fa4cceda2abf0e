//! stratlab engine: strategy validation
//!
//! Provides:
//! - Bar-by-bar backtesting with fees, slippage, funding, stops and a drawdown circuit breaker
//! - Parameter optimization (grid, random, genetic) over a typed search space
//! - Walk-forward analysis with rolling or anchored windows
//! - Monte Carlo robustness analysis of completed backtests
//! - Performance metrics and the exported report shape

pub mod engine;
pub mod error;
pub mod export;
pub mod fees;
pub mod indicators;
pub mod metrics;
pub mod monte_carlo;
pub mod optimizer;
pub mod params;
pub mod pool;
pub mod regime;
pub mod types;
pub mod walk_forward;

// Re-exports for convenience
pub use engine::{BacktestEngine, EngineState, ExecutionParams};
pub use error::{EngineError, Result};
pub use export::{params_hash, ReportKind, StrategyReport};
pub use indicators::{build_strategy, StaticSignals, StrategyFactory, STRATEGIES};
pub use metrics::{compute as compute_metrics, PerformanceReport};
pub use monte_carlo::{
    simulate, MonteCarloConfig, MonteCarloResult, MonteCarloRun, MonteCarloSimulator, SimulationMethod,
};
pub use optimizer::{
    optimize, BacktestObjective, Constraints, DataSplit, Evaluation, GeneticConfig, Objective,
    ObjectiveFunction, OptimizationCandidate, OptimizationResult, OptimizerConfig, ParameterOptimizer,
    SearchMethod,
};
pub use params::{ParamDomain, ParamSet, ParamSpace, ParamValue};
pub use pool::{BatchControl, WorkerPool};
pub use regime::{Regime, RegimeClassifier, RegimeConfig};
pub use types::*;
pub use walk_forward::{
    analyze, WalkForwardAnalyzer, WalkForwardConfig, WalkForwardResult, WalkForwardWindow, WindowMode,
};

/// Run a single backtest
pub fn run(
    config: &BacktestConfig,
    bars: &[Bar],
    signals: &[Signal],
    strategy_name: &str,
    params: &ParamSet,
) -> Result<BacktestResult> {
    BacktestEngine::run(config, bars, signals, strategy_name, params)
}
