//! Walk-forward analysis
//!
//! Each scheduled window re-optimizes on its in-sample bars and replays the
//! winning parameters, untouched, on the following out-of-sample bars.
//! Windows are independent and run concurrently on the worker pool; results are
//! re-ordered by window index before aggregation.
//!
//! The optimizer's own train/validation split is taken *inside* each window's
//! in-sample segment: out-of-sample bars are never seen during fitting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{select_range, BacktestEngine, MIN_BARS};
use crate::error::{EngineError, Result};
use crate::export::non_finite;
use crate::export::non_finite_option;
use crate::indicators::{segment_signals, StrategyFactory};
use crate::metrics::{self, coefficient_of_variation, finite_or, mean, median, PerformanceReport};
use crate::optimizer::{BacktestObjective, DataSplit, Objective, OptimizerConfig, ParameterOptimizer};
use crate::params::{ParamSet, ParamSpace};
use crate::pool::{BatchControl, WorkerPool};
use crate::types::{BacktestConfig, BacktestResult, Bar, EquityPoint, Trade};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Fixed-length in-sample window sliding forward by `step_days`
    #[default]
    Rolling,
    /// In-sample start fixed at the first bar, end extending by `step_days`
    Anchored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub mode: WindowMode,
    pub in_sample_days: u32,
    pub out_sample_days: u32,
    pub step_days: u32,
    /// Windows whose optimized in-sample run trades less than this are skipped
    pub min_trades_for_review: usize,
    pub objective: Objective,
    /// Share of each in-sample segment held out for the optimizer's validation
    pub validation_fraction: f64,
    pub optimizer: OptimizerConfig,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            mode: WindowMode::Rolling,
            in_sample_days: 180,
            out_sample_days: 30,
            step_days: 30,
            min_trades_for_review: 5,
            objective: Objective::Sharpe,
            validation_fraction: 0.3,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.in_sample_days == 0 || self.out_sample_days == 0 || self.step_days == 0 {
            return Err(EngineError::Config(
                "in_sample_days, out_sample_days and step_days must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(EngineError::Config(format!(
                "validation_fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        self.optimizer.validate()
    }
}

/// Half-open time range `[start, end)` in ms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    /// Index range of the bars inside this time range
    fn bounds(&self, bars: &[Bar]) -> std::ops::Range<usize> {
        let lo = bars.partition_point(|b| b.timestamp < self.start);
        let hi = bars.partition_point(|b| b.timestamp < self.end);
        lo..hi.max(lo)
    }

    fn slice<'b>(&self, bars: &'b [Bar]) -> &'b [Bar] {
        &bars[self.bounds(bars)]
    }
}

/// A scheduled in-sample / out-of-sample pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub index: usize,
    pub in_sample: TimeRange,
    pub out_sample: TimeRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardWindow {
    pub index: usize,
    pub in_sample_range: TimeRange,
    pub out_sample_range: TimeRange,
    pub optimized_params: ParamSet,
    pub in_sample_result: BacktestResult,
    pub out_sample_result: BacktestResult,
    #[serde(with = "non_finite")]
    pub in_sample_score: f64,
    #[serde(with = "non_finite")]
    pub out_sample_score: f64,
    /// `(is - oos) / is` on the chosen objective
    #[serde(with = "non_finite")]
    pub is_degradation: f64,
    /// Train / validation ratio from the in-sample optimization
    #[serde(with = "non_finite_option")]
    pub overfitting_ratio: Option<f64>,
    /// The in-sample optimization stopped before searching the whole space
    pub search_partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedWindow {
    pub index: usize,
    pub in_sample_range: TimeRange,
    pub out_sample_range: TimeRange,
    pub reason: String,
    /// The in-sample optimization stopped before searching the whole space
    #[serde(default)]
    pub search_partial: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DegradationSummary {
    pub mean: f64,
    pub median: f64,
    /// Largest degradation seen
    pub worst: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub strategy_name: String,
    pub objective: Objective,
    pub windows: Vec<WalkForwardWindow>,
    pub skipped: Vec<SkippedWindow>,
    /// Windows whose optimization or replay failed
    pub failed: Vec<SkippedWindow>,
    /// Out-of-sample equity, each segment re-based to the prior segment's end
    pub stitched_equity: Vec<EquityPoint>,
    pub oos_metrics: PerformanceReport,
    pub degradation: DegradationSummary,
    /// `1 - CV` of out-of-sample returns across windows; negative when the
    /// windows disagree more than they agree
    pub consistency_score: f64,
    /// Coefficient of variation of each numeric parameter across windows
    pub parameter_stability: BTreeMap<String, f64>,
    /// A window failed or was not run, or an in-sample search was cut short
    pub partial: bool,
}

enum WindowOutcome {
    Completed(Box<WalkForwardWindow>),
    Skipped(SkippedWindow),
}

impl WindowOutcome {
    fn search_partial(&self) -> bool {
        match self {
            WindowOutcome::Completed(w) => w.search_partial,
            WindowOutcome::Skipped(s) => s.search_partial,
        }
    }
}

pub struct WalkForwardAnalyzer {
    config: WalkForwardConfig,
    pool: WorkerPool,
    control: Arc<BatchControl>,
}

impl WalkForwardAnalyzer {
    pub fn new(config: WalkForwardConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.optimizer.threads)?;
        let control = match config.optimizer.timeout_secs {
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

    /// Lay out windows over `bars`; only windows with enough bars on both sides
    pub fn schedule(&self, bars: &[Bar]) -> Vec<WindowSpec> {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Vec::new();
        };
        let is_len = self.config.in_sample_days as i64 * MS_PER_DAY;
        let oos_len = self.config.out_sample_days as i64 * MS_PER_DAY;
        let step = self.config.step_days as i64 * MS_PER_DAY;
        let t0 = first.timestamp;

        let mut specs = Vec::new();
        for k in 0.. {
            let (is_start, is_end) = match self.config.mode {
                WindowMode::Rolling => (t0 + k * step, t0 + k * step + is_len),
                WindowMode::Anchored => (t0, t0 + is_len + k * step),
            };
            if is_end > last.timestamp {
                break;
            }
            let spec = WindowSpec {
                index: specs.len(),
                in_sample: TimeRange {
                    start: is_start,
                    end: is_end,
                },
                out_sample: TimeRange {
                    start: is_end,
                    end: is_end + oos_len,
                },
            };
            if spec.in_sample.slice(bars).len() >= MIN_BARS && spec.out_sample.slice(bars).len() >= MIN_BARS {
                specs.push(spec);
            }
        }
        specs
    }

    pub fn analyze(
        &self,
        bt_config: &BacktestConfig,
        bars: &[Bar],
        factory: &dyn StrategyFactory,
        param_ranges: &ParamSpace,
    ) -> Result<WalkForwardResult> {
        bt_config.validate()?;
        param_ranges.validate()?;
        let bars = select_range(bt_config, bars)?;
        let mut config = bt_config.clone();
        config.start_time = None;
        config.end_time = None;

        let specs = self.schedule(bars);
        if specs.is_empty() {
            return Err(EngineError::InsufficientData {
                required: self.bars_needed(bars),
                available: bars.len(),
            });
        }
        info!(
            strategy = factory.name(),
            windows = specs.len(),
            mode = ?self.config.mode,
            in_sample_days = self.config.in_sample_days,
            out_sample_days = self.config.out_sample_days,
            "Starting walk-forward analysis"
        );

        let outcome = self.pool.map(&specs, &self.control, |_, spec| {
            self.run_window(spec, &config, bars, factory, param_ranges)
        });

        let partial = outcome.is_partial() || outcome.results.iter().any(|(_, r)| r.search_partial());
        if partial && !outcome.is_partial() {
            warn!("In-sample optimization stopped early in at least one window");
        }
        let mut failed: Vec<SkippedWindow> = outcome
            .failures
            .iter()
            .map(|(i, e)| skipped(&specs[*i], format!("failed: {e}")))
            .collect();
        if outcome.cancelled {
            let done: Vec<usize> = outcome
                .results
                .iter()
                .map(|(i, _)| *i)
                .chain(outcome.failures.iter().map(|(i, _)| *i))
                .collect();
            failed.extend(
                specs
                    .iter()
                    .filter(|s| !done.contains(&s.index))
                    .map(|s| skipped(s, "not run: batch cancelled".to_string())),
            );
        }

        let mut windows = Vec::new();
        let mut skipped_windows = Vec::new();
        for (_, result) in outcome.results {
            match result {
                WindowOutcome::Completed(w) => windows.push(*w),
                WindowOutcome::Skipped(s) => skipped_windows.push(s),
            }
        }

        Ok(self.aggregate(factory.name(), bt_config.initial_capital, windows, skipped_windows, failed, partial))
    }

    fn bars_needed(&self, bars: &[Bar]) -> usize {
        let spacings: Vec<f64> = bars
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp) as f64)
            .collect();
        let spacing = median(&spacings).max(1.0);
        let span = (self.config.in_sample_days + self.config.out_sample_days) as f64 * MS_PER_DAY as f64;
        (span / spacing).ceil() as usize
    }

    fn run_window(
        &self,
        spec: &WindowSpec,
        config: &BacktestConfig,
        bars: &[Bar],
        factory: &dyn StrategyFactory,
        space: &ParamSpace,
    ) -> Result<WindowOutcome> {
        // The objective scores the in-sample range; earlier bars are indicator history
        let mut is_config = config.clone();
        is_config.start_time = Some(spec.in_sample.start);
        is_config.end_time = Some(spec.in_sample.end);
        let objective = BacktestObjective::new(
            &is_config,
            bars,
            factory,
            self.config.objective,
            self.config.validation_fraction,
        )?;
        // Own progress counters, shared cancel flag and deadline
        let optimizer = ParameterOptimizer::with_pool(self.config.optimizer.clone(), self.pool.clone())?
            .with_control(self.control.child());
        let optimization = optimizer.optimize(space, &objective)?;
        let params = optimization.best.params.clone();
        let search_partial = optimization.partial;

        let in_sample_result = objective.backtest(&params, DataSplit::Full)?;
        if in_sample_result.trades.len() < self.config.min_trades_for_review {
            let reason = format!(
                "{} in-sample trades < {}",
                in_sample_result.trades.len(),
                self.config.min_trades_for_review
            );
            warn!(window = spec.index, reason = %reason, "Walk-forward window skipped");
            return Ok(WindowOutcome::Skipped(SkippedWindow {
                search_partial,
                ..skipped(spec, reason)
            }));
        }

        let oos = spec.out_sample.bounds(bars);
        let oos_signals = segment_signals(factory, bars, oos.clone(), &params)?;
        let out_sample_result = BacktestEngine::run(config, &bars[oos], &oos_signals, factory.name(), &params)?;

        let in_sample_score = self.config.objective.score(&in_sample_result.metrics);
        let out_sample_score = self.config.objective.score(&out_sample_result.metrics);
        let is_degradation = degradation(in_sample_score, out_sample_score);

        info!(
            window = spec.index,
            params = %params,
            is_score = in_sample_score,
            oos_score = out_sample_score,
            degradation = is_degradation,
            "Walk-forward window complete"
        );

        Ok(WindowOutcome::Completed(Box::new(WalkForwardWindow {
            index: spec.index,
            in_sample_range: spec.in_sample,
            out_sample_range: spec.out_sample,
            optimized_params: params,
            in_sample_result,
            out_sample_result,
            in_sample_score,
            out_sample_score,
            is_degradation,
            overfitting_ratio: optimization.overfitting_ratio,
            search_partial,
        })))
    }

    fn aggregate(
        &self,
        strategy_name: &str,
        initial_capital: f64,
        windows: Vec<WalkForwardWindow>,
        skipped: Vec<SkippedWindow>,
        failed: Vec<SkippedWindow>,
        partial: bool,
    ) -> WalkForwardResult {
        let stitched_equity = stitch(initial_capital, windows.iter().map(|w| &w.out_sample_result));
        let oos_trades: Vec<Trade> = windows
            .iter()
            .flat_map(|w| w.out_sample_result.trades.iter().cloned())
            .collect();
        let oos_metrics = metrics::compute(&oos_trades, &stitched_equity, initial_capital, 0.0, None);

        let degradations: Vec<f64> = windows
            .iter()
            .map(|w| w.is_degradation)
            .filter(|d| d.is_finite())
            .collect();
        let degradation = DegradationSummary {
            mean: mean(&degradations),
            median: median(&degradations),
            worst: degradations.iter().copied().fold(0.0, f64::max),
        };

        let oos_returns: Vec<f64> = windows.iter().map(|w| w.out_sample_result.total_return()).collect();
        let consistency_score = if windows.is_empty() { 0.0 } else { consistency(&oos_returns) };

        let mut values: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for w in &windows {
            for (name, v) in w.optimized_params.numeric() {
                values.entry(name.clone()).or_default().push(v);
            }
        }
        let parameter_stability: BTreeMap<String, f64> = values
            .into_iter()
            .map(|(name, vs)| {
                let cv = finite_or(&name, coefficient_of_variation(&vs), 0.0);
                (name, cv)
            })
            .collect();

        if windows.is_empty() {
            warn!(skipped = skipped.len(), failed = failed.len(), "No walk-forward window completed");
        }
        info!(
            windows = windows.len(),
            skipped = skipped.len(),
            failed = failed.len(),
            consistency = consistency_score,
            mean_degradation = degradation.mean,
            oos_return = oos_metrics.total_return,
            "Walk-forward analysis complete"
        );

        WalkForwardResult {
            strategy_name: strategy_name.to_string(),
            objective: self.config.objective,
            windows,
            skipped,
            failed,
            stitched_equity,
            oos_metrics,
            degradation,
            consistency_score,
            parameter_stability,
            partial,
        }
    }
}

/// Run a walk-forward analysis with a fresh pool
pub fn analyze(
    wf_config: &WalkForwardConfig,
    bt_config: &BacktestConfig,
    bars: &[Bar],
    strategy_factory: &dyn StrategyFactory,
    param_ranges: &ParamSpace,
) -> Result<WalkForwardResult> {
    WalkForwardAnalyzer::new(wf_config.clone())?.analyze(bt_config, bars, strategy_factory, param_ranges)
}

/// `(is - oos) / is`; identical scores are no degradation
pub fn degradation(in_sample: f64, out_sample: f64) -> f64 {
    if in_sample == out_sample {
        return 0.0;
    }
    finite_or("is_degradation", metrics::ratio(in_sample - out_sample, in_sample), 0.0)
}

/// `1 - CV` of per-window returns, unclamped. A single window is fully
/// consistent; an undefined CV (zero mean return with dispersion) scores 0.
pub fn consistency(returns: &[f64]) -> f64 {
    let cv = coefficient_of_variation(returns);
    if cv.is_finite() {
        1.0 - cv
    } else {
        warn!(windows = returns.len(), "Out-of-sample returns average to zero, consistency set to 0");
        0.0
    }
}

/// Chain equity segments end-to-end, scaling each so it starts where the
/// previous one finished
pub fn stitch<'r>(initial_capital: f64, segments: impl Iterator<Item = &'r BacktestResult>) -> Vec<EquityPoint> {
    let mut out = Vec::new();
    let mut terminal = initial_capital;
    for segment in segments {
        let scale = if segment.initial_capital > 0.0 {
            terminal / segment.initial_capital
        } else {
            1.0
        };
        out.extend(segment.equity_curve.iter().map(|p| EquityPoint {
            time: p.time,
            equity: p.equity * scale,
        }));
        if let Some(last) = out.last() {
            terminal = last.equity;
        }
    }
    out
}

fn skipped(spec: &WindowSpec, reason: String) -> SkippedWindow {
    SkippedWindow {
        index: spec.index,
        in_sample_range: spec.in_sample,
        out_sample_range: spec.out_sample,
        reason,
        search_partial: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::stability;
    use crate::types::{Direction, Signal};

    /// Long on day 1 of every 10-day cycle, flat on day 5
    struct CycleTimed;

    fn cycle_signals(bars: &[Bar], warmup: usize) -> Vec<Signal> {
        bars.iter()
            .enumerate()
            .skip(warmup)
            .filter_map(|(_, b)| match (b.timestamp / MS_PER_DAY) % 10 {
                1 => Some(Signal::new(b.timestamp, "", Direction::Long)),
                5 => Some(Signal::new(b.timestamp, "", Direction::Flat)),
                _ => None,
            })
            .collect()
    }

    impl StrategyFactory for CycleTimed {
        fn name(&self) -> &str {
            "cycle_timed"
        }

        fn default_space(&self) -> ParamSpace {
            ParamSpace::new().int("x", 1, 1, 1)
        }

        fn signals(&self, bars: &[Bar], _params: &ParamSet) -> Result<Vec<Signal>> {
            Ok(cycle_signals(bars, 0))
        }
    }

    /// Same cycle, silent until it has seen ten bars
    struct SlowToWarm;

    impl StrategyFactory for SlowToWarm {
        fn name(&self) -> &str {
            "slow_to_warm"
        }

        fn default_space(&self) -> ParamSpace {
            CycleTimed.default_space()
        }

        fn signals(&self, bars: &[Bar], _params: &ParamSet) -> Result<Vec<Signal>> {
            Ok(cycle_signals(bars, 10))
        }
    }

    /// Cancels the batch the first time it is asked for signals
    struct CancelsBatch {
        control: Arc<BatchControl>,
    }

    impl StrategyFactory for CancelsBatch {
        fn name(&self) -> &str {
            "cancels_batch"
        }

        fn default_space(&self) -> ParamSpace {
            ParamSpace::new().int("x", 1, 6, 1)
        }

        fn signals(&self, bars: &[Bar], params: &ParamSet) -> Result<Vec<Signal>> {
            self.control.cancel();
            CycleTimed.signals(bars, params)
        }
    }

    fn daily_bars(prices: &[f64]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Bar::new(i as i64 * MS_PER_DAY, p, p + 1.0, p - 1.0, p, 1_000.0))
            .collect()
    }

    fn periodic(n: usize, period: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + ((i % period) as f64) * 2.0).collect()
    }

    fn wf_config(mode: WindowMode) -> WalkForwardConfig {
        WalkForwardConfig {
            mode,
            in_sample_days: 10,
            out_sample_days: 10,
            step_days: 10,
            min_trades_for_review: 1,
            objective: Objective::TotalReturn,
            optimizer: OptimizerConfig {
                threads: Some(2),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn run_cycle(config: &WalkForwardConfig, bars: &[Bar]) -> WalkForwardResult {
        analyze(config, &BacktestConfig::default(), bars, &CycleTimed, &CycleTimed.default_space()).unwrap()
    }

    #[test]
    fn test_rolling_schedule() {
        let analyzer = WalkForwardAnalyzer::new(wf_config(WindowMode::Rolling)).unwrap();
        let specs = analyzer.schedule(&daily_bars(&periodic(50, 10)));
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[1].in_sample.start, 10 * MS_PER_DAY);
        assert_eq!(specs[1].out_sample.start, 20 * MS_PER_DAY);
        assert!(specs.windows(2).all(|w| w[0].in_sample.end - w[0].in_sample.start
            == w[1].in_sample.end - w[1].in_sample.start));
    }

    #[test]
    fn test_anchored_schedule() {
        let analyzer = WalkForwardAnalyzer::new(wf_config(WindowMode::Anchored)).unwrap();
        let specs = analyzer.schedule(&daily_bars(&periodic(50, 10)));
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.in_sample.start == 0));
        assert_eq!(specs[3].in_sample.end, 40 * MS_PER_DAY);
    }

    #[test]
    fn test_identical_segments_have_zero_degradation() {
        let result = run_cycle(&wf_config(WindowMode::Rolling), &daily_bars(&periodic(40, 10)));
        assert_eq!(result.windows.len(), 3);
        for w in &result.windows {
            assert_eq!(w.is_degradation, 0.0);
            assert_eq!(w.in_sample_score, w.out_sample_score);
            assert!(!w.search_partial);
        }
        assert_eq!(result.degradation.mean, 0.0);
        assert_eq!(result.consistency_score, 1.0);
        assert_eq!(result.parameter_stability.get("x"), Some(&0.0));
        assert!(!result.partial);
    }

    #[test]
    fn test_out_of_sample_strategy_is_warm() {
        // Ten bars alone never warm the strategy up; with history they trade
        let bars = daily_bars(&periodic(40, 10));
        assert!(SlowToWarm.signals(&bars[20..30], &ParamSet::new()).unwrap().is_empty());

        let result = analyze(
            &wf_config(WindowMode::Rolling),
            &BacktestConfig::default(),
            &bars,
            &SlowToWarm,
            &SlowToWarm.default_space(),
        )
        .unwrap();
        // The first window has no history before its in-sample segment
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].index, 0);
        assert_eq!(result.windows.len(), 2);
        for w in &result.windows {
            assert_eq!(w.out_sample_result.trades.len(), 1);
            assert_eq!(w.is_degradation, 0.0);
        }
    }

    #[test]
    fn test_windows_with_too_few_trades_are_skipped() {
        let config = WalkForwardConfig {
            min_trades_for_review: 5,
            ..wf_config(WindowMode::Rolling)
        };
        let result = run_cycle(&config, &daily_bars(&periodic(40, 10)));
        assert!(result.windows.is_empty());
        assert_eq!(result.skipped.len(), 3);
        assert!(result.skipped[0].reason.contains("in-sample trades"));
        assert_eq!(result.consistency_score, 0.0);
    }

    #[test]
    fn test_cut_short_search_marks_result_partial() {
        let config = WalkForwardConfig {
            optimizer: OptimizerConfig {
                threads: Some(1),
                ..Default::default()
            },
            ..wf_config(WindowMode::Rolling)
        };
        let analyzer = WalkForwardAnalyzer::new(config).unwrap();
        let factory = CancelsBatch {
            control: analyzer.control().clone(),
        };
        let bars = daily_bars(&periodic(20, 10));
        let result = analyzer
            .analyze(&BacktestConfig::default(), &bars, &factory, &factory.default_space())
            .unwrap();

        // The only window ran to completion, but its search did not
        assert_eq!(result.windows.len(), 1);
        assert!(result.failed.is_empty());
        assert!(result.windows[0].search_partial);
        assert!(result.partial);
    }

    #[test]
    fn test_window_progress_excludes_nested_search() {
        let analyzer = WalkForwardAnalyzer::new(wf_config(WindowMode::Rolling)).unwrap();
        let bars = daily_bars(&periodic(40, 10));
        analyzer
            .analyze(&BacktestConfig::default(), &bars, &CycleTimed, &CycleTimed.default_space())
            .unwrap();
        assert_eq!(analyzer.control().total(), 3);
        assert_eq!(analyzer.control().completed(), 3);
    }

    #[test]
    fn test_stitching_rebases_segments() {
        let result = run_cycle(&wf_config(WindowMode::Rolling), &daily_bars(&periodic(40, 10)));
        let first = &result.windows[0].out_sample_result;
        let boundary = first.equity_curve.len();
        let stitched = &result.stitched_equity;
        assert_eq!(stitched.len(), result.windows.iter().map(|w| w.out_sample_result.equity_curve.len()).sum::<usize>());
        // The second segment starts from the first segment's terminal equity
        let growth = result.windows[1].out_sample_result.equity_curve[0].equity
            / result.windows[1].out_sample_result.initial_capital;
        assert!((stitched[boundary].equity - stitched[boundary - 1].equity * growth).abs() < 1e-6);
        assert!(stitched.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_too_little_data() {
        let bars = daily_bars(&periodic(11, 10));
        let err = analyze(
            &wf_config(WindowMode::Rolling),
            &BacktestConfig::default(),
            &bars,
            &CycleTimed,
            &CycleTimed.default_space(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn test_degradation_and_consistency() {
        assert_eq!(degradation(2.0, 1.0), 0.5);
        assert_eq!(degradation(f64::INFINITY, f64::INFINITY), 0.0);
        assert_eq!(consistency(&[0.1]), 1.0);
        // Unclamped, unlike the Monte Carlo stability terms
        let cv = crate::metrics::std_dev(&[-0.1, 0.3]) / 0.1;
        assert!((consistency(&[-0.1, 0.3]) - (1.0 - cv)).abs() < 1e-12);
        assert!(consistency(&[-0.1, 0.3]) < -1.8);
        assert_eq!(stability(&[-0.1, 0.3]), 0.0);
        assert_eq!(consistency(&[-0.1, 0.1]), 0.0);
    }
}
