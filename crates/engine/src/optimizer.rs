//! Parameter optimization over a typed search space
//!
//! Grid search, seeded random search and a genetic algorithm share one
//! evaluation path: every candidate is scored through an [`ObjectiveFunction`]
//! on the training split, constraint-checked, and kept in the history whether
//! it passed or not. The winner is then re-scored on the validation split to
//! produce the overfitting ratio.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{BacktestEngine, MIN_BARS};
use crate::error::{EngineError, Result};
use crate::export::{non_finite, non_finite_option};
use crate::indicators::{segment_signals, StrategyFactory};
use crate::metrics::{mean, PerformanceReport};
use crate::params::{ParamSet, ParamSpace};
use crate::pool::{BatchControl, WorkerPool};
use crate::types::{BacktestConfig, Bar};

// ============================================================================
// Types
// ============================================================================

/// Metric a search maximizes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Sharpe,
    Sortino,
    Calmar,
    TotalReturn,
    Cagr,
    ProfitFactor,
    Expectancy,
    KRatio,
}

impl Objective {
    pub fn score(&self, report: &PerformanceReport) -> f64 {
        match self {
            Objective::Sharpe => report.sharpe,
            Objective::Sortino => report.sortino,
            Objective::Calmar => report.calmar,
            Objective::TotalReturn => report.total_return,
            Objective::Cagr => report.cagr,
            Objective::ProfitFactor => report.profit_factor,
            Objective::Expectancy => report.expectancy,
            Objective::KRatio => report.k_ratio,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Objective::Sharpe => "sharpe",
            Objective::Sortino => "sortino",
            Objective::Calmar => "calmar",
            Objective::TotalReturn => "total_return",
            Objective::Cagr => "cagr",
            Objective::ProfitFactor => "profit_factor",
            Objective::Expectancy => "expectancy",
            Objective::KRatio => "k_ratio",
        }
    }
}

impl std::fmt::Display for Objective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Objective {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sharpe" => Ok(Objective::Sharpe),
            "sortino" => Ok(Objective::Sortino),
            "calmar" => Ok(Objective::Calmar),
            "total_return" => Ok(Objective::TotalReturn),
            "cagr" => Ok(Objective::Cagr),
            "profit_factor" => Ok(Objective::ProfitFactor),
            "expectancy" => Ok(Objective::Expectancy),
            "k_ratio" => Ok(Objective::KRatio),
            other => Err(EngineError::Config(format!("unknown objective '{other}'"))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    #[default]
    Grid,
    Random,
    Genetic,
}

impl std::fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMethod::Grid => write!(f, "grid"),
            SearchMethod::Random => write!(f, "random"),
            SearchMethod::Genetic => write!(f, "genetic"),
        }
    }
}

/// Genetic algorithm settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub n_generations: usize,
    pub crossover_rate: f64,
    /// Per-gene probability of resampling from the domain
    pub mutation_rate: f64,
    /// Share of each generation carried over unchanged
    pub elitism_fraction: f64,
    pub tournament_size: usize,
    /// Minimum best-score improvement over `convergence_window` generations
    pub convergence_epsilon: f64,
    pub convergence_window: usize,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 40,
            n_generations: 25,
            crossover_rate: 0.8,
            mutation_rate: 0.1,
            elitism_fraction: 0.1,
            tournament_size: 3,
            convergence_epsilon: 1e-4,
            convergence_window: 5,
        }
    }
}

/// Hard requirements a candidate must meet to be ranked
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub min_trades: Option<usize>,
    /// Maximum drawdown as a fraction
    pub max_drawdown: Option<f64>,
    pub min_win_rate: Option<f64>,
}

/// Outcome of a constraint check
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintCheck {
    Pass,
    Violated(Vec<String>),
    /// The evaluation cannot be judged, e.g. a constrained metric is missing
    Error(String),
}

impl Constraints {
    pub fn check(&self, eval: &Evaluation) -> ConstraintCheck {
        let mut violations = Vec::new();
        if let Some(min) = self.min_trades {
            match eval.trade_count {
                Some(n) if n < min => violations.push(format!("trades {n} < {min}")),
                Some(_) => {}
                None => return ConstraintCheck::Error("trade count unavailable".into()),
            }
        }
        if let Some(max) = self.max_drawdown {
            match eval.max_drawdown {
                Some(dd) if dd.is_nan() => return ConstraintCheck::Error("max drawdown is NaN".into()),
                Some(dd) if dd > max => violations.push(format!("max drawdown {dd:.4} > {max:.4}")),
                Some(_) => {}
                None => return ConstraintCheck::Error("max drawdown unavailable".into()),
            }
        }
        if let Some(min) = self.min_win_rate {
            match eval.win_rate {
                Some(w) if w.is_nan() => return ConstraintCheck::Error("win rate is NaN".into()),
                Some(w) if w < min => violations.push(format!("win rate {w:.4} < {min:.4}")),
                Some(_) => {}
                None => return ConstraintCheck::Error("win rate unavailable".into()),
            }
        }
        if violations.is_empty() {
            ConstraintCheck::Pass
        } else {
            ConstraintCheck::Violated(violations)
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub method: SearchMethod,
    /// Draws for random search
    pub n_samples: usize,
    pub seed: u64,
    pub genetic: GeneticConfig,
    pub constraints: Constraints,
    /// Number of ranked candidates kept in the result
    pub top_n: usize,
    /// Worker threads, `None` for one per core
    pub threads: Option<usize>,
    /// Whole-batch time limit
    pub timeout_secs: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            method: SearchMethod::Grid,
            n_samples: 100,
            seed: 42,
            genetic: GeneticConfig::default(),
            constraints: Constraints::default(),
            top_n: 10,
            threads: None,
            timeout_secs: None,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        match self.method {
            SearchMethod::Random if self.n_samples == 0 => {
                return Err(EngineError::Config("n_samples must be > 0".into()));
            }
            SearchMethod::Genetic => {
                let ga = &self.genetic;
                if ga.population_size < 2 || ga.n_generations == 0 {
                    return Err(EngineError::Config(
                        "genetic search needs population_size >= 2 and n_generations >= 1".into(),
                    ));
                }
                for (name, v) in [
                    ("crossover_rate", ga.crossover_rate),
                    ("mutation_rate", ga.mutation_rate),
                    ("elitism_fraction", ga.elitism_fraction),
                ] {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(EngineError::Config(format!("{name} must be in [0, 1], got {v}")));
                    }
                }
                if ga.tournament_size == 0 || ga.convergence_window == 0 {
                    return Err(EngineError::Config(
                        "tournament_size and convergence_window must be >= 1".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Which part of the data an evaluation runs on. Splits are time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSplit {
    Train,
    Validation,
    Full,
}

/// Score plus the metrics constraints are checked against
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub trade_count: Option<usize>,
    pub max_drawdown: Option<f64>,
    pub win_rate: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
}

impl Evaluation {
    /// Bare score, no constrained metrics
    pub fn from_score(score: f64) -> Self {
        Self {
            score,
            ..Default::default()
        }
    }

    pub fn from_report(objective: Objective, report: &PerformanceReport) -> Self {
        Self {
            score: objective.score(report),
            trade_count: Some(report.trade_count),
            max_drawdown: Some(report.max_drawdown),
            win_rate: Some(report.win_rate),
            metrics: report.to_map(),
        }
    }
}

/// Anything that can score a parameter set
pub trait ObjectiveFunction: Sync {
    fn evaluate(&self, params: &ParamSet, split: DataSplit) -> Result<Evaluation>;
}

impl<F> ObjectiveFunction for F
where
    F: Fn(&ParamSet, DataSplit) -> Result<Evaluation> + Sync,
{
    fn evaluate(&self, params: &ParamSet, split: DataSplit) -> Result<Evaluation> {
        self(params, split)
    }
}

/// Objective that backtests a strategy factory's signals.
///
/// Scored bars are the config's date range; bars before it serve only as
/// indicator history. Each split is evaluated with the strategy warmed up on
/// everything that precedes it, so the validation tail never starts cold.
pub struct BacktestObjective<'a> {
    config: BacktestConfig,
    /// Every bar up to the end of the scored range
    history: &'a [Bar],
    /// Index of the first scored bar in `history`
    start: usize,
    factory: &'a dyn StrategyFactory,
    objective: Objective,
    /// Trailing share of scored bars held out for validation
    validation_fraction: f64,
}

impl<'a> BacktestObjective<'a> {
    /// `bars` is narrowed to the config's date range once, up front
    pub fn new(
        config: &BacktestConfig,
        bars: &'a [Bar],
        factory: &'a dyn StrategyFactory,
        objective: Objective,
        validation_fraction: f64,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(EngineError::Config(format!(
                "validation_fraction must be in [0, 1), got {validation_fraction}"
            )));
        }
        let start = config
            .start_time
            .map(|t| bars.partition_point(|b| b.timestamp < t))
            .unwrap_or(0);
        let end = config
            .end_time
            .map(|t| bars.partition_point(|b| b.timestamp < t))
            .unwrap_or(bars.len())
            .max(start);
        let mut config = config.clone();
        config.start_time = None;
        config.end_time = None;
        Ok(Self {
            config,
            history: &bars[..end],
            start,
            factory,
            objective,
            validation_fraction,
        })
    }

    fn split(&self, split: DataSplit) -> Result<Range<usize>> {
        let n = self.history.len() - self.start;
        let train = self.start + n - ((n as f64) * self.validation_fraction).round() as usize;
        let range = match split {
            DataSplit::Full => self.start..self.history.len(),
            DataSplit::Train => self.start..train,
            DataSplit::Validation => train..self.history.len(),
        };
        if range.len() < MIN_BARS {
            return Err(EngineError::InsufficientData {
                required: MIN_BARS,
                available: range.len(),
            });
        }
        Ok(range)
    }

    /// Run a full backtest of `params` on `split`
    pub fn backtest(&self, params: &ParamSet, split: DataSplit) -> Result<crate::types::BacktestResult> {
        let range = self.split(split)?;
        let signals = segment_signals(self.factory, self.history, range.clone(), params)?;
        BacktestEngine::run(&self.config, &self.history[range], &signals, self.factory.name(), params)
    }
}

impl ObjectiveFunction for BacktestObjective<'_> {
    fn evaluate(&self, params: &ParamSet, split: DataSplit) -> Result<Evaluation> {
        let result = self.backtest(params, split)?;
        Ok(Evaluation::from_report(self.objective, &result.metrics))
    }
}

/// A scored parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationCandidate {
    /// Position in the ranked list, 0 when unranked
    pub rank: usize,
    pub params: ParamSet,
    /// Ranking score: the objective value, or `-inf` when a constraint is violated
    #[serde(with = "non_finite")]
    pub score: f64,
    /// Objective value regardless of constraints
    #[serde(with = "non_finite")]
    pub raw_score: f64,
    pub constraint_satisfied: bool,
    pub violations: Vec<String>,
    /// GA generation that produced it
    pub generation: Option<usize>,
    pub metrics: BTreeMap<String, f64>,
}

/// Per-generation population summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: usize,
    #[serde(with = "non_finite")]
    pub best_score: f64,
    #[serde(with = "non_finite")]
    pub mean_score: f64,
    pub valid: usize,
    pub evaluated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub method: SearchMethod,
    pub best: OptimizationCandidate,
    /// Ranked constraint-satisfying candidates, best first
    pub top: Vec<OptimizationCandidate>,
    /// Every evaluated candidate, in evaluation order
    pub history: Vec<OptimizationCandidate>,
    pub generations: Vec<GenerationSummary>,
    pub converged: bool,
    /// No evaluated candidate met the constraints; `best` is the top raw score
    pub constraint_violation: bool,
    #[serde(with = "non_finite_option")]
    pub validation_score: Option<f64>,
    /// Train score over validation score
    #[serde(with = "non_finite_option")]
    pub overfitting_ratio: Option<f64>,
    pub evaluations: usize,
    pub failed_evaluations: usize,
    /// Some units failed or the batch stopped early
    pub partial: bool,
}

// ============================================================================
// Optimizer
// ============================================================================

pub struct ParameterOptimizer {
    config: OptimizerConfig,
    pool: WorkerPool,
    control: Arc<BatchControl>,
}

impl ParameterOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        let pool = WorkerPool::new(config.threads)?;
        Self::with_pool(config, pool)
    }

    pub fn with_pool(config: OptimizerConfig, pool: WorkerPool) -> Result<Self> {
        config.validate()?;
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

    /// Share a cancel flag and progress counters with the caller
    pub fn with_control(mut self, control: Arc<BatchControl>) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> &Arc<BatchControl> {
        &self.control
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn optimize(&self, space: &ParamSpace, objective: &dyn ObjectiveFunction) -> Result<OptimizationResult> {
        space.validate()?;
        info!(
            method = %self.config.method,
            params = space.len(),
            threads = self.pool.threads(),
            "Starting parameter optimization"
        );

        let search = match self.config.method {
            SearchMethod::Grid => {
                let grid = space.grid()?;
                info!(combinations = grid.len(), "Grid generated");
                self.exhaustive(&grid, objective)
            }
            SearchMethod::Random => {
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                let samples: Vec<ParamSet> =
                    (0..self.config.n_samples).map(|_| space.sample(&mut rng)).collect();
                info!(samples = samples.len(), seed = self.config.seed, "Random samples drawn");
                self.exhaustive(&samples, objective)
            }
            SearchMethod::Genetic => self.genetic(space, objective),
        };

        self.finalize(search, objective)
    }

    fn evaluate_batch(
        &self,
        sets: &[ParamSet],
        generation: Option<usize>,
        objective: &dyn ObjectiveFunction,
        search: &mut SearchState,
    ) -> Vec<Option<OptimizationCandidate>> {
        let constraints = &self.config.constraints;
        let outcome = self.pool.map(sets, &self.control, |_, params| {
            let eval = objective.evaluate(params, DataSplit::Train)?;
            build_candidate(params, eval, constraints, generation)
        });
        search.partial |= outcome.is_partial();
        search.failed += outcome.failures.len();
        if outcome.cancelled {
            search.stopped = true;
        }

        let mut slots: Vec<Option<OptimizationCandidate>> = vec![None; sets.len()];
        for (i, candidate) in outcome.results {
            search.history.push(candidate.clone());
            slots[i] = Some(candidate);
        }
        slots
    }

    fn exhaustive(&self, sets: &[ParamSet], objective: &dyn ObjectiveFunction) -> SearchState {
        let mut search = SearchState::default();
        self.evaluate_batch(sets, None, objective, &mut search);
        search.converged = !search.stopped;
        search
    }

    fn genetic(&self, space: &ParamSpace, objective: &dyn ObjectiveFunction) -> SearchState {
        let ga = &self.config.genetic;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut search = SearchState::default();
        let mut cache: HashMap<String, Option<OptimizationCandidate>> = HashMap::new();
        let mut best_by_generation: Vec<f64> = Vec::new();
        let elite_count = ((ga.population_size as f64) * ga.elitism_fraction).ceil() as usize;

        let mut population: Vec<ParamSet> =
            (0..ga.population_size).map(|_| space.sample(&mut rng)).collect();

        for generation in 0..ga.n_generations {
            if self.control.should_stop() {
                warn!(generation, "Optimization cancelled");
                search.stopped = true;
                search.partial = true;
                break;
            }

            // Evaluate only individuals never seen before
            let mut fresh: Vec<ParamSet> = Vec::new();
            for individual in &population {
                let key = individual.key();
                if !cache.contains_key(&key) && !fresh.iter().any(|f| f.key() == key) {
                    fresh.push(individual.clone());
                }
            }
            let slots = self.evaluate_batch(&fresh, Some(generation), objective, &mut search);
            for (params, slot) in fresh.iter().zip(slots) {
                cache.insert(params.key(), slot);
            }
            if search.stopped {
                break;
            }

            let scored: Vec<(ParamSet, Fitness)> = population
                .iter()
                .map(|p| {
                    let fitness = cache
                        .get(&p.key())
                        .and_then(|c| c.as_ref())
                        .map(Fitness::of)
                        .unwrap_or(Fitness::FAILED);
                    (p.clone(), fitness)
                })
                .collect();

            let valid: Vec<f64> = scored
                .iter()
                .filter(|(_, f)| f.valid)
                .map(|(_, f)| f.score)
                .collect();
            let best = valid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let finite: Vec<f64> = valid.iter().copied().filter(|s| s.is_finite()).collect();
            search.generations.push(GenerationSummary {
                generation,
                best_score: best,
                mean_score: if finite.is_empty() { f64::NEG_INFINITY } else { mean(&finite) },
                valid: valid.len(),
                evaluated: fresh.len(),
            });
            let best_so_far = best_by_generation.last().copied().unwrap_or(f64::NEG_INFINITY).max(best);
            best_by_generation.push(best_so_far);
            debug!(generation, best = best_so_far, valid = valid.len(), evaluated = fresh.len(), "Generation complete");

            let w = ga.convergence_window;
            if best_by_generation.len() > w {
                let improvement = best_so_far - best_by_generation[best_by_generation.len() - 1 - w];
                if improvement.is_finite() && improvement < ga.convergence_epsilon {
                    info!(generation, best = best_so_far, "Genetic search converged");
                    search.converged = true;
                    break;
                }
            }
            if generation + 1 == ga.n_generations {
                break;
            }

            population = self.breed(space, &scored, elite_count, &mut rng);
        }
        search
    }

    fn breed(
        &self,
        space: &ParamSpace,
        scored: &[(ParamSet, Fitness)],
        elite_count: usize,
        rng: &mut StdRng,
    ) -> Vec<ParamSet> {
        let ga = &self.config.genetic;
        let mut ranked: Vec<&(ParamSet, Fitness)> = scored.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp_key(&a.1));

        let mut next: Vec<ParamSet> = Vec::with_capacity(ga.population_size);
        for (params, _) in ranked.iter() {
            if next.len() >= elite_count.min(ga.population_size) {
                break;
            }
            if !next.iter().any(|p| p.key() == params.key()) {
                next.push(params.clone());
            }
        }
        while next.len() < ga.population_size {
            let a = tournament(scored, ga.tournament_size, rng);
            let b = tournament(scored, ga.tournament_size, rng);
            let child = if rng.gen_bool(ga.crossover_rate) {
                space.crossover(a, b, rng)
            } else {
                a.clone()
            };
            next.push(space.mutate(&child, ga.mutation_rate, rng));
        }
        next
    }

    fn finalize(&self, search: SearchState, objective: &dyn ObjectiveFunction) -> Result<OptimizationResult> {
        let evaluations = search.history.len();
        let mut valid: Vec<OptimizationCandidate> = search
            .history
            .iter()
            .filter(|c| c.constraint_satisfied)
            .cloned()
            .collect();
        valid.sort_by(|a, b| b.score.total_cmp(&a.score));

        let (mut best, constraint_violation, converged) = match valid.first() {
            Some(best) => (best.clone(), false, search.converged),
            None => {
                let fallback = search
                    .history
                    .iter()
                    .max_by(|a, b| a.raw_score.total_cmp(&b.raw_score))
                    .cloned();
                match fallback {
                    Some(c) => {
                        warn!(
                            evaluations,
                            "Every candidate violated constraints, returning best raw score"
                        );
                        (c, true, false)
                    }
                    None if search.stopped => return Err(EngineError::Cancelled),
                    None => {
                        return Err(EngineError::InvalidInput(format!(
                            "all {} evaluations failed",
                            search.failed
                        )))
                    }
                }
            }
        };

        let mut top: Vec<OptimizationCandidate> = valid.into_iter().take(self.config.top_n).collect();
        for (i, c) in top.iter_mut().enumerate() {
            c.rank = i + 1;
        }
        if !constraint_violation {
            best.rank = 1;
        }

        let validation_score = match objective.evaluate(&best.params, DataSplit::Validation) {
            Ok(eval) if !eval.score.is_nan() => Some(eval.score),
            Ok(_) => {
                warn!("Validation score diverged to NaN");
                None
            }
            Err(e) => {
                warn!(error = %e, "Validation split unavailable");
                None
            }
        };
        let overfit = validation_score.map(|v| overfitting_ratio(best.raw_score, v));

        info!(
            score = best.score,
            raw_score = best.raw_score,
            params = %best.params,
            evaluations,
            failed = search.failed,
            converged,
            overfitting_ratio = overfit.unwrap_or(f64::NAN),
            "Optimization complete"
        );

        Ok(OptimizationResult {
            method: self.config.method,
            best,
            top,
            history: search.history,
            generations: search.generations,
            converged,
            constraint_violation,
            validation_score,
            overfitting_ratio: overfit,
            evaluations,
            failed_evaluations: search.failed,
            partial: search.partial,
        })
    }
}

/// Run one optimization with a fresh pool
pub fn optimize(
    config: &OptimizerConfig,
    space: &ParamSpace,
    objective: &dyn ObjectiveFunction,
) -> Result<OptimizationResult> {
    ParameterOptimizer::new(config.clone())?.optimize(space, objective)
}

/// `train / validation`; both zero means no degradation
pub fn overfitting_ratio(train: f64, validation: f64) -> f64 {
    if train == 0.0 && validation == 0.0 {
        1.0
    } else {
        crate::metrics::ratio(train, validation)
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct SearchState {
    history: Vec<OptimizationCandidate>,
    generations: Vec<GenerationSummary>,
    failed: usize,
    partial: bool,
    stopped: bool,
    converged: bool,
}

/// Ranking key: valid candidates first, then by objective value
#[derive(Debug, Clone, Copy)]
struct Fitness {
    valid: bool,
    score: f64,
}

impl Fitness {
    const FAILED: Fitness = Fitness {
        valid: false,
        score: f64::NEG_INFINITY,
    };

    fn of(c: &OptimizationCandidate) -> Self {
        Self {
            valid: c.constraint_satisfied,
            score: c.raw_score,
        }
    }

    fn cmp_key(&self, other: &Fitness) -> std::cmp::Ordering {
        self.valid
            .cmp(&other.valid)
            .then(self.score.total_cmp(&other.score))
    }
}

fn tournament<'p>(scored: &'p [(ParamSet, Fitness)], size: usize, rng: &mut StdRng) -> &'p ParamSet {
    let mut best = &scored[rng.gen_range(0..scored.len())];
    for _ in 1..size {
        let challenger = &scored[rng.gen_range(0..scored.len())];
        if challenger.1.cmp_key(&best.1).is_gt() {
            best = challenger;
        }
    }
    &best.0
}

fn build_candidate(
    params: &ParamSet,
    eval: Evaluation,
    constraints: &Constraints,
    generation: Option<usize>,
) -> Result<OptimizationCandidate> {
    let raw_score = if eval.score.is_nan() {
        warn!(params = %params, "Objective returned NaN, scoring as -inf");
        f64::NEG_INFINITY
    } else {
        eval.score
    };
    let (constraint_satisfied, violations) = match constraints.check(&eval) {
        ConstraintCheck::Pass => (true, Vec::new()),
        ConstraintCheck::Violated(v) => {
            debug!(params = %params, violations = ?v, "Constraint violated");
            (false, v)
        }
        ConstraintCheck::Error(msg) => {
            return Err(EngineError::ConstraintViolation(format!(
                "constraints could not be evaluated: {msg}"
            )))
        }
    };
    Ok(OptimizationCandidate {
        rank: 0,
        params: params.clone(),
        score: if constraint_satisfied { raw_score } else { f64::NEG_INFINITY },
        raw_score,
        constraint_satisfied,
        violations,
        generation,
        metrics: eval.metrics,
    })
}
