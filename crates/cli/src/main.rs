//! stratlab: strategy validation from the command line
//!
//! Usage:
//!   stratlab backtest --bars bars.json --strategy ema_crossover
//!   stratlab optimize --bars bars.json --strategy rsi_reversion --method genetic
//!   stratlab walk-forward --bars bars.json --strategy ema_crossover --mode anchored
//!   stratlab monte-carlo --bars bars.json --signals signals.json --method bootstrap
//!   stratlab reports --strategy ema_crossover

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use persistence::Database;
use serde::{Deserialize, Serialize};
use stratlab_engine::{
    annotate_volatility, build_strategy, BacktestConfig, BacktestEngine, BacktestObjective, BacktestResult,
    BatchControl, DataSplit, MonteCarloConfig, MonteCarloResult, MonteCarloSimulator, Objective,
    OptimizationResult, OptimizerConfig, ParamSet, ParameterOptimizer, PerformanceReport, SearchMethod,
    Signal, SimulationMethod, StaticSignals, StrategyFactory, StrategyReport, WalkForwardAnalyzer,
    WalkForwardConfig, WalkForwardResult, WindowMode, Bar, STRATEGIES,
};
use tracing::{info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "stratlab")]
#[command(about = "Backtest, optimize and stress-test trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Inputs shared by every analysis command
#[derive(Args, Clone)]
struct InputArgs {
    /// JSON array of bars
    #[arg(long)]
    bars: PathBuf,
    /// JSON array of pre-computed signals
    #[arg(long, conflicts_with = "strategy")]
    signals: Option<PathBuf>,
    /// Built-in strategy generating signals from the bars
    #[arg(long)]
    strategy: Option<String>,
    /// JSON config file (any subset of backtest / optimizer / walk_forward / monte_carlo)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Strategy parameters as a JSON object
    #[arg(long)]
    params: Option<String>,
    /// Trailing window for the per-bar volatility estimate
    #[arg(long, default_value_t = 20)]
    vol_window: usize,
}

#[derive(Args, Clone)]
struct OutputArgs {
    /// Write the full result as JSON
    #[arg(long)]
    export: Option<PathBuf>,
    /// Persist the strategy report to the database
    #[arg(long)]
    save: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest
    Backtest {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Search the strategy's parameter space
    Optimize {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        output: OutputArgs,
        /// grid, random or genetic
        #[arg(long)]
        method: Option<String>,
        /// Metric to maximize
        #[arg(long)]
        objective: Option<String>,
        /// Number of ranked candidates to show
        #[arg(long, default_value_t = 10)]
        top_n: usize,
    },
    /// Re-optimize on rolling or anchored windows and test out of sample
    WalkForward {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        output: OutputArgs,
        /// rolling or anchored
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        in_sample_days: Option<u32>,
        #[arg(long)]
        out_sample_days: Option<u32>,
        #[arg(long)]
        step_days: Option<u32>,
        #[arg(long)]
        objective: Option<String>,
    },
    /// Resample a backtest to estimate its outcome distribution
    MonteCarlo {
        #[command(flatten)]
        input: InputArgs,
        /// Write the full result as JSON
        #[arg(long)]
        export: Option<PathBuf>,
        /// trades, bootstrap or params
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        runs: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Browse stored strategy reports
    Reports {
        /// Only reports of this strategy
        #[arg(long)]
        strategy: Option<String>,
        /// Rank by this metric instead of recency
        #[arg(long)]
        metric: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Optional JSON config file; every section falls back to its defaults
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    backtest: BacktestConfig,
    optimizer: OptimizerConfig,
    walk_forward: WalkForwardConfig,
    monte_carlo: MonteCarloConfig,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,stratlab_engine=debug,persistence=debug,stratlab=debug")
    } else {
        EnvFilter::new("info,stratlab_engine=info,persistence=info,stratlab=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Backtest { input, output } => cmd_backtest(input, output).await?,
        Commands::Optimize {
            input,
            output,
            method,
            objective,
            top_n,
        } => cmd_optimize(input, output, method, objective, top_n).await?,
        Commands::WalkForward {
            input,
            output,
            mode,
            in_sample_days,
            out_sample_days,
            step_days,
            objective,
        } => {
            let windows = WindowOverrides {
                mode,
                in_sample_days,
                out_sample_days,
                step_days,
                objective,
            };
            cmd_walk_forward(input, output, windows).await?
        }
        Commands::MonteCarlo {
            input,
            export,
            method,
            runs,
            seed,
        } => cmd_monte_carlo(input, export, method, runs, seed).await?,
        Commands::Reports {
            strategy,
            metric,
            limit,
        } => cmd_reports(strategy, metric, limit).await?,
    }

    Ok(())
}

// ============================================================================
// Inputs
// ============================================================================

/// Everything a command needs, loaded once
struct Workload {
    config: FileConfig,
    bars: Vec<Bar>,
    factory: Box<dyn StrategyFactory>,
    params: ParamSet,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load(input: &InputArgs) -> anyhow::Result<Workload> {
    let config: FileConfig = match &input.config {
        Some(path) => read_json(path)?,
        None => FileConfig::default(),
    };

    let mut bars: Vec<Bar> = read_json(&input.bars)?;
    annotate_volatility(&mut bars, input.vol_window);

    let factory: Box<dyn StrategyFactory> = match (&input.strategy, &input.signals) {
        (Some(name), _) => build_strategy(name)?,
        (None, Some(path)) => {
            let signals: Vec<Signal> = read_json(path)?;
            Box::new(StaticSignals::new(signals))
        }
        (None, None) => bail!(
            "either --signals or --strategy is required (built-in strategies: {})",
            STRATEGIES.join(", ")
        ),
    };

    let params: ParamSet = match &input.params {
        Some(json) => serde_json::from_str(json).context("parsing --params")?,
        None => ParamSet::new(),
    };

    info!(
        bars = bars.len(),
        strategy = factory.name(),
        params = %params,
        "Inputs loaded"
    );
    Ok(Workload {
        config,
        bars,
        factory,
        params,
    })
}

fn db_path() -> String {
    std::env::var("STRATLAB_DB_PATH").unwrap_or_else(|_| "data/stratlab.db".to_string())
}

async fn open_db() -> anyhow::Result<Database> {
    let path = db_path();
    Database::new(&path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))
}

async fn save_report(report: &StrategyReport) -> anyhow::Result<()> {
    let db = open_db().await?;
    let inserted = db.reports().save(report).await?;
    if inserted {
        println!("\nReport saved to {} (hash {})", db_path(), &report.params_hash[..12]);
    } else {
        println!("\nReport already stored (hash {})", &report.params_hash[..12]);
    }
    Ok(())
}

fn export_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
    println!("\nResults exported to {}", path.display());
    Ok(())
}

fn batch_control(timeout_secs: Option<u64>) -> Arc<BatchControl> {
    let control = match timeout_secs {
        Some(secs) => BatchControl::with_timeout(Duration::from_secs(secs)),
        None => BatchControl::new(),
    };
    let control = Arc::new(control);

    let for_ctrlc = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        for_ctrlc.cancel();
    });
    control
}

/// Await a CPU-bound batch, drawing a progress bar until it finishes
async fn with_progress<T: Send + 'static>(
    control: &BatchControl,
    mut handle: tokio::task::JoinHandle<anyhow::Result<T>>,
) -> anyhow::Result<T> {
    loop {
        tokio::select! {
            joined = &mut handle => {
                println!();
                return joined.context("worker task panicked")?;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let pct = control.progress_pct();
                let bar_len = 30;
                let filled = ((pct as usize) * bar_len / 100).min(bar_len);
                let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
                print!(
                    "\r  [{}] {:.0}% ({}/{})   ",
                    bar,
                    pct,
                    control.completed(),
                    control.total()
                );
                use std::io::Write;
                std::io::stdout().flush().ok();
            }
        }
    }
}

fn parse_method(s: &str) -> anyhow::Result<SearchMethod> {
    match s.to_lowercase().as_str() {
        "grid" => Ok(SearchMethod::Grid),
        "random" => Ok(SearchMethod::Random),
        "genetic" | "ga" => Ok(SearchMethod::Genetic),
        other => bail!("unknown search method '{other}' (grid, random, genetic)"),
    }
}

fn parse_mode(s: &str) -> anyhow::Result<WindowMode> {
    match s.to_lowercase().as_str() {
        "rolling" => Ok(WindowMode::Rolling),
        "anchored" => Ok(WindowMode::Anchored),
        other => bail!("unknown window mode '{other}' (rolling, anchored)"),
    }
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(input: InputArgs, output: OutputArgs) -> anyhow::Result<()> {
    println!("\n=== stratlab v{} :: backtest ===", APP_VERSION);
    let work = load(&input)?;

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<BacktestResult> {
        let signals = work.factory.signals(&work.bars, &work.params)?;
        Ok(BacktestEngine::run(
            &work.config.backtest,
            &work.bars,
            &signals,
            work.factory.name(),
            &work.params,
        )?)
    })
    .await
    .context("backtest task panicked")??;

    print_backtest(&result);

    if let Some(path) = &output.export {
        export_json(path, &result)?;
    }
    if output.save {
        save_report(&StrategyReport::from_result(&result)?).await?;
    }
    Ok(())
}

fn print_backtest(result: &BacktestResult) {
    println!(
        "\n{} on {} bars: {} trades, final equity {:.2}",
        result.strategy_name,
        result.equity_curve.len(),
        result.trades.len(),
        result.final_equity
    );
    if let Some(at) = result.circuit_breaker_tripped_at {
        println!("  Circuit breaker tripped at {}", format_ms(at));
    }
    print_metrics(&result.metrics);
    println!(
        "  Costs: fees {:.2} | slippage {:.2} | funding {:.2}",
        result.total_fees, result.total_slippage, result.total_funding
    );

    if !result.regime_metrics.is_empty() {
        println!("\n  {:<22} {:>6} {:>12} {:>7} {:>7}", "Regime", "Bars", "PnL", "Trades", "WR%");
        println!("  {}", "-".repeat(58));
        for (regime, stats) in &result.regime_metrics {
            println!(
                "  {:<22} {:>6} {:>+12.2} {:>7} {:>6.1}%",
                regime,
                stats.bars,
                stats.pnl,
                stats.trades,
                stats.win_rate * 100.0
            );
        }
    }
}

fn print_metrics(m: &PerformanceReport) {
    println!(
        "  Return {:>+.2}% | CAGR {:>+.2}% | Sharpe {:.2} | Sortino {:.2} | Calmar {:.2}",
        m.total_return * 100.0,
        m.cagr * 100.0,
        m.sharpe,
        m.sortino,
        m.calmar
    );
    println!(
        "  Max DD {:.2}% ({} bars) | WR {:.1}% | PF {:.2} | Expectancy {:+.2} | Kelly {:.3}",
        m.max_drawdown * 100.0,
        m.max_drawdown_duration,
        m.win_rate * 100.0,
        m.profit_factor,
        m.expectancy,
        m.kelly_criterion
    );
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ============================================================================
// Optimize command
// ============================================================================

async fn cmd_optimize(
    input: InputArgs,
    output: OutputArgs,
    method: Option<String>,
    objective: Option<String>,
    top_n: usize,
) -> anyhow::Result<()> {
    println!("\n=== stratlab v{} :: optimize ===", APP_VERSION);
    let work = load(&input)?;

    let mut opt_config = work.config.optimizer.clone();
    if let Some(m) = &method {
        opt_config.method = parse_method(m)?;
    }
    opt_config.top_n = top_n;
    let objective: Objective = match &objective {
        Some(name) => name.parse()?,
        None => work.config.walk_forward.objective,
    };
    let validation_fraction = work.config.walk_forward.validation_fraction;
    let space = work.factory.default_space();
    println!(
        "Strategy: {} | Method: {:?} | Objective: {} | Space: {} params",
        work.factory.name(),
        opt_config.method,
        objective,
        space.len()
    );
    println!("Press Ctrl+C to stop\n");

    let control = batch_control(opt_config.timeout_secs);
    let worker_control = control.clone();
    let handle = tokio::task::spawn_blocking(
        move || -> anyhow::Result<(OptimizationResult, BacktestResult)> {
            let target = BacktestObjective::new(
                &work.config.backtest,
                &work.bars,
                work.factory.as_ref(),
                objective,
                validation_fraction,
            )?;
            let optimizer = ParameterOptimizer::new(opt_config)?.with_control(worker_control);
            let result = optimizer.optimize(&space, &target)?;
            let best = target.backtest(&result.best.params, DataSplit::Full)?;
            Ok((result, best))
        },
    );
    let (result, best) = with_progress(&control, handle).await?;

    print_optimization(&result);
    println!("\nBest parameters on the full data:");
    print_metrics(&best.metrics);

    if let Some(path) = &output.export {
        export_json(path, &result)?;
    }
    if output.save {
        save_report(&StrategyReport::from_result(&best)?).await?;
    }
    Ok(())
}

fn print_optimization(result: &OptimizationResult) {
    println!(
        "\n{} evaluations ({} failed){}{}",
        result.evaluations,
        result.failed_evaluations,
        if result.converged { ", converged" } else { "" },
        if result.partial { ", PARTIAL" } else { "" }
    );
    if result.constraint_violation {
        warn!("Every candidate violated the constraints; best raw score shown");
    }
    if let Some(ratio) = result.overfitting_ratio {
        println!("Overfitting ratio (train / validation): {:.2}", ratio);
    }

    println!("\n  {:>3}  {:>10}  {:<5}  {}", "#", "Score", "Valid", "Parameters");
    println!("  {}", "-".repeat(70));
    for c in &result.top {
        println!(
            "  {:>3}  {:>10.4}  {:<5}  {}",
            c.rank,
            c.raw_score,
            if c.constraint_satisfied { "yes" } else { "no" },
            c.params
        );
    }
}

// ============================================================================
// Walk-forward command
// ============================================================================

struct WindowOverrides {
    mode: Option<String>,
    in_sample_days: Option<u32>,
    out_sample_days: Option<u32>,
    step_days: Option<u32>,
    objective: Option<String>,
}

async fn cmd_walk_forward(input: InputArgs, output: OutputArgs, overrides: WindowOverrides) -> anyhow::Result<()> {
    println!("\n=== stratlab v{} :: walk-forward ===", APP_VERSION);
    let work = load(&input)?;

    let mut wf_config = work.config.walk_forward.clone();
    wf_config.optimizer = work.config.optimizer.clone();
    if let Some(m) = &overrides.mode {
        wf_config.mode = parse_mode(m)?;
    }
    if let Some(days) = overrides.in_sample_days {
        wf_config.in_sample_days = days;
    }
    if let Some(days) = overrides.out_sample_days {
        wf_config.out_sample_days = days;
    }
    if let Some(days) = overrides.step_days {
        wf_config.step_days = days;
    }
    if let Some(name) = &overrides.objective {
        wf_config.objective = name.parse()?;
    }
    println!(
        "Strategy: {} | Mode: {:?} | IS {}d / OOS {}d / step {}d | Objective: {}",
        work.factory.name(),
        wf_config.mode,
        wf_config.in_sample_days,
        wf_config.out_sample_days,
        wf_config.step_days,
        wf_config.objective
    );
    println!("Press Ctrl+C to stop\n");

    let control = batch_control(wf_config.optimizer.timeout_secs);
    let worker_control = control.clone();
    let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<WalkForwardResult> {
        let analyzer = WalkForwardAnalyzer::new(wf_config)?.with_control(worker_control);
        let space = work.factory.default_space();
        Ok(analyzer.analyze(&work.config.backtest, &work.bars, work.factory.as_ref(), &space)?)
    });
    let result = with_progress(&control, handle).await?;

    print_walk_forward(&result);

    if let Some(path) = &output.export {
        export_json(path, &result)?;
    }
    if output.save {
        if result.windows.is_empty() {
            warn!("No completed window, nothing to save");
        } else {
            save_report(&StrategyReport::from_walk_forward(&result)?).await?;
        }
    }
    Ok(())
}

fn print_walk_forward(result: &WalkForwardResult) {
    println!(
        "\n  {:>3}  {:<17} {:<17} {:>9} {:>9} {:>8}  {}",
        "#", "In-sample", "Out-of-sample", "IS", "OOS", "Degr.", "Parameters"
    );
    println!("  {}", "-".repeat(95));
    for w in &result.windows {
        println!(
            "  {:>3}  {:<17} {:<17} {:>9.4} {:>9.4} {:>7.1}%  {}",
            w.index,
            format_ms(w.in_sample_range.start),
            format_ms(w.out_sample_range.start),
            w.in_sample_score,
            w.out_sample_score,
            w.is_degradation * 100.0,
            w.optimized_params
        );
    }
    for s in result.skipped.iter().chain(result.failed.iter()) {
        println!("  {:>3}  skipped: {}", s.index, s.reason);
    }

    println!("\nStitched out-of-sample:");
    print_metrics(&result.oos_metrics);
    println!(
        "  Degradation mean {:.1}% / median {:.1}% / worst {:.1}% | Consistency {:.2}{}",
        result.degradation.mean * 100.0,
        result.degradation.median * 100.0,
        result.degradation.worst * 100.0,
        result.consistency_score,
        if result.partial { " | PARTIAL" } else { "" }
    );
    for (param, cv) in &result.parameter_stability {
        println!("  {:<20} CV {:.3}", param, cv);
    }
}

// ============================================================================
// Monte Carlo command
// ============================================================================

async fn cmd_monte_carlo(
    input: InputArgs,
    export: Option<PathBuf>,
    method: Option<String>,
    runs: Option<usize>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    println!("\n=== stratlab v{} :: monte carlo ===", APP_VERSION);
    let work = load(&input)?;

    let mut mc_config = work.config.monte_carlo.clone();
    if let Some(m) = &method {
        mc_config.method = m.parse::<SimulationMethod>()?;
    }
    if let Some(n) = runs {
        mc_config.n_simulations = n;
    }
    if let Some(s) = seed {
        mc_config.seed = s;
    }
    println!(
        "Strategy: {} | Method: {} | Runs: {} | Seed: {}",
        work.factory.name(),
        mc_config.method,
        mc_config.n_simulations,
        mc_config.seed
    );
    println!("Press Ctrl+C to stop\n");

    let control = batch_control(mc_config.timeout_secs);
    let worker_control = control.clone();
    let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<MonteCarloResult> {
        let signals = work.factory.signals(&work.bars, &work.params)?;
        let base = BacktestEngine::run(
            &work.config.backtest,
            &work.bars,
            &signals,
            work.factory.name(),
            &work.params,
        )?;
        let method = mc_config.method;
        let simulator = MonteCarloSimulator::new(mc_config)?.with_control(worker_control);
        let result = match method {
            SimulationMethod::ParameterSensitivity => {
                simulator.simulate_sensitivity(&base, &work.config.backtest, &work.bars, work.factory.as_ref())?
            }
            _ => simulator.simulate(&base)?,
        };
        Ok(result)
    });
    let result = with_progress(&control, handle).await?;

    print_monte_carlo(&result);

    if let Some(path) = &export {
        export_json(path, &result)?;
    }
    Ok(())
}

fn print_monte_carlo(result: &MonteCarloResult) {
    println!(
        "\n{} runs ({} failed){} | original return {:+.2}%",
        result.runs.len(),
        result.failed_runs,
        if result.partial { ", PARTIAL" } else { "" },
        result.original_return * 100.0
    );
    println!("\n  {:<12} {:>10} {:>10} {:>10} {:>10} {:>10}", "", "p5", "p25", "p50", "p75", "p95");
    for (label, dist) in [
        ("Return %", &result.returns),
        ("Sharpe", &result.sharpe),
        ("Max DD %", &result.max_drawdown),
    ] {
        let scale = if label.ends_with('%') { 100.0 } else { 1.0 };
        let cells: Vec<String> = dist
            .percentiles
            .iter()
            .map(|(_, v)| format!("{:>10.2}", v * scale))
            .collect();
        println!("  {:<12} {}", label, cells.join(" "));
    }
    println!(
        "\n  P(profit) {:.1}% | P(ruin) {:.1}% | VaR95 {:+.2}% | CVaR95 {:+.2}%",
        result.probability_of_profit * 100.0,
        result.probability_of_ruin * 100.0,
        result.var_95 * 100.0,
        result.cvar_95 * 100.0
    );
    println!(
        "  Robustness {:.2} (return stability {:.2}, sharpe stability {:.2}, param sensitivity {:.2})",
        result.robustness_score, result.return_stability, result.sharpe_stability, result.param_sensitivity_score
    );
}

// ============================================================================
// Reports command
// ============================================================================

async fn cmd_reports(strategy: Option<String>, metric: Option<String>, limit: i64) -> anyhow::Result<()> {
    let db = open_db().await?;
    let repo = db.reports();
    let total = repo.count().await?;
    println!("Database: {} ({} reports)", db_path(), total);

    let reports = match (&metric, &strategy) {
        (Some(metric), _) => repo.top_by_metric(metric, limit, strategy.as_deref()).await?,
        (None, Some(id)) => repo.list_by_strategy(id, limit).await?,
        (None, None) => repo.top_by_metric("sharpe", limit, None).await?,
    };
    if reports.is_empty() {
        println!("\nNo reports found.");
        return Ok(());
    }

    let sort_metric = metric.as_deref().unwrap_or("sharpe");
    println!(
        "\n  {:>3}  {:<20} {:<12} {:<12} {:<12} {:>10} {:>9}  {}",
        "#", "Strategy", "Kind", "From", "To", sort_metric, "Return%", "Parameters"
    );
    println!("  {}", "-".repeat(110));
    for (i, r) in reports.iter().enumerate() {
        println!(
            "  {:>3}  {:<20} {:<12} {:<12} {:<12} {:>10.3} {:>+8.2}%  {}",
            i + 1,
            r.strategy_id,
            r.kind.as_str(),
            r.period_start.format("%Y-%m-%d").to_string(),
            r.period_end.format("%Y-%m-%d").to_string(),
            r.metric(sort_metric).unwrap_or(f64::NAN),
            r.metric("total_return").unwrap_or(0.0) * 100.0,
            r.parameters
        );
    }
    Ok(())
}
