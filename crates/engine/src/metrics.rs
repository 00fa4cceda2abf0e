//! Performance metrics over a trade list and an equity curve
//!
//! Pure functions, no state. Degenerate denominators resolve to explicit
//! sentinels through [`ratio`]: `x / 0` is `+∞`/`-∞` by the sign of `x`, and
//! `0 / 0` is `0`. NaN never leaves this module: any NaN is logged and replaced
//! by the metric's documented fallback.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::export::non_finite;
use crate::types::{EquityPoint, Trade};

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1000.0;
const DEFAULT_PERIODS_PER_YEAR: f64 = 365.0;

// ============================================================================
// Statistics helpers
// ============================================================================

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1)
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Linear-interpolated percentile, `p` in [0, 100]
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p)
}

/// Percentile of an already ascending-sorted slice
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * weight
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

/// Coefficient of variation `std / |mean|`. Fewer than two samples is 0.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    ratio(std_dev(values), mean(values).abs())
}

/// `max(0, 1 - CV)`; 0 when the CV is not finite
pub fn stability(values: &[f64]) -> f64 {
    let cv = coefficient_of_variation(values);
    if cv.is_finite() {
        (1.0 - cv).max(0.0)
    } else {
        0.0
    }
}

/// Division with explicit sentinels for a zero denominator.
///
/// `0 / 0` is 0: nothing over nothing. For trade ratios this is the
/// documented value when there is neither a gain nor a loss to compare, and
/// `trade_count` tells "no trades" apart from "all breakeven".
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return if numerator > 0.0 {
            f64::INFINITY
        } else if numerator < 0.0 {
            f64::NEG_INFINITY
        } else {
            0.0
        };
    }
    numerator / denominator
}

/// Replace NaN by `fallback`, logging the divergence
pub fn finite_or(metric: &str, value: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        warn!(metric, fallback, "Metric diverged to NaN, using sentinel");
        fallback
    } else {
        value
    }
}

/// Period-over-period simple returns of an equity series
pub fn period_returns(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .map(|w| if w[0] > 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Bars per year inferred from the median timestamp spacing (24/7 calendar)
pub fn periods_per_year(curve: &[EquityPoint]) -> f64 {
    let spacings: Vec<f64> = curve
        .windows(2)
        .map(|w| (w[1].time - w[0].time) as f64)
        .filter(|d| *d > 0.0)
        .collect();
    if spacings.is_empty() {
        return DEFAULT_PERIODS_PER_YEAR;
    }
    MS_PER_YEAR / median(&spacings)
}

// ============================================================================
// Drawdown
// ============================================================================

/// Drawdown profile of an equity series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawdownProfile {
    /// Largest drawdown from peak, as a fraction
    pub max_drawdown: f64,
    /// Largest drawdown from peak, in currency
    pub max_drawdown_amount: f64,
    /// Mean of the per-episode maximum drawdowns
    pub average_drawdown: f64,
    /// Longest stretch spent below a prior peak, in bars
    pub max_duration: usize,
    /// Bars from the deepest trough back to the prior peak; `None` if never recovered
    pub recovery_bars: Option<usize>,
    /// Drawdown fraction at every point
    pub series: Vec<f64>,
}

pub fn drawdown_profile(equity: &[f64]) -> DrawdownProfile {
    if equity.is_empty() {
        return DrawdownProfile::default();
    }
    let mut profile = DrawdownProfile::default();
    let mut peak = equity[0];
    let mut underwater_since: Option<usize> = None;
    let mut episode_max = 0.0f64;
    let mut episodes: Vec<f64> = Vec::new();
    let mut trough_index = 0usize;
    let mut trough_peak = peak;

    for (i, &value) in equity.iter().enumerate() {
        if value >= peak {
            if let Some(start) = underwater_since.take() {
                profile.max_duration = profile.max_duration.max(i - start);
                episodes.push(episode_max);
                episode_max = 0.0;
            }
            peak = value;
            profile.series.push(0.0);
            continue;
        }
        let dd = if peak > 0.0 { (peak - value) / peak } else { 0.0 };
        if underwater_since.is_none() {
            underwater_since = Some(i - 1);
        }
        episode_max = episode_max.max(dd);
        if dd > profile.max_drawdown {
            profile.max_drawdown = dd;
            profile.max_drawdown_amount = peak - value;
            trough_index = i;
            trough_peak = peak;
        }
        profile.series.push(dd);
    }
    if let Some(start) = underwater_since {
        profile.max_duration = profile.max_duration.max(equity.len() - 1 - start);
        episodes.push(episode_max);
    }
    profile.average_drawdown = mean(&episodes);
    profile.recovery_bars = if profile.max_drawdown > 0.0 {
        equity[trough_index..]
            .iter()
            .position(|&v| v >= trough_peak)
    } else {
        Some(0)
    };
    profile
}

// ============================================================================
// Report
// ============================================================================

/// Benchmark-relative statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStats {
    pub beta: f64,
    /// Annualized Jensen alpha
    pub alpha: f64,
    #[serde(with = "non_finite")]
    pub information_ratio: f64,
    /// Strategy total return minus benchmark total return
    pub excess_return: f64,
}

/// Every derived statistic of a backtest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    // returns
    pub total_return: f64,
    pub annualized_return: f64,
    pub cagr: f64,
    pub net_profit: f64,
    pub final_equity: f64,
    pub volatility: f64,
    // risk-adjusted
    #[serde(with = "non_finite")]
    pub sharpe: f64,
    #[serde(with = "non_finite")]
    pub sortino: f64,
    #[serde(with = "non_finite")]
    pub calmar: f64,
    // drawdown
    pub max_drawdown: f64,
    pub average_drawdown: f64,
    pub max_drawdown_duration: usize,
    #[serde(with = "non_finite")]
    pub recovery_factor: f64,
    // trades
    pub trade_count: usize,
    pub win_rate: f64,
    /// Gross profit / gross loss: `+inf` without losses, 0 without gains or
    /// losses (no trades, or only breakeven ones)
    #[serde(with = "non_finite")]
    pub profit_factor: f64,
    pub expectancy: f64,
    /// Average win / average loss, same sentinels as `profit_factor`
    #[serde(with = "non_finite")]
    pub payoff_ratio: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub exposure: f64,
    // sizing / risk of ruin
    pub kelly_criterion: f64,
    pub optimal_f: f64,
    // path quality
    pub ulcer_index: f64,
    #[serde(with = "non_finite")]
    pub gain_to_pain: f64,
    #[serde(with = "non_finite")]
    pub k_ratio: f64,
    pub periods_per_year: f64,
    #[serde(default)]
    pub benchmark: Option<BenchmarkStats>,
}

impl PerformanceReport {
    /// Flat name → value view
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        let mut put = |k: &str, v: f64| {
            m.insert(k.to_string(), v);
        };
        put("total_return", self.total_return);
        put("annualized_return", self.annualized_return);
        put("cagr", self.cagr);
        put("net_profit", self.net_profit);
        put("final_equity", self.final_equity);
        put("volatility", self.volatility);
        put("sharpe", self.sharpe);
        put("sortino", self.sortino);
        put("calmar", self.calmar);
        put("max_drawdown", self.max_drawdown);
        put("average_drawdown", self.average_drawdown);
        put("max_drawdown_duration", self.max_drawdown_duration as f64);
        put("recovery_factor", self.recovery_factor);
        put("trade_count", self.trade_count as f64);
        put("win_rate", self.win_rate);
        put("profit_factor", self.profit_factor);
        put("expectancy", self.expectancy);
        put("payoff_ratio", self.payoff_ratio);
        put("avg_win", self.avg_win);
        put("avg_loss", self.avg_loss);
        put("largest_win", self.largest_win);
        put("largest_loss", self.largest_loss);
        put("max_consecutive_wins", self.max_consecutive_wins as f64);
        put("max_consecutive_losses", self.max_consecutive_losses as f64);
        put("exposure", self.exposure);
        put("kelly_criterion", self.kelly_criterion);
        put("optimal_f", self.optimal_f);
        put("ulcer_index", self.ulcer_index);
        put("gain_to_pain", self.gain_to_pain);
        put("k_ratio", self.k_ratio);
        put("periods_per_year", self.periods_per_year);
        if let Some(b) = &self.benchmark {
            put("beta", b.beta);
            put("alpha", b.alpha);
            put("information_ratio", b.information_ratio);
            put("excess_return", b.excess_return);
        }
        m
    }
}

/// Compute the full report.
///
/// `benchmark`, when given, is an equity (or price) series aligned index-by-index
/// with `curve`; extra points on either side are ignored.
pub fn compute(
    trades: &[Trade],
    curve: &[EquityPoint],
    initial_capital: f64,
    risk_free_rate: f64,
    benchmark: Option<&[f64]>,
) -> PerformanceReport {
    let equity: Vec<f64> = curve.iter().map(|p| p.equity).collect();
    let final_equity = equity.last().copied().unwrap_or(initial_capital);
    let ppy = periods_per_year(curve);
    let returns = period_returns(&equity);
    let dd = drawdown_profile(&equity);

    let total_return = ratio(final_equity - initial_capital, initial_capital);
    let years = (returns.len().max(1) as f64) / ppy;
    let cagr = if final_equity <= 0.0 || initial_capital <= 0.0 {
        -1.0
    } else {
        (final_equity / initial_capital).powf(1.0 / years) - 1.0
    };
    let rf_per_period = risk_free_rate / ppy;
    let mean_r = mean(&returns);
    let std_r = std_dev(&returns);

    let sharpe = ratio(mean_r - rf_per_period, std_r) * ppy.sqrt();
    let sortino = ratio(mean_r - rf_per_period, downside_deviation(&returns, rf_per_period)) * ppy.sqrt();
    let calmar = ratio(cagr, dd.max_drawdown);
    let net_profit = final_equity - initial_capital;

    let stats = trade_stats(trades);
    let exposure = if equity.len() > 1 {
        (trades.iter().map(|t| t.duration).sum::<usize>() as f64 / (equity.len() - 1) as f64)
            .min(1.0)
    } else {
        0.0
    };

    PerformanceReport {
        total_return: finite_or("total_return", total_return, 0.0),
        annualized_return: finite_or("annualized_return", mean_r * ppy, 0.0),
        cagr: finite_or("cagr", cagr, -1.0),
        net_profit,
        final_equity,
        volatility: finite_or("volatility", std_r * ppy.sqrt(), 0.0),
        sharpe: finite_or("sharpe", sharpe, 0.0),
        sortino: finite_or("sortino", sortino, 0.0),
        calmar: finite_or("calmar", calmar, 0.0),
        max_drawdown: dd.max_drawdown,
        average_drawdown: dd.average_drawdown,
        max_drawdown_duration: dd.max_duration,
        recovery_factor: finite_or(
            "recovery_factor",
            ratio(net_profit, dd.max_drawdown_amount),
            0.0,
        ),
        trade_count: stats.count,
        win_rate: stats.win_rate,
        profit_factor: stats.profit_factor,
        expectancy: stats.expectancy,
        payoff_ratio: stats.payoff_ratio,
        avg_win: stats.avg_win,
        avg_loss: stats.avg_loss,
        largest_win: stats.largest_win,
        largest_loss: stats.largest_loss,
        max_consecutive_wins: stats.max_consecutive_wins,
        max_consecutive_losses: stats.max_consecutive_losses,
        exposure,
        kelly_criterion: finite_or("kelly_criterion", kelly_criterion(&stats), 0.0),
        optimal_f: optimal_f(trades),
        ulcer_index: ulcer_index(&dd.series),
        gain_to_pain: finite_or("gain_to_pain", gain_to_pain(&returns), 0.0),
        k_ratio: finite_or("k_ratio", k_ratio(&equity), 0.0),
        periods_per_year: ppy,
        benchmark: benchmark.map(|b| benchmark_stats(&equity, b, total_return, ppy)),
    }
}

// ============================================================================
// Individual metrics
// ============================================================================

fn downside_deviation(returns: &[f64], target: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = returns.iter().map(|r| (r - target).min(0.0).powi(2)).sum();
    (sum_sq / returns.len() as f64).sqrt()
}

/// Per-trade statistics on net pnl
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeStats {
    pub count: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub payoff_ratio: f64,
    pub avg_win: f64,
    /// Average losing trade as a positive number
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
}

pub fn trade_stats(trades: &[Trade]) -> TradeStats {
    let pnls: Vec<f64> = trades.iter().map(Trade::net_pnl).collect();
    pnl_stats(&pnls)
}

/// Trade statistics over a raw pnl sequence
pub fn pnl_stats(pnls: &[f64]) -> TradeStats {
    let count = pnls.len();
    if count == 0 {
        return TradeStats::default();
    }
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();
    let avg_win = mean(&wins);
    let avg_loss = mean(&losses).abs();

    let mut max_wins = 0;
    let mut max_losses = 0;
    let mut run_wins = 0;
    let mut run_losses = 0;
    // Breakeven trades are neither wins nor losses and end both streaks
    for &p in pnls {
        if p > 0.0 {
            run_wins += 1;
            run_losses = 0;
        } else if p < 0.0 {
            run_losses += 1;
            run_wins = 0;
        } else {
            run_wins = 0;
            run_losses = 0;
        }
        max_wins = usize::max(max_wins, run_wins);
        max_losses = usize::max(max_losses, run_losses);
    }

    TradeStats {
        count,
        wins: wins.len(),
        losses: losses.len(),
        win_rate: wins.len() as f64 / count as f64,
        gross_profit,
        gross_loss,
        profit_factor: ratio(gross_profit, gross_loss),
        expectancy: mean(pnls),
        payoff_ratio: ratio(avg_win, avg_loss),
        avg_win,
        avg_loss,
        largest_win: wins.iter().copied().fold(0.0, f64::max),
        largest_loss: losses.iter().copied().fold(0.0, f64::min),
        max_consecutive_wins: max_wins,
        max_consecutive_losses: max_losses,
    }
}

/// Kelly fraction `W - (1 - W) / R`; with no losses (R = ∞) this is `W`
pub fn kelly_criterion(stats: &TradeStats) -> f64 {
    if stats.count == 0 {
        return 0.0;
    }
    let w = stats.win_rate;
    if stats.payoff_ratio.is_infinite() {
        return w;
    }
    if stats.payoff_ratio <= 0.0 {
        return -1.0;
    }
    w - (1.0 - w) / stats.payoff_ratio
}

/// Larry Williams optimal f: the fraction in (0, 1] maximizing the terminal
/// wealth relative `Π (1 + f · pnl / |largest loss|)`, searched in 0.01 steps.
///
/// No trades gives 0; no losing trade gives 1.
pub fn optimal_f(trades: &[Trade]) -> f64 {
    let pnls: Vec<f64> = trades.iter().map(Trade::net_pnl).collect();
    optimal_f_pnls(&pnls)
}

pub fn optimal_f_pnls(pnls: &[f64]) -> f64 {
    if pnls.is_empty() {
        return 0.0;
    }
    let largest_loss = pnls.iter().copied().fold(0.0, f64::min);
    if largest_loss >= 0.0 {
        return 1.0;
    }
    let mut best_f = 0.0;
    let mut best_twr = 1.0;
    for step in 1..=100 {
        let f = step as f64 / 100.0;
        let mut log_twr = 0.0;
        let mut ruined = false;
        for &p in pnls {
            let hpr = 1.0 + f * (p / -largest_loss);
            if hpr <= 0.0 {
                ruined = true;
                break;
            }
            log_twr += hpr.ln();
        }
        if ruined {
            continue;
        }
        let twr = log_twr.exp();
        if twr > best_twr {
            best_twr = twr;
            best_f = f;
        }
    }
    best_f
}

/// Root-mean-square drawdown, in percent
pub fn ulcer_index(drawdowns: &[f64]) -> f64 {
    if drawdowns.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = drawdowns.iter().map(|d| (d * 100.0).powi(2)).sum();
    (sum_sq / drawdowns.len() as f64).sqrt()
}

/// Sum of returns over the absolute sum of negative returns
pub fn gain_to_pain(returns: &[f64]) -> f64 {
    let total: f64 = returns.iter().sum();
    let pain: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    ratio(total, pain)
}

/// Kestner K-ratio: slope of the log-equity regression divided by its
/// standard error scaled by `sqrt(n)`
pub fn k_ratio(equity: &[f64]) -> f64 {
    let points: Vec<f64> = equity.iter().filter(|e| **e > 0.0).map(|e| e.ln()).collect();
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let x_mean = mean(&xs);
    let y_mean = mean(&points);
    let sxx: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
    let sxy: f64 = xs
        .iter()
        .zip(&points)
        .map(|(x, y)| (x - x_mean) * (y - y_mean))
        .sum();
    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let ssr: f64 = xs
        .iter()
        .zip(&points)
        .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
        .sum();
    let std_err = (ssr / (n - 2) as f64).sqrt() / sxx.sqrt();
    // Residuals below float noise count as a perfectly straight line
    if std_err < 1e-15 {
        return ratio(slope, 0.0);
    }
    slope / (std_err * (n as f64).sqrt())
}

fn benchmark_stats(equity: &[f64], benchmark: &[f64], total_return: f64, ppy: f64) -> BenchmarkStats {
    let n = equity.len().min(benchmark.len());
    let strat = period_returns(&equity[..n]);
    let bench = period_returns(&benchmark[..n]);
    let bench_mean = mean(&bench);
    let strat_mean = mean(&strat);
    let cov = if strat.len() > 1 {
        strat
            .iter()
            .zip(&bench)
            .map(|(s, b)| (s - strat_mean) * (b - bench_mean))
            .sum::<f64>()
            / (strat.len() - 1) as f64
    } else {
        0.0
    };
    let var_b = std_dev(&bench).powi(2);
    let beta = finite_or("beta", ratio(cov, var_b), 0.0);
    let beta = if beta.is_finite() { beta } else { 0.0 };
    let active: Vec<f64> = strat.iter().zip(&bench).map(|(s, b)| s - b).collect();
    let bench_total = if n > 0 && benchmark[0] > 0.0 {
        benchmark[n - 1] / benchmark[0] - 1.0
    } else {
        0.0
    };
    BenchmarkStats {
        beta,
        alpha: (strat_mean - beta * bench_mean) * ppy,
        information_ratio: finite_or(
            "information_ratio",
            ratio(mean(&active), std_dev(&active)) * ppy.sqrt(),
            0.0,
        ),
        excess_return: total_return - bench_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::Regime;
    use crate::types::{ExitReason, Side};

    fn trade(net: f64) -> Trade {
        Trade {
            side: Side::Long,
            quantity: 1.0,
            entry_time: 0,
            exit_time: 60_000,
            entry_price: 100.0,
            exit_price: 100.0 + net,
            entry_index: 0,
            exit_index: 1,
            realized_pnl: net,
            fees_paid: 0.0,
            slippage_paid: 0.0,
            funding_paid: 0.0,
            duration: 1,
            exit_reason: ExitReason::Signal,
            regime_at_entry: Regime::default(),
            mae: 0.0,
            mfe: 0.0,
        }
    }

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &e)| EquityPoint {
                time: i as i64 * 86_400_000,
                equity: e,
            })
            .collect()
    }

    #[test]
    fn test_ratio_sentinels() {
        assert_eq!(ratio(1.0, 0.0), f64::INFINITY);
        assert_eq!(ratio(-1.0, 0.0), f64::NEG_INFINITY);
        assert_eq!(ratio(0.0, 0.0), 0.0);
        assert_eq!(ratio(6.0, 3.0), 2.0);
    }

    #[test]
    fn test_profit_factor_infinite_without_losses() {
        let stats = trade_stats(&[trade(10.0), trade(5.0)]);
        assert_eq!(stats.profit_factor, f64::INFINITY);
        assert_eq!(stats.win_rate, 1.0);
        assert_eq!(stats.payoff_ratio, f64::INFINITY);
        assert_eq!(kelly_criterion(&stats), 1.0);
    }

    #[test]
    fn test_trade_stats_mixed() {
        let stats = trade_stats(&[trade(10.0), trade(-5.0), trade(-5.0), trade(20.0)]);
        assert_eq!(stats.count, 4);
        assert!((stats.win_rate - 0.5).abs() < 1e-12);
        assert!((stats.profit_factor - 3.0).abs() < 1e-12);
        assert!((stats.expectancy - 5.0).abs() < 1e-12);
        assert!((stats.payoff_ratio - 3.0).abs() < 1e-12);
        assert_eq!(stats.max_consecutive_losses, 2);
        assert_eq!(stats.largest_loss, -5.0);
        // W - (1-W)/R = 0.5 - 0.5/3
        assert!((kelly_criterion(&stats) - (0.5 - 0.5 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_empty_trades_are_zero_not_nan() {
        let report = compute(&[], &curve(&[100.0, 100.0, 100.0]), 100.0, 0.0, None);
        assert_eq!(report.trade_count, 0);
        assert_eq!(report.win_rate, 0.0);
        assert_eq!(report.profit_factor, 0.0);
        assert_eq!(report.sharpe, 0.0);
        assert_eq!(report.max_drawdown, 0.0);
        assert!(report.to_map().values().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_breakeven_trades_are_neither_wins_nor_losses() {
        let stats = trade_stats(&[trade(-5.0), trade(0.0), trade(-5.0), trade(0.0), trade(3.0)]);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 2);
        // The breakeven trade between the two losses ends the streak
        assert_eq!(stats.max_consecutive_losses, 1);
        assert_eq!(stats.max_consecutive_wins, 1);

        let flat = trade_stats(&[trade(0.0), trade(0.0)]);
        assert_eq!(flat.count, 2);
        assert_eq!(flat.losses, 0);
        assert_eq!(flat.max_consecutive_losses, 0);
        assert_eq!(flat.profit_factor, 0.0);
        assert_eq!(flat.payoff_ratio, 0.0);
    }

    #[test]
    fn test_drawdown_profile() {
        let dd = drawdown_profile(&[100.0, 120.0, 90.0, 110.0, 130.0, 117.0]);
        assert!((dd.max_drawdown - 0.25).abs() < 1e-12);
        assert!((dd.max_drawdown_amount - 30.0).abs() < 1e-12);
        // underwater from index 1 to recovery at index 4
        assert_eq!(dd.max_duration, 3);
        assert_eq!(dd.recovery_bars, Some(2));
        assert!((dd.average_drawdown - (0.25 + 0.1) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_unrecovered_drawdown() {
        let dd = drawdown_profile(&[100.0, 80.0, 85.0]);
        assert_eq!(dd.recovery_bars, None);
        assert_eq!(dd.max_duration, 2);
    }

    #[test]
    fn test_optimal_f() {
        assert_eq!(optimal_f_pnls(&[]), 0.0);
        assert_eq!(optimal_f_pnls(&[5.0, 3.0]), 1.0);
        // Symmetric coin with 2:1 payoff: optimal f is 0.25 of the largest loss
        let f = optimal_f_pnls(&[2.0, -1.0, 2.0, -1.0]);
        assert!((f - 0.25).abs() < 0.011, "got {f}");
    }

    #[test]
    fn test_percentiles() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 50.0), 3.0);
        assert_eq!(percentile(&values, 100.0), 5.0);
        assert!((percentile(&values, 25.0) - 2.0).abs() < 1e-12);
        assert!((percentile(&values, 5.0) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_coefficient_of_variation() {
        assert_eq!(coefficient_of_variation(&[5.0]), 0.0);
        assert_eq!(coefficient_of_variation(&[2.0, 2.0, 2.0]), 0.0);
        assert_eq!(coefficient_of_variation(&[-1.0, 1.0]), f64::INFINITY);
    }

    #[test]
    fn test_report_on_rising_curve() {
        let values: Vec<f64> = (0..50).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let report = compute(&[trade(10.0)], &curve(&values), 100.0, 0.0, None);
        assert!(report.total_return > 0.6);
        assert_eq!(report.max_drawdown, 0.0);
        assert_eq!(report.calmar, f64::INFINITY);
        assert_eq!(report.gain_to_pain, f64::INFINITY);
        assert!(report.k_ratio > 0.0);
        assert!((report.periods_per_year - 365.25).abs() < 1e-9);
    }

    #[test]
    fn test_benchmark_against_itself() {
        let values = [100.0, 102.0, 101.0, 105.0, 107.0];
        let report = compute(&[], &curve(&values), 100.0, 0.0, Some(&values));
        let bench = report.benchmark.unwrap();
        assert!((bench.beta - 1.0).abs() < 1e-9);
        assert!(bench.excess_return.abs() < 1e-12);
    }

    #[test]
    fn test_ulcer_index() {
        assert_eq!(ulcer_index(&[0.0, 0.0]), 0.0);
        assert!((ulcer_index(&[0.1, 0.1]) - 10.0).abs() < 1e-12);
    }
}
