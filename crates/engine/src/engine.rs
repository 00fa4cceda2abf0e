//! Bar-by-bar backtesting engine
//!
//! A run is a fold of [`BacktestEngine::advance`] over the bars: every step takes
//! the previous [`EngineState`] by value and returns the next one. Bar order is
//! part of the semantics, so a single run never parallelizes internally.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::fees::{funding_boundaries_crossed, funding_fee, CostModel, OrderAction};
use crate::metrics;
use crate::params::ParamSet;
use crate::regime::{Regime, RegimeClassifier};
use crate::types::*;

/// Parameter keys the engine reads from a [`ParamSet`]
pub const POSITION_PCT: &str = "position_pct";
pub const STOP_LOSS_PCT: &str = "stop_loss_pct";
pub const TAKE_PROFIT_PCT: &str = "take_profit_pct";
pub const LEVERAGE: &str = "leverage";

/// Minimum number of bars for a meaningful run
pub const MIN_BARS: usize = 2;

/// Execution parameters resolved from a [`ParamSet`] against the risk limits.
///
/// `position_pct` and the `max_position_pct` cap apply to committed margin,
/// `notional / leverage`. A leveraged position's notional can therefore reach
/// `leverage * max_position_pct * equity` while its margin stays within the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionParams {
    pub position_pct: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub leverage: f64,
}

impl ExecutionParams {
    pub fn resolve(params: &ParamSet, risk: &RiskLimits) -> Result<Self> {
        let position_pct = params.get_f64(POSITION_PCT).unwrap_or(risk.max_position_pct);
        if !(position_pct > 0.0 && position_pct <= 1.0) {
            return Err(EngineError::Config(format!(
                "{POSITION_PCT} must be in (0, 1], got {position_pct}"
            )));
        }
        let leverage = params.get_f64(LEVERAGE).unwrap_or(1.0);
        if !(leverage >= 1.0) {
            return Err(EngineError::Config(format!(
                "{LEVERAGE} must be >= 1, got {leverage}"
            )));
        }
        let positive = |key: &str| -> Result<Option<f64>> {
            match params.get_f64(key) {
                Some(v) if !(v > 0.0 && v.is_finite()) => Err(EngineError::Config(format!(
                    "{key} must be a positive fraction, got {v}"
                ))),
                other => Ok(other),
            }
        };
        Ok(Self {
            position_pct: position_pct.min(risk.max_position_pct),
            stop_loss_pct: positive(STOP_LOSS_PCT)?,
            take_profit_pct: positive(TAKE_PROFIT_PCT)?,
            leverage: leverage.min(risk.max_leverage),
        })
    }
}

/// Mutable-by-replacement simulation state
#[derive(Debug, Clone)]
pub struct EngineState {
    /// Realized cash: initial capital plus closed pnl, minus fees and funding
    pub cash: f64,
    /// Marked equity after the last processed bar
    pub equity: f64,
    pub peak_equity: f64,
    pub position: Option<Position>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub regime_stats: BTreeMap<String, RegimeStats>,
    /// Set once the circuit breaker trips; no entries afterwards
    pub terminal: bool,
    pub breaker_tripped_at: Option<i64>,
    pub total_fees: f64,
    pub total_funding: f64,
    pub total_slippage: f64,
    last_time: Option<i64>,
}

impl EngineState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            equity: initial_capital,
            peak_equity: initial_capital,
            position: None,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            regime_stats: BTreeMap::new(),
            terminal: false,
            breaker_tripped_at: None,
            total_fees: 0.0,
            total_funding: 0.0,
            total_slippage: 0.0,
            last_time: None,
        }
    }

    fn marked_equity(&self, price: f64) -> f64 {
        self.cash
            + self
                .position
                .as_ref()
                .map(|p| p.unrealized_pnl(price))
                .unwrap_or(0.0)
    }
}

/// Read-only inputs shared by every step of one run
pub struct BacktestEngine<'a> {
    config: &'a BacktestConfig,
    bars: &'a [Bar],
    costs: CostModel<'a>,
    classifier: RegimeClassifier,
    exec: ExecutionParams,
}

impl<'a> BacktestEngine<'a> {
    pub fn new(config: &'a BacktestConfig, bars: &'a [Bar], exec: ExecutionParams) -> Self {
        Self {
            config,
            bars,
            costs: CostModel::new(&config.fees, &config.slippage),
            classifier: RegimeClassifier::new(config.regime.clone()),
            exec,
        }
    }

    /// Run a full backtest.
    ///
    /// Bars must be strictly increasing in time; signals must be in
    /// non-decreasing time order and are matched to bars by exact timestamp.
    pub fn run(
        config: &BacktestConfig,
        bars: &[Bar],
        signals: &[Signal],
        strategy_name: &str,
        params: &ParamSet,
    ) -> Result<BacktestResult> {
        config.validate()?;
        validate_bars(bars)?;
        let bars = select_range(config, bars)?;
        if bars.len() < MIN_BARS {
            return Err(EngineError::InsufficientData {
                required: MIN_BARS,
                available: bars.len(),
            });
        }
        let aligned = align_signals(&config.symbol, bars, signals)?;
        let exec = ExecutionParams::resolve(params, &config.risk)?;

        info!(
            symbol = %config.symbol,
            strategy = strategy_name,
            bars = bars.len(),
            signals = signals.len(),
            capital = config.initial_capital,
            "Starting backtest"
        );

        let engine = BacktestEngine::new(config, bars, exec);
        let state = (0..bars.len()).fold(EngineState::new(config.initial_capital), |state, i| {
            engine.advance(state, i, aligned[i])
        });

        let result = engine.finish(state, strategy_name, params);
        info!(
            trades = result.trades.len(),
            final_equity = result.final_equity,
            total_return = result.metrics.total_return,
            max_drawdown = result.metrics.max_drawdown,
            breaker = result.circuit_breaker_tripped_at.is_some(),
            "Backtest complete"
        );
        Ok(result)
    }

    /// Process bar `index` and return the next state
    pub fn advance(&self, mut state: EngineState, index: usize, signal: Option<&Signal>) -> EngineState {
        let bar = &self.bars[index];
        let regime = self.classifier.classify_at(self.bars, index);
        let equity_before = state.equity;
        let last_bar = index + 1 == self.bars.len();

        // 1. funding for the interval since the previous bar, then excursions and triggers
        self.accrue_funding(&mut state, bar);
        if let Some(pos) = state.position.as_mut() {
            update_excursions(pos, bar);
        }
        if let Some((reason, reference)) = state.position.as_ref().and_then(|p| stop_trigger(p, bar)) {
            self.close_position(&mut state, index, reference, reason);
        }

        // 2. circuit breaker on marked equity
        let marked = state.marked_equity(bar.close);
        state.peak_equity = state.peak_equity.max(marked);
        if !state.terminal && state.peak_equity > 0.0 {
            let drawdown = (state.peak_equity - marked) / state.peak_equity;
            if drawdown >= self.config.risk.circuit_breaker_drawdown {
                warn!(
                    time = bar.timestamp,
                    drawdown,
                    threshold = self.config.risk.circuit_breaker_drawdown,
                    "Circuit breaker tripped, run is terminal"
                );
                if state.position.is_some() {
                    self.close_position(&mut state, index, bar.close, ExitReason::CircuitBreaker);
                }
                state.terminal = true;
                state.breaker_tripped_at = Some(bar.timestamp);
            }
        }

        // 3-4. signal exits
        let direction = signal.map(|s| s.direction);
        if let (Some(pos), Some(dir)) = (state.position.as_ref(), direction) {
            let opposing = match (pos.side, dir) {
                (_, Direction::Flat) => true,
                (Side::Long, Direction::Short) | (Side::Short, Direction::Long) => true,
                _ => false,
            };
            if opposing {
                self.close_position(&mut state, index, bar.close, ExitReason::Signal);
            }
        }
        if last_bar && state.position.is_some() {
            self.close_position(&mut state, index, bar.close, ExitReason::EndOfData);
        }

        // 5. entries
        if let Some(sig) = signal {
            if !state.terminal && !last_bar && state.position.is_none() {
                let side = match sig.direction {
                    Direction::Long => Some(Side::Long),
                    Direction::Short if self.config.allow_short => Some(Side::Short),
                    _ => None,
                };
                if let Some(side) = side {
                    self.open_position(&mut state, index, side, sig.size_hint, regime);
                }
            }
        }

        // 7-8. regime attribution and equity
        state.equity = state.marked_equity(bar.close);
        let bucket = state.regime_stats.entry(regime.label()).or_default();
        bucket.bars += 1;
        bucket.pnl += state.equity - equity_before;
        state.equity_curve.push(EquityPoint {
            time: bar.timestamp,
            equity: state.equity,
        });
        state.last_time = Some(bar.timestamp);
        state
    }

    fn accrue_funding(&self, state: &mut EngineState, bar: &Bar) {
        let Some(prev) = state.last_time else { return };
        let Some(pos) = state.position.as_mut() else { return };
        if !pos.is_leveraged() {
            return;
        }
        let crossed = funding_boundaries_crossed(prev.max(pos.opened_at), bar.timestamp);
        let fee = funding_fee(&self.config.fees, pos.quantity * bar.open, crossed);
        if fee > 0.0 {
            pos.funding_paid += fee;
            state.cash -= fee;
            state.total_funding += fee;
            debug!(time = bar.timestamp, intervals = crossed, fee, "Funding charged");
        }
    }

    fn open_position(
        &self,
        state: &mut EngineState,
        index: usize,
        side: Side,
        size_hint: Option<f64>,
        regime: Regime,
    ) {
        let bar = &self.bars[index];
        let equity = state.marked_equity(bar.close);
        if !(equity > 0.0 && bar.close > 0.0) {
            return;
        }
        let leverage = self.exec.leverage;
        let max_margin = self.config.risk.max_position_pct * equity;
        let style = self.config.fees.order_style;
        let action = OrderAction::opening(side);

        let mut quantity = size_hint
            .filter(|q| *q > 0.0 && q.is_finite())
            .unwrap_or(self.exec.position_pct * equity * leverage / bar.close);
        let mut fill = self.costs.fill(bar.close, quantity, action, bar, style, false);
        if quantity * fill.price / leverage > max_margin {
            quantity = max_margin * leverage / fill.price;
            fill = self.costs.fill(bar.close, quantity, action, bar, style, false);
        }
        if !(quantity > 0.0 && fill.price > 0.0) || fill.fee >= state.cash {
            debug!(time = bar.timestamp, quantity, "Entry skipped, capital insufficient");
            return;
        }

        let stop_loss = self
            .exec
            .stop_loss_pct
            .map(|pct| fill.price * (1.0 - pct * side.sign()));
        let take_profit = self
            .exec
            .take_profit_pct
            .map(|pct| fill.price * (1.0 + pct * side.sign()));

        state.cash -= fill.fee;
        state.total_fees += fill.fee;
        state.total_slippage += fill.slippage_cost;
        state.regime_stats.entry(regime.label()).or_default().trades += 1;
        state.position = Some(Position {
            side,
            quantity,
            entry_price: fill.price,
            entry_reference: bar.close,
            opened_at: bar.timestamp,
            entry_index: index,
            leverage,
            stop_loss,
            take_profit,
            mae: 0.0,
            mfe: 0.0,
            regime_at_entry: regime,
            entry_fee: fill.fee,
            entry_slippage: fill.slippage_cost,
            funding_paid: 0.0,
        });

        debug!(
            side = ?side,
            price = fill.price,
            quantity,
            time = bar.timestamp,
            "Opened position"
        );
    }

    fn close_position(&self, state: &mut EngineState, index: usize, reference: f64, reason: ExitReason) {
        let Some(pos) = state.position.take() else { return };
        let bar = &self.bars[index];
        let (style, stop_triggered) = match reason {
            ExitReason::Signal => (self.config.fees.order_style, false),
            ExitReason::Stop | ExitReason::CircuitBreaker => (OrderStyle::Taker, true),
            ExitReason::TakeProfit | ExitReason::EndOfData => (OrderStyle::Taker, false),
        };
        let fill = self.costs.fill(
            reference,
            pos.quantity,
            OrderAction::closing(pos.side),
            bar,
            style,
            stop_triggered,
        );
        let realized_pnl = (fill.price - pos.entry_price) * pos.quantity * pos.side.sign();
        let exit_pnl = pos.unrealized_pnl(fill.price);

        state.cash += realized_pnl - fill.fee;
        state.total_fees += fill.fee;
        state.total_slippage += fill.slippage_cost;

        let trade = Trade {
            side: pos.side,
            quantity: pos.quantity,
            entry_time: pos.opened_at,
            exit_time: bar.timestamp,
            entry_price: pos.entry_price,
            exit_price: fill.price,
            entry_index: pos.entry_index,
            exit_index: index,
            realized_pnl,
            fees_paid: pos.entry_fee + fill.fee,
            slippage_paid: pos.entry_slippage + fill.slippage_cost,
            funding_paid: pos.funding_paid,
            duration: index - pos.entry_index,
            exit_reason: reason,
            regime_at_entry: pos.regime_at_entry,
            mae: pos.mae.min(exit_pnl),
            mfe: pos.mfe.max(exit_pnl),
        };
        if trade.is_win() {
            state
                .regime_stats
                .entry(trade.regime_at_entry.label())
                .or_default()
                .wins += 1;
        }

        debug!(
            entry = trade.entry_price,
            exit = trade.exit_price,
            pnl = trade.net_pnl(),
            reason = ?reason,
            "Closed position"
        );
        state.trades.push(trade);
    }

    fn finish(&self, state: EngineState, strategy_name: &str, params: &ParamSet) -> BacktestResult {
        let closes: Vec<f64> = self.bars.iter().map(|b| b.close).collect();
        let report = metrics::compute(
            &state.trades,
            &state.equity_curve,
            self.config.initial_capital,
            self.config.risk_free_rate,
            Some(&closes),
        );
        let mut regime_metrics = state.regime_stats;
        for stats in regime_metrics.values_mut() {
            stats.win_rate = if stats.trades > 0 {
                stats.wins as f64 / stats.trades as f64
            } else {
                0.0
            };
        }
        BacktestResult {
            strategy_name: strategy_name.to_string(),
            symbol: self.config.symbol.clone(),
            params: params.clone(),
            start_time: self.bars.first().map(|b| b.timestamp).unwrap_or(0),
            end_time: self.bars.last().map(|b| b.timestamp).unwrap_or(0),
            initial_capital: self.config.initial_capital,
            final_equity: state.equity,
            trades: state.trades,
            equity_curve: state.equity_curve,
            metrics: report,
            regime_metrics,
            total_fees: state.total_fees,
            total_funding: state.total_funding,
            total_slippage: state.total_slippage,
            circuit_breaker_tripped_at: state.breaker_tripped_at,
        }
    }
}

/// Worst and best unrealized pnl using the bar's extremes
fn update_excursions(pos: &mut Position, bar: &Bar) {
    let (adverse, favorable) = match pos.side {
        Side::Long => (bar.low, bar.high),
        Side::Short => (bar.high, bar.low),
    };
    pos.mae = pos.mae.min(pos.unrealized_pnl(adverse));
    pos.mfe = pos.mfe.max(pos.unrealized_pnl(favorable));
}

/// Stop-loss or take-profit hit inside `bar`, with the reference fill price.
/// Stop-loss wins when both levels are inside the bar's range.
fn stop_trigger(pos: &Position, bar: &Bar) -> Option<(ExitReason, f64)> {
    match pos.side {
        Side::Long => {
            if let Some(stop) = pos.stop_loss.filter(|s| bar.low <= *s) {
                return Some((ExitReason::Stop, bar.open.min(stop)));
            }
            pos.take_profit
                .filter(|tp| bar.high >= *tp)
                .map(|tp| (ExitReason::TakeProfit, bar.open.max(tp)))
        }
        Side::Short => {
            if let Some(stop) = pos.stop_loss.filter(|s| bar.high >= *s) {
                return Some((ExitReason::Stop, bar.open.max(stop)));
            }
            pos.take_profit
                .filter(|tp| bar.low <= *tp)
                .map(|tp| (ExitReason::TakeProfit, bar.open.min(tp)))
        }
    }
}

fn validate_bars(bars: &[Bar]) -> Result<()> {
    for (i, bar) in bars.iter().enumerate() {
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) || !bar.volume.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "bar {i} at {} has non-finite or negative values",
                bar.timestamp
            )));
        }
        if i > 0 && bar.timestamp <= bars[i - 1].timestamp {
            return Err(EngineError::InvalidInput(format!(
                "bars must be strictly increasing in time, bar {i} at {} is not",
                bar.timestamp
            )));
        }
    }
    Ok(())
}

/// Restrict bars to `[start_time, end_time)` when a range is configured
pub fn select_range<'b>(config: &BacktestConfig, bars: &'b [Bar]) -> Result<&'b [Bar]> {
    if config.start_time.is_none() && config.end_time.is_none() {
        return Ok(bars);
    }
    let start = config
        .start_time
        .map(|t| bars.partition_point(|b| b.timestamp < t))
        .unwrap_or(0);
    let end = config
        .end_time
        .map(|t| bars.partition_point(|b| b.timestamp < t))
        .unwrap_or(bars.len());
    if !bars.is_empty() && start >= end {
        return Err(EngineError::Config(format!(
            "date range {:?}..{:?} lies outside the data",
            config.start_time, config.end_time
        )));
    }
    Ok(&bars[start..end.max(start)])
}

/// Map every bar index to the signal (if any) stamped with its timestamp
fn align_signals<'s>(symbol: &str, bars: &[Bar], signals: &'s [Signal]) -> Result<Vec<Option<&'s Signal>>> {
    let mut aligned: Vec<Option<&Signal>> = vec![None; bars.len()];
    let mut unmatched = 0usize;
    let mut prev_time = i64::MIN;
    for sig in signals {
        if sig.timestamp < prev_time {
            return Err(EngineError::InvalidInput(format!(
                "signals must be in time order, {} follows {}",
                sig.timestamp, prev_time
            )));
        }
        prev_time = sig.timestamp;
        if !sig.symbol.is_empty() && sig.symbol != symbol {
            unmatched += 1;
            continue;
        }
        match bars.binary_search_by_key(&sig.timestamp, |b| b.timestamp) {
            Ok(i) => aligned[i] = Some(sig),
            Err(_) => unmatched += 1,
        }
    }
    if unmatched > 0 {
        debug!(unmatched, "Signals without a matching bar ignored");
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn make_bars(prices: &[f64]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Bar::new(i as i64 * MIN, p, p + 1.0, p - 1.0, p, 1_000.0))
            .collect()
    }

    fn signal(bar: usize, direction: Direction) -> Signal {
        Signal::new(bar as i64 * MIN, "BTCUSDT", direction)
    }

    fn frictionless() -> BacktestConfig {
        let mut config = BacktestConfig::default();
        config.fees.maker = 0.0;
        config.fees.taker = 0.0;
        config.slippage = SlippageModel {
            fixed_bps: 0.0,
            volume_factor: 0.0,
            volatility_factor: 0.0,
            stop_extra_bps: 0.0,
        };
        config
    }

    fn run(config: &BacktestConfig, bars: &[Bar], signals: &[Signal], params: &ParamSet) -> BacktestResult {
        BacktestEngine::run(config, bars, signals, "test", params).unwrap()
    }

    #[test]
    fn test_zero_signals_flat_equity() {
        let bars = make_bars(&[100.0, 101.0, 99.0, 105.0, 103.0]);
        let result = run(&BacktestConfig::default(), &bars, &[], &ParamSet::new());
        assert_eq!(result.trades.len(), 0);
        assert_eq!(result.equity_curve.len(), bars.len());
        assert!(result.equity_curve.iter().all(|p| p.equity == 100_000.0));
        assert_eq!(result.final_equity, 100_000.0);
    }

    #[test]
    fn test_single_long_trade_example() {
        let mut config = BacktestConfig::default();
        config.fees.maker = 0.0002;
        config.fees.order_style = OrderStyle::Maker;
        config.slippage = SlippageModel {
            fixed_bps: 5.0,
            volume_factor: 0.0,
            volatility_factor: 0.0,
            stop_extra_bps: 0.0,
        };
        let bars = make_bars(&[100.0, 105.0, 110.0, 110.0]);
        let signals = vec![
            signal(0, Direction::Long).with_size(1.0),
            signal(2, Direction::Flat),
        ];
        let result = run(&config, &bars, &signals, &ParamSet::new());

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert!((trade.entry_price - 100.05).abs() < 1e-9);
        assert!((trade.exit_price - 109.945).abs() < 1e-9);
        assert!((trade.fees_paid - 0.0002 * (100.05 + 109.945)).abs() < 1e-9);
        assert!((trade.net_pnl() - 9.853).abs() < 0.01);
        assert_eq!(trade.exit_reason, ExitReason::Signal);
        assert_eq!(trade.duration, 2);
        assert_eq!(result.metrics.win_rate, 1.0);
        assert_eq!(result.metrics.profit_factor, f64::INFINITY);
    }

    #[test]
    fn test_accounting_identity() {
        let mut config = BacktestConfig::default();
        config.risk.max_leverage = 3.0;
        let prices: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.4).sin() * 8.0 + i as f64 * 0.1)
            .collect();
        // 4h bars so leveraged positions cross funding boundaries
        let bars: Vec<Bar> = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Bar::new(i as i64 * 4 * 60 * MIN, p, p + 1.0, p - 1.0, p, 500.0))
            .collect();
        let signals: Vec<Signal> = (0..60)
            .step_by(7)
            .enumerate()
            .map(|(k, i)| {
                let dir = if k % 2 == 0 { Direction::Long } else { Direction::Short };
                Signal::new(bars[i].timestamp, "BTCUSDT", dir)
            })
            .collect();
        let params = ParamSet::new().with(LEVERAGE, 2.0);
        let result = run(&config, &bars, &signals, &params);

        assert!(!result.trades.is_empty());
        assert!(result.total_funding > 0.0);
        let net: f64 = result.trades.iter().map(Trade::net_pnl).sum();
        assert!((result.final_equity - (config.initial_capital + net)).abs() < 1e-6);

        let realized: f64 = result.trades.iter().map(|t| t.realized_pnl).sum();
        let price_driven = result.final_equity - config.initial_capital + result.total_fees + result.total_funding;
        assert!((realized - price_driven).abs() < 1e-6);
        assert!(result.trades.iter().all(|t| t.duration >= 1));
    }

    #[test]
    fn test_position_size_capped() {
        let config = frictionless();
        let bars = make_bars(&[100.0, 100.0, 100.0]);
        // A huge size hint is clamped to max_position_pct of equity
        let signals = vec![signal(0, Direction::Long).with_size(1_000_000.0)];
        let result = run(&config, &bars, &signals, &ParamSet::new());
        let trade = &result.trades[0];
        let committed = trade.quantity * trade.entry_price;
        assert!(committed <= config.risk.max_position_pct * config.initial_capital + 1e-6);
    }

    #[test]
    fn test_position_cap_applies_to_margin() {
        let mut config = frictionless();
        config.risk.max_leverage = 3.0;
        let bars = make_bars(&[100.0, 100.0, 100.0]);
        let signals = vec![signal(0, Direction::Long).with_size(1_000_000.0)];
        let params = ParamSet::new().with(LEVERAGE, 3.0);
        let result = run(&config, &bars, &signals, &params);
        let trade = &result.trades[0];
        let notional = trade.quantity * trade.entry_price;
        let cap = config.risk.max_position_pct * config.initial_capital;
        assert!((notional - 3.0 * cap).abs() < 1e-6);
        assert!((notional / 3.0 - cap).abs() < 1e-6);
    }

    #[test]
    fn test_stop_loss_precedes_take_profit() {
        let config = frictionless();
        let mut bars = make_bars(&[100.0, 100.0, 100.0, 100.0]);
        // Bar 1 spans both the stop (95) and the take-profit (105)
        bars[1].high = 110.0;
        bars[1].low = 90.0;
        let params = ParamSet::new()
            .with(STOP_LOSS_PCT, 0.05)
            .with(TAKE_PROFIT_PCT, 0.05);
        let result = run(&config, &bars, &[signal(0, Direction::Long)], &params);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::Stop);
        assert!((result.trades[0].exit_price - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_gap_fills_at_open() {
        let config = frictionless();
        let mut bars = make_bars(&[100.0, 100.0, 100.0]);
        bars[1] = Bar::new(MIN, 80.0, 81.0, 79.0, 80.0, 1_000.0);
        let params = ParamSet::new().with(STOP_LOSS_PCT, 0.05);
        let result = run(&config, &bars, &[signal(0, Direction::Long)], &params);
        assert!((result.trades[0].exit_price - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_circuit_breaker_is_terminal() {
        let mut config = frictionless();
        config.risk.max_position_pct = 1.0;
        config.risk.circuit_breaker_drawdown = 0.10;
        let bars = make_bars(&[100.0, 95.0, 85.0, 90.0, 95.0, 100.0, 105.0]);
        let signals = vec![
            signal(0, Direction::Long),
            signal(3, Direction::Long),
            signal(4, Direction::Long),
        ];
        let params = ParamSet::new().with(POSITION_PCT, 1.0);
        let result = run(&config, &bars, &signals, &params);

        assert_eq!(result.circuit_breaker_tripped_at, Some(2 * MIN));
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::CircuitBreaker);
        assert_eq!(result.trades[0].exit_index, 2);
        let after = &result.equity_curve[2..];
        assert!(after.iter().all(|p| p.equity == after[0].equity));
    }

    #[test]
    fn test_open_position_closes_at_end_of_data() {
        let config = frictionless();
        let bars = make_bars(&[100.0, 102.0, 104.0]);
        let result = run(&config, &bars, &[signal(0, Direction::Long)], &ParamSet::new());
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::EndOfData);
        assert_eq!(result.trades[0].exit_index, 2);
    }

    #[test]
    fn test_no_entry_on_last_bar() {
        let config = frictionless();
        let bars = make_bars(&[100.0, 102.0, 104.0]);
        let result = run(&config, &bars, &[signal(2, Direction::Long)], &ParamSet::new());
        assert!(result.trades.is_empty());
    }

    #[test]
    fn test_short_disallowed_only_closes() {
        let mut config = frictionless();
        config.allow_short = false;
        let bars = make_bars(&[100.0, 102.0, 104.0, 103.0, 101.0]);
        let signals = vec![signal(0, Direction::Long), signal(2, Direction::Short)];
        let result = run(&config, &bars, &signals, &ParamSet::new());
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].side, Side::Long);
        assert_eq!(result.trades[0].exit_index, 2);
    }

    #[test]
    fn test_reversal_opens_short() {
        let config = frictionless();
        let bars = make_bars(&[100.0, 102.0, 104.0, 100.0, 98.0]);
        let signals = vec![signal(0, Direction::Long), signal(2, Direction::Short)];
        let result = run(&config, &bars, &signals, &ParamSet::new());
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[1].side, Side::Short);
        assert!(result.trades[1].realized_pnl > 0.0);
    }

    #[test]
    fn test_insufficient_data() {
        let bars = make_bars(&[100.0]);
        let err = BacktestEngine::run(&BacktestConfig::default(), &bars, &[], "test", &ParamSet::new())
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientData {
                required: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_date_range_outside_data() {
        let config = BacktestConfig {
            start_time: Some(1_000 * MIN),
            end_time: Some(2_000 * MIN),
            ..Default::default()
        };
        let bars = make_bars(&[100.0, 101.0, 102.0]);
        let err = BacktestEngine::run(&config, &bars, &[], "test", &ParamSet::new()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_date_range_filters_bars() {
        let config = BacktestConfig {
            start_time: Some(MIN),
            end_time: Some(4 * MIN),
            ..Default::default()
        };
        let bars = make_bars(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
        let result = run(&config, &bars, &[], &ParamSet::new());
        assert_eq!(result.equity_curve.len(), 3);
        assert_eq!(result.start_time, MIN);
    }

    #[test]
    fn test_unordered_signals_rejected() {
        let bars = make_bars(&[100.0, 101.0, 102.0]);
        let signals = vec![signal(2, Direction::Long), signal(1, Direction::Flat)];
        let err = BacktestEngine::run(&BacktestConfig::default(), &bars, &signals, "test", &ParamSet::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_leverage_param_below_one_rejected() {
        let bars = make_bars(&[100.0, 101.0, 102.0]);
        let params = ParamSet::new().with(LEVERAGE, 0.5);
        let err = BacktestEngine::run(&BacktestConfig::default(), &bars, &[], "test", &params).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_regime_attribution_sums_to_total_pnl() {
        let config = frictionless();
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.3).sin() * 10.0).collect();
        let bars = make_bars(&prices);
        let signals = vec![signal(3, Direction::Long), signal(20, Direction::Short), signal(35, Direction::Flat)];
        let result = run(&config, &bars, &signals, &ParamSet::new());
        let attributed: f64 = result.regime_metrics.values().map(|s| s.pnl).sum();
        assert!((attributed - (result.final_equity - config.initial_capital)).abs() < 1e-6);
        let bars_counted: usize = result.regime_metrics.values().map(|s| s.bars).sum();
        assert_eq!(bars_counted, bars.len());
    }

    #[test]
    fn test_deterministic() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64).cos() * 5.0).collect();
        let bars = make_bars(&prices);
        let signals = vec![signal(2, Direction::Long), signal(10, Direction::Short), signal(20, Direction::Flat)];
        let a = run(&BacktestConfig::default(), &bars, &signals, &ParamSet::new());
        let b = run(&BacktestConfig::default(), &bars, &signals, &ParamSet::new());
        assert_eq!(a.trades, b.trades);
        assert_eq!(a.equity_curve, b.equity_curve);
    }
}
