//! Built-in strategy factories
//!
//! Signal production belongs to the caller; these factories exist so the
//! optimizer, walk-forward analyzer and sensitivity runs have something to
//! re-parameterize. Each factory builds a fresh bar-by-bar `SignalGenerator`
//! from a [`ParamSet`] and emits a [`Signal`] whenever the desired direction
//! changes.

use std::ops::Range;

use ta::indicators::{BollingerBands, ExponentialMovingAverage, RelativeStrengthIndex};
use ta::Next;

use crate::error::{EngineError, Result};
use crate::params::{ParamDomain, ParamSet, ParamSpace};
use crate::types::{Bar, Direction, Signal};

// ============================================================================
// Core traits
// ============================================================================

/// Builds signals for a bar series from a parameter set
pub trait StrategyFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Search space the optimizer uses when the caller supplies none
    fn default_space(&self) -> ParamSpace;

    /// Signals for `bars`, time-aligned to bar timestamps
    fn signals(&self, bars: &[Bar], params: &ParamSet) -> Result<Vec<Signal>>;
}

/// Stateful bar-by-bar direction source
trait SignalGenerator {
    fn on_bar(&mut self, bar: &Bar) -> Option<Direction>;
}

/// Run a generator over `bars`, emitting only direction changes
fn replay(generator: &mut dyn SignalGenerator, bars: &[Bar]) -> Vec<Signal> {
    let mut last: Option<Direction> = None;
    let mut out = Vec::new();
    for bar in bars {
        if let Some(dir) = generator.on_bar(bar) {
            if last != Some(dir) {
                out.push(Signal::new(bar.timestamp, "", dir));
                last = Some(dir);
            }
        }
    }
    out
}

fn required_usize(params: &ParamSet, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(_) => params
            .get_usize(key)
            .filter(|v| *v > 0)
            .ok_or_else(|| EngineError::Config(format!("{key} must be a positive integer"))),
    }
}

fn indicator_error(name: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Config(format!("invalid {name} parameters: {e}"))
}

// ============================================================================
// EMA crossover
// ============================================================================

struct EmaCrossoverGenerator {
    fast: ExponentialMovingAverage,
    slow: ExponentialMovingAverage,
    slow_period: usize,
    prev: Option<(f64, f64)>,
    bars_seen: usize,
}

impl SignalGenerator for EmaCrossoverGenerator {
    fn on_bar(&mut self, bar: &Bar) -> Option<Direction> {
        let fast = self.fast.next(bar.close);
        let slow = self.slow.next(bar.close);
        self.bars_seen += 1;
        let prev = self.prev.replace((fast, slow));
        if self.bars_seen <= self.slow_period {
            return None;
        }
        let (prev_fast, prev_slow) = prev?;
        if prev_fast <= prev_slow && fast > slow {
            Some(Direction::Long)
        } else if prev_fast >= prev_slow && fast < slow {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

/// Long on a golden cross, short on a death cross
pub struct EmaCrossover;

impl StrategyFactory for EmaCrossover {
    fn name(&self) -> &str {
        "ema_crossover"
    }

    fn default_space(&self) -> ParamSpace {
        ParamSpace::new()
            .int("fast_period", 5, 15, 5)
            .int("slow_period", 20, 50, 10)
    }

    fn signals(&self, bars: &[Bar], params: &ParamSet) -> Result<Vec<Signal>> {
        let fast_period = required_usize(params, "fast_period", 12)?;
        let slow_period = required_usize(params, "slow_period", 26)?;
        if fast_period >= slow_period {
            return Err(EngineError::Config(format!(
                "fast_period {fast_period} must be below slow_period {slow_period}"
            )));
        }
        let mut generator = EmaCrossoverGenerator {
            fast: ExponentialMovingAverage::new(fast_period).map_err(|e| indicator_error("EMA", e))?,
            slow: ExponentialMovingAverage::new(slow_period).map_err(|e| indicator_error("EMA", e))?,
            slow_period,
            prev: None,
            bars_seen: 0,
        };
        Ok(replay(&mut generator, bars))
    }
}

// ============================================================================
// RSI reversion
// ============================================================================

struct RsiGenerator {
    rsi: RelativeStrengthIndex,
    period: usize,
    overbought: f64,
    oversold: f64,
    bars_seen: usize,
}

impl SignalGenerator for RsiGenerator {
    fn on_bar(&mut self, bar: &Bar) -> Option<Direction> {
        let value = self.rsi.next(bar.close);
        self.bars_seen += 1;
        if self.bars_seen <= self.period {
            return None;
        }
        if value < self.oversold {
            Some(Direction::Long)
        } else if value > self.overbought {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

/// Long when oversold, short when overbought
pub struct RsiReversion;

impl StrategyFactory for RsiReversion {
    fn name(&self) -> &str {
        "rsi_reversion"
    }

    fn default_space(&self) -> ParamSpace {
        ParamSpace::new()
            .int("period", 7, 21, 7)
            .float("oversold", 20.0, 35.0, Some(5.0))
            .float("overbought", 65.0, 80.0, Some(5.0))
    }

    fn signals(&self, bars: &[Bar], params: &ParamSet) -> Result<Vec<Signal>> {
        let period = required_usize(params, "period", 14)?;
        let oversold = params.get_f64("oversold").unwrap_or(30.0);
        let overbought = params.get_f64("overbought").unwrap_or(70.0);
        if !(0.0..=100.0).contains(&oversold) || !(0.0..=100.0).contains(&overbought) || oversold >= overbought {
            return Err(EngineError::Config(format!(
                "RSI thresholds must satisfy 0 <= oversold ({oversold}) < overbought ({overbought}) <= 100"
            )));
        }
        let mut generator = RsiGenerator {
            rsi: RelativeStrengthIndex::new(period).map_err(|e| indicator_error("RSI", e))?,
            period,
            overbought,
            oversold,
            bars_seen: 0,
        };
        Ok(replay(&mut generator, bars))
    }
}

// ============================================================================
// Bollinger reversion
// ============================================================================

struct BollingerGenerator {
    bb: BollingerBands,
    period: usize,
    bars_seen: usize,
    side: Option<Direction>,
}

impl SignalGenerator for BollingerGenerator {
    fn on_bar(&mut self, bar: &Bar) -> Option<Direction> {
        let bands = self.bb.next(bar.close);
        self.bars_seen += 1;
        if self.bars_seen < self.period || bands.upper - bands.lower <= 0.0 {
            return None;
        }
        let close = bar.close;
        let next = if close < bands.lower {
            Some(Direction::Long)
        } else if close > bands.upper {
            Some(Direction::Short)
        } else {
            // Exit once price is back through the middle band
            match self.side {
                Some(Direction::Long) if close >= bands.average => Some(Direction::Flat),
                Some(Direction::Short) if close <= bands.average => Some(Direction::Flat),
                _ => None,
            }
        };
        if next.is_some() {
            self.side = next;
        }
        next
    }
}

/// Fade moves outside the bands, flatten at the middle band
pub struct BollingerReversion;

impl StrategyFactory for BollingerReversion {
    fn name(&self) -> &str {
        "bollinger_reversion"
    }

    fn default_space(&self) -> ParamSpace {
        ParamSpace::new()
            .int("period", 10, 30, 5)
            .float("multiplier", 1.5, 3.0, Some(0.5))
    }

    fn signals(&self, bars: &[Bar], params: &ParamSet) -> Result<Vec<Signal>> {
        let period = required_usize(params, "period", 20)?;
        let multiplier = params.get_f64("multiplier").unwrap_or(2.0);
        let mut generator = BollingerGenerator {
            bb: BollingerBands::new(period, multiplier).map_err(|e| indicator_error("Bollinger", e))?,
            period,
            bars_seen: 0,
            side: None,
        };
        Ok(replay(&mut generator, bars))
    }
}

// ============================================================================
// Pre-computed signals
// ============================================================================

/// Replays an externally produced signal stream, restricted to the bars given.
///
/// Has no signal parameters of its own; its default space covers the engine's
/// sizing keys so sensitivity and walk-forward runs still have something to tune.
pub struct StaticSignals {
    signals: Vec<Signal>,
}

impl StaticSignals {
    pub fn new(signals: Vec<Signal>) -> Self {
        Self { signals }
    }
}

impl StrategyFactory for StaticSignals {
    fn name(&self) -> &str {
        "signals"
    }

    fn default_space(&self) -> ParamSpace {
        ParamSpace::new().with(
            crate::engine::POSITION_PCT,
            ParamDomain::Float {
                min: 0.05,
                max: 0.25,
                step: Some(0.05),
            },
        )
    }

    fn signals(&self, bars: &[Bar], _params: &ParamSet) -> Result<Vec<Signal>> {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Ok(Vec::new());
        };
        Ok(self
            .signals
            .iter()
            .filter(|s| s.timestamp >= first.timestamp && s.timestamp <= last.timestamp)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Warm-started segments
// ============================================================================

/// Signals for the segment `bars[range]`, with the strategy warmed up on every
/// bar before it.
///
/// The factory sees `bars[..range.end]`. The last signal emitted before the
/// segment is re-stamped onto its first bar, so a direction already held at the
/// boundary is taken when the segment opens; a signal of the segment's own on
/// that bar still wins.
pub fn segment_signals(
    factory: &dyn StrategyFactory,
    bars: &[Bar],
    range: Range<usize>,
    params: &ParamSet,
) -> Result<Vec<Signal>> {
    let end = range.end.min(bars.len());
    let Some(first) = bars.get(range.start).filter(|_| range.start < end) else {
        return Ok(Vec::new());
    };
    let all = factory.signals(&bars[..end], params)?;
    let split = all.partition_point(|s| s.timestamp < first.timestamp);

    let mut out = Vec::with_capacity(all.len() - split + 1);
    if let Some(held) = split.checked_sub(1).map(|i| &all[i]) {
        out.push(Signal {
            timestamp: first.timestamp,
            ..held.clone()
        });
    }
    out.extend_from_slice(&all[split..]);
    Ok(out)
}

// ============================================================================
// Factory
// ============================================================================

/// Names accepted by [`build_strategy`]
pub const STRATEGIES: &[&str] = &["ema_crossover", "rsi_reversion", "bollinger_reversion"];

pub fn build_strategy(name: &str) -> Result<Box<dyn StrategyFactory>> {
    match name {
        "ema_crossover" => Ok(Box::new(EmaCrossover)),
        "rsi_reversion" => Ok(Box::new(RsiReversion)),
        "bollinger_reversion" => Ok(Box::new(BollingerReversion)),
        other => Err(EngineError::Config(format!(
            "unknown strategy '{other}', expected one of {}",
            STRATEGIES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bars(prices: &[f64]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Bar::new(i as i64 * 60_000, p, p + 1.0, p - 1.0, p, 100.0))
            .collect()
    }

    fn v_shape() -> Vec<f64> {
        let mut prices = Vec::new();
        for i in 0..40 {
            prices.push(100.0 - i as f64);
        }
        for i in 0..40 {
            prices.push(60.0 + i as f64 * 2.0);
        }
        prices
    }

    #[test]
    fn test_ema_crossover_goes_long_after_bottom() {
        let bars = make_bars(&v_shape());
        let params = ParamSet::new().with("fast_period", 5i64).with("slow_period", 20i64);
        let signals = EmaCrossover.signals(&bars, &params).unwrap();
        assert!(signals.iter().any(|s| s.direction == Direction::Long && s.timestamp > 40 * 60_000));
    }

    #[test]
    fn test_ema_rejects_inverted_periods() {
        let params = ParamSet::new().with("fast_period", 30i64).with("slow_period", 10i64);
        assert!(EmaCrossover.signals(&make_bars(&v_shape()), &params).is_err());
    }

    #[test]
    fn test_rsi_reversion_signals() {
        let bars = make_bars(&v_shape());
        let signals = RsiReversion.signals(&bars, &ParamSet::new()).unwrap();
        assert!(signals.iter().any(|s| s.direction == Direction::Long));
        assert!(signals.iter().any(|s| s.direction == Direction::Short));
        // Only direction changes are emitted
        assert!(signals.windows(2).all(|w| w[0].direction != w[1].direction));
    }

    #[test]
    fn test_bollinger_flattens_at_middle() {
        let mut prices: Vec<f64> = (0..30).map(|i| 100.0 + (i % 2) as f64).collect();
        prices.push(90.0);
        prices.extend([95.0, 99.0, 101.0, 101.0]);
        let signals = BollingerReversion.signals(&make_bars(&prices), &ParamSet::new()).unwrap();
        let long_at = signals.iter().position(|s| s.direction == Direction::Long).unwrap();
        assert!(signals[long_at + 1..].iter().any(|s| s.direction == Direction::Flat));
    }

    #[test]
    fn test_signals_are_time_ordered_and_aligned() {
        let bars = make_bars(&v_shape());
        for name in STRATEGIES {
            let factory = build_strategy(name).unwrap();
            let signals = factory.signals(&bars, &ParamSet::new()).unwrap();
            assert!(signals.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            assert!(signals
                .iter()
                .all(|s| bars.iter().any(|b| b.timestamp == s.timestamp)));
            assert!(!factory.default_space().is_empty());
        }
    }

    #[test]
    fn test_static_signals_restricted_to_bars() {
        let bars = make_bars(&[100.0, 101.0, 102.0]);
        let factory = StaticSignals::new(vec![
            Signal::new(0, "", Direction::Long),
            Signal::new(120_000, "", Direction::Flat),
            Signal::new(600_000, "", Direction::Long),
        ]);
        let signals = factory.signals(&bars[1..], &ParamSet::new()).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].timestamp, 120_000);
    }

    #[test]
    fn test_segment_signals_are_warm() {
        // Flat, then a steady climb: a 50-bar slow EMA needs history to see it
        let mut prices = vec![100.0; 60];
        prices.extend((1..=60).map(|i| 100.0 + i as f64));
        let bars = make_bars(&prices);
        let params = ParamSet::new().with("fast_period", 12i64).with("slow_period", 50i64);
        let segment = 100..120;

        let cold = EmaCrossover.signals(&bars[segment.clone()], &params).unwrap();
        assert!(cold.is_empty());

        let warm = segment_signals(&EmaCrossover, &bars, segment.clone(), &params).unwrap();
        assert_eq!(warm[0].timestamp, bars[segment.start].timestamp);
        assert_eq!(warm[0].direction, Direction::Long);

        // Every later signal is exactly what a full-history run emits there
        let full = EmaCrossover.signals(&bars, &params).unwrap();
        let in_segment: Vec<&Signal> = full
            .iter()
            .filter(|s| s.timestamp > bars[segment.start].timestamp && s.timestamp <= bars[segment.end - 1].timestamp)
            .collect();
        assert_eq!(warm[1..].iter().collect::<Vec<_>>(), in_segment);
    }

    #[test]
    fn test_segment_signal_on_first_bar_wins() {
        let bars = make_bars(&[100.0, 101.0, 102.0, 103.0]);
        let factory = StaticSignals::new(vec![
            Signal::new(0, "", Direction::Long),
            Signal::new(120_000, "", Direction::Short),
        ]);
        let signals = segment_signals(&factory, &bars, 2..4, &ParamSet::new()).unwrap();
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.timestamp == 120_000));
        assert_eq!(signals.last().map(|s| s.direction), Some(Direction::Short));
        assert!(segment_signals(&factory, &bars, 4..4, &ParamSet::new()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_strategy() {
        assert!(build_strategy("nope").is_err());
    }
}
