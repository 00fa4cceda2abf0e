//! Execution cost model: fees, slippage and funding
//!
//! Slippage formula:
//!   slippage_bps = fixed_bps + volume_factor × size_ratio + volatility_factor × realized_vol
//!                  [+ stop_extra_bps when the fill is stop-triggered]
//! Where size_ratio = order quantity / bar volume.
//! Buys fill above the reference price, sells below it.

use crate::types::{Bar, FeeSchedule, OrderStyle, Side, SlippageModel, FUNDING_INTERVAL_MS};

const BPS: f64 = 10_000.0;

/// Which way an order moves the position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    /// Action that opens a position on `side`
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => OrderAction::Buy,
            Side::Short => OrderAction::Sell,
        }
    }

    /// Action that closes a position on `side`
    pub fn closing(side: Side) -> Self {
        match side {
            Side::Long => OrderAction::Sell,
            Side::Short => OrderAction::Buy,
        }
    }
}

/// A simulated fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub slippage_bps: f64,
    /// Cost of slippage in quote currency (always >= 0)
    pub slippage_cost: f64,
    pub fee: f64,
}

/// Slippage in basis points for an order of `quantity` against `bar`.
///
/// Non-decreasing in `quantity` and in `bar.volatility`.
pub fn slippage_bps(model: &SlippageModel, quantity: f64, bar: &Bar, stop_triggered: bool) -> f64 {
    let size_ratio = if bar.volume > 0.0 {
        quantity.abs() / bar.volume
    } else {
        0.0
    };
    let mut bps = model.fixed_bps
        + model.volume_factor * size_ratio
        + model.volatility_factor * bar.volatility.max(0.0);
    if stop_triggered {
        bps += model.stop_extra_bps;
    }
    bps
}

/// Fee rate for an order of the given style
pub fn fee_rate(fees: &FeeSchedule, style: OrderStyle) -> f64 {
    match style {
        OrderStyle::Maker => fees.maker,
        OrderStyle::Taker => fees.taker,
    }
}

/// Fee schedule and slippage coefficients bundled for fill simulation
#[derive(Debug, Clone, Copy)]
pub struct CostModel<'a> {
    pub fees: &'a FeeSchedule,
    pub slippage: &'a SlippageModel,
}

impl<'a> CostModel<'a> {
    pub fn new(fees: &'a FeeSchedule, slippage: &'a SlippageModel) -> Self {
        Self { fees, slippage }
    }

    /// Simulate filling `quantity` at `reference` price
    pub fn fill(
        &self,
        reference: f64,
        quantity: f64,
        action: OrderAction,
        bar: &Bar,
        style: OrderStyle,
        stop_triggered: bool,
    ) -> Fill {
        let bps = slippage_bps(self.slippage, quantity, bar, stop_triggered);
        let shift = reference * bps / BPS;
        let price = match action {
            OrderAction::Buy => reference + shift,
            OrderAction::Sell => (reference - shift).max(0.0),
        };
        Fill {
            price,
            slippage_bps: bps,
            slippage_cost: (price - reference).abs() * quantity,
            fee: price * quantity * fee_rate(self.fees, style),
        }
    }
}

/// Number of 8-hour funding boundaries crossed in (from, to]
pub fn funding_boundaries_crossed(from: i64, to: i64) -> i64 {
    if to <= from {
        return 0;
    }
    to.div_euclid(FUNDING_INTERVAL_MS) - from.div_euclid(FUNDING_INTERVAL_MS)
}

/// Funding charged on `notional` for `boundaries` crossed intervals
pub fn funding_fee(fees: &FeeSchedule, notional: f64, boundaries: i64) -> f64 {
    if boundaries <= 0 {
        return 0.0;
    }
    notional.abs() * fees.funding_per_8h * boundaries as f64
}
