//! Window worker core: turns a per-symbol trade stream into closed 1m bars,
//! rolls them into 5m/15m, and maintains the 3-second notional-flow window.
//!
//! Everything here is synchronous and owned by exactly one task; the runtime
//! layer feeds decoded trades in and writes the resulting bars/state back to
//! the bus.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use core_types::{fmt_f64, push_field, SealedBar, Side, Timeframe, TradeEvent};
use infra_clock::{bucket_close, rollup_close, MINUTE_MS};
use market_stats::{push_capped, true_range, Ewma};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// Quote notional per contract unit; OKX linear swaps trade in contracts.
    pub contract_multiplier: f64,
    pub flow_window_ms: i64,
    pub price_ring: usize,
    /// EWMA half-life knob for the per-trade absolute-delta scale anchor.
    pub ewma_alpha: f64,
    /// 1m ATR smoothing, Wilder-style.
    pub atr_alpha: f64,
    pub state_ttl_s: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            contract_multiplier: 1.0,
            flow_window_ms: 3_000,
            price_ring: 50,
            ewma_alpha: 0.01,
            atr_alpha: 1.0 / 14.0,
            state_ttl_s: 600,
        }
    }
}

/// One in-flight minute bucket. `close_ts - start_ts` is always one minute.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteWindow {
    pub start_ts: i64,
    pub close_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub vol: f64,
    pub vbuy: f64,
    pub vsell: f64,
    pub vwap_num: f64,
    pub vwap_den: f64,
    pub tick_n: u64,
}

impl MinuteWindow {
    fn new(close_ts: i64, px: f64) -> Self {
        Self {
            start_ts: close_ts - MINUTE_MS,
            close_ts,
            open: px,
            high: px,
            low: px,
            last: px,
            vol: 0.0,
            vbuy: 0.0,
            vsell: 0.0,
            vwap_num: 0.0,
            vwap_den: 0.0,
            tick_n: 0,
        }
    }

    fn apply(&mut self, trade: &TradeEvent) {
        self.last = trade.px;
        self.high = self.high.max(trade.px);
        self.low = self.low.min(trade.px);
        if trade.qty.is_finite() {
            self.vol += trade.qty;
            match trade.side {
                Side::Buy => self.vbuy += trade.qty,
                Side::Sell => self.vsell += trade.qty,
            }
            self.vwap_num += trade.px * trade.qty;
            self.vwap_den += trade.qty;
        }
        self.tick_n += 1;
    }

    pub fn vwap(&self) -> f64 {
        if self.vwap_den > 0.0 {
            self.vwap_num / self.vwap_den
        } else {
            self.last
        }
    }

    fn seal(&self, gap: bool) -> SealedBar {
        SealedBar {
            close_ts: self.close_ts,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.last,
            vol: self.vol,
            vbuy: self.vbuy,
            vsell: self.vsell,
            vwap: self.vwap(),
            tick_n: self.tick_n,
            gap,
        }
    }

    /// Fields for the in-progress `win:state:1m:{sym}` hash.
    pub fn state_fields(&self, updated_ts: i64) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(13);
        push_field(&mut out, "startTs", self.start_ts.to_string());
        push_field(&mut out, "closeTs", self.close_ts.to_string());
        push_field(&mut out, "open", fmt_f64(self.open));
        push_field(&mut out, "high", fmt_f64(self.high));
        push_field(&mut out, "low", fmt_f64(self.low));
        push_field(&mut out, "last", fmt_f64(self.last));
        push_field(&mut out, "vol", fmt_f64(self.vol));
        push_field(&mut out, "vbuy", fmt_f64(self.vbuy));
        push_field(&mut out, "vsell", fmt_f64(self.vsell));
        push_field(&mut out, "vwapNum", fmt_f64(self.vwap_num));
        push_field(&mut out, "vwapDen", fmt_f64(self.vwap_den));
        push_field(&mut out, "tickN", self.tick_n.to_string());
        push_field(&mut out, "updatedTs", updated_ts.to_string());
        out
    }
}

/// 3-second notional sliding window with running buy/sell sums.
#[derive(Debug, Default, Clone)]
pub struct FlowWindow {
    buf: VecDeque<FlowEntry>,
    buy: f64,
    sell: f64,
    max_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FlowEntry {
    ts: i64,
    buy: f64,
    sell: f64,
}

impl FlowWindow {
    /// Returns `false` when the trade is older than the window and was
    /// dropped under the strict late-arrival policy.
    pub fn push(&mut self, ts: i64, buy: f64, sell: f64, window_ms: i64) -> bool {
        if self.max_ts > 0 && ts < self.max_ts - window_ms {
            return false;
        }
        self.max_ts = self.max_ts.max(ts);
        self.buf.push_back(FlowEntry { ts, buy, sell });
        self.buy += buy;
        self.sell += sell;
        while let Some(head) = self.buf.front() {
            if head.ts < self.max_ts - window_ms {
                self.buy -= head.buy;
                self.sell -= head.sell;
                self.buf.pop_front();
            } else {
                break;
            }
        }
        true
    }

    pub fn buy_notional(&self) -> f64 {
        self.buy.max(0.0)
    }

    pub fn sell_notional(&self) -> f64 {
        self.sell.max(0.0)
    }

    pub fn max_ts(&self) -> i64 {
        self.max_ts
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[cfg(test)]
    fn span_ms(&self) -> i64 {
        match (self.buf.front(), self.buf.back()) {
            (Some(a), Some(b)) => b.ts - a.ts,
            _ => 0,
        }
    }

    #[cfg(test)]
    fn recomputed_buy(&self) -> f64 {
        self.buf.iter().map(|e| e.buy).sum()
    }
}

/// Higher-timeframe accumulator fed by sealed 1m bars.
#[derive(Debug, Clone, PartialEq)]
pub struct TfAccumulator {
    pub close_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub vol: f64,
    pub vbuy: f64,
    pub vsell: f64,
    pub vwap_num: f64,
    pub vwap_den: f64,
    pub tick_n: u64,
}

impl TfAccumulator {
    fn new(close_ts: i64, seed_open: f64) -> Self {
        Self {
            close_ts,
            open: seed_open,
            high: seed_open,
            low: seed_open,
            last: seed_open,
            vol: 0.0,
            vbuy: 0.0,
            vsell: 0.0,
            vwap_num: 0.0,
            vwap_den: 0.0,
            tick_n: 0,
        }
    }

    fn absorb(&mut self, m1: &MinuteWindow) {
        self.last = m1.last;
        self.high = self.high.max(m1.high);
        self.low = self.low.min(m1.low);
        self.vol += m1.vol;
        self.vbuy += m1.vbuy;
        self.vsell += m1.vsell;
        self.vwap_num += m1.vwap_num;
        self.vwap_den += m1.vwap_den;
        self.tick_n += m1.tick_n;
    }

    fn seal(&self, gap: bool) -> SealedBar {
        let vwap = if self.vwap_den > 0.0 {
            self.vwap_num / self.vwap_den
        } else {
            self.last
        };
        SealedBar {
            close_ts: self.close_ts,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.last,
            vol: self.vol,
            vbuy: self.vbuy,
            vsell: self.vsell,
            vwap,
            tick_n: self.tick_n,
            gap,
        }
    }

    pub fn state_fields(&self, updated_ts: i64) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(12);
        push_field(&mut out, "closeTs", self.close_ts.to_string());
        push_field(&mut out, "open", fmt_f64(self.open));
        push_field(&mut out, "high", fmt_f64(self.high));
        push_field(&mut out, "low", fmt_f64(self.low));
        push_field(&mut out, "last", fmt_f64(self.last));
        push_field(&mut out, "vol", fmt_f64(self.vol));
        push_field(&mut out, "vbuy", fmt_f64(self.vbuy));
        push_field(&mut out, "vsell", fmt_f64(self.vsell));
        push_field(&mut out, "vwapNum", fmt_f64(self.vwap_num));
        push_field(&mut out, "vwapDen", fmt_f64(self.vwap_den));
        push_field(&mut out, "tickN", self.tick_n.to_string());
        push_field(&mut out, "updatedTs", updated_ts.to_string());
        out
    }
}

#[derive(Debug, Default, Clone)]
struct TfState {
    acc: Option<TfAccumulator>,
    prev_sealed_close: Option<i64>,
}

#[derive(Debug)]
pub struct SymbolState {
    m1: Option<MinuteWindow>,
    prev_sealed_close: Option<i64>,
    prev_close_px: Option<f64>,
    flow: FlowWindow,
    prices: Vec<f64>,
    dyn_abs_delta: Ewma,
    atr: Ewma,
    tf: HashMap<Timeframe, TfState>,
}

impl SymbolState {
    fn new(cfg: &WindowConfig) -> Self {
        Self {
            m1: None,
            prev_sealed_close: None,
            prev_close_px: None,
            flow: FlowWindow::default(),
            prices: Vec::with_capacity(cfg.price_ring),
            dyn_abs_delta: Ewma::new(cfg.ewma_alpha),
            atr: Ewma::new(cfg.atr_alpha),
            tf: Timeframe::ROLLUPS
                .iter()
                .map(|tf| (*tf, TfState::default()))
                .collect(),
        }
    }

    pub fn minute(&self) -> Option<&MinuteWindow> {
        self.m1.as_ref()
    }

    pub fn tf_accumulator(&self, tf: Timeframe) -> Option<&TfAccumulator> {
        self.tf.get(&tf).and_then(|s| s.acc.as_ref())
    }

    pub fn flow(&self) -> &FlowWindow {
        &self.flow
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    pub fn dyn_abs_delta(&self) -> f64 {
        self.dyn_abs_delta.get()
    }

    /// Smoothed 1m ATR; NaN until the first bar seals.
    pub fn atr(&self) -> f64 {
        if self.atr.is_warm() {
            self.atr.get()
        } else {
            f64::NAN
        }
    }
}

/// Everything the runtime needs to act on after one trade.
#[derive(Debug, Default)]
pub struct TradeOutcome {
    /// Bars sealed by this trade, 1m first, then any rolled-up TFs.
    pub sealed: Vec<(Timeframe, SealedBar)>,
    /// Trade was older than the flow window and skipped there.
    pub late_flow_drop: bool,
    /// Bucket extremes as they stood before this trade widened them. A
    /// breakout test against the post-trade bar would compare the bar's
    /// maximum with itself, so detectors get the prior range.
    pub pre_high: f64,
    pub pre_low: f64,
}

/// Per-process book of all symbol windows; strictly single-owner.
#[derive(Debug)]
pub struct WindowBook {
    cfg: WindowConfig,
    symbols: HashMap<SmolStr, SymbolState>,
}

impl WindowBook {
    pub fn new(cfg: WindowConfig) -> Self {
        Self {
            cfg,
            symbols: HashMap::new(),
        }
    }

    pub fn cfg(&self) -> &WindowConfig {
        &self.cfg
    }

    pub fn state(&self, sym: &str) -> Option<&SymbolState> {
        self.symbols.get(sym)
    }

    pub fn on_trade(&mut self, sym: &str, trade: &TradeEvent) -> TradeOutcome {
        let cfg = self.cfg.clone();
        let state = self
            .symbols
            .entry(SmolStr::new(sym))
            .or_insert_with(|| SymbolState::new(&cfg));
        let mut outcome = TradeOutcome::default();

        let close_ts = bucket_close(trade.ts, MINUTE_MS);
        let needs_seal = state
            .m1
            .as_ref()
            .map(|w| w.close_ts != close_ts)
            .unwrap_or(false);
        if needs_seal {
            if let Some(old) = state.m1.take() {
                seal_minute(state, &old, &mut outcome);
            }
        }
        let win = state
            .m1
            .get_or_insert_with(|| MinuteWindow::new(close_ts, trade.px));
        outcome.pre_high = win.high;
        outcome.pre_low = win.low;
        win.apply(trade);

        let notional = trade.qty * trade.px * cfg.contract_multiplier;
        let (buy, sell) = match trade.side {
            Side::Buy => (notional, 0.0),
            Side::Sell => (0.0, notional),
        };
        if !state.flow.push(trade.ts, buy, sell, cfg.flow_window_ms) {
            outcome.late_flow_drop = true;
        }

        push_capped(&mut state.prices, trade.px, cfg.price_ring);
        state.dyn_abs_delta.update((buy - sell).abs());

        outcome
    }
}

fn seal_minute(state: &mut SymbolState, old: &MinuteWindow, outcome: &mut TradeOutcome) {
    let gap = state
        .prev_sealed_close
        .map(|prev| old.close_ts - prev > MINUTE_MS)
        .unwrap_or(false);
    let bar = old.seal(gap);

    state
        .atr
        .update(true_range(bar.high, bar.low, state.prev_close_px));
    state.prev_close_px = Some(bar.close);
    state.prev_sealed_close = Some(bar.close_ts);
    outcome.sealed.push((Timeframe::M1, bar));

    for tf in Timeframe::ROLLUPS {
        let span = tf.span_ms();
        let tf_close = rollup_close(old.close_ts, span);
        let Some(slot) = state.tf.get_mut(&tf) else {
            continue;
        };
        if let Some(acc) = &slot.acc {
            if acc.close_ts != tf_close {
                let gap = slot
                    .prev_sealed_close
                    .map(|prev| acc.close_ts - prev > span)
                    .unwrap_or(false);
                let sealed = acc.seal(gap);
                slot.prev_sealed_close = Some(sealed.close_ts);
                outcome.sealed.push((tf, sealed));
                slot.acc = None;
            }
        }
        let acc = slot
            .acc
            .get_or_insert_with(|| TfAccumulator::new(tf_close, old.open));
        acc.absorb(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, px: f64, qty: f64, side: Side) -> TradeEvent {
        TradeEvent {
            ts,
            px,
            qty,
            side,
            trade_id: None,
            taker: None,
            recv_ts: None,
            ingest_id: None,
        }
    }

    const SYM: &str = "BTC-USDT-SWAP";

    #[test]
    fn seals_bar_with_vwap_on_minute_boundary() {
        let mut book = WindowBook::new(WindowConfig::default());
        assert!(book.on_trade(SYM, &trade(59_500, 100.0, 1.0, Side::Buy)).sealed.is_empty());
        assert!(book.on_trade(SYM, &trade(59_800, 105.0, 2.0, Side::Sell)).sealed.is_empty());

        let outcome = book.on_trade(SYM, &trade(60_500, 107.0, 1.0, Side::Buy));
        assert_eq!(outcome.sealed.len(), 1);
        let (tf, bar) = &outcome.sealed[0];
        assert_eq!(*tf, Timeframe::M1);
        assert_eq!(bar.close_ts, 60_000);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 100.0);
        assert_eq!(bar.close, 105.0);
        assert_eq!(bar.vol, 3.0);
        assert_eq!(bar.vbuy, 1.0);
        assert_eq!(bar.vsell, 2.0);
        assert!((bar.vwap - 103.333333).abs() < 1e-5);
        assert_eq!(bar.tick_n, 2);
        assert!(!bar.gap);

        let m1 = book.state(SYM).unwrap().minute().unwrap();
        assert_eq!(m1.open, 107.0);
        assert_eq!(m1.high, 107.0);
        assert_eq!(m1.low, 107.0);
        assert_eq!(m1.last, 107.0);
        assert_eq!(m1.tick_n, 1);
    }

    #[test]
    fn bar_closedness_invariant() {
        let mut book = WindowBook::new(WindowConfig::default());
        for (ts, px) in [(1_000, 101.0), (20_000, 99.5), (40_000, 103.0), (59_000, 102.0)] {
            book.on_trade(SYM, &trade(ts, px, 1.0, Side::Buy));
        }
        let outcome = book.on_trade(SYM, &trade(61_000, 100.0, 1.0, Side::Sell));
        let (_, bar) = &outcome.sealed[0];
        assert!(bar.high >= bar.open && bar.high >= bar.close);
        assert!(bar.low <= bar.open && bar.low <= bar.close);
        assert_eq!(bar.vol, bar.vbuy + bar.vsell);
    }

    #[test]
    fn vwap_falls_back_to_last_on_zero_volume() {
        let mut book = WindowBook::new(WindowConfig::default());
        book.on_trade(SYM, &trade(1_000, 100.0, 0.0, Side::Buy));
        let outcome = book.on_trade(SYM, &trade(61_000, 101.0, 1.0, Side::Buy));
        let (_, bar) = &outcome.sealed[0];
        assert_eq!(bar.vwap, bar.close);
        assert_eq!(bar.tick_n, 1);
    }

    #[test]
    fn gap_flag_set_after_quiet_minutes() {
        let mut book = WindowBook::new(WindowConfig::default());
        book.on_trade(SYM, &trade(30_000, 100.0, 1.0, Side::Buy));
        let first = book.on_trade(SYM, &trade(61_000, 100.0, 1.0, Side::Buy));
        assert!(!first.sealed[0].1.gap);

        // Skip minutes 2..5 entirely; the next seal closes at 360k vs 120k.
        let second = book.on_trade(SYM, &trade(301_000, 100.0, 1.0, Side::Buy));
        assert!(!second.sealed[0].1.gap); // close 120_000, prev 60_000
        let third = book.on_trade(SYM, &trade(400_000, 100.0, 1.0, Side::Buy));
        let (_, bar) = &third.sealed[0];
        assert_eq!(bar.close_ts, 360_000);
        assert!(bar.gap);
    }

    #[test]
    fn rollup_conserves_volume_and_extremes() {
        let mut book = WindowBook::new(WindowConfig::default());
        // Five 1m bars inside one 5m bucket.
        let mut highs = Vec::new();
        let mut lows = Vec::new();
        let mut vol = 0.0;
        for minute in 0..5 {
            let base = minute as i64 * 60_000;
            let px = 100.0 + minute as f64;
            book.on_trade(SYM, &trade(base + 1_000, px, 1.0, Side::Buy));
            book.on_trade(SYM, &trade(base + 30_000, px + 0.5, 2.0, Side::Sell));
            highs.push(px + 0.5);
            lows.push(px);
            vol += 3.0;
        }
        // Seals the 5th 1m bar into the 5m accumulator...
        let outcome = book.on_trade(SYM, &trade(301_000, 110.0, 1.0, Side::Buy));
        assert!(outcome.sealed.iter().all(|(tf, _)| *tf != Timeframe::M5));
        // ...and the next 1m seal lands in the following 5m bucket.
        let outcome = book.on_trade(SYM, &trade(361_000, 111.0, 1.0, Side::Buy));
        let m5: Vec<_> = outcome
            .sealed
            .iter()
            .filter(|(tf, _)| *tf == Timeframe::M5)
            .collect();
        assert_eq!(m5.len(), 1);
        let bar = &m5[0].1;
        assert_eq!(bar.close_ts, 300_000);
        assert_eq!(bar.vol, vol);
        assert_eq!(bar.high, highs.iter().copied().fold(f64::MIN, f64::max));
        assert_eq!(bar.low, lows.iter().copied().fold(f64::MAX, f64::min));
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.close, 104.5);
        assert_eq!(bar.tick_n, 10);
    }

    #[test]
    fn flow_window_evicts_and_conserves_sums() {
        let mut flow = FlowWindow::default();
        assert!(flow.push(1_000, 100.0, 0.0, 3_000));
        assert!(flow.push(2_000, 0.0, 50.0, 3_000));
        assert!(flow.push(4_500, 200.0, 0.0, 3_000));
        // Entry at 1_000 fell out of [1_500, 4_500].
        assert_eq!(flow.len(), 2);
        assert_eq!(flow.buy_notional(), 200.0);
        assert_eq!(flow.sell_notional(), 50.0);
        assert!(flow.span_ms() <= 3_000);
        assert_eq!(flow.recomputed_buy(), flow.buy_notional());
    }

    #[test]
    fn flow_window_drops_late_trades() {
        let mut flow = FlowWindow::default();
        assert!(flow.push(10_000, 100.0, 0.0, 3_000));
        assert!(!flow.push(6_000, 999.0, 0.0, 3_000));
        assert_eq!(flow.buy_notional(), 100.0);
        assert_eq!(flow.max_ts(), 10_000);
    }

    #[test]
    fn late_trade_marks_outcome() {
        let mut book = WindowBook::new(WindowConfig::default());
        book.on_trade(SYM, &trade(10_000, 100.0, 1.0, Side::Buy));
        let outcome = book.on_trade(SYM, &trade(5_000, 100.0, 1.0, Side::Buy));
        assert!(outcome.late_flow_drop);
    }

    #[test]
    fn ewma_and_atr_warmup() {
        let mut book = WindowBook::new(WindowConfig::default());
        book.on_trade(SYM, &trade(1_000, 100.0, 2.0, Side::Buy));
        let st = book.state(SYM).unwrap();
        assert_eq!(st.dyn_abs_delta(), 200.0);
        assert!(st.atr().is_nan());

        book.on_trade(SYM, &trade(61_000, 101.0, 1.0, Side::Buy));
        let st = book.state(SYM).unwrap();
        assert!(!st.atr().is_nan());
    }

    #[test]
    fn price_ring_is_bounded() {
        let mut book = WindowBook::new(WindowConfig::default());
        for i in 0..60 {
            book.on_trade(SYM, &trade(1_000 + i, 100.0 + i as f64, 1.0, Side::Buy));
        }
        let st = book.state(SYM).unwrap();
        assert_eq!(st.prices().len(), 50);
        assert_eq!(*st.prices().last().unwrap(), 159.0);
    }

    #[test]
    fn symbols_do_not_alias_state() {
        let mut book = WindowBook::new(WindowConfig::default());
        book.on_trade("BTC-USDT-SWAP", &trade(1_000, 50_000.0, 1.0, Side::Buy));
        book.on_trade("ETH-USDT-SWAP", &trade(1_000, 3_000.0, 2.0, Side::Sell));

        let btc = book.state("BTC-USDT-SWAP").unwrap();
        let eth = book.state("ETH-USDT-SWAP").unwrap();
        assert_eq!(btc.minute().unwrap().last, 50_000.0);
        assert_eq!(eth.minute().unwrap().last, 3_000.0);
        assert_eq!(btc.flow().buy_notional(), 50_000.0);
        assert_eq!(btc.flow().sell_notional(), 0.0);
        assert_eq!(eth.flow().sell_notional(), 6_000.0);
    }

    #[test]
    fn monotonic_seal_times() {
        let mut book = WindowBook::new(WindowConfig::default());
        let mut closes = Vec::new();
        for minute in 0..4 {
            let outcome = book.on_trade(
                SYM,
                &trade(minute * 60_000 + 1_000, 100.0, 1.0, Side::Buy),
            );
            for (tf, bar) in outcome.sealed {
                if tf == Timeframe::M1 {
                    closes.push(bar.close_ts);
                }
            }
        }
        let mut sorted = closes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(closes, sorted);
    }
}
