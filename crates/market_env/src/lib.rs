//! Market-environment computation: volatility/liquidity percentiles, OI
//! regime with a persistence filter, funding-event proximity and signal-rate
//! anomaly, mapped into the dynamic gate snapshot.
//!
//! All functions are pure over already-fetched series; the runtime owns the
//! 10-second cycle and every bus round-trip.

use serde::{Deserialize, Serialize};

use core_types::{GateSnapshot, KlineFrame, GATE_VERSION};
use market_stats::{clip01, mad, mean, median, percentile_rank, round_dp, true_range};

pub const FUNDING_EVENT_WINDOW_MS: i64 = 10 * 60_000;
const Z_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvConfig {
    pub refresh_ms: u64,
    pub kline_depth: usize,
    pub base_min: f64,
    pub base_notional: f64,
    pub base_cooldown_ms: f64,
    pub base_dedup_ms: i64,
    pub oi_window_min: i64,
    /// Raw OI regime must hold this long before it surfaces.
    pub oi_hold_ms: i64,
    pub oi_pct_threshold: f64,
    pub oi_z_threshold: f64,
    pub rate_recent_ms: i64,
    pub rate_base_ms: i64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            refresh_ms: 10_000,
            kline_depth: 48,
            base_min: 0.65,
            base_notional: 2_000.0,
            base_cooldown_ms: 6_000.0,
            base_dedup_ms: 8_000,
            oi_window_min: 90,
            oi_hold_ms: 10 * 60_000,
            oi_pct_threshold: 0.012,
            oi_z_threshold: 2.0,
            rate_recent_ms: 60_000,
            rate_base_ms: 15 * 60_000,
        }
    }
}

/// Regime inputs for one symbol, one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvInputs {
    pub vol_pct: f64,
    pub liq_pct: f64,
    pub oi_regime: i8,
    pub event_flag: bool,
    pub rate_exc: f64,
}

/// True-range series normalized to basis points of close, oldest first.
pub fn tr_series_bp(klines: &[KlineFrame]) -> Vec<f64> {
    let mut out = Vec::with_capacity(klines.len());
    let mut prev_close: Option<f64> = None;
    for k in klines {
        if k.close > 0.0 {
            let tr = true_range(k.high, k.low, prev_close);
            out.push(tr / k.close * 10_000.0);
        }
        prev_close = Some(k.close);
    }
    out
}

pub fn liquidity_series(klines: &[KlineFrame]) -> Vec<f64> {
    klines.iter().map(KlineFrame::quote_liquidity).collect()
}

/// Percentile rank of the latest value within its own history.
pub fn pct_of_last(series: &[f64]) -> f64 {
    match series.last() {
        Some(last) => percentile_rank(series, *last),
        None => 0.5,
    }
}

/// Last sample per minute bucket, ascending by bucket.
pub fn downsample_last_per_minute(samples: &[(i64, f64)]) -> Vec<(i64, f64)> {
    let mut out: Vec<(i64, f64)> = Vec::new();
    let mut sorted: Vec<(i64, f64)> = samples.to_vec();
    sorted.sort_by_key(|(ts, _)| *ts);
    for (ts, v) in sorted {
        let bucket = ts.div_euclid(60_000) * 60_000;
        match out.last_mut() {
            Some((last_bucket, last_v)) if *last_bucket == bucket => *last_v = v,
            _ => out.push((bucket, v)),
        }
    }
    out
}

/// Raw OI regime from a per-minute series: recent 15m mean vs. the prior
/// 15m, cross-checked by a MAD-scaled z of the latest diff.
pub fn raw_oi_regime(series: &[(i64, f64)], cfg: &EnvConfig) -> i8 {
    let Some((t_end, _)) = series.last() else {
        return 0;
    };
    let split = t_end - 15 * 60_000;
    let floor = t_end - 30 * 60_000;
    let a: Vec<f64> = series
        .iter()
        .filter(|(ts, _)| *ts > split)
        .map(|(_, v)| *v)
        .collect();
    let b: Vec<f64> = series
        .iter()
        .filter(|(ts, _)| *ts > floor && *ts <= split)
        .map(|(_, v)| *v)
        .collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let pct = (mean(&a) - mean(&b)) / median(&values).max(1.0);

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.is_empty() {
        return 0;
    }
    let last_diff = *diffs.last().unwrap_or(&0.0);
    let z_like = last_diff / (1.4826 * mad(&diffs) + Z_EPS);

    if pct >= cfg.oi_pct_threshold && z_like >= cfg.oi_z_threshold {
        1
    } else if pct <= -cfg.oi_pct_threshold && z_like <= -cfg.oi_z_threshold {
        -1
    } else {
        0
    }
}

/// Persistence filter: a nonzero raw regime must keep its sign for the hold
/// window before it surfaces; zero or a sign flip resets the clock.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct OiRegimeTracker {
    pending: i8,
    since: i64,
}

impl OiRegimeTracker {
    pub fn update(&mut self, raw: i8, now: i64, hold_ms: i64) -> i8 {
        if raw == 0 {
            self.pending = 0;
            self.since = 0;
            return 0;
        }
        if raw != self.pending {
            self.pending = raw;
            self.since = now;
            return 0;
        }
        if now - self.since >= hold_ms {
            raw
        } else {
            0
        }
    }
}

/// Detected-signal rate excess: recent per-second rate over the 15m
/// baseline, minus one, floored at zero. A dead baseline with recent
/// activity reads as full excess.
pub fn rate_excess(recent_count: usize, base_count: usize, cfg: &EnvConfig) -> f64 {
    let recent_rate = recent_count as f64 / (cfg.rate_recent_ms as f64 / 1_000.0);
    let base_rate = base_count as f64 / (cfg.rate_base_ms as f64 / 1_000.0);
    if base_rate <= f64::EPSILON {
        if recent_count > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        (recent_rate / base_rate - 1.0).max(0.0)
    }
}

pub fn funding_event_flag(next_funding_time: Option<i64>, now: i64) -> bool {
    match next_funding_time {
        Some(next) => {
            let dt = next - now;
            (0..=FUNDING_EVENT_WINDOW_MS).contains(&dt)
        }
        None => false,
    }
}

/// Gate mapping v1.1.
pub fn map_gates(inputs: &EnvInputs, cfg: &EnvConfig, now: i64) -> GateSnapshot {
    let vol = clip01(inputs.vol_pct);
    let liq = clip01(inputs.liq_pct);
    let rate = inputs.rate_exc.min(1.0).max(0.0);
    let event = if inputs.event_flag { 1.0 } else { 0.0 };
    let oi_active = if inputs.oi_regime != 0 { 1.0 } else { 0.0 };

    let eff_min0 = (cfg.base_min
        + 0.05 * if vol > 0.8 { 1.0 } else { 0.0 }
        + 0.05 * rate
        + 0.08 * event
        + 0.02 * oi_active)
        .clamp(0.60, 0.78);

    let min_notional_3s = (cfg.base_notional * (0.9 + 0.35 * liq))
        .round()
        .max(cfg.base_notional);
    let min_move_bp = (2.0 + 4.0 * vol).round();
    let min_move_atr_ratio = round_dp(0.15 + 0.2 * vol, 3);
    let cooldown_ms = (cfg.base_cooldown_ms * (1.0 + 0.6 * rate + 0.6 * event)).round() as i64;
    let breakout_band_pct = round_dp((0.02 * (1.0 + 0.5 * vol)).min(0.05), 4);

    GateSnapshot {
        eff_min0: round_dp(eff_min0, 4),
        min_notional_3s,
        min_move_bp,
        min_move_atr_ratio,
        cooldown_ms,
        dedup_ms: cfg.base_dedup_ms,
        breakout_band_pct,
        vol_pct: round_dp(vol, 4),
        liq_pct: round_dp(liq, 4),
        rate_exc: round_dp(inputs.rate_exc.max(0.0), 4),
        event_flag: inputs.event_flag,
        oi_regime: inputs.oi_regime.clamp(-1, 1),
        updated_at: now,
        version: GATE_VERSION.to_string(),
    }
}

/// Compose one cycle's inputs, applying the low-vol/low-liquidity override
/// that forces the OI regime flat.
pub fn assemble_inputs(
    vol5_pct: f64,
    vol15_pct: f64,
    liq5_pct: f64,
    liq15_pct: f64,
    surfaced_oi: i8,
    event_flag: bool,
    rate_exc: f64,
) -> EnvInputs {
    let vol_pct = clip01(vol5_pct.max(vol15_pct));
    let liq_pct = clip01(liq5_pct.max(liq15_pct));
    let oi_regime = if vol_pct < 0.4 || liq_pct < 0.4 {
        0
    } else {
        surfaced_oi
    };
    EnvInputs {
        vol_pct,
        liq_pct,
        oi_regime,
        event_flag,
        rate_exc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(ts: i64, high: f64, low: f64, close: f64, vol: f64) -> KlineFrame {
        KlineFrame {
            ts,
            tf: Some("5m".to_string()),
            open: close,
            high,
            low,
            close,
            vol,
            quote_vol: None,
            confirm: true,
        }
    }

    #[test]
    fn tr_series_uses_prev_close() {
        let ks = vec![
            kline(0, 101.0, 99.0, 100.0, 1.0),
            kline(300_000, 100.5, 100.0, 100.2, 1.0),
        ];
        let series = tr_series_bp(&ks);
        assert_eq!(series.len(), 2);
        // First bar: plain range 2.0 on close 100 -> 200bp.
        assert!((series[0] - 200.0).abs() < 1e-9);
        // Second bar: TR = max(0.5, |100.5-100|, |100-100|) = 0.5 -> ~49.9bp.
        assert!((series[1] - 0.5 / 100.2 * 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn pct_of_last_ranks_within_history() {
        let mut series: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        assert_eq!(pct_of_last(&series), 1.0);
        series.push(0.5);
        assert!((pct_of_last(&series) - 1.0 / 11.0).abs() < 1e-9);
        assert_eq!(pct_of_last(&[]), 0.5);
    }

    #[test]
    fn downsample_keeps_last_sample_per_minute() {
        let samples = vec![
            (10_000, 1.0),
            (50_000, 2.0),
            (70_000, 3.0),
            (61_000, 2.5), // out of order, same minute as 70_000
        ];
        let ds = downsample_last_per_minute(&samples);
        assert_eq!(ds, vec![(0, 2.0), (60_000, 3.0)]);
    }

    fn rising_oi_series() -> Vec<(i64, f64)> {
        // 60 per-minute samples: flat then a late ramp.
        (0..60)
            .map(|i| {
                let ts = i * 60_000;
                let v = if i < 45 {
                    1_000.0 + (i % 3) as f64
                } else {
                    1_000.0 + (i - 44) as f64 * 20.0
                };
                (ts, v)
            })
            .collect()
    }

    #[test]
    fn raw_regime_detects_oi_buildup() {
        let cfg = EnvConfig::default();
        assert_eq!(raw_oi_regime(&rising_oi_series(), &cfg), 1);

        let falling: Vec<(i64, f64)> = rising_oi_series()
            .into_iter()
            .map(|(ts, v)| (ts, 3_000.0 - v))
            .collect();
        assert_eq!(raw_oi_regime(&falling, &cfg), -1);

        let flat: Vec<(i64, f64)> = (0..60).map(|i| (i * 60_000, 1_000.0)).collect();
        assert_eq!(raw_oi_regime(&flat, &cfg), 0);
    }

    #[test]
    fn raw_regime_needs_both_windows() {
        let cfg = EnvConfig::default();
        assert_eq!(raw_oi_regime(&[], &cfg), 0);
        // Only 10 minutes of history: no prior window to compare against.
        let short: Vec<(i64, f64)> = (0..10).map(|i| (i * 60_000, 1_000.0 + i as f64)).collect();
        assert_eq!(raw_oi_regime(&short, &cfg), 0);
    }

    #[test]
    fn persistence_filter_delays_and_resets() {
        let mut tr = OiRegimeTracker::default();
        let hold = 10 * 60_000;
        let t0 = 1_700_000_000_000;
        assert_eq!(tr.update(1, t0, hold), 0);
        assert_eq!(tr.update(1, t0 + 5 * 60_000, hold), 0);
        assert_eq!(tr.update(1, t0 + 10 * 60_000, hold), 1);
        // A zero resets everything.
        assert_eq!(tr.update(0, t0 + 11 * 60_000, hold), 0);
        assert_eq!(tr.update(1, t0 + 12 * 60_000, hold), 0);
        // A sign flip restarts the clock and surfaces flat.
        assert_eq!(tr.update(-1, t0 + 13 * 60_000, hold), 0);
        assert_eq!(tr.update(-1, t0 + 23 * 60_000, hold), -1);
    }

    #[test]
    fn rate_excess_handles_dead_baseline() {
        let cfg = EnvConfig::default();
        assert_eq!(rate_excess(0, 0, &cfg), 0.0);
        assert_eq!(rate_excess(3, 0, &cfg), 1.0);
        // recent 6/60s = 0.1/s vs base 45/900s = 0.05/s -> excess 1.0
        assert!((rate_excess(6, 45, &cfg) - 1.0).abs() < 1e-9);
        // recent below baseline floors at zero.
        assert_eq!(rate_excess(1, 60, &cfg), 0.0);
    }

    #[test]
    fn funding_window_is_inclusive_and_forward_only() {
        let now = 1_700_000_000_000;
        assert!(funding_event_flag(Some(now), now));
        assert!(funding_event_flag(Some(now + 10 * 60_000), now));
        assert!(!funding_event_flag(Some(now + 10 * 60_000 + 1), now));
        assert!(!funding_event_flag(Some(now - 1), now));
        assert!(!funding_event_flag(None, now));
    }

    #[test]
    fn gate_mapping_quiet_market() {
        let cfg = EnvConfig::default();
        let inputs = EnvInputs::default();
        let snap = map_gates(&inputs, &cfg, 42);
        assert_eq!(snap.eff_min0, 0.65);
        assert_eq!(snap.min_notional_3s, 2_000.0);
        assert_eq!(snap.min_move_bp, 2.0);
        assert_eq!(snap.min_move_atr_ratio, 0.15);
        assert_eq!(snap.cooldown_ms, 6_000);
        assert_eq!(snap.breakout_band_pct, 0.02);
        assert_eq!(snap.updated_at, 42);
        assert_eq!(snap.version, GATE_VERSION);
    }

    #[test]
    fn gate_mapping_stressed_market() {
        let cfg = EnvConfig::default();
        let inputs = EnvInputs {
            vol_pct: 0.9,
            liq_pct: 1.0,
            oi_regime: 1,
            event_flag: true,
            rate_exc: 2.5,
        };
        let snap = map_gates(&inputs, &cfg, 0);
        // 0.65 + 0.05 + 0.05 + 0.08 + 0.02 = 0.85 -> clamped to 0.78.
        assert_eq!(snap.eff_min0, 0.78);
        assert_eq!(snap.min_notional_3s, 2_500.0);
        assert_eq!(snap.min_move_bp, 6.0);
        assert!((snap.min_move_atr_ratio - 0.33).abs() < 1e-9);
        // 6000 * (1 + 0.6 + 0.6)
        assert_eq!(snap.cooldown_ms, 13_200);
        assert!((snap.breakout_band_pct - 0.029).abs() < 1e-9);
        assert_eq!(snap.oi_regime, 1);
        assert!(snap.event_flag);
    }

    #[test]
    fn min_notional_never_drops_below_base() {
        let cfg = EnvConfig::default();
        let inputs = EnvInputs {
            liq_pct: 0.0,
            ..EnvInputs::default()
        };
        // 2000 * 0.9 = 1800, bounded back to 2000.
        assert_eq!(map_gates(&inputs, &cfg, 0).min_notional_3s, 2_000.0);
    }

    #[test]
    fn low_vol_or_liq_forces_flat_regime() {
        let inputs = assemble_inputs(0.3, 0.35, 0.9, 0.9, 1, false, 0.0);
        assert_eq!(inputs.oi_regime, 0);
        let inputs = assemble_inputs(0.9, 0.9, 0.2, 0.3, -1, false, 0.0);
        assert_eq!(inputs.oi_regime, 0);
        let inputs = assemble_inputs(0.9, 0.5, 0.6, 0.5, -1, false, 0.0);
        assert_eq!(inputs.oi_regime, -1);
        assert_eq!(inputs.vol_pct, 0.9);
    }
}
