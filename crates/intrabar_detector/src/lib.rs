//! Intra-bar detectors and the per-symbol aggregator.
//!
//! Three pure detectors look at each tick (aggressive flow, delta z-like,
//! range breakout); the aggregator consolidates their candidates into at
//! most one signal per symbol per tick under consensus, symmetry, cooldown,
//! minimum-move and near-duplicate suppression rules.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use core_types::{fmt_f64, DetectedSignal, Side};
use market_stats::{clip01, fnv1a64, round_dp, round_to};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Flow,
    Delta,
    Breakout,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Flow => "flow",
            SignalSource::Delta => "delta",
            SignalSource::Breakout => "breakout",
        }
    }

    /// Tie-break rank; breakout beats delta beats flow.
    pub fn rank(&self) -> u8 {
        match self {
            SignalSource::Breakout => 3,
            SignalSource::Delta => 2,
            SignalSource::Flow => 1,
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minute-bar view handed to the detectors. `high`/`low` are the bucket
/// extremes *before* the current trade widened them; `last` is the trade
/// price itself.
#[derive(Debug, Clone, Copy)]
pub struct WinSnapshot {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub atr: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorCtx<'a> {
    pub now: i64,
    pub sym: &'a str,
    pub win: WinSnapshot,
    pub last_prices: &'a [f64],
    pub buy_notional_3s: f64,
    pub sell_notional_3s: f64,
    pub min_notional_3s: f64,
    pub breakout_band_pct: f64,
    pub dyn_abs_delta: f64,
    pub dyn_delta_k: f64,
    pub liq_k: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub ts: i64,
    pub dir: Side,
    pub strength: f64,
    pub src: SignalSource,
    pub z_like: f64,
    pub buy_share: f64,
    pub extras: Vec<(&'static str, f64)>,
}

/// D1: one side owns at least 80% of the 3s notional and the imbalance is
/// material against the adaptive scale.
pub fn detect_flow(ctx: &DetectorCtx) -> Option<Candidate> {
    let buy = ctx.buy_notional_3s;
    let sell = ctx.sell_notional_3s;
    let sum = buy + sell;
    let liq_th = ctx.min_notional_3s.max(ctx.liq_k * ctx.dyn_abs_delta);
    if sum <= liq_th {
        return None;
    }
    let buy_share = if sum > 0.0 { buy / sum } else { 0.5 };
    let (dir, share_strength) = if buy_share >= 0.8 {
        (Side::Buy, clip01((buy_share - 0.75) / 0.25))
    } else if buy_share <= 0.2 {
        (Side::Sell, clip01((0.25 - buy_share) / 0.25))
    } else {
        return None;
    };
    let signif = clip01((buy - sell).abs() / (3.0 * ctx.min_notional_3s.max(ctx.dyn_abs_delta)));
    let strength = round_dp(clip01(0.6 * share_strength + 0.4 * signif), 3);
    Some(Candidate {
        ts: ctx.now,
        dir,
        strength,
        src: SignalSource::Flow,
        z_like: 0.0,
        buy_share,
        extras: vec![("sum3s", sum), ("signif", signif)],
    })
}

/// D2: absolute buy/sell delta clears an adaptive threshold.
pub fn detect_delta(ctx: &DetectorCtx) -> Option<Candidate> {
    let buy = ctx.buy_notional_3s;
    let sell = ctx.sell_notional_3s;
    let sum = buy + sell;
    let sum_floor = (0.5 * ctx.min_notional_3s).max(0.5 * ctx.liq_k * ctx.dyn_abs_delta);
    if sum < sum_floor {
        return None;
    }
    let dyn_th = ctx.min_notional_3s.max(ctx.dyn_abs_delta * ctx.dyn_delta_k);
    let delta = buy - sell;
    if delta.abs() <= dyn_th {
        return None;
    }
    let strength = round_dp(clip01(delta.abs() / (4.0 * dyn_th)), 3);
    let dir = if delta > 0.0 { Side::Buy } else { Side::Sell };
    let z_like = delta / dyn_th;
    Some(Candidate {
        ts: ctx.now,
        dir,
        strength,
        src: SignalSource::Delta,
        z_like,
        buy_share: if sum > 0.0 { buy / sum } else { 0.5 },
        extras: vec![("delta3s", delta), ("dynTh", dyn_th)],
    })
}

/// D3: the latest trade escapes the bucket's prior range by an adaptive
/// epsilon, confirmed by slope or volume.
pub fn detect_breakout(ctx: &DetectorCtx) -> Option<Candidate> {
    let band = ctx.win.high - ctx.win.low;
    if band <= 0.0 {
        return None;
    }
    let pct = ctx.breakout_band_pct.clamp(0.0, 0.2);
    let eps = band * pct;
    let lp = ctx.last_prices;
    if lp.len() < 3 {
        return None;
    }
    let slope = (lp[lp.len() - 1] - lp[0]) / (lp.len() as f64 - 1.0);
    let vol_confirm = ctx.buy_notional_3s + ctx.sell_notional_3s >= 0.5 * ctx.dyn_abs_delta;
    let last = ctx.win.last;

    let (dir, dist, slope_confirms) = if last >= ctx.win.high + eps && (slope > 0.0 || vol_confirm)
    {
        (Side::Buy, (last - (ctx.win.high + eps)) / band, slope > 0.0)
    } else if last <= ctx.win.low - eps && (slope < 0.0 || vol_confirm) {
        (Side::Sell, ((ctx.win.low - eps) - last) / band, slope < 0.0)
    } else {
        return None;
    };

    let strength = round_dp(
        clip01(0.55 + (2.0 * dist).min(0.35) + if slope_confirms { 0.1 } else { 0.0 }),
        3,
    );
    Some(Candidate {
        ts: ctx.now,
        dir,
        strength,
        src: SignalSource::Breakout,
        z_like: 0.0,
        buy_share: 0.5,
        extras: vec![("band", band), ("slope", slope), ("dist", dist)],
    })
}

/// Static aggregator knobs; the dyn-gate-driven tier arrives per call as
/// [`GateParams`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatorConfig {
    pub min_strength_floor: f64,
    pub consensus_k: f64,
    /// Multiplier on `consensus_k` while `dynAbsDelta` runs hot.
    pub consensus_k_hi_vol_discount: f64,
    pub symmetry_eps: f64,
    pub z_bucket: f64,
    pub share_bucket: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_strength_floor: 0.6,
            consensus_k: 0.03,
            consensus_k_hi_vol_discount: 0.5,
            symmetry_eps: 0.05,
            z_bucket: 0.05,
            share_bucket: 0.02,
        }
    }
}

/// Per-evaluation gate parameters derived from the dyn-gate snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateParams {
    pub min_strength: f64,
    pub cooldown_ms: i64,
    pub dedup_ms: i64,
    pub min_move_bp: f64,
    pub min_move_atr_ratio: f64,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            min_strength: 0.65,
            cooldown_ms: 6_000,
            dedup_ms: 8_000,
            min_move_bp: 4.0,
            min_move_atr_ratio: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggDrop {
    NoCandidates,
    Consensus,
    Symmetry,
    Cooldown,
    MinMove,
    Dedup,
}

impl AggDrop {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggDrop::NoCandidates => "no_candidates",
            AggDrop::Consensus => "consensus",
            AggDrop::Symmetry => "symmetry",
            AggDrop::Cooldown => "cooldown",
            AggDrop::MinMove => "min_move",
            AggDrop::Dedup => "dedup",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct EmitState {
    ts: i64,
    px: f64,
    key: String,
}

/// Consolidates candidates into at most one emission per symbol per tick.
/// State is keyed by (symbol, direction) and owned by the window task; it
/// is intentionally not persisted, so a restart starts with empty cooldown
/// history.
#[derive(Debug, Default)]
pub struct Aggregator {
    cfg: AggregatorConfig,
    state: HashMap<(SmolStr, Side), EmitState>,
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self {
            cfg,
            state: HashMap::new(),
        }
    }

    pub fn cfg(&self) -> &AggregatorConfig {
        &self.cfg
    }

    pub fn evaluate(
        &mut self,
        ctx: &DetectorCtx,
        gates: &GateParams,
    ) -> Result<DetectedSignal, AggDrop> {
        let mut candidates: Vec<Candidate> = [
            detect_flow(ctx),
            detect_delta(ctx),
            detect_breakout(ctx),
        ]
        .into_iter()
        .flatten()
        .collect();
        if candidates.is_empty() {
            return Err(AggDrop::NoCandidates);
        }

        // Stable ordering: source rank, then buy before sell, then strength
        // descending. The candidates hash and all tie-breaks key off this.
        candidates.sort_by(|a, b| {
            b.src
                .rank()
                .cmp(&a.src.rank())
                .then_with(|| match (a.dir, b.dir) {
                    (Side::Buy, Side::Sell) => std::cmp::Ordering::Less,
                    (Side::Sell, Side::Buy) => std::cmp::Ordering::Greater,
                    _ => std::cmp::Ordering::Equal,
                })
                .then_with(|| b.strength.total_cmp(&a.strength))
        });
        let ordered = candidates.clone();

        // Consensus: more same-direction candidates lower the bar, faster in
        // a hot tape.
        let hi_vol = ctx.dyn_abs_delta > 1.5 * ctx.min_notional_3s;
        let k_eff = if hi_vol {
            self.cfg.consensus_k * self.cfg.consensus_k_hi_vol_discount
        } else {
            self.cfg.consensus_k
        };
        let n_buy = candidates.iter().filter(|c| c.dir == Side::Buy).count();
        let n_sell = candidates.len() - n_buy;
        candidates.retain(|c| {
            let n_dir = if c.dir == Side::Buy { n_buy } else { n_sell };
            let eff_min = self
                .cfg
                .min_strength_floor
                .max(gates.min_strength - k_eff * (n_dir.saturating_sub(1) as f64));
            c.strength >= eff_min
        });
        if candidates.is_empty() {
            return Err(AggDrop::Consensus);
        }

        let max_buy = candidates
            .iter()
            .filter(|c| c.dir == Side::Buy)
            .map(|c| c.strength)
            .fold(f64::NAN, f64::max);
        let max_sell = candidates
            .iter()
            .filter(|c| c.dir == Side::Sell)
            .map(|c| c.strength)
            .fold(f64::NAN, f64::max);
        let buy_n = candidates.iter().filter(|c| c.dir == Side::Buy).count();
        let sell_n = candidates.len() - buy_n;
        if buy_n > 0
            && buy_n == sell_n
            && (max_buy - max_sell).abs() < self.cfg.symmetry_eps
        {
            return Err(AggDrop::Symmetry);
        }

        let chosen = candidates
            .iter()
            .max_by(|a, b| {
                a.strength
                    .total_cmp(&b.strength)
                    .then_with(|| a.src.rank().cmp(&b.src.rank()))
            })
            .cloned()
            .ok_or(AggDrop::NoCandidates)?;

        let state_key = (SmolStr::new(ctx.sym), chosen.dir);
        if let Some(prev) = self.state.get(&state_key) {
            if prev.ts > 0 && ctx.now - prev.ts < gates.cooldown_ms {
                return Err(AggDrop::Cooldown);
            }
        }

        if let Some(prev) = self.state.get(&state_key) {
            if prev.px.is_finite() && prev.px > 0.0 && ctx.win.last.is_finite() {
                let delta = (ctx.win.last - prev.px).abs();
                let move_bp = delta / ctx.win.last * 10_000.0;
                let atr = if ctx.win.atr.is_finite() {
                    ctx.win.atr
                } else {
                    (ctx.win.high - ctx.win.low) * 2.0 / 3.0
                };
                let atr_ok = atr <= 0.0 || delta / atr >= gates.min_move_atr_ratio;
                if move_bp < gates.min_move_bp || !atr_ok {
                    return Err(AggDrop::MinMove);
                }
            }
        }

        let approx_key = self.approx_key(ctx.sym, &chosen);
        if let Some(prev) = self.state.get(&state_key) {
            if prev.key == approx_key && ctx.now - prev.ts < gates.dedup_ms {
                return Err(AggDrop::Dedup);
            }
        }

        self.state.insert(
            state_key,
            EmitState {
                ts: ctx.now,
                px: ctx.win.last,
                key: approx_key.clone(),
            },
        );

        Ok(self.build_signal(ctx, gates, &ordered, chosen, approx_key))
    }

    fn approx_key(&self, sym: &str, c: &Candidate) -> String {
        format!(
            "{sym}|{}|{}|{}|z:{:.2}|sh:{:.2}",
            c.dir.as_str(),
            c.src.as_str(),
            (c.strength * 100.0).round() as i64,
            round_to(c.z_like, self.cfg.z_bucket),
            round_to(c.buy_share, self.cfg.share_bucket),
        )
    }

    fn build_signal(
        &self,
        ctx: &DetectorCtx,
        gates: &GateParams,
        ordered: &[Candidate],
        chosen: Candidate,
        approx_key: String,
    ) -> DetectedSignal {
        let hashed = serde_json::to_string(
            &ordered
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "src": c.src.as_str(),
                        "dir": c.dir.as_str(),
                        "strength": c.strength,
                        "z": round_to(c.z_like, self.cfg.z_bucket),
                        "share": round_to(c.buy_share, self.cfg.share_bucket),
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap_or_default();
        let z_max = ordered
            .iter()
            .map(|c| c.z_like)
            .fold(0.0f64, |acc, z| if z.abs() > acc.abs() { z } else { acc });
        let share_max = ordered.iter().map(|c| c.buy_share).fold(0.0, f64::max);

        let mut evidence = BTreeMap::new();
        evidence.insert("src".to_string(), chosen.src.as_str().to_string());
        evidence.insert("dir".to_string(), chosen.dir.as_str().to_string());
        evidence.insert("kind".to_string(), "intra".to_string());
        evidence.insert(
            "candidates_hash".to_string(),
            format!("{:016x}", fnv1a64(hashed.as_bytes())),
        );
        evidence.insert("approx_key".to_string(), approx_key.clone());
        evidence.insert("zLike_max".to_string(), fmt_f64(round_dp(z_max, 4)));
        evidence.insert(
            "buyShare3s_max".to_string(),
            fmt_f64(round_dp(share_max, 4)),
        );
        for (k, v) in &chosen.extras {
            evidence.insert((*k).to_string(), fmt_f64(round_dp(*v, 6)));
        }

        DetectedSignal {
            sym: SmolStr::new(ctx.sym),
            ts: chosen.ts,
            dir: chosen.dir,
            strength: chosen.strength,
            evidence,
            approx_key,
            strategy_id: "intra.v1".to_string(),
            ttl_ms: gates.cooldown_ms.max(3_000),
        }
    }
}
