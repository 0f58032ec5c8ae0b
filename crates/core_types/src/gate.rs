use serde::{Deserialize, Serialize};

use crate::fields::{fmt_bool, fmt_f64, get_bool, get_f64, get_i64, get_str, push_field, Fields};

pub const GATE_VERSION: &str = "v1.1";

/// Adaptive gate parameters, overwritten wholesale into `dyn:gate:{sym}`
/// every market-env cycle. Readers tolerate missing fields by falling back
/// to the per-field defaults below, so a partially written or absent hash
/// degrades to the static baseline instead of blocking the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSnapshot {
    pub eff_min0: f64,
    pub min_notional_3s: f64,
    pub min_move_bp: f64,
    pub min_move_atr_ratio: f64,
    pub cooldown_ms: i64,
    pub dedup_ms: i64,
    pub breakout_band_pct: f64,
    pub vol_pct: f64,
    pub liq_pct: f64,
    pub rate_exc: f64,
    pub event_flag: bool,
    pub oi_regime: i8,
    pub updated_at: i64,
    pub version: String,
}

impl Default for GateSnapshot {
    fn default() -> Self {
        Self {
            eff_min0: 0.65,
            min_notional_3s: 2_000.0,
            min_move_bp: 4.0,
            min_move_atr_ratio: 0.25,
            cooldown_ms: 6_000,
            dedup_ms: 8_000,
            breakout_band_pct: 0.02,
            vol_pct: 0.5,
            liq_pct: 0.5,
            rate_exc: 0.0,
            event_flag: false,
            oi_regime: 0,
            updated_at: 0,
            version: GATE_VERSION.to_string(),
        }
    }
}

impl GateSnapshot {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(14);
        push_field(&mut out, "effMin0", fmt_f64(self.eff_min0));
        push_field(&mut out, "minNotional3s", fmt_f64(self.min_notional_3s));
        push_field(&mut out, "minMoveBp", fmt_f64(self.min_move_bp));
        push_field(&mut out, "minMoveAtrRatio", fmt_f64(self.min_move_atr_ratio));
        push_field(&mut out, "cooldownMs", self.cooldown_ms.to_string());
        push_field(&mut out, "dedupMs", self.dedup_ms.to_string());
        push_field(&mut out, "breakoutBandPct", fmt_f64(self.breakout_band_pct));
        push_field(&mut out, "volPct", fmt_f64(self.vol_pct));
        push_field(&mut out, "liqPct", fmt_f64(self.liq_pct));
        push_field(&mut out, "rateExc", fmt_f64(self.rate_exc));
        push_field(&mut out, "eventFlag", fmt_bool(self.event_flag));
        push_field(&mut out, "oiRegime", self.oi_regime.to_string());
        push_field(&mut out, "updated_at", self.updated_at.to_string());
        push_field(&mut out, "version", self.version.clone());
        out
    }

    pub fn from_fields(fields: &Fields) -> GateSnapshot {
        let base = GateSnapshot::default();
        GateSnapshot {
            eff_min0: get_f64(fields, &["effMin0"]).unwrap_or(base.eff_min0),
            min_notional_3s: get_f64(fields, &["minNotional3s"]).unwrap_or(base.min_notional_3s),
            min_move_bp: get_f64(fields, &["minMoveBp"]).unwrap_or(base.min_move_bp),
            min_move_atr_ratio: get_f64(fields, &["minMoveAtrRatio"])
                .unwrap_or(base.min_move_atr_ratio),
            cooldown_ms: get_i64(fields, &["cooldownMs"]).unwrap_or(base.cooldown_ms),
            dedup_ms: get_i64(fields, &["dedupMs"]).unwrap_or(base.dedup_ms),
            breakout_band_pct: get_f64(fields, &["breakoutBandPct"])
                .unwrap_or(base.breakout_band_pct),
            vol_pct: get_f64(fields, &["volPct"]).unwrap_or(base.vol_pct),
            liq_pct: get_f64(fields, &["liqPct"]).unwrap_or(base.liq_pct),
            rate_exc: get_f64(fields, &["rateExc"]).unwrap_or(base.rate_exc),
            event_flag: get_bool(fields, &["eventFlag"]).unwrap_or(base.event_flag),
            oi_regime: get_i64(fields, &["oiRegime"]).unwrap_or(0).clamp(-1, 1) as i8,
            updated_at: get_i64(fields, &["updated_at"]).unwrap_or(0),
            version: get_str(fields, &["version"])
                .unwrap_or(GATE_VERSION)
                .to_string(),
        }
    }
}
