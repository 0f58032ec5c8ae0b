use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::fields::{fmt_bool, fmt_f64, get_bool, get_f64, get_i64, get_str, push_field, Fields};
use crate::frames::Side;

pub const EVIDENCE_PREFIX: &str = "evidence.";

/// Detector output as appended to `signal:detected:{sym}`.
///
/// Evidence is an ordered map so the encoded row (and anything hashed over
/// it) is deterministic. Detector-specific keys pass through the router
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedSignal {
    pub sym: SmolStr,
    pub ts: i64,
    pub dir: Side,
    pub strength: f64,
    pub evidence: BTreeMap<String, String>,
    pub approx_key: String,
    pub strategy_id: String,
    pub ttl_ms: i64,
}

impl DetectedSignal {
    pub fn src(&self) -> &str {
        self.evidence.get("src").map(String::as_str).unwrap_or("unknown")
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(6 + self.evidence.len());
        push_field(&mut out, "ts", self.ts.to_string());
        push_field(&mut out, "dir", self.dir.as_str().to_string());
        push_field(&mut out, "strength", fmt_f64(self.strength));
        for (k, v) in &self.evidence {
            push_field(&mut out, &format!("{EVIDENCE_PREFIX}{k}"), v.clone());
        }
        push_field(&mut out, "approx_key", self.approx_key.clone());
        push_field(&mut out, "strategyId", self.strategy_id.clone());
        push_field(&mut out, "ttlMs", self.ttl_ms.to_string());
        out
    }

    /// Decode one row; the symbol comes from the stream key's hash-tag.
    pub fn from_fields(sym: &str, fields: &Fields) -> Option<DetectedSignal> {
        let ts = get_i64(fields, &["ts"])?;
        let dir = Side::parse(get_str(fields, &["dir"])?)?;
        let strength = get_f64(fields, &["strength"])?;
        if !(0.0..=1.0).contains(&strength) {
            return None;
        }
        let mut evidence = BTreeMap::new();
        for (k, v) in fields {
            if let Some(name) = k.strip_prefix(EVIDENCE_PREFIX) {
                evidence.insert(name.to_string(), v.clone());
            }
        }
        Some(DetectedSignal {
            sym: SmolStr::new(sym),
            ts,
            dir,
            strength,
            evidence,
            approx_key: get_str(fields, &["approx_key"]).unwrap_or("").to_string(),
            strategy_id: get_str(fields, &["strategyId"])
                .unwrap_or("intra.v1")
                .to_string(),
            ttl_ms: get_i64(fields, &["ttlMs"]).unwrap_or(3_000),
        })
    }
}

/// Accepted signal as appended to `signal:final:{sym}`: the detected row
/// plus the reference-price enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSignal {
    pub detected: DetectedSignal,
    pub ref_px: Option<f64>,
    pub ref_px_source: Option<String>,
    pub ref_px_ts: Option<i64>,
    pub ref_px_stale: Option<bool>,
}

impl FinalSignal {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = self.detected.to_fields();
        if let Some(px) = self.ref_px {
            push_field(&mut out, "refPx", fmt_f64(px));
        }
        if let Some(source) = &self.ref_px_source {
            push_field(&mut out, "refPx_source", source.clone());
        }
        if let Some(ts) = self.ref_px_ts {
            push_field(&mut out, "refPx_ts", ts.to_string());
        }
        if let Some(stale) = self.ref_px_stale {
            push_field(&mut out, "refPx_stale", fmt_bool(stale));
        }
        out
    }

    pub fn from_fields(sym: &str, fields: &Fields) -> Option<FinalSignal> {
        let detected = DetectedSignal::from_fields(sym, fields)?;
        Some(FinalSignal {
            detected,
            ref_px: get_f64(fields, &["refPx"]),
            ref_px_source: get_str(fields, &["refPx_source"]).map(str::to_string),
            ref_px_ts: get_i64(fields, &["refPx_ts"]),
            ref_px_stale: get_bool(fields, &["refPx_stale"]),
        })
    }
}

/// Audit row appended to `eval:done:{sym}` after a horizon resolves (or is
/// abandoned with `miss_px`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRow {
    pub ts0: i64,
    pub due_at: i64,
    pub horizon: String,
    pub dir: Side,
    pub p0: f64,
    pub used_px: Option<f64>,
    pub used_px_source: Option<String>,
    pub used_px_ts: Option<i64>,
    pub price_lag_ms: Option<i64>,
    pub ret_raw_bp: Option<f64>,
    pub ret_net_bp: Option<f64>,
    pub threshold_bp: f64,
    pub neutral_band_bp: f64,
    pub neutral: bool,
    pub success: bool,
    pub miss_px: bool,
    pub final_id: String,
    pub retry: u32,
}

impl EvalRow {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(18);
        push_field(&mut out, "ts0", self.ts0.to_string());
        push_field(&mut out, "dueAt", self.due_at.to_string());
        push_field(&mut out, "horizon", self.horizon.clone());
        push_field(&mut out, "dir", self.dir.as_str().to_string());
        push_field(&mut out, "p0", fmt_f64(self.p0));
        if let Some(px) = self.used_px {
            push_field(&mut out, "usedPx", fmt_f64(px));
        }
        if let Some(source) = &self.used_px_source {
            push_field(&mut out, "usedPx_source", source.clone());
        }
        if let Some(ts) = self.used_px_ts {
            push_field(&mut out, "usedPx_ts", ts.to_string());
        }
        if let Some(lag) = self.price_lag_ms {
            push_field(&mut out, "priceLagMs", lag.to_string());
        }
        if let Some(bp) = self.ret_raw_bp {
            push_field(&mut out, "retRawBp", fmt_f64(bp));
        }
        if let Some(bp) = self.ret_net_bp {
            push_field(&mut out, "retNetBp", fmt_f64(bp));
        }
        push_field(&mut out, "thresholdBp", fmt_f64(self.threshold_bp));
        push_field(&mut out, "neutralBandBp", fmt_f64(self.neutral_band_bp));
        push_field(&mut out, "neutral", fmt_bool(self.neutral));
        push_field(&mut out, "success", fmt_bool(self.success));
        push_field(&mut out, "miss_px", fmt_bool(self.miss_px));
        push_field(&mut out, "finalId", self.final_id.clone());
        push_field(&mut out, "retry", self.retry.to_string());
        out
    }

    pub fn from_fields(fields: &Fields) -> Option<EvalRow> {
        Some(EvalRow {
            ts0: get_i64(fields, &["ts0"])?,
            due_at: get_i64(fields, &["dueAt"])?,
            horizon: get_str(fields, &["horizon"])?.to_string(),
            dir: Side::parse(get_str(fields, &["dir"])?)?,
            p0: get_f64(fields, &["p0"])?,
            used_px: get_f64(fields, &["usedPx"]),
            used_px_source: get_str(fields, &["usedPx_source"]).map(str::to_string),
            used_px_ts: get_i64(fields, &["usedPx_ts"]),
            price_lag_ms: get_i64(fields, &["priceLagMs"]),
            ret_raw_bp: get_f64(fields, &["retRawBp"]),
            ret_net_bp: get_f64(fields, &["retNetBp"]),
            threshold_bp: get_f64(fields, &["thresholdBp"]).unwrap_or(0.0),
            neutral_band_bp: get_f64(fields, &["neutralBandBp"]).unwrap_or(0.0),
            neutral: get_bool(fields, &["neutral"]).unwrap_or(false),
            success: get_bool(fields, &["success"]).unwrap_or(false),
            miss_px: get_bool(fields, &["miss_px"]).unwrap_or(false),
            final_id: get_str(fields, &["finalId"]).unwrap_or("").to_string(),
            retry: get_i64(fields, &["retry"]).unwrap_or(0).max(0) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected() -> DetectedSignal {
        let mut evidence = BTreeMap::new();
        evidence.insert("src".to_string(), "flow".to_string());
        evidence.insert("buyShare3s_max".to_string(), "0.92".to_string());
        DetectedSignal {
            sym: SmolStr::new("BTC-USDT-SWAP"),
            ts: 1_700_000_000_000,
            dir: Side::Buy,
            strength: 0.815,
            evidence,
            approx_key: "BTC-USDT-SWAP|buy|flow|82|z:0|sh:0.92".to_string(),
            strategy_id: "intra.v1".to_string(),
            ttl_ms: 6_000,
        }
    }

    #[test]
    fn detected_roundtrip_preserves_evidence() {
        let sig = detected();
        let fields: Fields = sig.to_fields().into_iter().collect();
        assert_eq!(fields.get("evidence.src").unwrap(), "flow");
        let back = DetectedSignal::from_fields("BTC-USDT-SWAP", &fields).unwrap();
        assert_eq!(back, sig);
        assert_eq!(back.src(), "flow");
    }

    #[test]
    fn detected_rejects_out_of_range_strength() {
        let mut fields: Fields = detected().to_fields().into_iter().collect();
        fields.insert("strength".to_string(), "1.4".to_string());
        assert!(DetectedSignal::from_fields("X", &fields).is_none());
    }

    #[test]
    fn final_signal_omits_absent_ref_px() {
        let no_ref = FinalSignal {
            detected: detected(),
            ref_px: None,
            ref_px_source: None,
            ref_px_ts: None,
            ref_px_stale: None,
        };
        let fields: Fields = no_ref.to_fields().into_iter().collect();
        assert!(!fields.contains_key("refPx"));

        let with_ref = FinalSignal {
            ref_px: Some(50_000.5),
            ref_px_source: Some("mid".to_string()),
            ref_px_ts: Some(1_700_000_000_100),
            ref_px_stale: Some(false),
            ..no_ref
        };
        let fields: Fields = with_ref.to_fields().into_iter().collect();
        let back = FinalSignal::from_fields("BTC-USDT-SWAP", &fields).unwrap();
        assert_eq!(back.ref_px, Some(50_000.5));
        assert_eq!(back.ref_px_stale, Some(false));
    }

    #[test]
    fn eval_row_roundtrip() {
        let row = EvalRow {
            ts0: 1_700_000_000_000,
            due_at: 1_700_000_340_000,
            horizon: "5m".to_string(),
            dir: Side::Buy,
            p0: 100.0,
            used_px: Some(100.08),
            used_px_source: Some("mid".to_string()),
            used_px_ts: Some(1_700_000_341_000),
            price_lag_ms: Some(1_000),
            ret_raw_bp: Some(8.0),
            ret_net_bp: Some(8.0),
            threshold_bp: 5.0,
            neutral_band_bp: 2.0,
            neutral: false,
            success: true,
            miss_px: false,
            final_id: "1700000000000-0".to_string(),
            retry: 0,
        };
        let fields: Fields = row.to_fields().into_iter().collect();
        assert_eq!(EvalRow::from_fields(&fields).unwrap(), row);
    }
}
