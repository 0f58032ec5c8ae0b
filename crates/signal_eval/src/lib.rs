//! Signal evaluation core: fixed-horizon job scheduling and realized-return
//! accounting. The evaluator task drives this book from its intake loop and
//! 1-second resolve tick; price lookups live in the runtime's resolver.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use core_types::{EvalRow, FinalSignal, Side};
use infra_clock::ceil_to_next_minute;

/// Price sources in resolver preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Mid,
    Last,
    Win1m,
    WsKline1m,
    BfKline1m,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Mid => "mid",
            PriceSource::Last => "last",
            PriceSource::Win1m => "win:1m",
            PriceSource::WsKline1m => "ws:kline1m",
            PriceSource::BfKline1m => "bf:kline1m",
        }
    }

    pub fn parse(raw: &str) -> Option<PriceSource> {
        match raw.trim() {
            "mid" => Some(PriceSource::Mid),
            "last" => Some(PriceSource::Last),
            "win:1m" => Some(PriceSource::Win1m),
            "ws:kline1m" => Some(PriceSource::WsKline1m),
            "bf:kline1m" => Some(PriceSource::BfKline1m),
            _ => None,
        }
    }

    pub fn default_preference() -> Vec<PriceSource> {
        vec![
            PriceSource::Mid,
            PriceSource::Last,
            PriceSource::Win1m,
            PriceSource::WsKline1m,
            PriceSource::BfKline1m,
        ]
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a preference list like `mid,last,win:1m`; unknown entries are
/// skipped, an empty result falls back to the default order.
pub fn parse_price_pref(raw: &str) -> Vec<PriceSource> {
    let parsed: Vec<PriceSource> = raw.split(',').filter_map(PriceSource::parse).collect();
    if parsed.is_empty() {
        PriceSource::default_preference()
    } else {
        parsed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    pub name: String,
    pub ms: i64,
}

/// Parse `5m,15m` style horizon lists; `h` and `m` suffixes are accepted.
pub fn parse_horizons(raw: &str) -> Vec<Horizon> {
    let mut out = Vec::new();
    for token in raw.split(',') {
        let t = token.trim();
        if t.len() < 2 {
            continue;
        }
        let (num, unit) = t.split_at(t.len() - 1);
        let Ok(n) = num.parse::<i64>() else {
            continue;
        };
        let ms = match unit {
            "m" => n * 60_000,
            "h" => n * 3_600_000,
            _ => continue,
        };
        if ms > 0 {
            out.push(Horizon {
                name: t.to_string(),
                ms,
            });
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalConfig {
    pub horizons: Vec<Horizon>,
    pub success_bp: f64,
    pub neutral_band_bp: f64,
    pub fee_bp: f64,
    pub max_retry: u32,
    pub px_search_ms: i64,
    pub price_pref: Vec<PriceSource>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            horizons: parse_horizons("5m,15m"),
            success_bp: 5.0,
            neutral_band_bp: 2.0,
            fee_bp: 0.0,
            max_retry: 6,
            px_search_ms: 15_000,
            price_pref: PriceSource::default_preference(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalJob {
    pub final_id: String,
    pub sym: SmolStr,
    pub dir: Side,
    pub ts0: i64,
    pub p0: f64,
    pub p0_src: String,
    pub hz_name: String,
    pub hz_ms: i64,
    pub due_at: i64,
    pub retry: u32,
}

/// A resolved price observation near a target time.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub px: f64,
    pub ts: i64,
    pub source: String,
}

/// Entry price straight off the final row, accepted only when the reference
/// price is present, not flagged stale, and close enough to the signal time.
pub fn entry_price_from_final(sig: &FinalSignal, px_search_ms: i64) -> Option<(f64, String)> {
    let px = sig.ref_px?;
    if px <= 0.0 {
        return None;
    }
    if sig.ref_px_stale == Some(true) {
        return None;
    }
    let ref_ts = sig.ref_px_ts?;
    if (ref_ts - sig.detected.ts).abs() > px_search_ms {
        return None;
    }
    let source = sig.ref_px_source.clone().unwrap_or_else(|| "mid".to_string());
    Some((px, source))
}

pub fn raw_return_bp(dir: Side, p0: f64, p1: f64) -> f64 {
    match dir {
        Side::Buy => (p1 / p0 - 1.0) * 10_000.0,
        Side::Sell => (p0 / p1 - 1.0) * 10_000.0,
    }
}

/// Pending-job book keyed `{finalId}|{hzName}`; exclusively owned by the
/// evaluator task.
#[derive(Debug, Default)]
pub struct JobBook {
    jobs: HashMap<String, EvalJob>,
}

impl JobBook {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&EvalJob> {
        self.jobs.get(key)
    }

    /// One job per configured horizon for an accepted signal.
    pub fn enqueue(
        &mut self,
        final_id: &str,
        sym: &str,
        dir: Side,
        ts0: i64,
        p0: f64,
        p0_src: &str,
        horizons: &[Horizon],
    ) -> usize {
        let mut added = 0;
        for hz in horizons {
            let key = format!("{final_id}|{}", hz.name);
            if self.jobs.contains_key(&key) {
                continue;
            }
            self.jobs.insert(
                key,
                EvalJob {
                    final_id: final_id.to_string(),
                    sym: SmolStr::new(sym),
                    dir,
                    ts0,
                    p0,
                    p0_src: p0_src.to_string(),
                    hz_name: hz.name.clone(),
                    hz_ms: hz.ms,
                    due_at: ceil_to_next_minute(ts0 + hz.ms),
                    retry: 0,
                },
            );
            added += 1;
        }
        added
    }

    pub fn due_keys(&self, now: i64) -> Vec<String> {
        let mut keys: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.due_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Apply one resolve attempt. Returns a finished audit row when the job
    /// leaves the book (resolved or abandoned); `None` means it stays for
    /// another tick.
    pub fn settle(
        &mut self,
        key: &str,
        resolved: Option<Resolved>,
        cfg: &EvalConfig,
    ) -> Option<EvalRow> {
        let job = self.jobs.get_mut(key)?;
        match resolved {
            Some(r) => {
                let row = build_row(job, &r, cfg);
                self.jobs.remove(key);
                Some(row)
            }
            None => {
                if job.retry < cfg.max_retry {
                    job.retry += 1;
                    None
                } else {
                    let row = build_miss_row(job, cfg);
                    self.jobs.remove(key);
                    Some(row)
                }
            }
        }
    }
}

fn build_row(job: &EvalJob, resolved: &Resolved, cfg: &EvalConfig) -> EvalRow {
    let raw_bp = raw_return_bp(job.dir, job.p0, resolved.px);
    let net_bp = raw_bp - cfg.fee_bp;
    let neutral = net_bp.abs() < cfg.neutral_band_bp;
    let success = !neutral && net_bp >= cfg.success_bp;
    EvalRow {
        ts0: job.ts0,
        due_at: job.due_at,
        horizon: job.hz_name.clone(),
        dir: job.dir,
        p0: job.p0,
        used_px: Some(resolved.px),
        used_px_source: Some(resolved.source.clone()),
        used_px_ts: Some(resolved.ts),
        price_lag_ms: Some((resolved.ts - job.due_at).max(0)),
        ret_raw_bp: Some(raw_bp),
        ret_net_bp: Some(net_bp),
        threshold_bp: cfg.success_bp,
        neutral_band_bp: cfg.neutral_band_bp,
        neutral,
        success,
        miss_px: false,
        final_id: job.final_id.clone(),
        retry: job.retry,
    }
}

fn build_miss_row(job: &EvalJob, cfg: &EvalConfig) -> EvalRow {
    EvalRow {
        ts0: job.ts0,
        due_at: job.due_at,
        horizon: job.hz_name.clone(),
        dir: job.dir,
        p0: job.p0,
        used_px: None,
        used_px_source: None,
        used_px_ts: None,
        price_lag_ms: None,
        ret_raw_bp: None,
        ret_net_bp: None,
        threshold_bp: cfg.success_bp,
        neutral_band_bp: cfg.neutral_band_bp,
        neutral: false,
        success: false,
        miss_px: true,
        final_id: job.final_id.clone(),
        retry: job.retry,
    }
}
