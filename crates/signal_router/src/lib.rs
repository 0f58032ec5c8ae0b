//! Second-layer signal gating: strength floor, publish cooldown, dedup,
//! minimum spacing, direction hysteresis and the idempotency bucket, applied
//! in a fixed order so drop counters stay comparable across runs.
//!
//! The idempotency lock itself is a bus-side SET-NX; this crate computes the
//! bucket and sequences the checks, the runtime owns the round-trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use core_types::{DetectedSignal, GateSnapshot, Side};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    pub enabled: bool,
    pub strength_floor: f64,
    pub extra_cooldown_ms: i64,
    pub min_spacing_ms: i64,
    pub hyst_hi: f64,
    pub hyst_lo: f64,
    pub idem_bucket_ms: i64,
    pub idem_ttl_ms: i64,
    /// Reference price older than this at publish time is flagged stale.
    pub ref_px_stale_ms: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strength_floor: 0.60,
            extra_cooldown_ms: 0,
            min_spacing_ms: 10_000,
            hyst_hi: 0.75,
            hyst_lo: 0.55,
            idem_bucket_ms: 8_000,
            idem_ttl_ms: 10_000,
            ref_px_stale_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Disabled,
    BadRow,
    Strength,
    Cooldown,
    Dedup,
    MinSpacing,
    Hysteresis,
    IdempotentLock,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Disabled => "disabled",
            DropReason::BadRow => "bad_row",
            DropReason::Strength => "strength",
            DropReason::Cooldown => "cooldown",
            DropReason::Dedup => "dedup",
            DropReason::MinSpacing => "min_spacing",
            DropReason::Hysteresis => "hysteresis",
            DropReason::IdempotentLock => "idempotent_lock",
        }
    }
}

/// What the runtime needs to finish publishing an admitted signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admit {
    pub cool_ms: i64,
    pub final_min: f64,
    pub idem_bucket: i64,
    pub ttl_ms: i64,
}

#[derive(Debug, Default, Clone)]
struct DirState {
    /// Wall-clock of the last acceptance for this (sym, dir).
    last_emit_wall: i64,
    last_key: String,
}

#[derive(Debug, Default, Clone)]
struct SymState {
    per_dir: HashMap<Side, DirState>,
    last_dir: Option<Side>,
}

/// Single-owner gate state for the router task. Not persisted: a restart
/// clears cooldown history and the Redis idempotency locks carry the
/// at-most-once guarantee across redeliveries.
#[derive(Debug, Default)]
pub struct RouterGate {
    cfg: RouterConfig,
    state: HashMap<SmolStr, SymState>,
}

impl RouterGate {
    pub fn new(cfg: RouterConfig) -> Self {
        Self {
            cfg,
            state: HashMap::new(),
        }
    }

    pub fn cfg(&self) -> &RouterConfig {
        &self.cfg
    }

    pub fn idem_bucket(&self, ts: i64) -> i64 {
        ts.div_euclid(self.cfg.idem_bucket_ms.max(1)) * self.cfg.idem_bucket_ms.max(1)
    }

    /// Run the in-order gate cascade. `wall_now` is the processing clock;
    /// the signal's own `ts` is only compared against it for cooldown.
    pub fn admit(
        &self,
        sig: &DetectedSignal,
        gate: &GateSnapshot,
        wall_now: i64,
    ) -> Result<Admit, DropReason> {
        if !self.cfg.enabled {
            return Err(DropReason::Disabled);
        }

        let final_min = self.cfg.strength_floor.max(gate.eff_min0);
        if sig.strength < final_min {
            return Err(DropReason::Strength);
        }

        let cool_ms = gate.cooldown_ms + self.cfg.extra_cooldown_ms;
        let sym_state = self.state.get(sig.sym.as_str());
        let dir_state = sym_state.and_then(|s| s.per_dir.get(&sig.dir));

        if let Some(dir_state) = dir_state {
            if dir_state.last_emit_wall > 0 && sig.ts - dir_state.last_emit_wall < cool_ms {
                return Err(DropReason::Cooldown);
            }
            if !sig.approx_key.is_empty()
                && dir_state.last_key == sig.approx_key
                && sig.ts - dir_state.last_emit_wall < cool_ms
            {
                return Err(DropReason::Dedup);
            }
            if wall_now - dir_state.last_emit_wall < self.cfg.min_spacing_ms {
                return Err(DropReason::MinSpacing);
            }
        }

        if let Some(last_dir) = sym_state.and_then(|s| s.last_dir) {
            let needed = if last_dir != sig.dir {
                self.cfg.hyst_hi
            } else {
                self.cfg.hyst_lo
            };
            if sig.strength < needed {
                return Err(DropReason::Hysteresis);
            }
        }

        Ok(Admit {
            cool_ms,
            final_min,
            idem_bucket: self.idem_bucket(sig.ts),
            ttl_ms: gate.cooldown_ms.max(3_000),
        })
    }

    /// Record an acceptance after the idempotency lock and publish succeed.
    pub fn commit(&mut self, sig: &DetectedSignal, wall_now: i64) {
        let sym_state = self.state.entry(sig.sym.clone()).or_default();
        let dir_state = sym_state.per_dir.entry(sig.dir).or_default();
        dir_state.last_emit_wall = wall_now;
        dir_state.last_key = sig.approx_key.clone();
        sym_state.last_dir = Some(sig.dir);
    }
}
