use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;

use core_types::{FundingFrame, KeySpace, KlineFrame, OiFrame, get_i64, push_field};
use market_env::{
    assemble_inputs, downsample_last_per_minute, funding_event_flag, liquidity_series, map_gates,
    pct_of_last, raw_oi_regime, rate_excess, tr_series_bp, EnvConfig, OiRegimeTracker,
};
use stream_bus::{StreamBus, Trim};

const OI_FETCH_CAP: usize = 2_000;
const RATE_RECENT_CAP: usize = 5_000;
const RATE_BASE_CAP: usize = 20_000;
const STATE_OI_TTL_S: i64 = 3_600;
const STATE_FUNDING_TTL_S: i64 = 14_400;

pub(crate) struct EnvRuntime {
    bus: StreamBus,
    keys: KeySpace,
    symbols: Vec<String>,
    cfg: EnvConfig,
    trackers: HashMap<String, OiRegimeTracker>,
}

impl EnvRuntime {
    pub(crate) fn new(bus: StreamBus, keys: KeySpace, symbols: Vec<String>, cfg: EnvConfig) -> Self {
        Self {
            bus,
            keys,
            symbols,
            cfg,
            trackers: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.refresh_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(symbols = self.symbols.len(), "market-env updater started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let symbols = self.symbols.clone();
            for sym in &symbols {
                self.cycle(sym).await;
            }
            metrics::counter!("quant_env_cycles_total").increment(1);
        }
        tracing::info!("market-env updater stopped");
    }

    async fn cycle(&mut self, sym: &str) {
        let now = infra_clock::now_ms();

        let k5 = self.fetch_klines(sym, "5m").await;
        let k15 = self.fetch_klines(sym, "15m").await;
        let vol5 = pct_of_last(&tr_series_bp(&k5));
        let vol15 = pct_of_last(&tr_series_bp(&k15));
        let liq5 = pct_of_last(&liquidity_series(&k5));
        let liq15 = pct_of_last(&liquidity_series(&k15));

        let (raw_oi, surfaced_oi) = self.oi_regime(sym, now).await;
        let event_flag = self.funding_event(sym, now).await;
        let rate_exc = self.signal_rate_excess(sym, now).await;

        let inputs = assemble_inputs(vol5, vol15, liq5, liq15, surfaced_oi, event_flag, rate_exc);
        let snap = map_gates(&inputs, &self.cfg, now);

        self.bus
            .hset_map(&self.keys.dyn_gate(sym), &snap.to_fields(), None)
            .await;

        let mut audit = snap.to_fields();
        push_field(&mut audit, "oiRegimeRaw", raw_oi.to_string());
        self.bus
            .xadd(&self.keys.dyn_gate_log(sym), &audit, Trim::MaxLen(2_000))
            .await;
    }

    async fn fetch_klines(&self, sym: &str, tf: &str) -> Vec<KlineFrame> {
        let rows = self
            .bus
            .xrevrange_latest(&self.keys.kline(sym, tf), self.cfg.kline_depth)
            .await;
        let mut out: Vec<KlineFrame> = rows
            .iter()
            .rev()
            .filter_map(|(_, fields)| KlineFrame::from_fields(fields))
            .collect();
        out.sort_by_key(|k| k.ts);
        out
    }

    /// OI series over the trailing window, downsampled per minute, with the
    /// persistence filter applied; returns `(raw, surfaced)`. Also mirrors
    /// the freshest sample into the `state:oi` hash so restarts keep a
    /// snapshot.
    async fn oi_regime(&mut self, sym: &str, now: i64) -> (i8, i8) {
        let from = now - self.cfg.oi_window_min * 60_000;
        let rows = self
            .bus
            .xrange_by_time(&self.keys.oi(sym), from, now, OI_FETCH_CAP)
            .await;
        let samples: Vec<(i64, f64)> = rows
            .iter()
            .filter_map(|(_, fields)| OiFrame::from_fields(fields))
            .map(|oi| (oi.ts, oi.value()))
            .collect();

        if let Some(last) = rows.last().and_then(|(_, f)| OiFrame::from_fields(f)) {
            let mut fields = Vec::with_capacity(3);
            push_field(&mut fields, "ts", last.ts.to_string());
            push_field(&mut fields, "oi", core_types::fmt_f64(last.oi));
            if let Some(ccy) = last.oi_ccy {
                push_field(&mut fields, "oiCcy", core_types::fmt_f64(ccy));
            }
            self.bus
                .hset_map(&self.keys.state_oi(sym), &fields, Some(STATE_OI_TTL_S))
                .await;
        }

        let series = downsample_last_per_minute(&samples);
        let raw = raw_oi_regime(&series, &self.cfg);
        let tracker = self.trackers.entry(sym.to_string()).or_default();
        (raw, tracker.update(raw, now, self.cfg.oi_hold_ms))
    }

    /// Funding proximity: refresh the state hash from the stream when a new
    /// row exists, then gate on `nextFundingTime` from the hash.
    async fn funding_event(&self, sym: &str, now: i64) -> bool {
        if let Some((_, fields)) = self
            .bus
            .xrevrange_latest(&self.keys.funding(sym), 1)
            .await
            .first()
        {
            if let Some(frame) = FundingFrame::from_fields(fields) {
                self.bus
                    .hset_map(
                        &self.keys.state_funding(sym),
                        &frame.to_fields(),
                        Some(STATE_FUNDING_TTL_S),
                    )
                    .await;
            }
        }
        let hash = self.bus.hgetall(&self.keys.state_funding(sym)).await;
        funding_event_flag(get_i64(&hash, &["nextFundingTime"]), now)
    }

    async fn signal_rate_excess(&self, sym: &str, now: i64) -> f64 {
        let key = self.keys.detected(sym);
        let recent = self
            .bus
            .count_in_range(&key, now - self.cfg.rate_recent_ms, now, RATE_RECENT_CAP)
            .await;
        let base = self
            .bus
            .count_in_range(&key, now - self.cfg.rate_base_ms, now, RATE_BASE_CAP)
            .await;
        rate_excess(recent, base, &self.cfg)
    }
}
