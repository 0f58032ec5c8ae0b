use std::collections::HashMap;

use bar_window::{WindowBook, WindowConfig};
use core_types::{
    DetectedSignal, FinalSignal, GateSnapshot, KeySpace, SealedBar, Side, TradeEvent,
};
use intrabar_detector::{Aggregator, AggregatorConfig, DetectorCtx, GateParams, WinSnapshot};
use signal_eval::{entry_price_from_final, EvalConfig, JobBook, Resolved};
use signal_router::{DropReason, RouterConfig, RouterGate};
use stream_bus::normalize_entry;

use crate::config_loader::{self, DetectorParams};

const SYM: &str = "BTC-USDT-SWAP";

fn lookup_from<'a>(map: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
    move |key| map.get(key).map(|v| v.to_string())
}

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

/// Mirror of the runtime's context assembly, kept in lockstep by this test
/// module so the pure crates can be driven without a live bus.
fn detector_ctx<'a>(
    book: &'a WindowBook,
    sym: &'a str,
    now: i64,
    pre_high: f64,
    pre_low: f64,
    gate: &GateSnapshot,
    det: &DetectorParams,
) -> DetectorCtx<'a> {
    let state = book.state(sym).expect("symbol state");
    let m1 = state.minute().expect("open minute");
    DetectorCtx {
        now,
        sym,
        win: WinSnapshot {
            open: m1.open,
            high: pre_high,
            low: pre_low,
            last: m1.last,
            atr: state.atr(),
        },
        last_prices: state.prices(),
        buy_notional_3s: state.flow().buy_notional(),
        sell_notional_3s: state.flow().sell_notional(),
        min_notional_3s: gate.min_notional_3s,
        breakout_band_pct: gate.breakout_band_pct,
        dyn_abs_delta: state.dyn_abs_delta(),
        dyn_delta_k: det.dyn_delta_k,
        liq_k: det.liq_k,
    }
}

#[test]
fn config_defaults_and_symbol_expansion() {
    let env: HashMap<&str, &str> = [("SYMBOLS", "btc,eth")].into_iter().collect();
    let cfg = config_loader::load_with(&lookup_from(&env)).unwrap();
    assert_eq!(cfg.symbols, vec!["BTC-USDT-SWAP", "ETH-USDT-SWAP"]);
    assert!(cfg.router.enabled);
    assert_eq!(cfg.router.min_spacing_ms, 10_000);
    assert_eq!(cfg.router.hyst_hi, 0.75);
    assert_eq!(cfg.router.hyst_lo, 0.55);
    assert_eq!(cfg.router.idem_bucket_ms, 8_000);
    assert_eq!(cfg.eval.success_bp, 5.0);
    assert_eq!(cfg.eval.neutral_band_bp, 2.0);
    assert_eq!(cfg.eval.max_retry, 6);
    assert_eq!(cfg.eval.horizons.len(), 2);
    assert_eq!(cfg.env.refresh_ms, 10_000);
    assert_eq!(cfg.redis_url, "redis://127.0.0.1:6379");
}

#[test]
fn config_overrides_and_clamping() {
    let env: HashMap<&str, &str> = [
        ("OKX_ASSETS", "sol"),
        ("SIGNALS_ENABLED", "false"),
        ("SIGNAL_MIN_SPACING_MS", "2500"),
        ("SIGNAL_HYST_HI", "1.7"), // clamped into [0,1]
        ("EVAL_HORIZONS", "5m,1h"),
        ("EVAL_FEE_BP", "1.5"),
        ("EVAL_PRICE_PREF", "last,mid"),
        ("QUANT_KEY_PREFIX", "dev:"),
    ]
    .into_iter()
    .collect();
    let cfg = config_loader::load_with(&lookup_from(&env)).unwrap();
    assert_eq!(cfg.symbols, vec!["SOL-USDT-SWAP"]);
    assert!(!cfg.router.enabled);
    assert_eq!(cfg.router.min_spacing_ms, 2_500);
    assert_eq!(cfg.router.hyst_hi, 1.0);
    assert_eq!(cfg.eval.horizons[1].ms, 3_600_000);
    assert_eq!(cfg.eval.fee_bp, 1.5);
    assert_eq!(cfg.eval.price_pref.len(), 2);
    assert_eq!(cfg.key_prefix, "dev:");
}

#[test]
fn config_requires_symbols() {
    let env: HashMap<&str, &str> = HashMap::new();
    assert!(config_loader::load_with(&lookup_from(&env)).is_err());
}

#[test]
fn wire_trade_flows_through_window_book() {
    // A raw bus entry, exactly as ingress writes it.
    let fields: core_types::Fields = [
        ("ts", "59500"),
        ("px", "100"),
        ("qty", "1"),
        ("side", "buy"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let msg = normalize_entry("ws:{BTC-USDT-SWAP}:trades", "59500-0", fields, 0);
    assert_eq!(msg.sym.as_deref(), Some(SYM));
    let trade = TradeEvent::from_fields(&msg.fields).unwrap();

    let mut book = WindowBook::new(WindowConfig::default());
    book.on_trade(SYM, &trade);
    book.on_trade(SYM, &self::trade(59_800, 105.0, 2.0, Side::Sell));
    let outcome = book.on_trade(SYM, &self::trade(60_500, 107.0, 1.0, Side::Buy));

    let (_, bar) = &outcome.sealed[0];
    assert_eq!(bar.close_ts, 60_000);
    assert!((bar.vwap - 310.0 / 3.0).abs() < 1e-9);

    // The in-progress hash the runtime writes after the boundary trade.
    let m1 = book.state(SYM).unwrap().minute().unwrap();
    let state: core_types::Fields = m1.state_fields(60_500).into_iter().collect();
    assert_eq!(state.get("open").unwrap(), "107");
    assert_eq!(state.get("tickN").unwrap(), "1");
    assert_eq!(state.get("closeTs").unwrap(), "120000");
}

/// Window -> detector -> aggregator against a one-sided tape.
#[test]
fn burst_of_aggressive_buys_produces_one_signal() {
    let mut book = WindowBook::new(WindowConfig::default());
    let mut agg = Aggregator::new(AggregatorConfig::default());
    let det = DetectorParams::default();
    let gate = GateSnapshot::default();
    let gates = GateParams {
        min_strength: gate.eff_min0,
        cooldown_ms: gate.cooldown_ms,
        dedup_ms: gate.dedup_ms,
        min_move_bp: gate.min_move_bp,
        min_move_atr_ratio: gate.min_move_atr_ratio,
    };

    let t0 = 1_700_000_000_000;
    let mut signals: Vec<DetectedSignal> = Vec::new();
    for i in 0..10i64 {
        let ts = t0 + i * 200;
        let px = 50_000.0 + i as f64 * 5.0;
        let outcome = book.on_trade(SYM, &trade(ts, px, 1.0, Side::Buy));
        let ctx = detector_ctx(
            &book,
            SYM,
            ts,
            outcome.pre_high,
            outcome.pre_low,
            &gate,
            &det,
        );
        if let Ok(sig) = agg.evaluate(&ctx, &gates) {
            signals.push(sig);
        }
    }

    // Cooldown keeps the burst to a single emission.
    assert_eq!(signals.len(), 1);
    let sig = &signals[0];
    assert_eq!(sig.dir, Side::Buy);
    assert!(sig.strength >= gates.min_strength);
    assert_eq!(sig.evidence.get("kind").unwrap(), "intra");
    assert!(!sig.approx_key.is_empty());
}

/// Detected -> router -> final -> evaluator, all on the pure cores.
#[test]
fn accepted_signal_round_trips_to_eval_row() {
    let mut router = RouterGate::new(RouterConfig::default());
    let gate = GateSnapshot::default();
    let t0 = 1_700_000_000_000;

    let mut evidence = std::collections::BTreeMap::new();
    evidence.insert("src".to_string(), "flow".to_string());
    let detected = DetectedSignal {
        sym: SYM.into(),
        ts: t0,
        dir: Side::Buy,
        strength: 0.82,
        evidence,
        approx_key: format!("{SYM}|buy|flow|82|z:0.00|sh:0.96"),
        strategy_id: "intra.v1".to_string(),
        ttl_ms: 6_000,
    };

    let admit = router.admit(&detected, &gate, t0).unwrap();
    assert_eq!(admit.idem_bucket % 8_000, 0);

    let final_sig = FinalSignal {
        detected: detected.clone(),
        ref_px: Some(100.0),
        ref_px_source: Some("mid".to_string()),
        ref_px_ts: Some(t0 - 50),
        ref_px_stale: Some(false),
    };
    router.commit(&detected, t0);

    // Evaluator intake.
    let cfg = EvalConfig::default();
    let (p0, p0_src) = entry_price_from_final(&final_sig, cfg.px_search_ms).unwrap();
    assert_eq!(p0, 100.0);

    let mut jobs = JobBook::default();
    jobs.enqueue("1700000000000-0", SYM, Side::Buy, t0, p0, &p0_src, &cfg.horizons);
    assert_eq!(jobs.len(), 2);

    let due = jobs.get("1700000000000-0|5m").unwrap().due_at;
    let row = jobs
        .settle(
            "1700000000000-0|5m",
            Some(Resolved {
                px: 100.08,
                ts: due + 1_000,
                source: "mid".to_string(),
            }),
            &cfg,
        )
        .unwrap();
    assert!((row.ret_raw_bp.unwrap() - 8.0).abs() < 1e-9);
    assert!(row.success);
    assert_eq!(row.price_lag_ms, Some(1_000));

    // A redelivered detected row in the same bucket cannot re-emit.
    let redelivered = router.admit(&detected, &gate, t0 + 1);
    assert!(matches!(
        redelivered,
        Err(DropReason::Cooldown) | Err(DropReason::MinSpacing)
    ));
}

#[test]
fn sealed_bar_survives_the_wire() {
    let bar = SealedBar {
        close_ts: 1_700_000_040_000,
        open: 100.0,
        high: 101.0,
        low: 99.5,
        close: 100.5,
        vol: 12.0,
        vbuy: 7.0,
        vsell: 5.0,
        vwap: 100.4,
        tick_n: 9,
        gap: false,
    };
    let keys = KeySpace::new("");
    assert_eq!(keys.win("1m", SYM), "win:1m:{BTC-USDT-SWAP}");
    let fields: core_types::Fields = bar.to_fields().into_iter().collect();
    let msg = normalize_entry(&keys.win("1m", SYM), "1700000040001-0", fields, 0);
    // Payload ts (bar close) outranks the id time.
    assert_eq!(msg.ts, 1_700_000_040_000);
    assert_eq!(SealedBar::from_fields(&msg.fields).unwrap(), bar);
}
