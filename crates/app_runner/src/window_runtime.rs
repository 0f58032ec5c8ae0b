use tokio::sync::watch;

use bar_window::{TradeOutcome, WindowBook, WindowConfig};
use core_types::{KeySpace, PipelineEvent, Timeframe, TradeEvent, CG_WINDOW};
use intrabar_detector::{Aggregator, AggregatorConfig, DetectorCtx, GateParams, WinSnapshot};
use stream_bus::{ReadRequest, StreamBus, StreamMsg, Trim};

use crate::bus::RingBus;
use crate::config_loader::DetectorParams;
use crate::gate_cache::GateCache;

const READ_COUNT: usize = 200;
const READ_BLOCK_MS: u64 = 200;
const CLAIM_MIN_IDLE_MS: i64 = 30_000;
const STATE_TTL_S: i64 = 600;

pub(crate) struct WindowRuntime {
    bus: StreamBus,
    keys: KeySpace,
    symbols: Vec<String>,
    book: WindowBook,
    aggregator: Aggregator,
    detector: DetectorParams,
    gates: GateCache,
    ring: RingBus<PipelineEvent>,
    consumer: String,
}

impl WindowRuntime {
    pub(crate) fn new(
        bus: StreamBus,
        keys: KeySpace,
        symbols: Vec<String>,
        window_cfg: WindowConfig,
        agg_cfg: AggregatorConfig,
        detector: DetectorParams,
        ring: RingBus<PipelineEvent>,
    ) -> Self {
        let gates = GateCache::new(bus.clone(), keys.clone());
        Self {
            bus,
            keys,
            symbols,
            book: WindowBook::new(window_cfg),
            aggregator: Aggregator::new(agg_cfg),
            detector,
            gates,
            ring,
            consumer: format!("window#{}", std::process::id()),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let trade_keys: Vec<String> = self.symbols.iter().map(|s| self.keys.trades(s)).collect();

        // Recover anything a dead consumer left pending before reading new
        // entries.
        for key in &trade_keys {
            let claimed = self
                .bus
                .autoclaim(key, CG_WINDOW, &self.consumer, CLAIM_MIN_IDLE_MS, 100)
                .await;
            for msg in claimed {
                self.handle(msg).await;
            }
        }

        let req = ReadRequest {
            keys: trade_keys,
            group: CG_WINDOW.to_string(),
            consumer: self.consumer.clone(),
            count: READ_COUNT,
            block_ms: READ_BLOCK_MS,
        };
        tracing::info!(symbols = self.symbols.len(), "window worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(batch) = self.bus.read_group(&req).await else {
                continue;
            };
            for msg in batch {
                self.handle(msg).await;
            }
        }
        tracing::info!("window worker stopped");
    }

    async fn handle(&mut self, msg: StreamMsg) {
        let Some(sym) = msg.sym.clone() else {
            // Key without a hash-tag is not ours; ack so it cannot wedge the
            // group.
            self.bus.ack(&msg.key, CG_WINDOW, &msg.id).await;
            return;
        };
        let Some(trade) = TradeEvent::from_fields(&msg.fields) else {
            // Malformed trades stay pending by design: the row is kept for
            // later claim-side inspection instead of being silently lost.
            metrics::counter!("quant_trades_malformed_total").increment(1);
            return;
        };

        metrics::counter!("quant_trades_total").increment(1);
        let outcome = self.book.on_trade(&sym, &trade);
        if outcome.late_flow_drop {
            metrics::counter!("quant_flow_late_drop_total").increment(1);
        }

        self.publish_sealed(&sym, &outcome).await;
        self.write_state_hashes(&sym, !outcome.sealed.is_empty()).await;
        self.run_detector(&sym, &trade, &outcome).await;

        self.bus.ack(&msg.key, CG_WINDOW, &msg.id).await;
    }

    async fn publish_sealed(&self, sym: &str, outcome: &TradeOutcome) {
        for (tf, bar) in &outcome.sealed {
            let key = self.keys.win(tf.label(), sym);
            self.bus
                .xadd(&key, &bar.to_fields(), Trim::MaxLen(2_000))
                .await;
            metrics::counter!("quant_bars_sealed_total", "tf" => tf.label()).increment(1);
            self.ring.publish_lossy(PipelineEvent::BarSealed {
                sym: sym.to_string(),
                tf: *tf,
                bar: bar.clone(),
            });
        }
    }

    async fn write_state_hashes(&self, sym: &str, tf_touched: bool) {
        let now = infra_clock::now_ms();
        let Some(state) = self.book.state(sym) else {
            return;
        };
        if let Some(m1) = state.minute() {
            self.bus
                .hset_map(
                    &self.keys.win_state("1m", sym),
                    &m1.state_fields(now),
                    Some(STATE_TTL_S),
                )
                .await;
        }
        // Roll-up accumulators only move when a 1m bar seals.
        if tf_touched {
            for tf in Timeframe::ROLLUPS {
                if let Some(acc) = state.tf_accumulator(tf) {
                    self.bus
                        .hset_map(
                            &self.keys.win_state(tf.label(), sym),
                            &acc.state_fields(now),
                            Some(STATE_TTL_S),
                        )
                        .await;
                }
            }
        }
    }

    async fn run_detector(&mut self, sym: &str, trade: &TradeEvent, outcome: &TradeOutcome) {
        let gate = self.gates.get(sym).await;
        let Some(state) = self.book.state(sym) else {
            return;
        };
        let Some(m1) = state.minute() else {
            return;
        };
        let ctx = DetectorCtx {
            now: trade.ts,
            sym,
            win: WinSnapshot {
                open: m1.open,
                high: outcome.pre_high,
                low: outcome.pre_low,
                last: m1.last,
                atr: state.atr(),
            },
            last_prices: state.prices(),
            buy_notional_3s: state.flow().buy_notional(),
            sell_notional_3s: state.flow().sell_notional(),
            min_notional_3s: gate.min_notional_3s,
            breakout_band_pct: gate.breakout_band_pct,
            dyn_abs_delta: state.dyn_abs_delta(),
            dyn_delta_k: self.detector.dyn_delta_k,
            liq_k: self.detector.liq_k,
        };
        let gates = GateParams {
            min_strength: gate.eff_min0,
            cooldown_ms: gate.cooldown_ms,
            dedup_ms: gate.dedup_ms,
            min_move_bp: gate.min_move_bp,
            min_move_atr_ratio: gate.min_move_atr_ratio,
        };

        match self.aggregator.evaluate(&ctx, &gates) {
            Ok(signal) => {
                let key = self.keys.detected(sym);
                self.bus
                    .xadd(&key, &signal.to_fields(), Trim::MaxLen(5_000))
                    .await;
                metrics::counter!("quant_detected_total").increment(1);
                self.ring.publish_lossy(PipelineEvent::Detected(signal));
            }
            Err(reason) => {
                metrics::counter!("quant_aggregator_dropped_total", "reason" => reason.as_str())
                    .increment(1);
            }
        }
    }
}
