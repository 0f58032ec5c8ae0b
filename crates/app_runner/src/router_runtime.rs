use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use core_types::{
    BookFrame, DetectedSignal, FinalSignal, KeySpace, PipelineEvent, TradeEvent, CG_ROUTER,
};
use signal_router::{DropReason, RouterConfig, RouterGate};
use stream_bus::{id_time_ms, ReadRequest, StreamBus, StreamMsg, Trim};

use crate::bus::RingBus;
use crate::gate_cache::GateCache;

const READ_COUNT: usize = 100;
const READ_BLOCK_MS: u64 = 300;
const CLAIM_MIN_IDLE_MS: i64 = 30_000;

pub(crate) struct RouterRuntime {
    bus: StreamBus,
    keys: KeySpace,
    symbols: Vec<String>,
    gate: RouterGate,
    gates: GateCache,
    ring: RingBus<PipelineEvent>,
    paused: Arc<AtomicBool>,
    consumer: String,
}

impl RouterRuntime {
    pub(crate) fn new(
        bus: StreamBus,
        keys: KeySpace,
        symbols: Vec<String>,
        cfg: RouterConfig,
        ring: RingBus<PipelineEvent>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        let gates = GateCache::new(bus.clone(), keys.clone());
        Self {
            bus,
            keys,
            symbols,
            gate: RouterGate::new(cfg),
            gates,
            ring,
            paused,
            consumer: format!("router#{}", std::process::id()),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let detected_keys: Vec<String> =
            self.symbols.iter().map(|s| self.keys.detected(s)).collect();

        for key in &detected_keys {
            let claimed = self
                .bus
                .autoclaim(key, CG_ROUTER, &self.consumer, CLAIM_MIN_IDLE_MS, 100)
                .await;
            for msg in claimed {
                self.handle(msg).await;
            }
        }

        let req = ReadRequest {
            keys: detected_keys,
            group: CG_ROUTER.to_string(),
            consumer: self.consumer.clone(),
            count: READ_COUNT,
            block_ms: READ_BLOCK_MS,
        };
        tracing::info!(symbols = self.symbols.len(), "signal router started");

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
        tracing::info!("signal router stopped");
    }

    async fn handle(&mut self, msg: StreamMsg) {
        let parsed = msg
            .sym
            .as_deref()
            .and_then(|sym| DetectedSignal::from_fields(sym, &msg.fields));
        let Some(sig) = parsed else {
            drop_counter(DropReason::BadRow);
            self.bus.ack(&msg.key, CG_ROUTER, &msg.id).await;
            return;
        };

        if self.paused.load(Ordering::Relaxed) {
            drop_counter(DropReason::Disabled);
            self.bus.ack(&msg.key, CG_ROUTER, &msg.id).await;
            return;
        }

        let gate = self.gates.get(sig.sym.as_str()).await;
        let wall_now = infra_clock::now_ms();

        let admit = match self.gate.admit(&sig, &gate, wall_now) {
            Ok(admit) => admit,
            Err(reason) => {
                drop_counter(reason);
                self.bus.ack(&msg.key, CG_ROUTER, &msg.id).await;
                return;
            }
        };

        // One-shot ownership of this (sym, dir, src, bucket); TTL is the only
        // release, so redeliveries cannot double-publish.
        let lock_key = self.keys.idem_lock(
            sig.sym.as_str(),
            sig.dir,
            sig.src(),
            admit.idem_bucket,
        );
        let locked = self
            .bus
            .set_nx_px(&lock_key, &msg.id, self.gate.cfg().idem_ttl_ms)
            .await;
        if !locked {
            drop_counter(DropReason::IdempotentLock);
            self.bus.ack(&msg.key, CG_ROUTER, &msg.id).await;
            return;
        }

        let final_sig = self.enrich(sig, admit.ttl_ms, wall_now).await;
        let final_key = self.keys.final_signals(final_sig.detected.sym.as_str());
        let Some(_id) = self
            .bus
            .xadd(&final_key, &final_sig.to_fields(), Trim::MaxLen(5_000))
            .await
        else {
            // Publish failed: leave the message pending so the group retries;
            // the idempotency lock guards against a double emit meanwhile.
            tracing::warn!(sym = %final_sig.detected.sym, "final publish failed, leaving unacked");
            return;
        };

        self.gate.commit(&final_sig.detected, wall_now);
        metrics::counter!("quant_final_total").increment(1);
        self.ring.publish_lossy(PipelineEvent::Final(final_sig));
        self.bus.ack(&msg.key, CG_ROUTER, &msg.id).await;
    }

    /// Attach a reference price: freshest book mid, falling back to the last
    /// trade; flag it stale past the freshness threshold.
    async fn enrich(&self, mut sig: DetectedSignal, ttl_ms: i64, wall_now: i64) -> FinalSignal {
        sig.ttl_ms = ttl_ms;
        let sym = sig.sym.clone();

        let mut ref_px: Option<f64> = None;
        let mut ref_source: Option<String> = None;
        let mut ref_ts: Option<i64> = None;

        if let Some((id, fields)) = self
            .bus
            .xrevrange_latest(&self.keys.book(&sym), 1)
            .await
            .first()
        {
            if let Some(book) = BookFrame::from_fields(fields) {
                if let Some(mid) = book.mid() {
                    ref_px = Some(mid);
                    ref_source = Some("mid".to_string());
                    ref_ts = Some(if book.ts > 0 {
                        book.ts
                    } else {
                        id_time_ms(id).unwrap_or(wall_now)
                    });
                }
            }
        }
        if ref_px.is_none() {
            if let Some((id, fields)) = self
                .bus
                .xrevrange_latest(&self.keys.trades(&sym), 1)
                .await
                .first()
            {
                if let Some(trade) = TradeEvent::from_fields(fields) {
                    ref_px = Some(trade.px);
                    ref_source = Some("last".to_string());
                    ref_ts = Some(if trade.ts > 0 {
                        trade.ts
                    } else {
                        id_time_ms(id).unwrap_or(wall_now)
                    });
                }
            }
        }

        let ref_stale =
            ref_ts.map(|ts| wall_now - ts > self.gate.cfg().ref_px_stale_ms);
        FinalSignal {
            detected: sig,
            ref_px,
            ref_px_source: ref_source,
            ref_px_ts: ref_ts,
            ref_px_stale: ref_stale,
        }
    }
}

fn drop_counter(reason: DropReason) {
    metrics::counter!("quant_router_dropped_total", "reason" => reason.as_str()).increment(1);
}
