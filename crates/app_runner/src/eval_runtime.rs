use std::time::{Duration, Instant};

use tokio::sync::watch;

use core_types::{FinalSignal, KeySpace, PipelineEvent, CG_EVAL};
use signal_eval::{entry_price_from_final, EvalConfig, JobBook};
use stream_bus::{ReadRequest, StreamBus, StreamMsg, Trim};

use crate::bus::RingBus;
use crate::price_resolver::PriceResolver;

const READ_COUNT: usize = 100;
const READ_BLOCK_MS: u64 = 200;
const CLAIM_MIN_IDLE_MS: i64 = 30_000;
const RESOLVE_TICK: Duration = Duration::from_secs(1);

/// Intake and resolve run in one task so the job book stays single-owner:
/// the loop alternates a short blocking group-read with a 1-second resolve
/// tick.
pub(crate) struct EvalRuntime {
    bus: StreamBus,
    keys: KeySpace,
    symbols: Vec<String>,
    cfg: EvalConfig,
    book: JobBook,
    resolver: PriceResolver,
    ring: RingBus<PipelineEvent>,
    consumer: String,
}

impl EvalRuntime {
    pub(crate) fn new(
        bus: StreamBus,
        keys: KeySpace,
        symbols: Vec<String>,
        cfg: EvalConfig,
        ring: RingBus<PipelineEvent>,
    ) -> Self {
        let resolver = PriceResolver::new(
            bus.clone(),
            keys.clone(),
            cfg.px_search_ms,
            cfg.price_pref.clone(),
        );
        Self {
            bus,
            keys,
            symbols,
            cfg,
            book: JobBook::default(),
            resolver,
            ring,
            consumer: format!("eval#{}", std::process::id()),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let final_keys: Vec<String> = self
            .symbols
            .iter()
            .map(|s| self.keys.final_signals(s))
            .collect();

        for key in &final_keys {
            let claimed = self
                .bus
                .autoclaim(key, CG_EVAL, &self.consumer, CLAIM_MIN_IDLE_MS, 100)
                .await;
            for msg in claimed {
                self.intake(msg).await;
            }
        }

        let req = ReadRequest {
            keys: final_keys,
            group: CG_EVAL.to_string(),
            consumer: self.consumer.clone(),
            count: READ_COUNT,
            block_ms: READ_BLOCK_MS,
        };
        tracing::info!(symbols = self.symbols.len(), "signal evaluator started");

        let mut last_tick = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(batch) = self.bus.read_group(&req).await {
                for msg in batch {
                    self.intake(msg).await;
                }
            }
            if last_tick.elapsed() >= RESOLVE_TICK {
                last_tick = Instant::now();
                self.resolve_tick().await;
            }
        }
        tracing::info!(open_jobs = self.book.len(), "signal evaluator stopped");
    }

    async fn intake(&mut self, msg: StreamMsg) {
        let parsed = msg
            .sym
            .as_deref()
            .and_then(|sym| FinalSignal::from_fields(sym, &msg.fields));
        let Some(sig) = parsed else {
            metrics::counter!("quant_eval_bad_row_total").increment(1);
            self.bus.ack(&msg.key, CG_EVAL, &msg.id).await;
            return;
        };

        let sym = sig.detected.sym.clone();
        let ts0 = sig.detected.ts;

        // Entry price: the enriched refPx when it is fresh enough, otherwise
        // a resolver pass anchored at the signal time.
        let entry = match entry_price_from_final(&sig, self.cfg.px_search_ms) {
            Some((px, source)) => Some((px, source)),
            None => self
                .resolver
                .resolve(&sym, ts0)
                .await
                .map(|r| (r.px, r.source)),
        };
        let Some((p0, p0_src)) = entry else {
            metrics::counter!("quant_eval_no_entry_total").increment(1);
            self.bus.ack(&msg.key, CG_EVAL, &msg.id).await;
            return;
        };

        let added = self.book.enqueue(
            &msg.id,
            &sym,
            sig.detected.dir,
            ts0,
            p0,
            &p0_src,
            &self.cfg.horizons,
        );
        if added > 0 {
            metrics::gauge!("quant_eval_open_jobs").set(self.book.len() as f64);
        }
        self.bus.ack(&msg.key, CG_EVAL, &msg.id).await;
    }

    async fn resolve_tick(&mut self) {
        let now = infra_clock::now_ms();
        for key in self.book.due_keys(now) {
            let Some(job) = self.book.get(&key) else {
                continue;
            };
            let (sym, due_at) = (job.sym.clone(), job.due_at);
            let resolved = self.resolver.resolve(&sym, due_at).await;
            let Some(row) = self.book.settle(&key, resolved, &self.cfg) else {
                continue; // retrying
            };

            if row.miss_px {
                metrics::counter!("quant_eval_miss_total").increment(1);
            } else {
                metrics::counter!("quant_eval_done_total").increment(1);
            }
            self.bus
                .xadd(
                    &self.keys.eval_done(&sym),
                    &row.to_fields(),
                    Trim::MaxLen(5_000),
                )
                .await;
            self.ring.publish_lossy(PipelineEvent::EvalDone(row));
        }
        metrics::gauge!("quant_eval_open_jobs").set(self.book.len() as f64);
    }
}
