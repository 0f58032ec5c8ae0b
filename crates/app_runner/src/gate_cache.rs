use std::collections::HashMap;
use std::time::{Duration, Instant};

use core_types::{GateSnapshot, KeySpace};
use stream_bus::StreamBus;

/// Per-task dyn-gate read cache. One second of staleness is the documented
/// contract for gate readers, which bounds the hash read rate per symbol.
pub(crate) struct GateCache {
    bus: StreamBus,
    keys: KeySpace,
    ttl: Duration,
    entries: HashMap<String, (Instant, GateSnapshot)>,
}

impl GateCache {
    pub(crate) fn new(bus: StreamBus, keys: KeySpace) -> Self {
        Self {
            bus,
            keys,
            ttl: Duration::from_secs(1),
            entries: HashMap::new(),
        }
    }

    pub(crate) async fn get(&mut self, sym: &str) -> GateSnapshot {
        if let Some((at, snap)) = self.entries.get(sym) {
            if at.elapsed() < self.ttl {
                return snap.clone();
            }
        }
        let fields = self.bus.hgetall(&self.keys.dyn_gate(sym)).await;
        let snap = GateSnapshot::from_fields(&fields);
        self.entries
            .insert(sym.to_string(), (Instant::now(), snap.clone()));
        snap
    }
}
