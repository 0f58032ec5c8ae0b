use crate::frames::Side;

pub const CG_WINDOW: &str = "cg:window";
pub const CG_ROUTER: &str = "cg:signal-router";
pub const CG_EVAL: &str = "cg:signal-eval";

/// Builds every bus key the pipeline touches. Per-symbol keys wrap the
/// instrument in `{...}` so all state for one symbol hashes to one shard;
/// the optional process-wide prefix (e.g. `dev:`) is prepended verbatim.
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn trades(&self, sym: &str) -> String {
        format!("{}ws:{{{}}}:trades", self.prefix, sym)
    }

    pub fn book(&self, sym: &str) -> String {
        format!("{}ws:{{{}}}:book", self.prefix, sym)
    }

    pub fn kline(&self, sym: &str, tf: &str) -> String {
        format!("{}ws:{{{}}}:kline{}", self.prefix, sym, tf)
    }

    /// External backfill feed, e.g. `bf:{sym}:kline1m`.
    pub fn backfill_kline(&self, sym: &str, tf: &str) -> String {
        format!("{}bf:{{{}}}:kline{}", self.prefix, sym, tf)
    }

    pub fn oi(&self, sym: &str) -> String {
        format!("{}ws:{{{}}}:oi", self.prefix, sym)
    }

    pub fn funding(&self, sym: &str) -> String {
        format!("{}ws:{{{}}}:funding", self.prefix, sym)
    }

    pub fn win(&self, tf: &str, sym: &str) -> String {
        format!("{}win:{}:{{{}}}", self.prefix, tf, sym)
    }

    pub fn win_state(&self, tf: &str, sym: &str) -> String {
        format!("{}win:state:{}:{{{}}}", self.prefix, tf, sym)
    }

    pub fn detected(&self, sym: &str) -> String {
        format!("{}signal:detected:{{{}}}", self.prefix, sym)
    }

    pub fn final_signals(&self, sym: &str) -> String {
        format!("{}signal:final:{{{}}}", self.prefix, sym)
    }

    pub fn eval_done(&self, sym: &str) -> String {
        format!("{}eval:done:{{{}}}", self.prefix, sym)
    }

    pub fn dyn_gate(&self, sym: &str) -> String {
        format!("{}dyn:gate:{{{}}}", self.prefix, sym)
    }

    pub fn dyn_gate_log(&self, sym: &str) -> String {
        format!("{}dyn:gate:log:{{{}}}", self.prefix, sym)
    }

    pub fn state_oi(&self, sym: &str) -> String {
        format!("{}state:oi:{{{}}}", self.prefix, sym)
    }

    pub fn state_funding(&self, sym: &str) -> String {
        format!("{}state:funding:{{{}}}", self.prefix, sym)
    }

    pub fn idem_lock(&self, sym: &str, dir: Side, src: &str, bucket_ts: i64) -> String {
        format!(
            "{}idem:final:{{{}}}:{}:{}:{}",
            self.prefix,
            sym,
            dir.as_str(),
            src,
            bucket_ts
        )
    }
}

/// Instrument id between the `{...}` hash-tag braces, if any.
pub fn symbol_from_key(key: &str) -> Option<&str> {
    let start = key.find('{')?;
    let end = key[start + 1..].find('}')?;
    let sym = &key[start + 1..start + 1 + end];
    if sym.is_empty() {
        None
    } else {
        Some(sym)
    }
}

/// Stream kind from the final `:`-separated key segment. `kline{tf}`
/// segments fold to kind `kline` with the timeframe split out.
pub fn kind_from_key(key: &str) -> (String, Option<String>) {
    let last = key.rsplit(':').next().unwrap_or(key);
    if let Some(tf) = last.strip_prefix("kline") {
        if !tf.is_empty() {
            return ("kline".to_string(), Some(tf.to_string()));
        }
    }
    (last.to_string(), None)
}
