use anyhow::Result;

use bar_window::WindowConfig;
use core_types::{parse_symbol_list, PipelineError};
use intrabar_detector::AggregatorConfig;
use market_env::EnvConfig;
use signal_eval::{parse_horizons, parse_price_pref, EvalConfig};
use signal_router::RouterConfig;

/// Detector-layer scale factors that are static per process (the adaptive
/// tier rides the dyn-gate hash instead).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DetectorParams {
    pub dyn_delta_k: f64,
    pub liq_k: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            dyn_delta_k: 2.0,
            liq_k: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub symbols: Vec<String>,
    pub redis_url: String,
    pub key_prefix: String,
    pub http_addr: String,
    pub bootstrap_klines: bool,
    pub window: WindowConfig,
    pub aggregator: AggregatorConfig,
    pub detector: DetectorParams,
    pub router: RouterConfig,
    pub eval: EvalConfig,
    pub env: EnvConfig,
}

pub(crate) fn load() -> Result<AppConfig> {
    load_with(&|key| std::env::var(key).ok())
}

/// Env-injectable loader so tests can drive it without touching the
/// process environment.
pub(crate) fn load_with(lookup: &dyn Fn(&str) -> Option<String>) -> Result<AppConfig> {
    let raw_symbols = lookup("SYMBOLS")
        .or_else(|| lookup("OKX_ASSETS"))
        .or_else(|| lookup("OKX_SYMBOLS"))
        .unwrap_or_default();
    let symbols = parse_symbol_list(&raw_symbols);
    if symbols.is_empty() {
        return Err(PipelineError::NoSymbols.into());
    }

    let router = RouterConfig {
        enabled: bool_var(lookup, "SIGNALS_ENABLED").unwrap_or(true),
        strength_floor: f64_var(lookup, "SIGNAL_MIN_STRENGTH_FLOOR", 0.0, 1.0).unwrap_or(0.60),
        extra_cooldown_ms: i64_var(lookup, "SIGNAL_EXTRA_COOLDOWN_MS", 0, 600_000).unwrap_or(0),
        min_spacing_ms: i64_var(lookup, "SIGNAL_MIN_SPACING_MS", 0, 600_000).unwrap_or(10_000),
        hyst_hi: f64_var(lookup, "SIGNAL_HYST_HI", 0.0, 1.0).unwrap_or(0.75),
        hyst_lo: f64_var(lookup, "SIGNAL_HYST_LO", 0.0, 1.0).unwrap_or(0.55),
        idem_bucket_ms: i64_var(lookup, "SIGNAL_IDEM_BUCKET_MS", 1_000, 600_000).unwrap_or(8_000),
        idem_ttl_ms: i64_var(lookup, "SIGNAL_IDEM_TTL_MS", 1_000, 600_000).unwrap_or(10_000),
        ref_px_stale_ms: 200,
    };

    let eval = EvalConfig {
        horizons: {
            let parsed = parse_horizons(&lookup("EVAL_HORIZONS").unwrap_or_default());
            if parsed.is_empty() {
                parse_horizons("5m,15m")
            } else {
                parsed
            }
        },
        success_bp: f64_var(lookup, "EVAL_SUCCESS_BP", 0.0, 10_000.0).unwrap_or(5.0),
        neutral_band_bp: f64_var(lookup, "EVAL_NEUTRAL_BAND_BP", 0.0, 10_000.0).unwrap_or(2.0),
        fee_bp: f64_var(lookup, "EVAL_FEE_BP", 0.0, 10_000.0).unwrap_or(0.0),
        max_retry: i64_var(lookup, "EVAL_MAX_RETRY", 0, 1_000).unwrap_or(6) as u32,
        px_search_ms: i64_var(lookup, "EVAL_PX_SEARCH_MS", 1_000, 600_000).unwrap_or(15_000),
        price_pref: parse_price_pref(&lookup("EVAL_PRICE_PREF").unwrap_or_default()),
    };

    let env = EnvConfig {
        refresh_ms: i64_var(lookup, "ENV_REFRESH_MS", 1_000, 600_000).unwrap_or(10_000) as u64,
        kline_depth: i64_var(lookup, "ENV_KLINE_DEPTH", 8, 500).unwrap_or(48) as usize,
        ..EnvConfig::default()
    };

    let detector = DetectorParams {
        dyn_delta_k: f64_var(lookup, "QUANT_DYN_DELTA_K", 0.1, 100.0).unwrap_or(2.0),
        liq_k: f64_var(lookup, "QUANT_LIQ_K", 0.1, 100.0).unwrap_or(1.5),
    };

    Ok(AppConfig {
        symbols,
        redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        key_prefix: lookup("QUANT_KEY_PREFIX").unwrap_or_default(),
        http_addr: lookup("QUANT_HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string()),
        bootstrap_klines: bool_var(lookup, "QUANT_BOOTSTRAP_KLINES").unwrap_or(false),
        window: WindowConfig::default(),
        aggregator: AggregatorConfig::default(),
        detector,
        router,
        eval,
        env,
    })
}

fn bool_var(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
}

fn f64_var(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    min: f64,
    max: f64,
) -> Option<f64> {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(min, max))
}

fn i64_var(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    min: i64,
    max: i64,
) -> Option<i64> {
    lookup(key)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(min, max))
}
