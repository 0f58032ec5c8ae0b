//! Telemetry bootstrap: tracing subscriber wiring and the Prometheus
//! recorder, including the catalog of every metric series the pipeline
//! emits so `/metrics` carries HELP text from the first scrape.

use std::sync::OnceLock;

use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide subscriber: an env filter (defaulting to info
/// for the service and its workspace crates), a non-blocking stdout writer,
/// and a line or JSON format per `QUANT_LOG_JSON`. Returns `None` when a
/// subscriber is already installed (tests, embedded use); otherwise the
/// guard must stay alive for the writer to flush.
pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{service_name}=info,stream_bus=info,bar_window=info,market_env=info,info"
        ))
    });
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let json = std::env::var("QUANT_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(writer).json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(writer))
            .try_init()
    };

    installed.ok().map(|_| guard)
}

/// Install the Prometheus recorder once and register the pipeline's metric
/// catalog against it; later callers get the same handle back.
pub fn init_metrics() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("prometheus recorder install");
            describe_pipeline_metrics();
            handle
        })
        .clone()
}

fn describe_pipeline_metrics() {
    metrics::describe_counter!(
        "quant_trades_total",
        Unit::Count,
        "Trades consumed off the bus"
    );
    metrics::describe_counter!(
        "quant_trades_malformed_total",
        Unit::Count,
        "Inbound trades rejected at decode and left pending"
    );
    metrics::describe_counter!(
        "quant_flow_late_drop_total",
        Unit::Count,
        "Trades older than the 3s flow window"
    );
    metrics::describe_counter!(
        "quant_bars_sealed_total",
        Unit::Count,
        "Sealed bars per timeframe"
    );
    metrics::describe_counter!(
        "quant_detected_total",
        Unit::Count,
        "Signals published to the detected stream"
    );
    metrics::describe_counter!(
        "quant_aggregator_dropped_total",
        Unit::Count,
        "Aggregator candidates dropped, by gate reason"
    );
    metrics::describe_counter!(
        "quant_router_dropped_total",
        Unit::Count,
        "Detected signals dropped by the router, by gate reason"
    );
    metrics::describe_counter!(
        "quant_final_total",
        Unit::Count,
        "Signals accepted and published to the final stream"
    );
    metrics::describe_counter!(
        "quant_eval_bad_row_total",
        Unit::Count,
        "Final rows the evaluator could not parse"
    );
    metrics::describe_counter!(
        "quant_eval_no_entry_total",
        Unit::Count,
        "Final rows skipped for lack of an entry price"
    );
    metrics::describe_counter!(
        "quant_eval_done_total",
        Unit::Count,
        "Horizon evaluations resolved with a price"
    );
    metrics::describe_counter!(
        "quant_eval_miss_total",
        Unit::Count,
        "Horizon evaluations abandoned after retries"
    );
    metrics::describe_counter!(
        "quant_env_cycles_total",
        Unit::Count,
        "Completed market-env refresh cycles"
    );
    metrics::describe_gauge!(
        "quant_eval_open_jobs",
        Unit::Count,
        "Pending evaluation jobs"
    );
}
