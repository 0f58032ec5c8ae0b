mod bootstrap;
mod bus;
mod config_loader;
mod control_api;
mod env_runtime;
mod eval_runtime;
mod gate_cache;
mod price_resolver;
mod router_runtime;
mod window_runtime;
#[cfg(test)]
mod tests;

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use core_types::{KeySpace, PipelineError, PipelineEvent};
use stream_bus::StreamBus;

use crate::bus::RingBus;
use crate::control_api::ApiState;
use crate::env_runtime::EnvRuntime;
use crate::eval_runtime::EvalRuntime;
use crate::router_runtime::RouterRuntime;
use crate::window_runtime::WindowRuntime;

pub(crate) fn spawn_detached<F>(name: &'static str, critical: bool, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        fut.await;
        if critical {
            tracing::error!(task = name, "critical task exited");
        } else {
            tracing::debug!(task = name, "task exited");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = observability::init_tracing("quantflow");
    let prometheus = observability::init_metrics();

    let cfg = config_loader::load()?;
    tracing::info!(
        symbols = ?cfg.symbols,
        redis = %cfg.redis_url,
        prefix = %cfg.key_prefix,
        "quantflow starting"
    );

    let sbus = StreamBus::connect(&cfg.redis_url)
        .await
        .map_err(|err| PipelineError::BusUnavailable(err.to_string()))?;
    let keys = KeySpace::new(cfg.key_prefix.clone());

    bootstrap::ensure_groups(&sbus, &keys, &cfg.symbols).await?;
    if cfg.bootstrap_klines {
        bootstrap::warmup_klines(&sbus, &keys, &cfg.symbols).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ring: RingBus<PipelineEvent> = RingBus::new(8_192);
    let paused = Arc::new(AtomicBool::new(false));

    // Each consumer loop gets its own connection: a blocking group-read on
    // a shared multiplexed pipe would stall every other worker's commands
    // for the block window.
    let window = WindowRuntime::new(
        StreamBus::connect(&cfg.redis_url).await.context("redis connect (window)")?,
        keys.clone(),
        cfg.symbols.clone(),
        cfg.window.clone(),
        cfg.aggregator.clone(),
        cfg.detector,
        ring.clone(),
    );
    spawn_detached("window_worker", true, window.run(shutdown_rx.clone()));

    let env = EnvRuntime::new(sbus.clone(), keys.clone(), cfg.symbols.clone(), cfg.env.clone());
    spawn_detached("market_env", true, env.run(shutdown_rx.clone()));

    let router = RouterRuntime::new(
        StreamBus::connect(&cfg.redis_url).await.context("redis connect (router)")?,
        keys.clone(),
        cfg.symbols.clone(),
        cfg.router.clone(),
        ring.clone(),
        paused.clone(),
    );
    spawn_detached("signal_router", true, router.run(shutdown_rx.clone()));

    let eval = EvalRuntime::new(
        StreamBus::connect(&cfg.redis_url).await.context("redis connect (eval)")?,
        keys.clone(),
        cfg.symbols.clone(),
        cfg.eval.clone(),
        ring.clone(),
    );
    spawn_detached("signal_eval", true, eval.run(shutdown_rx.clone()));

    let api_state = ApiState {
        paused,
        bus: sbus,
        keys,
        symbols: cfg.symbols.clone(),
        prometheus,
    };
    let app = control_api::router(api_state);
    let addr: SocketAddr = cfg.http_addr.parse().context("parse QUANT_HTTP_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind control api")?;
    tracing::info!(%addr, "control api started");

    tokio::select! {
        res = axum::serve(listener, app).into_future() => {
            res.context("control api server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(true);
    // Workers observe the flag between iterations; give them one beat.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}
