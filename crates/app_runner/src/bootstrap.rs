use std::time::Duration;

use anyhow::Result;

use core_types::{KeySpace, PipelineError, CG_EVAL, CG_ROUTER, CG_WINDOW};
use stream_bus::{StreamBus, Trim};

const BOOTSTRAP_HTTP_TIMEOUT: Duration = Duration::from_secs(6);
const BOOTSTRAP_TFS: [&str; 2] = ["5m", "15m"];

/// Create every consumer group idempotently, starting at `$` so only new
/// messages flow. A non-BUSYGROUP failure here is fatal for the process.
pub(crate) async fn ensure_groups(
    bus: &StreamBus,
    keys: &KeySpace,
    symbols: &[String],
) -> Result<()> {
    for sym in symbols {
        for (key, group) in [
            (keys.trades(sym), CG_WINDOW),
            (keys.detected(sym), CG_ROUTER),
            (keys.final_signals(sym), CG_EVAL),
        ] {
            bus.ensure_group(&key, group, "$")
                .await
                .map_err(|err| PipelineError::GroupSetup {
                    key: key.clone(),
                    detail: err.to_string(),
                })?;
        }
    }
    Ok(())
}

/// Best-effort kline warmup from the venue REST API so the market-env
/// percentiles have history right after a cold start. Hard 6s timeout and
/// every failure is ignored; the pipeline works without it, just with
/// neutral percentiles for the first bars.
pub(crate) async fn warmup_klines(bus: &StreamBus, keys: &KeySpace, symbols: &[String]) {
    let Ok(client) = reqwest::Client::builder()
        .timeout(BOOTSTRAP_HTTP_TIMEOUT)
        .build()
    else {
        return;
    };

    for sym in symbols {
        for tf in BOOTSTRAP_TFS {
            let url = format!(
                "https://www.okx.com/api/v5/market/candles?instId={sym}&bar={tf}&limit=48"
            );
            let Ok(resp) = client.get(&url).send().await else {
                tracing::debug!(sym, tf, "kline warmup fetch failed");
                continue;
            };
            let Ok(body) = resp.json::<serde_json::Value>().await else {
                continue;
            };
            let Some(rows) = body.get("data").and_then(|d| d.as_array()) else {
                continue;
            };
            let key = keys.kline(sym, tf);
            // Venue returns newest-first; append oldest-first.
            for row in rows.iter().rev() {
                let Some(cells) = row.as_array() else {
                    continue;
                };
                let cell = |i: usize| -> Option<String> {
                    cells.get(i).and_then(|v| v.as_str()).map(str::to_string)
                };
                let (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(vol)) = (
                    cell(0),
                    cell(1),
                    cell(2),
                    cell(3),
                    cell(4),
                    cell(5),
                ) else {
                    continue;
                };
                let mut fields = vec![
                    ("ts".to_string(), ts),
                    ("tf".to_string(), tf.to_string()),
                    ("o".to_string(), o),
                    ("h".to_string(), h),
                    ("l".to_string(), l),
                    ("c".to_string(), c),
                    ("vol".to_string(), vol),
                    ("confirm".to_string(), "1".to_string()),
                ];
                if let Some(quote_vol) = cell(7) {
                    fields.push(("volCcyQuote".to_string(), quote_vol));
                }
                bus.xadd(&key, &fields, Trim::MaxLen(500)).await;
            }
            tracing::info!(sym, tf, rows = rows.len(), "kline history warmed up");
        }
    }
}
