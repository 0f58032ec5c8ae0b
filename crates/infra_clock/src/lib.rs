use chrono::Utc;

pub const MINUTE_MS: i64 = 60_000;

/// Wall-clock milliseconds UTC. All bus timestamps use this scale.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Start of the minute containing `ts_ms`.
pub fn floor_to_minute(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Smallest minute boundary at or after `ts_ms`.
pub fn ceil_to_next_minute(ts_ms: i64) -> i64 {
    let floor = floor_to_minute(ts_ms);
    if floor == ts_ms {
        ts_ms
    } else {
        floor + MINUTE_MS
    }
}

/// Close timestamp of the `span_ms` bucket containing `ts_ms`.
/// A tick at exactly the boundary opens the next bucket.
pub fn bucket_close(ts_ms: i64, span_ms: i64) -> i64 {
    ts_ms.div_euclid(span_ms) * span_ms + span_ms
}

/// Close timestamp of the higher-timeframe bucket that a sealed bar with
/// close `bar_close_ms` contributes to. The `-1` keeps a bar closing exactly
/// on the TF boundary inside that TF bucket rather than the next one.
pub fn rollup_close(bar_close_ms: i64, span_ms: i64) -> i64 {
    (bar_close_ms - 1).div_euclid(span_ms) * span_ms + span_ms
}
