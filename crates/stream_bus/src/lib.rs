//! Thin, typed operations over the Redis-Streams bus.
//!
//! Every method swallows transport errors after logging them: producers are
//! never poisoned by a consumer-side failure, and read paths surface `None`
//! so callers idle briefly and retry. Unacked messages reappear through the
//! consumer group and are recovered with `XAUTOCLAIM` on restart.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply, StreamRangeReply};
use redis::Value;
use smol_str::SmolStr;

use core_types::{get_i64, kind_from_key, symbol_from_key, Fields};

/// Approximate trim applied on append. `MaxLen` keeps roughly the newest N
/// entries; `MinId` drops entries older than the given wall-clock ms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trim {
    None,
    MaxLen(usize),
    MinId(i64),
}

/// One normalized message off a consumer-group read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMsg {
    pub key: String,
    pub id: String,
    pub sym: Option<SmolStr>,
    pub kind: String,
    pub tf: Option<String>,
    pub ts: i64,
    pub fields: Fields,
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub keys: Vec<String>,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    pub block_ms: u64,
}

#[derive(Clone)]
pub struct StreamBus {
    conn: MultiplexedConnection,
}

impl StreamBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// Append one row. Empty values are omitted; id is returned on success,
    /// `None` after a logged failure.
    pub async fn xadd(&self, key: &str, fields: &[(String, String)], trim: Trim) -> Option<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        match trim {
            Trim::None => {}
            Trim::MaxLen(n) => {
                cmd.arg("MAXLEN").arg("~").arg(n);
            }
            Trim::MinId(ms) => {
                cmd.arg("MINID").arg("~").arg(format!("{ms}-0"));
            }
        }
        cmd.arg("*");
        let mut wrote = 0usize;
        for (k, v) in fields {
            if v.is_empty() {
                continue;
            }
            cmd.arg(k).arg(v);
            wrote += 1;
        }
        if wrote == 0 {
            return None;
        }
        let mut conn = self.conn.clone();
        match cmd.query_async::<String>(&mut conn).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(?err, key, "xadd failed");
                None
            }
        }
    }

    /// Idempotent group creation; an existing group (BUSYGROUP) is success.
    pub async fn ensure_group(&self, key: &str, group: &str, start: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let res = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async::<Value>(&mut conn)
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(anyhow!("group create {group} on {key}: {err}")),
        }
    }

    /// Blocking consumer-group read over many keys with the `>` cursor.
    /// `None` covers both "nothing arrived" and a logged transport error;
    /// callers treat the two identically.
    pub async fn read_group(&self, req: &ReadRequest) -> Option<Vec<StreamMsg>> {
        if req.keys.is_empty() {
            return None;
        }
        let opts = StreamReadOptions::default()
            .group(&req.group, &req.consumer)
            .count(req.count)
            .block(req.block_ms as usize);
        let cursors: Vec<&str> = req.keys.iter().map(|_| ">").collect();
        let mut conn = self.conn.clone();
        // A BLOCK timeout comes back as Nil, hence the Option wrapper.
        let reply: Option<StreamReadReply> = match redis::cmd("XREADGROUP")
            .arg(&opts)
            .arg("STREAMS")
            .arg(&req.keys)
            .arg(&cursors)
            .query_async(&mut conn)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                if !err.is_timeout() {
                    tracing::warn!(?err, group = %req.group, "read_group failed");
                }
                return None;
            }
        };
        let reply = reply?;

        let now = infra_clock::now_ms();
        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let fields = flatten_value_map(&entry.map);
                out.push(normalize_entry(&stream_key.key, &entry.id, fields, now));
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Ack failures are logged and dropped; the message simply reappears.
    pub async fn ack(&self, key: &str, group: &str, id: &str) {
        let mut conn = self.conn.clone();
        let res = redis::cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(id)
            .query_async::<i64>(&mut conn)
            .await;
        if let Err(err) = res {
            tracing::warn!(?err, key, id, "xack failed");
        }
    }

    /// Entries with ids in `[from_ms, to_ms]`, oldest first.
    pub async fn xrange_by_time(
        &self,
        key: &str,
        from_ms: i64,
        to_ms: i64,
        count: usize,
    ) -> Vec<(String, Fields)> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = match redis::cmd("XRANGE")
            .arg(key)
            .arg(format!("{from_ms}-0"))
            .arg(format!("{to_ms}-999999"))
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(?err, key, "xrange failed");
                return Vec::new();
            }
        };
        reply
            .ids
            .into_iter()
            .map(|e| (e.id, flatten_value_map(&e.map)))
            .collect()
    }

    /// Newest `n` entries, newest first.
    pub async fn xrevrange_latest(&self, key: &str, n: usize) -> Vec<(String, Fields)> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = match redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(n)
            .query_async(&mut conn)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(?err, key, "xrevrange failed");
                return Vec::new();
            }
        };
        reply
            .ids
            .into_iter()
            .map(|e| (e.id, flatten_value_map(&e.map)))
            .collect()
    }

    /// Number of entries with ids inside `[from_ms, to_ms]`, capped at `cap`.
    pub async fn count_in_range(&self, key: &str, from_ms: i64, to_ms: i64, cap: usize) -> usize {
        self.xrange_by_time(key, from_ms, to_ms, cap).await.len()
    }

    /// Reclaim pending entries idle for at least `min_idle_ms`, walking the
    /// cursor for at most three pages per call.
    pub async fn autoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: i64,
        page: usize,
    ) -> Vec<StreamMsg> {
        let mut out = Vec::new();
        let mut cursor = "0-0".to_string();
        let now = infra_clock::now_ms();
        for _ in 0..3 {
            let mut conn = self.conn.clone();
            let reply: Value = match redis::cmd("XAUTOCLAIM")
                .arg(key)
                .arg(group)
                .arg(consumer)
                .arg(min_idle_ms)
                .arg(&cursor)
                .arg("COUNT")
                .arg(page)
                .query_async(&mut conn)
                .await
            {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(?err, key, group, "xautoclaim failed");
                    return out;
                }
            };
            let Some((next, entries)) = parse_autoclaim_reply(&reply) else {
                return out;
            };
            for (id, fields) in entries {
                out.push(normalize_entry(key, &id, fields, now));
            }
            if next == "0-0" {
                break;
            }
            cursor = next;
        }
        out
    }

    pub async fn hset_map(&self, key: &str, fields: &[(String, String)], ttl_s: Option<i64>) {
        if fields.is_empty() {
            return;
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        let mut conn = self.conn.clone();
        if let Err(err) = cmd.query_async::<i64>(&mut conn).await {
            tracing::warn!(?err, key, "hset failed");
            return;
        }
        if let Some(secs) = ttl_s {
            self.expire(key, secs).await;
        }
    }

    pub async fn hgetall(&self, key: &str) -> Fields {
        let mut conn = self.conn.clone();
        match redis::cmd("HGETALL")
            .arg(key)
            .query_async::<HashMap<String, String>>(&mut conn)
            .await
        {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(?err, key, "hgetall failed");
                Fields::new()
            }
        }
    }

    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<Option<String>>(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(?err, key, field, "hget failed");
                None
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl_s: i64) {
        let mut conn = self.conn.clone();
        let res = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_s)
            .query_async::<i64>(&mut conn)
            .await;
        if let Err(err) = res {
            tracing::warn!(?err, key, "expire failed");
        }
    }

    /// One-shot lock: create-if-absent with a PX ttl. `true` means this
    /// caller owns the bucket; release is by expiry only.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: i64) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<Option<String>>(&mut conn)
            .await
        {
            Ok(reply) => reply.is_some(),
            Err(err) => {
                tracing::warn!(?err, key, "set nx failed");
                false
            }
        }
    }
}

/// Flatten a stream entry's `[k, v, k, v, …]` value map into strings.
/// Non-string values are rendered through the redis conversion so integer
/// replies stay readable.
pub fn flatten_value_map(map: &HashMap<String, Value>) -> Fields {
    let mut out = Fields::with_capacity(map.len());
    for (k, v) in map {
        if let Ok(s) = redis::from_redis_value::<String>(v) {
            out.insert(k.clone(), s);
        }
    }
    out
}

/// Millisecond part of a `<ms>-<seq>` stream id.
pub fn id_time_ms(id: &str) -> Option<i64> {
    id.split('-').next()?.parse::<i64>().ok()
}

/// Derive symbol/kind/ts for one raw entry. Timestamp priority is the
/// payload `ts`, then the id time, then the caller's clock.
pub fn normalize_entry(key: &str, id: &str, mut fields: Fields, now_ms: i64) -> StreamMsg {
    let sym = symbol_from_key(key).map(SmolStr::new);
    let (kind, tf) = kind_from_key(key);
    if let Some(tf) = &tf {
        fields.entry("_tf".to_string()).or_insert_with(|| tf.clone());
    }
    let ts = get_i64(&fields, &["ts"])
        .or_else(|| id_time_ms(id))
        .unwrap_or(now_ms);
    StreamMsg {
        key: key.to_string(),
        id: id.to_string(),
        sym,
        kind,
        tf,
        ts,
        fields,
    }
}

fn parse_autoclaim_reply(reply: &Value) -> Option<(String, Vec<(String, Fields)>)> {
    let Value::Array(items) = reply else {
        return None;
    };
    let next = redis::from_redis_value::<String>(items.first()?).ok()?;
    let Value::Array(entries) = items.get(1)? else {
        return None;
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(pair) = entry else {
            continue;
        };
        let Some(id) = pair.first().and_then(|v| redis::from_redis_value::<String>(v).ok()) else {
            continue;
        };
        let mut fields = Fields::new();
        if let Some(Value::Array(kvs)) = pair.get(1) {
            let mut iter = kvs.iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                if let (Ok(k), Ok(v)) = (
                    redis::from_redis_value::<String>(k),
                    redis::from_redis_value::<String>(v),
                ) {
                    fields.insert(k, v);
                }
            }
        }
        out.push((id, fields));
    }
    Some((next, out))
}
