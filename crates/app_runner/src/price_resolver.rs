use core_types::{get_f64, get_i64, Fields, KeySpace};
use signal_eval::{PriceSource, Resolved};
use stream_bus::{id_time_ms, StreamBus};

const FETCH_CAP: usize = 2_000;

/// Walks the configured source preference list around a target time and
/// returns the row closest to it. One failing or empty source never aborts
/// the walk.
pub(crate) struct PriceResolver {
    bus: StreamBus,
    keys: KeySpace,
    window_ms: i64,
    pref: Vec<PriceSource>,
}

impl PriceResolver {
    pub(crate) fn new(
        bus: StreamBus,
        keys: KeySpace,
        window_ms: i64,
        pref: Vec<PriceSource>,
    ) -> Self {
        Self {
            bus,
            keys,
            window_ms,
            pref,
        }
    }

    pub(crate) async fn resolve(&self, sym: &str, t: i64) -> Option<Resolved> {
        for source in &self.pref {
            let key = match source {
                PriceSource::Mid => self.keys.book(sym),
                PriceSource::Last => self.keys.trades(sym),
                PriceSource::Win1m => self.keys.win("1m", sym),
                PriceSource::WsKline1m => self.keys.kline(sym, "1m"),
                PriceSource::BfKline1m => self.keys.backfill_kline(sym, "1m"),
            };
            let rows = self
                .bus
                .xrange_by_time(&key, t - self.window_ms, t + self.window_ms, FETCH_CAP)
                .await;
            if let Some(found) = closest_price(&rows, t, *source) {
                return Some(found);
            }
        }
        None
    }
}

/// Pick the in-window row whose timestamp minimizes `|ts - t|`, decoding the
/// price per source kind. Rows without a usable price are skipped.
fn closest_price(rows: &[(String, Fields)], t: i64, source: PriceSource) -> Option<Resolved> {
    let mut best: Option<Resolved> = None;
    for (id, fields) in rows {
        let Some(px) = price_of(fields, source) else {
            continue;
        };
        let ts = get_i64(fields, &["ts"])
            .or_else(|| id_time_ms(id))
            .unwrap_or(t);
        let candidate = Resolved {
            px,
            ts,
            source: source.as_str().to_string(),
        };
        match &best {
            Some(current) if (current.ts - t).abs() <= (ts - t).abs() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

fn price_of(fields: &Fields, source: PriceSource) -> Option<f64> {
    match source {
        PriceSource::Mid => {
            let bid = get_f64(fields, &["bid1.px"])?;
            let ask = get_f64(fields, &["ask1.px"])?;
            if bid > 0.0 && ask > 0.0 {
                Some((bid + ask) / 2.0)
            } else {
                None
            }
        }
        PriceSource::Last => get_f64(fields, &["px"]).filter(|px| *px > 0.0),
        PriceSource::Win1m | PriceSource::WsKline1m | PriceSource::BfKline1m => {
            get_f64(fields, &["close", "c"]).filter(|px| *px > 0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, pairs: &[(&str, &str)]) -> (String, Fields) {
        (
            id.to_string(),
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn closest_row_wins() {
        let rows = vec![
            row("1000-0", &[("ts", "1000"), ("px", "100.0")]),
            row("4000-0", &[("ts", "4000"), ("px", "101.0")]),
            row("9000-0", &[("ts", "9000"), ("px", "102.0")]),
        ];
        let found = closest_price(&rows, 5_000, PriceSource::Last).unwrap();
        assert_eq!(found.px, 101.0);
        assert_eq!(found.ts, 4_000);
        assert_eq!(found.source, "last");
    }

    #[test]
    fn mid_requires_both_sides() {
        let rows = vec![
            row("1-0", &[("ts", "1"), ("bid1.px", "99"), ("ask1.px", "0")]),
            row("2-0", &[("ts", "2"), ("bid1.px", "99"), ("ask1.px", "101")]),
        ];
        let found = closest_price(&rows, 1, PriceSource::Mid).unwrap();
        assert_eq!(found.px, 100.0);
        assert_eq!(found.ts, 2);
    }

    #[test]
    fn kline_accepts_both_close_aliases() {
        let short = vec![row("5-0", &[("ts", "5"), ("c", "42.0")])];
        assert_eq!(
            closest_price(&short, 5, PriceSource::WsKline1m).unwrap().px,
            42.0
        );
        let long = vec![row("5-0", &[("ts", "5"), ("close", "43.0")])];
        assert_eq!(
            closest_price(&long, 5, PriceSource::Win1m).unwrap().px,
            43.0
        );
    }

    #[test]
    fn id_time_backfills_missing_ts() {
        let rows = vec![row("7000-0", &[("px", "50.0")])];
        let found = closest_price(&rows, 6_000, PriceSource::Last).unwrap();
        assert_eq!(found.ts, 7_000);
    }

    #[test]
    fn unusable_rows_are_skipped() {
        let rows = vec![
            row("1-0", &[("ts", "1"), ("px", "0")]),
            row("2-0", &[("ts", "2")]),
        ];
        assert!(closest_price(&rows, 1, PriceSource::Last).is_none());
    }
}
