use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fields::{fmt_bool, fmt_f64, get_bool, get_f64, get_i64, get_str, push_field, Fields};

/// Taker side of a trade, also the direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
}

impl Timeframe {
    pub const ROLLUPS: [Timeframe; 2] = [Timeframe::M5, Timeframe::M15];

    pub fn span_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 300_000,
            Timeframe::M15 => 900_000,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
        }
    }

    pub fn parse(raw: &str) -> Option<Timeframe> {
        match raw.trim() {
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One trade off `ws:{sym}:trades`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub ts: i64,
    pub px: f64,
    pub qty: f64,
    pub side: Side,
    pub trade_id: Option<String>,
    pub taker: Option<bool>,
    pub recv_ts: Option<i64>,
    pub ingest_id: Option<String>,
}

impl TradeEvent {
    /// Strict edge validation: `px > 0`, `qty >= 0`, both finite.
    pub fn from_fields(fields: &Fields) -> Option<TradeEvent> {
        let ts = get_i64(fields, &["ts"])?;
        let px = get_f64(fields, &["px"])?;
        let qty = get_f64(fields, &["qty"])?;
        if px <= 0.0 || qty < 0.0 {
            return None;
        }
        let side = Side::parse(get_str(fields, &["side"])?)?;
        Some(TradeEvent {
            ts,
            px,
            qty,
            side,
            trade_id: get_str(fields, &["tradeId"]).map(str::to_string),
            taker: get_bool(fields, &["taker"]),
            recv_ts: get_i64(fields, &["recvTs"]),
            ingest_id: get_str(fields, &["ingestId"]).map(str::to_string),
        })
    }
}

/// Top-of-book frame off `ws:{sym}:book`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookFrame {
    pub ts: i64,
    pub bid_px: f64,
    pub bid_sz: f64,
    pub ask_px: f64,
    pub ask_sz: f64,
    pub bid_sz10: Option<f64>,
    pub ask_sz10: Option<f64>,
    pub spread: Option<f64>,
    pub snapshot: bool,
}

impl BookFrame {
    pub fn from_fields(fields: &Fields) -> Option<BookFrame> {
        let ts = get_i64(fields, &["ts"])?;
        Some(BookFrame {
            ts,
            bid_px: get_f64(fields, &["bid1.px"]).unwrap_or(0.0),
            bid_sz: get_f64(fields, &["bid1.sz"]).unwrap_or(0.0),
            ask_px: get_f64(fields, &["ask1.px"]).unwrap_or(0.0),
            ask_sz: get_f64(fields, &["ask1.sz"]).unwrap_or(0.0),
            bid_sz10: get_f64(fields, &["bidSz10"]),
            ask_sz10: get_f64(fields, &["askSz10"]),
            spread: get_f64(fields, &["spread"]),
            snapshot: get_bool(fields, &["snapshot"]).unwrap_or(false),
        })
    }

    /// Mid price when both sides are quoted.
    pub fn mid(&self) -> Option<f64> {
        if self.bid_px > 0.0 && self.ask_px > 0.0 {
            Some((self.bid_px + self.ask_px) / 2.0)
        } else {
            None
        }
    }
}

/// Kline row; `ts` is bar-open on the external feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineFrame {
    pub ts: i64,
    pub tf: Option<String>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub quote_vol: Option<f64>,
    pub confirm: bool,
}

impl KlineFrame {
    pub fn from_fields(fields: &Fields) -> Option<KlineFrame> {
        let ts = get_i64(fields, &["ts"])?;
        let close = get_f64(fields, &["c", "close"])?;
        Some(KlineFrame {
            ts,
            tf: get_str(fields, &["tf", "_tf"]).map(str::to_string),
            open: get_f64(fields, &["o", "open"]).unwrap_or(close),
            high: get_f64(fields, &["h", "high"]).unwrap_or(close),
            low: get_f64(fields, &["l", "low"]).unwrap_or(close),
            close,
            vol: get_f64(fields, &["vol"]).unwrap_or(0.0),
            quote_vol: get_f64(fields, &["volCcyQuote", "quoteVol"]),
            confirm: get_bool(fields, &["confirm"]).unwrap_or(false),
        })
    }

    /// Quote-currency liquidity proxy: prefer the quote volume the venue
    /// reports, fall back to `vol * close`.
    pub fn quote_liquidity(&self) -> f64 {
        self.quote_vol.unwrap_or(self.vol * self.close)
    }
}

/// Open-interest sample off `ws:{sym}:oi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OiFrame {
    pub ts: i64,
    pub oi: f64,
    pub oi_ccy: Option<f64>,
}

impl OiFrame {
    pub fn from_fields(fields: &Fields) -> Option<OiFrame> {
        let ts = get_i64(fields, &["ts"])?;
        let oi = get_f64(fields, &["oi"])?;
        Some(OiFrame {
            ts,
            oi,
            oi_ccy: get_f64(fields, &["oiCcy"]),
        })
    }

    pub fn value(&self) -> f64 {
        self.oi_ccy.unwrap_or(self.oi)
    }
}

/// Funding sample off `ws:{sym}:funding` / Hash `state:funding:{sym}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingFrame {
    pub ts: i64,
    pub rate: f64,
    pub next_funding_time: Option<i64>,
}

impl FundingFrame {
    pub fn from_fields(fields: &Fields) -> Option<FundingFrame> {
        let ts = get_i64(fields, &["ts"])?;
        let rate = get_f64(fields, &["rate"])?;
        Some(FundingFrame {
            ts,
            rate,
            next_funding_time: get_i64(fields, &["nextFundingTime"]),
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(3);
        push_field(&mut out, "ts", self.ts.to_string());
        push_field(&mut out, "rate", fmt_f64(self.rate));
        if let Some(next) = self.next_funding_time {
            push_field(&mut out, "nextFundingTime", next.to_string());
        }
        out
    }
}

/// Sealed bar as appended to `win:{tf}:{sym}`; `ts` is bar close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBar {
    pub close_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub vbuy: f64,
    pub vsell: f64,
    pub vwap: f64,
    pub tick_n: u64,
    pub gap: bool,
}

impl SealedBar {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(11);
        push_field(&mut out, "ts", self.close_ts.to_string());
        push_field(&mut out, "open", fmt_f64(self.open));
        push_field(&mut out, "high", fmt_f64(self.high));
        push_field(&mut out, "low", fmt_f64(self.low));
        push_field(&mut out, "close", fmt_f64(self.close));
        push_field(&mut out, "vol", fmt_f64(self.vol));
        push_field(&mut out, "vbuy", fmt_f64(self.vbuy));
        push_field(&mut out, "vsell", fmt_f64(self.vsell));
        push_field(&mut out, "vwap", fmt_f64(self.vwap));
        push_field(&mut out, "tickN", self.tick_n.to_string());
        push_field(&mut out, "gap", fmt_bool(self.gap));
        out
    }

    pub fn from_fields(fields: &Fields) -> Option<SealedBar> {
        let close_ts = get_i64(fields, &["ts"])?;
        let close = get_f64(fields, &["close", "c"])?;
        Some(SealedBar {
            close_ts,
            open: get_f64(fields, &["open", "o"]).unwrap_or(close),
            high: get_f64(fields, &["high", "h"]).unwrap_or(close),
            low: get_f64(fields, &["low", "l"]).unwrap_or(close),
            close,
            vol: get_f64(fields, &["vol"]).unwrap_or(0.0),
            vbuy: get_f64(fields, &["vbuy"]).unwrap_or(0.0),
            vsell: get_f64(fields, &["vsell"]).unwrap_or(0.0),
            vwap: get_f64(fields, &["vwap"]).unwrap_or(close),
            tick_n: get_i64(fields, &["tickN"]).unwrap_or(0).max(0) as u64,
            gap: get_bool(fields, &["gap"]).unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn side_roundtrip() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.to_string(), "sell");
    }

    #[test]
    fn trade_rejects_bad_numbers() {
        let good = map(&[("ts", "1000"), ("px", "100.5"), ("qty", "2"), ("side", "buy")]);
        assert!(TradeEvent::from_fields(&good).is_some());

        let zero_px = map(&[("ts", "1000"), ("px", "0"), ("qty", "2"), ("side", "buy")]);
        assert!(TradeEvent::from_fields(&zero_px).is_none());

        let nan_qty = map(&[("ts", "1000"), ("px", "1"), ("qty", "NaN"), ("side", "buy")]);
        assert!(TradeEvent::from_fields(&nan_qty).is_none());

        let no_side = map(&[("ts", "1000"), ("px", "1"), ("qty", "2")]);
        assert!(TradeEvent::from_fields(&no_side).is_none());
    }

    #[test]
    fn book_mid_needs_both_sides() {
        let m = map(&[
            ("ts", "5"),
            ("bid1.px", "99"),
            ("bid1.sz", "1"),
            ("ask1.px", "101"),
            ("ask1.sz", "1"),
            ("snapshot", "1"),
        ]);
        let book = BookFrame::from_fields(&m).unwrap();
        assert_eq!(book.mid(), Some(100.0));
        assert!(book.snapshot);

        let one_sided = map(&[("ts", "5"), ("bid1.px", "99")]);
        assert_eq!(BookFrame::from_fields(&one_sided).unwrap().mid(), None);
    }

    #[test]
    fn kline_accepts_short_and_long_names() {
        let short = map(&[("ts", "0"), ("c", "100"), ("vol", "3"), ("confirm", "1")]);
        let k = KlineFrame::from_fields(&short).unwrap();
        assert_eq!(k.close, 100.0);
        assert!(k.confirm);
        assert_eq!(k.quote_liquidity(), 300.0);

        let long = map(&[("ts", "0"), ("close", "7"), ("volCcyQuote", "50")]);
        let k = KlineFrame::from_fields(&long).unwrap();
        assert_eq!(k.quote_liquidity(), 50.0);
    }

    #[test]
    fn oi_prefers_ccy_value() {
        let m = map(&[("ts", "1"), ("oi", "100"), ("oiCcy", "5000")]);
        assert_eq!(OiFrame::from_fields(&m).unwrap().value(), 5000.0);
        let bare = map(&[("ts", "1"), ("oi", "100")]);
        assert_eq!(OiFrame::from_fields(&bare).unwrap().value(), 100.0);
    }

    #[test]
    fn sealed_bar_field_roundtrip() {
        let bar = SealedBar {
            close_ts: 60_000,
            open: 100.0,
            high: 105.0,
            low: 100.0,
            close: 105.0,
            vol: 3.0,
            vbuy: 1.0,
            vsell: 2.0,
            vwap: 103.5,
            tick_n: 2,
            gap: false,
        };
        let fields: Fields = bar.to_fields().into_iter().collect();
        let back = SealedBar::from_fields(&fields).unwrap();
        assert_eq!(back, bar);
    }
}
