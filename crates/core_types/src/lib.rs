mod fields;
mod frames;
mod gate;
mod keys;
mod signal;
mod symbol;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fields::{fmt_bool, fmt_f64, get_bool, get_f64, get_i64, get_str, push_field, Fields};
pub use frames::{
    BookFrame, FundingFrame, KlineFrame, OiFrame, SealedBar, Side, Timeframe, TradeEvent,
};
pub use gate::{GateSnapshot, GATE_VERSION};
pub use keys::{kind_from_key, symbol_from_key, KeySpace, CG_EVAL, CG_ROUTER, CG_WINDOW};
pub use signal::{DetectedSignal, EvalRow, FinalSignal, EVIDENCE_PREFIX};
pub use symbol::{normalize_symbol, parse_symbol_list};

/// In-process telemetry event; correctness never depends on it, the bus
/// of record is Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    BarSealed {
        sym: String,
        tf: Timeframe,
        bar: SealedBar,
    },
    Detected(DetectedSignal),
    Final(FinalSignal),
    EvalDone(EvalRow),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),
    #[error("consumer group setup failed on {key}: {detail}")]
    GroupSetup { key: String, detail: String },
    #[error("no symbols configured")]
    NoSymbols,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_event_json_roundtrip() {
        let event = PipelineEvent::BarSealed {
            sym: "BTC-USDT-SWAP".to_string(),
            tf: Timeframe::M1,
            bar: SealedBar {
                close_ts: 60_000,
                open: 100.0,
                high: 105.0,
                low: 100.0,
                close: 105.0,
                vol: 3.0,
                vbuy: 1.0,
                vsell: 2.0,
                vwap: 103.0,
                tick_n: 2,
                gap: false,
            },
        };
        let raw = serde_json::to_string(&event).expect("serialize");
        let parsed: PipelineEvent = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, event);
    }

    #[test]
    fn pipeline_error_messages_name_the_key() {
        let err = PipelineError::GroupSetup {
            key: "ws:{BTC-USDT-SWAP}:trades".to_string(),
            detail: "boom".to_string(),
        };
        assert!(err.to_string().contains("ws:{BTC-USDT-SWAP}:trades"));
    }
}
