//! Value types shared across the router and fetch coordinator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ustr::Ustr;

/// One OHLCV bar as delivered by `timescale_update`/`du`: `[time,o,h,l,c,v]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Parse a `[time, o, h, l, c, v]` vector, as found at `data[k].s[*].v`.
    pub fn from_values(v: &[f64]) -> Option<Self> {
        if v.len() < 6 {
            return None;
        }
        Some(Bar {
            time: v[0] as i64,
            open: v[1],
            high: v[2],
            low: v[3],
            close: v[4],
            volume: v[5].max(0.0),
        })
    }
}

/// One indicator sample: `[time, v1, v2, ...]`, as found at `data[studyId].st[*].v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorBar {
    pub time: i64,
    pub values: Vec<f64>,
}

impl IndicatorBar {
    pub fn from_values(v: &[f64]) -> Option<Self> {
        if v.is_empty() {
            return None;
        }
        Some(IndicatorBar {
            time: v[0] as i64,
            values: v[1..].to_vec(),
        })
    }
}

/// Symbol metadata from `symbol_resolved`. Required fields are typed; any
/// other field the server sends is preserved opaquely in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub name: Ustr,
    pub full_name: Ustr,
    pub ticker: Ustr,
    pub exchange: Ustr,
    #[serde(rename = "type")]
    pub kind: Ustr,
    pub timezone: Ustr,
    pub minmov: i64,
    pub pricescale: i64,
    pub session: Ustr,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SymbolMetadata {
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(value.clone())
    }
}
