//! Classifies and dispatches inbound protocol frames.
//!
//! Correlates each message back to a pending request in the tracker rather
//! than firing a callback per event type, since fetches here are
//! request/response rather than push-callback.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use ustr::Ustr;

use crate::error::Error;
use crate::fetch::PendingFetch;
use crate::frame::RawMessage;
use crate::models::{Bar, IndicatorBar, SymbolMetadata};
use crate::series::SeriesRegistry;
use crate::state::{ConnectionState, StateMachine};
use crate::tracker::RequestTracker;

const RECOVERABLE_PATTERNS: &[&str] = &[
    "exceed limit of series",
    "symbol not found",
    "invalid resolution",
    "invalid timeframe",
    "invalid period",
    "symbol error",
    "study error",
    "series error",
];

#[derive(Debug, Default)]
pub struct RouterStats {
    fallback_reached: AtomicU64,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fallback_reached(&self) -> u64 {
        self.fallback_reached.load(Ordering::Relaxed)
    }

    fn record_fallback(&self) {
        self.fallback_reached.fetch_add(1, Ordering::Relaxed);
    }
}

/// Dispatch one decoded protocol message (never a heartbeat; the caller
/// drains and echoes those before this is ever called).
pub async fn route_message(
    msg: &RawMessage,
    tracker: &RequestTracker,
    series: &SeriesRegistry,
    state: &StateMachine,
    pending: &Mutex<Option<PendingFetch>>,
    stats: &RouterStats,
) {
    match msg.m.as_str() {
        "protocol_error" | "critical_error" => handle_protocol_error(&msg.p, tracker, state),
        "symbol_resolved" => handle_symbol_resolved(&msg.p, tracker, pending).await,
        "symbol_error" => handle_symbol_error(&msg.p, tracker),
        "timescale_update" | "du" => handle_data_update(&msg.p, tracker, series, pending, stats).await,
        other => debug!("router: ignoring unknown method {other}"),
    }
}

fn is_recoverable_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    RECOVERABLE_PATTERNS.iter().any(|pat| lower.contains(pat))
}

fn handle_protocol_error(params: &[Value], tracker: &RequestTracker, state: &StateMachine) {
    let turnaround = params.first().and_then(Value::as_str).map(str::to_string);
    let text = params
        .iter()
        .skip(1)
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    let text = if text.is_empty() {
        turnaround.clone().unwrap_or_default()
    } else {
        text
    };

    if is_recoverable_text(&text) {
        warn!("recoverable protocol error: {text}");
        match turnaround.as_deref().and_then(|t| tracker.get_request_by_turnaround(t)) {
            Some(request_id) => tracker.reject(request_id, Error::Protocol(Ustr::from(&text))),
            None => warn!("no pending request found for turnaround {turnaround:?}, dropping recoverable protocol error"),
        }
    } else {
        error!("non-recoverable protocol error, forcing Error state: {text}");
        state.force_transition(ConnectionState::Error);
        tracker.cancel_all_requests(&format!("connection error: {text}"));
    }
}

async fn handle_symbol_resolved(params: &[Value], tracker: &RequestTracker, pending: &Mutex<Option<PendingFetch>>) {
    let Some(symbol_session) = params.get(1).and_then(Value::as_str) else {
        warn!("symbol_resolved: missing symbolSession parameter");
        return;
    };
    let Some(metadata_value) = params.get(2) else {
        warn!("symbol_resolved: missing metadata parameter");
        return;
    };

    if let Some(request_id) = tracker.get_request_by_turnaround(symbol_session) {
        tracker.resolve(request_id, metadata_value.clone());
    } else {
        warn!("symbol_resolved: no pending resolve_symbol for session {symbol_session}");
    }

    let mut guard = pending.lock().await;
    if let Some(pf) = guard.as_mut() {
        if pf.symbol_session_id.as_str() == symbol_session {
            match SymbolMetadata::from_value(metadata_value) {
                Ok(meta) => pf.metadata = Some(meta),
                Err(e) => warn!("symbol_resolved: failed to parse metadata: {e}"),
            }
        }
    }
}

fn handle_symbol_error(params: &[Value], tracker: &RequestTracker) {
    let reason = params.get(2).and_then(Value::as_str).unwrap_or("unknown symbol error");
    match tracker.find_pending_of_kind(crate::config::RequestKind::ResolveSymbol) {
        Some(request_id) => tracker.reject(request_id, Error::SymbolError(Ustr::from(reason))),
        None => warn!("symbol_error: no pending resolve_symbol to reject ({reason})"),
    }
}

async fn handle_data_update(
    params: &[Value],
    tracker: &RequestTracker,
    series: &SeriesRegistry,
    pending: &Mutex<Option<PendingFetch>>,
    stats: &RouterStats,
) {
    let Some(data) = params.get(1).and_then(Value::as_object) else {
        warn!("data update: missing or malformed data object");
        return;
    };

    let mut guard = pending.lock().await;
    let Some(pf) = guard.as_mut() else {
        debug!("data update: no active pending fetch, dropping");
        return;
    };

    for (key, value) in data {
        if key.as_str() == pf.series_id.as_str() {
            let appended = append_bars(value, &mut pf.bars);

            let request_id = series
                .get_request_id(key)
                .or_else(|| extract_turnaround(value).and_then(|t| tracker.get_request_by_turnaround(&t)))
                .or_else(|| {
                    let fallback = tracker.oldest_pending_create_series();
                    if fallback.is_some() {
                        stats.record_fallback();
                    }
                    fallback
                });

            match request_id {
                Some(id) => tracker.resolve(id, Value::from(appended)),
                None => warn!("data update: could not correlate series key {key} to any pending create_series"),
            }
            continue;
        }

        for (indicator_type, study_id) in pf.study_ids.clone() {
            if study_id.as_str() == key.as_str() {
                let appended = append_indicator_bars(value, pf.indicators.entry(indicator_type).or_default());
                if let Some(&request_id) = pf.study_request_ids.get(&study_id) {
                    tracker.resolve(request_id, Value::from(appended));
                } else {
                    warn!("data update: no tracked request for study {study_id}");
                }
            }
        }
    }
}

fn append_bars(value: &Value, bars: &mut Vec<Bar>) -> usize {
    let Some(rows) = value.get("s").and_then(Value::as_array) else {
        return 0;
    };
    let mut appended = 0;
    for row in rows {
        let Some(v) = row.get("v").and_then(Value::as_array) else {
            continue;
        };
        let floats: Vec<f64> = v.iter().filter_map(Value::as_f64).collect();
        if let Some(bar) = Bar::from_values(&floats) {
            bars.push(bar);
            appended += 1;
        }
    }
    appended
}

fn append_indicator_bars(value: &Value, out: &mut Vec<IndicatorBar>) -> usize {
    let Some(rows) = value.get("st").and_then(Value::as_array) else {
        return 0;
    };
    let mut appended = 0;
    for row in rows {
        let Some(v) = row.get("v").and_then(Value::as_array) else {
            continue;
        };
        let floats: Vec<f64> = v.iter().filter_map(Value::as_f64).collect();
        if let Some(bar) = IndicatorBar::from_values(&floats) {
            out.push(bar);
            appended += 1;
        }
    }
    appended
}

fn extract_turnaround(value: &Value) -> Option<String> {
    value
        .get("ns")
        .and_then(|n| n.get("d"))
        .and_then(Value::as_str)
        .or_else(|| value.get("lbs").and_then(|n| n.get("d")).and_then(Value::as_str))
        .map(str::to_string)
}
