//! Bounded registry of in-flight requests with timeouts, cancellation, and
//! multi-key correlation.
//!
//! An active tracker rather than a passive lookup map: it owns each
//! request's timeout task and settles a oneshot per entry, the Rust
//! analogue of a resolve/reject callback pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ustr::Ustr;

use crate::config::RequestKind;
use crate::error::{Error, Result};

pub const MAX_PENDING: usize = 100;

struct Entry {
    kind: RequestKind,
    symbol_id: Option<Ustr>,
    is_cvd: bool,
    turnaround_id: Option<Ustr>,
    sent_at: Instant,
    responder: Option<oneshot::Sender<Result<Value>>>,
    cancel: CancellationToken,
}

/// A freshly created request: its id for correlation, and a future that
/// resolves when the tracker settles it (by value, timeout, or cancellation).
pub struct Created {
    pub request_id: u64,
    pub recv: oneshot::Receiver<Result<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    pub pending: usize,
    pub requests_by_kind: std::collections::HashMap<RequestKind, usize>,
}

pub struct RequestTracker {
    entries: DashMap<u64, Entry>,
    next_id: AtomicU64,
    default_timeouts: DashMap<RequestKind, Duration>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_timeouts: DashMap::new(),
        }
    }

    pub fn set_default_timeout(&self, kind: RequestKind, timeout: Duration) {
        self.default_timeouts.insert(kind, timeout);
    }

    pub fn get_default_timeout(&self, kind: RequestKind) -> Duration {
        self.default_timeouts
            .get(&kind)
            .map(|t| *t)
            .unwrap_or_else(|| kind.default_timeout())
    }

    /// Register a new in-flight request. Fails synchronously with
    /// `QueueFull` once `MAX_PENDING` entries are live.
    pub fn create_request(
        self: &Arc<Self>,
        kind: RequestKind,
        timeout: Duration,
        symbol_id: Option<Ustr>,
        is_cvd: bool,
        turnaround_id: Option<Ustr>,
    ) -> Result<Created> {
        if self.entries.len() >= MAX_PENDING {
            return Err(Error::QueueFull(MAX_PENDING));
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let entry = Entry {
            kind,
            symbol_id,
            is_cvd,
            turnaround_id,
            sent_at: Instant::now(),
            responder: Some(tx),
            cancel: cancel.clone(),
        };
        self.entries.insert(request_id, entry);

        let this = Arc::clone(self);
        let timeout_kind_is_cvd = is_cvd;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let reason = if timeout_kind_is_cvd {
                        Error::CvdTimeout(Ustr::from(&format!("request {request_id} timed out")))
                    } else {
                        Error::DataTimeout(Ustr::from(&format!("request {request_id} timed out")))
                    };
                    this.settle(request_id, Err(reason));
                }
                _ = cancel.cancelled() => {}
            }
        });

        Ok(Created { request_id, recv: rx })
    }

    pub fn resolve(&self, request_id: u64, value: Value) {
        self.settle(request_id, Ok(value));
    }

    pub fn reject(&self, request_id: u64, err: Error) {
        self.settle(request_id, Err(err));
    }

    /// Idempotent settle: clears the timeout task and removes the entry.
    /// A second settle on an already-removed id is a silent no-op: a
    /// resolved-then-late response is dropped rather than panicking.
    fn settle(&self, request_id: u64, result: Result<Value>) {
        if let Some((_, mut entry)) = self.entries.remove(&request_id) {
            entry.cancel.cancel();
            if let Some(tx) = entry.responder.take() {
                let _ = tx.send(result);
            }
        }
    }

    pub fn cancel_request(&self, request_id: u64, reason: &str) {
        self.settle(
            request_id,
            Err(Error::RequestCancelled(Ustr::from(reason))),
        );
    }

    /// Two-phase: collect matching ids first, then cancel each, since
    /// cancellation mutates the map we're conceptually iterating.
    pub fn cancel_symbol_requests(&self, symbol_id: &str, reason: &str) -> usize {
        let matching: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.symbol_id.as_deref() == Some(symbol_id))
            .map(|e| *e.key())
            .collect();

        for id in &matching {
            self.cancel_request(*id, reason);
        }
        if !matching.is_empty() {
            debug!("cancelled {} pending request(s) for symbol {symbol_id}", matching.len());
        }
        matching.len()
    }

    pub fn cancel_all_cvd_requests(&self, reason: &str) -> usize {
        let matching: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.is_cvd)
            .map(|e| *e.key())
            .collect();
        for id in &matching {
            self.cancel_request(*id, reason);
        }
        matching.len()
    }

    pub fn cancel_all_requests(&self, reason: &str) -> usize {
        let matching: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for id in &matching {
            self.cancel_request(*id, reason);
        }
        matching.len()
    }

    /// Find a request by its correlation turnaround id (linear scan).
    pub fn get_request_by_turnaround(&self, turnaround_id: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.turnaround_id.as_deref() == Some(turnaround_id))
            .map(|e| *e.key())
    }

    /// Find the first pending request of `kind` whose `symbol_id`/params
    /// match; used by the router for `symbol_resolved`/`symbol_error`.
    pub fn find_pending_of_kind(&self, kind: RequestKind) -> Option<u64> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .min_by_key(|e| e.sent_at)
            .map(|e| *e.key())
    }

    /// Oldest pending `create_series` request — tier-3 correlation fallback,
    /// gated behind a warning and a fallback counter rather than disabled
    /// outright.
    pub fn oldest_pending_create_series(&self) -> Option<u64> {
        let found = self.find_pending_of_kind(RequestKind::CreateSeries);
        if found.is_some() {
            warn!("router fallback: correlating by oldest pending create_series");
        }
        found
    }

    pub fn stats(&self) -> TrackerStats {
        let mut by_kind = std::collections::HashMap::new();
        for e in self.entries.iter() {
            *by_kind.entry(e.kind).or_insert(0) += 1;
        }
        TrackerStats {
            pending: self.entries.len(),
            requests_by_kind: by_kind,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> Arc<RequestTracker> {
        Arc::new(RequestTracker::new())
    }

    #[tokio::test]
    async fn resolve_settles_the_promise_exactly_once() {
        let t = tracker();
        let created = t
            .create_request(RequestKind::ResolveSymbol, Duration::from_secs(5), None, false, None)
            .unwrap();
        t.resolve(created.request_id, Value::from("ok"));
        let result = created.recv.await.unwrap();
        assert_eq!(result.unwrap(), Value::from("ok"));
        assert_eq!(t.len(), 0);
    }

    #[tokio::test]
    async fn queue_full_at_101st_request() {
        let t = tracker();
        let mut receivers = Vec::new();
        for _ in 0..MAX_PENDING {
            let created = t
                .create_request(RequestKind::ResolveSymbol, Duration::from_secs(5), None, false, None)
                .unwrap();
            receivers.push(created);
        }
        let overflow = t.create_request(RequestKind::ResolveSymbol, Duration::from_secs(5), None, false, None);
        assert!(matches!(overflow, Err(Error::QueueFull(100))));
        assert_eq!(t.stats().pending, 100);
    }

    #[tokio::test]
    async fn cancel_symbol_requests_rejects_only_matching() {
        let t = tracker();
        let a = t
            .create_request(
                RequestKind::CreateSeries,
                Duration::from_secs(5),
                Some(Ustr::from("RELIANCE")),
                false,
                None,
            )
            .unwrap();
        let b = t
            .create_request(
                RequestKind::CreateSeries,
                Duration::from_secs(5),
                Some(Ustr::from("TCS")),
                false,
                None,
            )
            .unwrap();

        let cancelled = t.cancel_symbol_requests("RELIANCE", "Symbol switched");
        assert_eq!(cancelled, 1);

        let a_result = a.recv.await.unwrap();
        assert!(matches!(a_result, Err(Error::RequestCancelled(_))));
        assert_eq!(t.stats().pending, 1);

        t.cancel_request(b.request_id, "test cleanup");
        assert!(b.recv.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn timeout_rejects_with_data_timeout() {
        let t = tracker();
        let created = t
            .create_request(RequestKind::ResolveSymbol, Duration::from_millis(10), None, false, None)
            .unwrap();
        let result = created.recv.await.unwrap();
        assert!(matches!(result, Err(Error::DataTimeout(_))));
    }

    #[tokio::test]
    async fn cvd_timeout_uses_dedicated_error() {
        let t = tracker();
        let created = t
            .create_request(RequestKind::CreateStudy, Duration::from_millis(10), None, true, None)
            .unwrap();
        let result = created.recv.await.unwrap();
        assert!(matches!(result, Err(Error::CvdTimeout(_))));
    }

    #[tokio::test]
    async fn late_resolve_after_settle_is_a_no_op() {
        let t = tracker();
        let created = t
            .create_request(RequestKind::ResolveSymbol, Duration::from_secs(5), None, false, None)
            .unwrap();
        t.resolve(created.request_id, Value::from(1));
        // Second settle must not panic and must be ignored.
        t.reject(created.request_id, Error::Internal(Ustr::from("late")));
        let result = created.recv.await.unwrap();
        assert_eq!(result.unwrap(), Value::from(1));
    }
}
