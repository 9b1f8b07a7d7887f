//! Per-connection series handle tracking and pre-fetch cleanup.
//!
//! Removes individual series rather than tearing down whole chart sessions:
//! without this, TradingView eventually answers `exceed limit of series`.

use dashmap::DashMap;
use tracing::warn;
use ustr::Ustr;

use crate::error::Result;

#[derive(Debug, Clone)]
struct SeriesEntry {
    request_id: u64,
    chart_session: Ustr,
}

pub struct SeriesRegistry {
    entries: DashMap<Ustr, SeriesEntry>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, series_id: Ustr, request_id: u64, chart_session: Ustr) {
        self.entries.insert(
            series_id,
            SeriesEntry {
                request_id,
                chart_session,
            },
        );
    }

    pub fn get_request_id(&self, series_id: &str) -> Option<u64> {
        self.entries.get(series_id).map(|e| e.request_id)
    }

    /// Send `remove_series` for every tracked handle (failures logged,
    /// non-fatal), then clear all local tracking.
    pub async fn cleanup_all<F, Fut>(&self, mut send_remove: F)
    where
        F: FnMut(Ustr, Ustr) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let handles: Vec<(Ustr, Ustr)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().chart_session))
            .collect();

        for (series_id, chart_session) in handles {
            if let Err(e) = send_remove(chart_session, series_id).await {
                warn!("failed to remove series {series_id} (non-fatal): {e}");
            }
        }

        self.entries.clear();
    }

    /// Clear local tracking without sending anything (used on dispose).
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeriesRegistry {
    fn default() -> Self {
        Self::new()
    }
}
