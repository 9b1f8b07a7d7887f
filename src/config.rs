use std::collections::HashMap;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use ustr::Ustr;

/// The kinds of request the tracker (`tracker::RequestTracker`) correlates.
/// Each kind carries its own default timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    ResolveSymbol,
    CreateSeries,
    ModifySeries,
    CreateStudy,
}

impl RequestKind {
    pub fn default_timeout(self) -> Duration {
        match self {
            RequestKind::ResolveSymbol => Duration::from_secs(5),
            RequestKind::CreateSeries => Duration::from_secs(15),
            RequestKind::ModifySeries => Duration::from_secs(15),
            RequestKind::CreateStudy => Duration::from_secs(30),
        }
    }
}

/// Immutable-after-construct configuration for one [`crate::connection::Connection`].
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    /// Authentication token (TradingView JWT). Required.
    pub jwt_token: Ustr,

    #[builder(default = default_websocket_url())]
    pub websocket_url: Ustr,

    #[builder(default = default_chart_id())]
    pub chart_id: Ustr,

    #[builder(default = Duration::from_secs(30))]
    pub connect_timeout: Duration,

    /// Per-kind timeout overrides. Missing entries fall back to
    /// `RequestKind::default_timeout`.
    #[builder(default)]
    pub timeout_overrides: HashMap<RequestKind, Duration>,

    #[builder(default = false)]
    pub enable_logging: bool,

    /// `shouldRefresh()` flips true once the completed-request count reaches
    /// this threshold; the pool's idle-reap pass consults it to retire a
    /// heavily used connection without penalizing the caller holding it.
    #[builder(default = 20)]
    pub max_requests_per_connection: u32,
}

fn default_websocket_url() -> Ustr {
    Ustr::from("wss://prodata.tradingview.com/socket.io/websocket")
}

fn default_chart_id() -> Ustr {
    Ustr::from("sxCfElo9cG")
}

impl ConnectionConfig {
    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        self.timeout_overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_timeout())
    }
}

/// Options for one [`crate::pool::ConnectionPool`].
#[derive(Debug, Clone, Builder)]
pub struct PoolConfig {
    #[builder(default = 2)]
    pub max_connections: usize,

    #[builder(default = Duration::from_secs(45))]
    pub cvd_timeout: Duration,

    #[builder(default = false)]
    pub use_mock_cvd: bool,

    #[builder(default = Duration::from_secs(30))]
    pub acquire_timeout: Duration,

    #[builder(default = Duration::from_millis(100))]
    pub acquire_poll_interval: Duration,

    #[builder(default = Duration::from_secs(5 * 60))]
    pub idle_reap_interval: Duration,

    #[builder(default = Duration::from_secs(10 * 60))]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
