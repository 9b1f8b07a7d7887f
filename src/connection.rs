//! Composes framing, state, tracking, heartbeats, series lifecycle, routing,
//! fetching, and handshake behind one facade that owns the socket. Each
//! collaborator takes the socket/tracker/etc. by reference rather than
//! holding a back-reference to `Connection`, so no service outlives the
//! facade that wires it together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::cvd::CvdConfigProvider;
use crate::error::Result;
use crate::fetch::{FetchCoordinator, FetchRequest, FetchResult, FetchStats, SessionIds};
use crate::frame::{self, Frame};
use crate::heartbeat::HeartbeatManager;
use crate::router::{self, RouterStats};
use crate::series::SeriesRegistry;
use crate::socket_adapter::{WebSocketAdapter, WebSocketConnector};
use crate::state::{ConnectionState, StateMachine};
use crate::tracker::{RequestTracker, TrackerStats};

const HEARTBEAT_STALE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub fetch: FetchStats,
    pub tracker: TrackerStats,
    pub router_fallback_reached: u64,
}

pub struct Connection {
    config: ConnectionConfig,
    socket: Arc<dyn WebSocketAdapter>,
    state: Arc<StateMachine>,
    tracker: Arc<RequestTracker>,
    series: Arc<SeriesRegistry>,
    heartbeat: Arc<HeartbeatManager>,
    session_ids: Arc<SessionIds>,
    fetch: Arc<FetchCoordinator>,
    cvd_provider: Arc<dyn CvdConfigProvider>,
    router_stats: Arc<RouterStats>,
    read_loop_shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl Connection {
    /// Explicit async factory: no eager init hidden inside a constructor.
    /// Performs the full connect/authenticate/create-session sequence before
    /// returning, so a returned `Connection` is always `Ready` or the call
    /// fails outright.
    pub async fn connect(
        config: ConnectionConfig,
        connector: &dyn WebSocketConnector,
        cvd_provider: Arc<dyn CvdConfigProvider>,
    ) -> Result<Arc<Self>> {
        let state = Arc::new(StateMachine::new());
        let session_ids = Arc::new(SessionIds::new());

        let socket = crate::init::initialize(&config, connector, &state, &session_ids).await?;

        let tracker = Arc::new(RequestTracker::new());
        let series = Arc::new(SeriesRegistry::new());
        let heartbeat = HeartbeatManager::new(HEARTBEAT_STALE_TIMEOUT);
        let fetch = Arc::new(FetchCoordinator::new());
        let router_stats = Arc::new(RouterStats::new());
        let read_loop_shutdown = CancellationToken::new();

        heartbeat.spawn_stale_watch();

        let connection = Arc::new(Self {
            config,
            socket: Arc::clone(&socket),
            state: Arc::clone(&state),
            tracker: Arc::clone(&tracker),
            series: Arc::clone(&series),
            heartbeat: Arc::clone(&heartbeat),
            session_ids,
            fetch: Arc::clone(&fetch),
            cvd_provider,
            router_stats: Arc::clone(&router_stats),
            read_loop_shutdown: read_loop_shutdown.clone(),
            disposed: AtomicBool::new(false),
        });

        spawn_read_loop(
            Arc::clone(&socket),
            Arc::clone(&tracker),
            Arc::clone(&series),
            Arc::clone(&state),
            Arc::clone(&heartbeat),
            Arc::clone(&fetch),
            Arc::clone(&router_stats),
            read_loop_shutdown,
        );

        info!("connection ready");
        Ok(connection)
    }

    pub async fn fetch_symbol(&self, request: FetchRequest) -> Result<FetchResult> {
        self.fetch
            .fetch_symbol(
                request,
                self.socket.as_ref(),
                &self.tracker,
                &self.series,
                &self.session_ids,
                &self.config,
                self.cvd_provider.as_ref(),
                &self.state,
            )
            .await
    }

    pub fn get_state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn is_ready(&self) -> bool {
        self.state.current() == ConnectionState::Ready
    }

    /// `shouldRefresh()`: true once the completed-request count reaches the
    /// configured threshold. Consulted by the pool's idle-reap pass, not on
    /// the acquisition hot path.
    pub fn should_refresh(&self) -> bool {
        self.fetch.stats().request_count >= self.config.max_requests_per_connection as u64
    }

    pub fn get_stats(&self) -> ConnectionStats {
        ConnectionStats {
            fetch: self.fetch.stats(),
            tracker: self.tracker.stats(),
            router_fallback_reached: self.router_stats.fallback_reached(),
        }
    }

    /// Idempotent: cancels all pending requests, stops the heartbeat, closes
    /// the socket with normal code 1000, clears tracker/series state, forces
    /// `Closed`.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.tracker.cancel_all_requests("Connection disposed");
        self.heartbeat.stop();
        self.read_loop_shutdown.cancel();
        if let Err(e) = self.socket.close(1000, "normal closure").await {
            warn!("error closing socket during dispose (non-fatal): {e}");
        }
        self.series.clear();
        self.state.force_transition(ConnectionState::Closed);
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_read_loop(
    socket: Arc<dyn WebSocketAdapter>,
    tracker: Arc<RequestTracker>,
    series: Arc<SeriesRegistry>,
    state: Arc<StateMachine>,
    heartbeat: Arc<HeartbeatManager>,
    fetch: Arc<FetchCoordinator>,
    router_stats: Arc<RouterStats>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                r = socket.recv() => r,
                _ = shutdown.cancelled() => break,
            };

            match received {
                Ok(Some(message)) => {
                    let Ok(text) = message.into_text() else {
                        debug!("read loop: ignoring non-text frame");
                        continue;
                    };
                    // Heartbeats in this batch are echoed before any protocol
                    // message from the same batch produces a side effect,
                    // regardless of their relative order on the wire.
                    let (heartbeats, messages): (Vec<_>, Vec<_>) =
                        frame::decode(&text).into_iter().partition(|f| matches!(f, Frame::Heartbeat(_)));

                    for frame in heartbeats {
                        if let Frame::Heartbeat(raw) = frame {
                            heartbeat.record_received();
                            if let Err(e) = socket.send(frame::encode_raw(&raw)).await {
                                warn!("failed to echo heartbeat: {e}");
                            }
                        }
                    }

                    for frame in messages {
                        if let Frame::Message(raw_message) = frame {
                            router::route_message(&raw_message, &tracker, &series, &state, &fetch.pending, &router_stats).await;
                        }
                    }
                }
                Ok(None) => {
                    info!("socket closed, forcing Closed state");
                    heartbeat.stop();
                    state.force_transition(ConnectionState::Closed);
                    break;
                }
                Err(e) => {
                    error!("read loop error, forcing Error state: {e}");
                    heartbeat.stop();
                    state.force_transition(ConnectionState::Error);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvd::MockCvdConfigProvider;
    use crate::socket_adapter::{MockConnector, MockSocket};
    use ustr::Ustr;

    async fn ready_connection() -> (Arc<Connection>, Arc<MockSocket>) {
        let socket = MockSocket::new();
        let connector = MockConnector { socket: Arc::clone(&socket) };
        let config = ConnectionConfig::builder().jwt_token(Ustr::from("t1")).build();
        let cvd = Arc::new(MockCvdConfigProvider::new());
        let connection = Connection::connect(config, &connector, cvd).await.unwrap();
        (connection, socket)
    }

    #[tokio::test]
    async fn connect_reaches_ready_state() {
        let (connection, _socket) = ready_connection().await;
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (connection, socket) = ready_connection().await;
        connection.dispose().await;
        connection.dispose().await;
        assert_eq!(connection.get_state(), ConnectionState::Closed);
        assert_eq!(socket.ready_state(), crate::socket_adapter::ReadyState::Closed);
    }

    #[tokio::test]
    async fn heartbeat_is_echoed_before_subsequent_message_side_effects() {
        let (connection, socket) = ready_connection().await;
        socket.push_inbound_text("~m~4~m~~h~1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = socket.sent_texts().await;
        assert!(sent.iter().any(|s| s == "~m~4~m~~h~1"));
        assert!(connection.is_ready());
    }
}
