//! Maintains up to N ready connections per credential, assigns fetch
//! requests to them, and idle-reaps connections that have sat unused too
//! long or crossed their request-count threshold.
//!
//! `PoolRegistry` is an explicit struct a caller owns, never a process-wide
//! `static`, so tests can build isolated instances without global state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use ustr::Ustr;

use crate::config::{ConnectionConfig, PoolConfig};
use crate::connection::Connection;
use crate::cvd::CvdConfigProvider;
use crate::error::{Error, InvalidStateContext, Result};
use crate::fetch::{FetchRequest, FetchResult, Indicator};
use crate::init;
use crate::socket_adapter::{TungsteniteConnector, default_headers};

/// Builds a fresh, fully-initialized [`Connection`] on demand. The
/// production implementation opens a new socket per call; tests supply a
/// factory backed by scripted `MockSocket`s.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<Connection>>;
}

/// Default production factory: one fresh `TungsteniteConnector` (and hence
/// one fresh TCP/TLS socket) per `create()` call.
pub struct DefaultConnectionFactory {
    pub config: ConnectionConfig,
    pub cvd_provider: Arc<dyn CvdConfigProvider>,
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn create(&self) -> Result<Arc<Connection>> {
        let url = init::build_connect_url(&self.config)?;
        let connector = TungsteniteConnector {
            url: url.to_string(),
            headers: default_headers(),
        };
        Connection::connect(self.config.clone(), &connector, Arc::clone(&self.cvd_provider)).await
    }
}

/// Request shape accepted by `ConnectionPool::fetch_chart_data`.
#[derive(Debug, Clone)]
pub struct PoolFetchRequest {
    pub symbol: Ustr,
    pub resolution: Ustr,
    pub bars_count: u32,
    pub adjustment: Option<Ustr>,
    pub session: Option<Ustr>,
    pub cvd_enabled: bool,
    pub cvd_anchor_period: Option<Ustr>,
    pub cvd_timeframe: Option<Ustr>,
}

impl PoolFetchRequest {
    fn into_fetch_request(self) -> FetchRequest {
        let mut indicators = Vec::new();
        if self.cvd_enabled {
            indicators.push(Indicator::Cvd {
                anchor_period: self.cvd_anchor_period.unwrap_or_else(|| Ustr::from("3M")),
                custom_timeframe: self.cvd_timeframe,
            });
        }
        FetchRequest {
            symbol: self.symbol,
            resolution: self.resolution,
            bars_count: self.bars_count,
            adjustment: self.adjustment,
            session: self.session,
            indicators,
        }
    }
}

struct PoolSlot {
    connection: Mutex<Arc<Connection>>,
    in_use: AtomicBool,
    last_used: Mutex<Instant>,
    current_symbol: Mutex<Option<Ustr>>,
}

impl PoolSlot {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection: Mutex::new(connection),
            in_use: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
            current_symbol: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Arc<Connection> {
        Arc::clone(&*self.connection.lock().await)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub slot_count: usize,
    pub in_use: usize,
}

pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    slots: Mutex<Vec<Arc<PoolSlot>>>,
    disposed: AtomicBool,
    idle_reap_shutdown: CancellationToken,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            factory,
            slots: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            idle_reap_shutdown: CancellationToken::new(),
        });
        spawn_idle_reap(Arc::clone(&pool));
        pool
    }

    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        PoolStats {
            slot_count: slots.len(),
            in_use: slots.iter().filter(|s| s.in_use.load(Ordering::Relaxed)).count(),
        }
    }

    /// Rejects if disposed; acquires a slot (reuse idle, grow up to
    /// `max_connections`, else poll); replaces a dead/erroring slot and
    /// retries once; releases the slot when done.
    pub async fn fetch_chart_data(&self, request: PoolFetchRequest) -> Result<FetchResult> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(InvalidStateContext::Other));
        }

        let slot = self.acquire_slot().await?;
        let fetch_request = request.into_fetch_request();
        *slot.current_symbol.lock().await = Some(fetch_request.symbol);

        let result = self.fetch_with_slot(&slot, fetch_request).await;

        *slot.last_used.lock().await = Instant::now();
        slot.in_use.store(false, Ordering::Release);
        result
    }

    async fn acquire_slot(&self) -> Result<Arc<PoolSlot>> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            {
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.iter().find(|s| !s.in_use.load(Ordering::Acquire)) {
                    slot.in_use.store(true, Ordering::Release);
                    return Ok(Arc::clone(slot));
                }
                if slots.len() < self.config.max_connections {
                    let connection = self.factory.create().await?;
                    let slot = Arc::new(PoolSlot::new(connection));
                    slot.in_use.store(true, Ordering::Release);
                    slots.push(Arc::clone(&slot));
                    return Ok(slot);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::ConnectionTimeout(self.config.acquire_timeout));
            }
            tokio::time::sleep(self.config.acquire_poll_interval).await;
        }
    }

    /// A not-ready slot, or one of the three pool-recoverable errors on the
    /// first attempt (`invalid-state` when Closed, `connection-closed`,
    /// `stale-connection`), triggers a dispose-and-replace-then-retry-once.
    /// Any other error — including an ordinary `data-timeout`/`cvd-timeout`
    /// on an otherwise healthy connection — propagates unchanged rather than
    /// silently tearing down a working connection.
    async fn fetch_with_slot(&self, slot: &Arc<PoolSlot>, request: FetchRequest) -> Result<FetchResult> {
        let mut connection = slot.connection().await;
        if !connection.is_ready() {
            self.replace_slot(slot).await?;
            connection = slot.connection().await;
        }

        match connection.fetch_symbol(request.clone()).await {
            Ok(result) => Ok(result),
            Err(e) if is_pool_recoverable(&e) => {
                warn!("fetch failed with recoverable error, replacing connection and retrying once: {e}");
                self.replace_slot(slot).await?;
                let connection = slot.connection().await;
                connection.fetch_symbol(request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn replace_slot(&self, slot: &Arc<PoolSlot>) -> Result<()> {
        let new_connection = self.factory.create().await?;
        let old = {
            let mut guard = slot.connection.lock().await;
            std::mem::replace(&mut *guard, new_connection)
        };
        old.dispose().await;
        Ok(())
    }

    /// `dispose`: clears the reap timer, disposes every owned connection.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.idle_reap_shutdown.cancel();
        let mut slots = self.slots.lock().await;
        for slot in slots.drain(..) {
            slot.connection().await.dispose().await;
        }
    }

    /// Disposes idle slots past `idle_timeout`, or idle slots whose
    /// connection has crossed `should_refresh()`.
    async fn reap_idle(&self) {
        let mut slots = self.slots.lock().await;
        let mut keep = Vec::with_capacity(slots.len());
        for slot in slots.drain(..) {
            if slot.in_use.load(Ordering::Acquire) {
                keep.push(slot);
                continue;
            }
            let idle_for = slot.last_used.lock().await.elapsed();
            let connection = slot.connection().await;
            if idle_for > self.config.idle_timeout || connection.should_refresh() {
                connection.dispose().await;
            } else {
                keep.push(slot);
            }
        }
        *slots = keep;
    }
}

/// The exact three error kinds the pool treats as "rebuild and retry once",
/// per spec.md's error-propagation policy — a strict subset of
/// `Error::recoverable()`, which also covers request-scoped timeouts that
/// must propagate to the caller rather than trigger a connection rebuild.
fn is_pool_recoverable(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidState(InvalidStateContext::Closed) | Error::ConnectionClosed(_) | Error::StaleConnection(_)
    )
}

fn spawn_idle_reap(pool: Arc<ConnectionPool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pool.config.idle_reap_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => pool.reap_idle().await,
                _ = pool.idle_reap_shutdown.cancelled() => break,
            }
        }
    });
}

/// Process-local, caller-owned registry keyed by credential fingerprint.
/// A plain struct a caller constructs and holds, never a `static`.
pub struct PoolRegistry {
    pools: DashMap<Ustr, Arc<ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self { pools: DashMap::new() }
    }

    /// Returns the existing pool for `credential`, or creates one via
    /// `factory`/`config` (check-then-insert; race-free because `DashMap`'s
    /// `entry` API locks the shard for the duration of the closure).
    pub fn for_user(&self, credential: Ustr, factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Arc<ConnectionPool> {
        Arc::clone(&self.pools.entry(credential).or_insert_with(|| ConnectionPool::new(config, factory)))
    }

    pub async fn dispose_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        self.pools.clear();
        for pool in pools {
            pool.dispose().await;
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_adapter::{MockConnector, MockSocket};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockConnectionFactory {
        cvd_provider: Arc<dyn CvdConfigProvider>,
        sockets: StdMutex<Vec<Arc<MockSocket>>>,
    }

    impl MockConnectionFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cvd_provider: Arc::new(crate::cvd::MockCvdConfigProvider::new()),
                sockets: StdMutex::new(Vec::new()),
            })
        }

        fn last_socket(&self) -> Arc<MockSocket> {
            Arc::clone(self.sockets.lock().unwrap().last().unwrap())
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockConnectionFactory {
        async fn create(&self) -> Result<Arc<Connection>> {
            let socket = MockSocket::new();
            self.sockets.lock().unwrap().push(Arc::clone(&socket));
            let connector = MockConnector { socket };
            let mut timeout_overrides = HashMap::new();
            timeout_overrides.insert(crate::config::RequestKind::ResolveSymbol, Duration::from_millis(20));
            let config = ConnectionConfig::builder()
                .jwt_token(Ustr::from("t1"))
                .timeout_overrides(timeout_overrides)
                .build();
            Connection::connect(config, &connector, Arc::clone(&self.cvd_provider)).await
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig::builder().max_connections(1).acquire_poll_interval(Duration::from_millis(5)).build()
    }

    #[tokio::test]
    async fn registry_returns_same_pool_for_same_credential() {
        let registry = PoolRegistry::new();
        let factory = MockConnectionFactory::new();
        let a = registry.for_user(Ustr::from("tok"), factory.clone(), pool_config());
        let b = registry.for_user(Ustr::from("tok"), factory, pool_config());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn closed_connection_is_rebuilt_transparently() {
        let factory = MockConnectionFactory::new();
        let pool = ConnectionPool::new(pool_config(), factory.clone());

        let request = PoolFetchRequest {
            symbol: Ustr::from("NSE:TCS"),
            resolution: Ustr::from("1D"),
            bars_count: 1,
            adjustment: None,
            session: None,
            cvd_enabled: false,
            cvd_anchor_period: None,
            cvd_timeframe: None,
        };

        // Acquire + force-close the underlying connection without fetching
        // (an unresponsive adapter would otherwise hang on resolve_symbol).
        let slot = pool.acquire_slot().await.unwrap();
        let dead_connection = slot.connection().await;
        dead_connection.dispose().await;
        slot.in_use.store(false, Ordering::Release);

        let result = pool.fetch_with_slot(&slot, request.clone().into_fetch_request()).await;
        assert!(matches!(result, Err(_)));

        drop(dead_connection);
        assert_eq!(factory.sockets.lock().unwrap().len(), 2, "expected a replacement connection to be created");
        let _ = factory.last_socket();
    }
}
