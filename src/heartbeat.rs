//! Echoes server keep-alives and detects staleness.
//!
//! An explicit liveness tracker with its own stale-detection interval, rather
//! than folding heartbeat handling into a generic read-timeout probe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

type StaleCallback = Box<dyn Fn() + Send + Sync + 'static>;

pub struct HeartbeatManager {
    last_received_at: AtomicU64,
    start: Instant,
    echoed: AtomicUsize,
    stale_timeout: Duration,
    check_interval: Duration,
    on_stale: std::sync::Mutex<Option<StaleCallback>>,
    stale_fired: std::sync::atomic::AtomicBool,
    shutdown: CancellationToken,
}

impl HeartbeatManager {
    /// `stale_timeout` defaults to 30s; the staleness check itself runs
    /// every 5s.
    pub fn new(stale_timeout: Duration) -> Arc<Self> {
        Self::with_check_interval(stale_timeout, Duration::from_secs(5))
    }

    pub fn with_check_interval(stale_timeout: Duration, check_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_received_at: AtomicU64::new(0),
            start: Instant::now(),
            echoed: AtomicUsize::new(0),
            stale_timeout,
            check_interval,
            on_stale: std::sync::Mutex::new(None),
            stale_fired: std::sync::atomic::AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn on_stale(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_stale.lock().expect("heartbeat callback lock poisoned") = Some(Box::new(f));
    }

    /// Call when a `~h~<n>` frame arrives, *before* any protocol message in
    /// the same socket read is processed.
    pub fn record_received(&self) {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        self.last_received_at.store(elapsed_ms, Ordering::Relaxed);
        self.echoed.fetch_add(1, Ordering::Relaxed);
        self.stale_fired.store(false, Ordering::Relaxed);
    }

    pub fn echoed_count(&self) -> usize {
        self.echoed.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.millis_since_last_received() <= self.stale_timeout.as_millis() as u64
    }

    fn millis_since_last_received(&self) -> u64 {
        let last = self.last_received_at.load(Ordering::Relaxed);
        (self.start.elapsed().as_millis() as u64).saturating_sub(last)
    }

    pub fn reset(&self) {
        self.last_received_at
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.echoed.store(0, Ordering::Relaxed);
        self.stale_fired.store(false, Ordering::Relaxed);
    }

    /// Spawn the 5s staleness-check loop. Fires `on_stale` once per episode
    /// (a warning, not a connection kill — the socket's own close follows).
    pub fn spawn_stale_watch(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !this.is_healthy() && !this.stale_fired.swap(true, Ordering::Relaxed) {
                            warn!("heartbeat stale: no ~h~ received in over {:?}", this.stale_timeout);
                            if let Some(cb) = this.on_stale.lock().expect("heartbeat callback lock poisoned").as_ref() {
                                cb();
                            }
                        }
                    }
                    _ = this.shutdown.cancelled() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
