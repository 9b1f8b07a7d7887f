//! Orchestrates resolve→bars→studies for one symbol, cancelling the prior
//! symbol's in-flight requests on switch: cancel-then-replace the one active
//! symbol, rather than accumulating an ever-growing set of series.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;
use ustr::Ustr;

use crate::config::{ConnectionConfig, RequestKind};
use crate::cvd::{self, CvdConfigProvider};
use crate::error::{Error, InvalidStateContext, Result};
use crate::frame::{self, OutgoingMessage};
use crate::models::{Bar, IndicatorBar, SymbolMetadata};
use crate::series::SeriesRegistry;
use crate::socket_adapter::WebSocketAdapter;
use crate::state::{ConnectionState, StateMachine};
use crate::tracker::RequestTracker;

const RESPONSE_HISTORY_CAP: usize = 100;

/// Record describing a single requested indicator. Only CVD exists today;
/// the enum leaves room for future study types without reshaping the
/// request surface.
#[derive(Debug, Clone)]
pub enum Indicator {
    Cvd {
        anchor_period: Ustr,
        custom_timeframe: Option<Ustr>,
    },
}

impl Indicator {
    /// The map key `PendingFetch`/`FetchResult` key this indicator's bars
    /// under, populated by `fetch_indicator` as each `create_study` is sent.
    fn type_key(&self) -> Ustr {
        match self {
            Indicator::Cvd { .. } => Ustr::from("cvd"),
        }
    }

    /// The human-readable study name carried in the result payload (not the
    /// wire `create_study` study name literal, which is `cvd::CVD_STUDY_NAME`).
    fn study_name(&self) -> &'static str {
        match self {
            Indicator::Cvd { .. } => "CVD",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub symbol: Ustr,
    pub resolution: Ustr,
    pub bars_count: u32,
    pub adjustment: Option<Ustr>,
    pub session: Option<Ustr>,
    pub indicators: Vec<Indicator>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchTimings {
    pub resolve_symbol: Duration,
    pub bars: Duration,
    pub indicators: Duration,
    pub total: Duration,
}

/// One requested indicator's bars plus the human-readable study name it was
/// computed from (e.g. `"CVD"`), so callers don't have to infer it back from
/// the map key.
#[derive(Debug, Clone)]
pub struct IndicatorResult {
    pub study_name: &'static str,
    pub bars: Vec<IndicatorBar>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: Ustr,
    pub bars: Vec<Bar>,
    pub metadata: Option<SymbolMetadata>,
    pub indicators: HashMap<Ustr, IndicatorResult>,
    pub timing: FetchTimings,
}

/// Scoped to one `fetch_symbol` call; the router writes into this only when
/// its session ids still match, preventing stale-symbol cross-contamination
/// on rapid switches.
#[derive(Debug, Clone)]
pub struct PendingFetch {
    pub symbol: Ustr,
    pub bars: Vec<Bar>,
    pub metadata: Option<SymbolMetadata>,
    pub indicators: HashMap<Ustr, Vec<IndicatorBar>>,
    pub symbol_session_id: Ustr,
    pub series_id: Ustr,
    /// indicator type -> study id
    pub study_ids: HashMap<Ustr, Ustr>,
    /// study id -> tracker request id, populated as each create_study is sent
    pub study_request_ids: HashMap<Ustr, u64>,
}

/// Monotonic id generators for one Connection.
pub struct SessionIds {
    pub chart_session: Ustr,
    pub quote_session: Ustr,
    symbol_session_counter: std::sync::atomic::AtomicU64,
    series_counter: std::sync::atomic::AtomicU64,
    turnaround_counter: std::sync::atomic::AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self {
            chart_session: Ustr::from(&frame::gen_session_id("cs")),
            quote_session: Ustr::from(&frame::gen_session_id("qs")),
            symbol_session_counter: std::sync::atomic::AtomicU64::new(0),
            series_counter: std::sync::atomic::AtomicU64::new(0),
            turnaround_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn next_symbol_session(&self) -> Ustr {
        let n = self.symbol_session_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        Ustr::from(&format!("sds_sym_{n}"))
    }

    pub fn next_series_id(&self) -> Ustr {
        let n = self.series_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        Ustr::from(&format!("sds_{n}"))
    }

    pub fn next_turnaround(&self) -> Ustr {
        let n = self.turnaround_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        Ustr::from(&format!("sds_{n}"))
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    pub request_count: u64,
    pub success_count: u64,
    pub response_times_ms: Vec<u64>,
}

struct StatsInner {
    request_count: u64,
    success_count: u64,
    response_times: VecDeque<Duration>,
}

pub struct FetchCoordinator {
    current_symbol: Mutex<Option<Ustr>>,
    pub pending: Mutex<Option<PendingFetch>>,
    stats: std::sync::Mutex<StatsInner>,
}

impl FetchCoordinator {
    pub fn new() -> Self {
        Self {
            current_symbol: Mutex::new(None),
            pending: Mutex::new(None),
            stats: std::sync::Mutex::new(StatsInner {
                request_count: 0,
                success_count: 0,
                response_times: VecDeque::with_capacity(RESPONSE_HISTORY_CAP),
            }),
        }
    }

    pub fn stats(&self) -> FetchStats {
        let inner = self.stats.lock().expect("fetch stats lock poisoned");
        FetchStats {
            request_count: inner.request_count,
            success_count: inner.success_count,
            response_times_ms: inner.response_times.iter().map(|d| d.as_millis() as u64).collect(),
        }
    }

    fn record_attempt(&self) {
        self.stats.lock().expect("fetch stats lock poisoned").request_count += 1;
    }

    fn record_success(&self, elapsed: Duration) {
        let mut inner = self.stats.lock().expect("fetch stats lock poisoned");
        inner.success_count += 1;
        if inner.response_times.len() == RESPONSE_HISTORY_CAP {
            inner.response_times.pop_front();
        }
        inner.response_times.push_back(elapsed);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_symbol(
        &self,
        request: FetchRequest,
        socket: &dyn WebSocketAdapter,
        tracker: &Arc<RequestTracker>,
        series: &SeriesRegistry,
        session_ids: &SessionIds,
        config: &ConnectionConfig,
        cvd_provider: &dyn CvdConfigProvider,
        state: &StateMachine,
    ) -> Result<FetchResult> {
        let started = Instant::now();

        match state.current() {
            ConnectionState::Ready => {}
            ConnectionState::Closed => return Err(Error::InvalidState(InvalidStateContext::Closed)),
            _ => return Err(Error::InvalidState(InvalidStateContext::Other)),
        }

        self.record_attempt();

        // Steps 1-2: symbol-switch cancellation.
        {
            let mut current = self.current_symbol.lock().await;
            if current.as_ref() != Some(&request.symbol) {
                if let Some(prev) = current.as_ref() {
                    let cancelled = tracker.cancel_symbol_requests(prev.as_str(), "Symbol switched");
                    if cancelled > 0 {
                        warn!("Symbol switched from {prev} to {}, cancelled {cancelled} pending request(s)", request.symbol);
                    }
                }
                *current = Some(request.symbol);
            }
        }

        // Step 3: prevent "exceed limit of series".
        let chart_session = session_ids.chart_session;
        series
            .cleanup_all(|cs, series_id| async move {
                let msg = OutgoingMessage::new("remove_series", vec![Value::from(cs.as_str()), Value::from(series_id.as_str())]);
                let encoded = frame::encode(&msg)?;
                socket.send(encoded).await
            })
            .await;

        // Step 4: allocate and install the pending-fetch record.
        let symbol_session_id = session_ids.next_symbol_session();
        let series_id = session_ids.next_series_id();
        {
            *self.pending.lock().await = Some(PendingFetch {
                symbol: request.symbol,
                bars: Vec::new(),
                metadata: None,
                indicators: HashMap::new(),
                symbol_session_id,
                series_id,
                study_ids: HashMap::new(),
                study_request_ids: HashMap::new(),
            });
        }

        let outcome = self
            .run_steps(&request, socket, tracker, series, session_ids, config, cvd_provider, chart_session, symbol_session_id, series_id)
            .await;

        // Step 9: clear the pointer only if it's still ours.
        {
            let mut guard = self.pending.lock().await;
            let still_ours = guard.as_ref().map(|pf| pf.series_id) == Some(series_id);
            if still_ours {
                *guard = None;
            }
        }

        match outcome {
            Ok((bars, metadata, indicators, timing)) => {
                self.record_success(started.elapsed());
                Ok(FetchResult {
                    symbol: request.symbol,
                    bars,
                    metadata,
                    indicators,
                    timing: FetchTimings { total: started.elapsed(), ..timing },
                })
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        request: &FetchRequest,
        socket: &dyn WebSocketAdapter,
        tracker: &Arc<RequestTracker>,
        series: &SeriesRegistry,
        session_ids: &SessionIds,
        config: &ConnectionConfig,
        cvd_provider: &dyn CvdConfigProvider,
        chart_session: Ustr,
        symbol_session_id: Ustr,
        series_id: Ustr,
    ) -> Result<(Vec<Bar>, Option<SymbolMetadata>, HashMap<Ustr, IndicatorResult>, FetchTimings)> {
        let mut timing = FetchTimings::default();

        // Step 5: resolve symbol.
        let resolve_start = Instant::now();
        let symbol_spec = frame::symbol_spec(
            request.symbol.as_str(),
            request.adjustment.as_deref(),
            request.session.as_deref(),
        )?;
        let resolve_created = tracker.create_request(
            RequestKind::ResolveSymbol,
            config.timeout_for(RequestKind::ResolveSymbol),
            Some(request.symbol),
            false,
            Some(symbol_session_id),
        )?;
        send(
            socket,
            "resolve_symbol",
            vec![Value::from(chart_session.as_str()), Value::from(symbol_session_id.as_str()), Value::from(symbol_spec)],
        )
        .await?;
        resolve_created.recv.await.map_err(|_| Error::Internal(Ustr::from("resolve_symbol responder dropped")))??;
        timing.resolve_symbol = resolve_start.elapsed();

        // Step 6: fetch bars.
        let bars_start = Instant::now();
        let turnaround = session_ids.next_turnaround();
        let series_created = tracker.create_request(
            RequestKind::CreateSeries,
            config.timeout_for(RequestKind::CreateSeries),
            Some(request.symbol),
            false,
            Some(turnaround),
        )?;
        series.register(series_id, series_created.request_id, chart_session);
        send(
            socket,
            "create_series",
            vec![
                Value::from(chart_session.as_str()),
                Value::from(series_id.as_str()),
                Value::from(turnaround.as_str()),
                Value::from(symbol_session_id.as_str()),
                Value::from(request.resolution.as_str()),
                Value::from(request.bars_count),
            ],
        )
        .await?;
        series_created.recv.await.map_err(|_| Error::Internal(Ustr::from("create_series responder dropped")))??;
        timing.bars = bars_start.elapsed();

        // Step 7: fetch indicators in parallel.
        let indicators_start = Instant::now();
        if !request.indicators.is_empty() {
            let mut futures = Vec::new();
            for indicator in &request.indicators {
                futures.push(self.fetch_indicator(indicator, socket, tracker, session_ids, config, cvd_provider, chart_session, series_id, request.symbol));
            }
            for result in join_all(futures).await {
                result?;
            }
        }
        timing.indicators = indicators_start.elapsed();

        let guard = self.pending.lock().await;
        let pf = guard.as_ref().ok_or_else(|| Error::Internal(Ustr::from("pending fetch missing at assembly")))?;

        let indicators = request
            .indicators
            .iter()
            .map(|indicator| {
                let bars = pf.indicators.get(&indicator.type_key()).cloned().unwrap_or_default();
                (indicator.type_key(), IndicatorResult { study_name: indicator.study_name(), bars })
            })
            .collect();

        Ok((pf.bars.clone(), pf.metadata.clone(), indicators, timing))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_indicator(
        &self,
        indicator: &Indicator,
        socket: &dyn WebSocketAdapter,
        tracker: &Arc<RequestTracker>,
        session_ids: &SessionIds,
        config: &ConnectionConfig,
        cvd_provider: &dyn CvdConfigProvider,
        chart_session: Ustr,
        series_id: Ustr,
        symbol: Ustr,
    ) -> Result<()> {
        match indicator {
            Indicator::Cvd { anchor_period, custom_timeframe } => {
                let study_id = Ustr::from(&format!("cvd_{}", epoch_millis()));
                let turnaround = session_ids.next_turnaround();
                let indicator_type = indicator.type_key();

                let cvd_config = cvd_provider.get_cvd_config(anchor_period.as_str()).await?;
                let study_config = cvd::build_cvd_study_config(&cvd_config, anchor_period.as_str(), custom_timeframe.as_deref());

                let created = tracker.create_request(
                    RequestKind::CreateStudy,
                    config.timeout_for(RequestKind::CreateStudy),
                    Some(symbol),
                    true,
                    Some(turnaround),
                )?;

                {
                    let mut guard = self.pending.lock().await;
                    if let Some(pf) = guard.as_mut() {
                        pf.study_ids.insert(indicator_type, study_id);
                        pf.study_request_ids.insert(study_id, created.request_id);
                    }
                }

                send(
                    socket,
                    "create_study",
                    vec![
                        Value::from(chart_session.as_str()),
                        Value::from(study_id.as_str()),
                        Value::from(turnaround.as_str()),
                        Value::from(series_id.as_str()),
                        Value::from(cvd::CVD_STUDY_NAME),
                        study_config,
                    ],
                )
                .await?;

                created.recv.await.map_err(|_| Error::Internal(Ustr::from("create_study responder dropped")))??;
                Ok(())
            }
        }
    }
}

impl Default for FetchCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn send(socket: &dyn WebSocketAdapter, method: &'static str, params: Vec<Value>) -> Result<()> {
    let msg = OutgoingMessage::new(method, params);
    let encoded = frame::encode(&msg)?;
    socket.send(encoded).await
}

/// `create_study` ids are minted as `<type>_<ms-epoch>`.
fn epoch_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
