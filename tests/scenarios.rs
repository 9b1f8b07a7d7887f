//! End-to-end scenarios driven against `MockSocket`, covering the literal
//! S1/S2/S5/S6 cases (S3 and S4 are exercised as focused unit tests
//! alongside `tracker.rs`/`router.rs`).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use ustr::Ustr;

use tv_chart_client::connection::Connection;
use tv_chart_client::cvd::MockCvdConfigProvider;
use tv_chart_client::error::Error;
use tv_chart_client::fetch::{FetchRequest, Indicator};
use tv_chart_client::frame::{self, OutgoingMessage};
use tv_chart_client::pool::{ConnectionFactory, ConnectionPool};
use tv_chart_client::socket_adapter::{MockConnector, MockSocket, WebSocketAdapter};
use tv_chart_client::state::ConnectionState;
use tv_chart_client::{ConnectionConfig, PoolConfig, PoolFetchRequest, Result};

fn config() -> ConnectionConfig {
    ConnectionConfig::builder().jwt_token(Ustr::from("t1")).build()
}

async fn connect_ready() -> (Arc<Connection>, Arc<MockSocket>) {
    let socket = MockSocket::new();
    let connector = MockConnector { socket: Arc::clone(&socket) };
    let cvd = Arc::new(MockCvdConfigProvider::new());
    let connection = Connection::connect(config(), &connector, cvd).await.unwrap();
    (connection, socket)
}

/// Blocks until `socket.sent_texts()` has at least `n` entries, polling every
/// 5ms up to a few seconds — the fetch coordinator runs concurrently with the
/// scripted server side in every one of these scenarios.
async fn wait_for_sent_count(socket: &MockSocket, n: usize) -> Vec<String> {
    for _ in 0..400 {
        let sent = socket.sent_texts().await;
        if sent.len() >= n {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {n} sent message(s), got {:?}", socket.sent_texts().await);
}

fn decoded(sent: &str) -> (String, Vec<Value>) {
    match &frame::decode(sent)[..] {
        [frame::Frame::Message(m)] => (m.m.clone(), m.p.clone()),
        other => panic!("expected exactly one Message frame, got {other:?}"),
    }
}

async fn push_server_message(socket: &MockSocket, method: &'static str, params: Vec<Value>) {
    let message = frame::encode(&OutgoingMessage::new(method, params)).unwrap();
    socket.push_inbound(message).await;
}

fn symbol_metadata(name: &str) -> Value {
    json!({
        "name": name, "full_name": format!("NSE:{name}"), "ticker": name, "exchange": "NSE",
        "type": "stock", "timezone": "Asia/Kolkata", "minmov": 1, "pricescale": 100, "session": "0915-1530"
    })
}

fn bar_rows(count: usize, start_time: i64, start_open: f64) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let t = start_time + i as i64;
            let o = start_open + i as f64;
            json!({ "i": i, "v": [t, o, o + 10.0, o - 10.0, o + 1.0, 1000.0 + i as f64] })
        })
        .collect()
}

fn study_rows(count: usize, start_time: i64) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let t = start_time + i as i64;
            json!({ "i": i, "v": [t, 42.0 + i as f64] })
        })
        .collect()
}

#[tokio::test]
async fn s1_happy_path_resolves_with_bars() {
    let (connection, socket) = connect_ready().await;

    let fetch = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move {
            connection
                .fetch_symbol(FetchRequest {
                    symbol: Ustr::from("NSE:TCS"),
                    resolution: Ustr::from("1D"),
                    bars_count: 300,
                    adjustment: None,
                    session: None,
                    indicators: vec![],
                })
                .await
        }
    });

    let sent = wait_for_sent_count(&socket, 5).await; // 4 handshake + resolve_symbol
    let (method, params) = decoded(&sent[4]);
    assert_eq!(method, "resolve_symbol");
    let symbol_session = params[1].as_str().unwrap().to_string();
    push_server_message(&socket, "symbol_resolved", vec![Value::from("cs"), Value::from(symbol_session.as_str()), symbol_metadata("TCS")]).await;

    let sent = wait_for_sent_count(&socket, 6).await;
    let (method, params) = decoded(&sent[5]);
    assert_eq!(method, "create_series");
    let series_id = params[1].as_str().unwrap().to_string();

    let data = json!({ series_id: { "s": bar_rows(300, 1703376000, 3500.0) } });
    push_server_message(&socket, "timescale_update", vec![Value::from("cs"), data]).await;

    let result = fetch.await.unwrap().unwrap();
    assert_eq!(result.bars.len(), 300);
    assert_eq!(result.bars[0].open, 3500.0);
    assert_eq!(connection.get_state(), ConnectionState::Ready);
}

#[tokio::test]
async fn s2_symbol_switch_cancels_prior_fetch() {
    let (connection, socket) = connect_ready().await;

    let reliance = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move {
            connection
                .fetch_symbol(FetchRequest {
                    symbol: Ustr::from("NSE:RELIANCE"),
                    resolution: Ustr::from("1D"),
                    bars_count: 300,
                    adjustment: None,
                    session: None,
                    indicators: vec![Indicator::Cvd { anchor_period: Ustr::from("3M"), custom_timeframe: None }],
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let tcs = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move {
            connection
                .fetch_symbol(FetchRequest {
                    symbol: Ustr::from("NSE:TCS"),
                    resolution: Ustr::from("1D"),
                    bars_count: 300,
                    adjustment: None,
                    session: None,
                    indicators: vec![],
                })
                .await
        }
    });

    // 4 handshake + RELIANCE resolve_symbol + TCS resolve_symbol.
    let sent = wait_for_sent_count(&socket, 6).await;
    let (method, params) = decoded(&sent[5]);
    assert_eq!(method, "resolve_symbol");
    let symbol_session = params[1].as_str().unwrap().to_string();
    push_server_message(&socket, "symbol_resolved", vec![Value::from("cs"), Value::from(symbol_session.as_str()), symbol_metadata("TCS")]).await;

    let sent = wait_for_sent_count(&socket, 7).await;
    let (method, params) = decoded(&sent[6]);
    assert_eq!(method, "create_series");
    let series_id = params[1].as_str().unwrap().to_string();
    let data = json!({ series_id: { "s": bar_rows(300, 1703376000, 3500.0) } });
    push_server_message(&socket, "timescale_update", vec![Value::from("cs"), data]).await;

    let reliance_result = reliance.await.unwrap();
    assert!(matches!(reliance_result, Err(Error::RequestCancelled(_))));

    let tcs_result = tcs.await.unwrap().unwrap();
    assert_eq!(tcs_result.bars.len(), 300);
    assert_eq!(connection.get_state(), ConnectionState::Ready);
}

#[tokio::test]
async fn s6_cvd_success_path() {
    let (connection, socket) = connect_ready().await;

    let fetch = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move {
            connection
                .fetch_symbol(FetchRequest {
                    symbol: Ustr::from("NSE:TCS"),
                    resolution: Ustr::from("1D"),
                    bars_count: 300,
                    adjustment: None,
                    session: None,
                    indicators: vec![Indicator::Cvd { anchor_period: Ustr::from("3M"), custom_timeframe: None }],
                })
                .await
        }
    });

    let sent = wait_for_sent_count(&socket, 5).await;
    let (_, params) = decoded(&sent[4]);
    let symbol_session = params[1].as_str().unwrap().to_string();
    push_server_message(&socket, "symbol_resolved", vec![Value::from("cs"), Value::from(symbol_session.as_str()), symbol_metadata("TCS")]).await;

    let sent = wait_for_sent_count(&socket, 6).await;
    let (method, params) = decoded(&sent[5]);
    assert_eq!(method, "create_series");
    let series_id = params[1].as_str().unwrap().to_string();

    // create_study is sent concurrently with create_series (step 7 runs once
    // step 6 settles, but the indicator's own create_study still needs its
    // own scripted response) — wait for it once create_series has settled.
    let data = json!({ series_id: { "s": bar_rows(300, 1703376000, 3500.0) } });
    push_server_message(&socket, "timescale_update", vec![Value::from("cs"), data]).await;

    let sent = wait_for_sent_count(&socket, 7).await;
    let (method, params) = decoded(&sent[6]);
    assert_eq!(method, "create_study");
    let study_id = params[1].as_str().unwrap().to_string();

    let study_data = json!({ study_id: { "st": study_rows(300, 1703376000) } });
    push_server_message(&socket, "timescale_update", vec![Value::from("cs"), study_data]).await;

    let result = fetch.await.unwrap().unwrap();
    let cvd = result.indicators.get(&Ustr::from("cvd")).expect("cvd indicator missing from result");
    assert_eq!(cvd.study_name, "CVD");
    assert_eq!(cvd.bars.len(), 300);
    assert_eq!(cvd.bars[0].time, 1703376000);
}

struct ScriptedFactory {
    sockets: std::sync::Mutex<Vec<Arc<MockSocket>>>,
    next: AtomicUsize,
    cvd: Arc<MockCvdConfigProvider>,
}

impl ScriptedFactory {
    fn new(sockets: Vec<Arc<MockSocket>>) -> Arc<Self> {
        Arc::new(Self {
            sockets: std::sync::Mutex::new(sockets),
            next: AtomicUsize::new(0),
            cvd: Arc::new(MockCvdConfigProvider::new()),
        })
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn create(&self) -> Result<Arc<Connection>> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let socket = self.sockets.lock().unwrap()[index].clone();
        let connector = MockConnector { socket };
        let cvd: Arc<dyn tv_chart_client::CvdConfigProvider> = Arc::clone(&self.cvd);
        Connection::connect(config(), &connector, cvd).await
    }
}

async fn drive_one_fetch(socket: &MockSocket, already_sent: usize) {
    let sent = wait_for_sent_count(socket, already_sent + 1).await;
    let (_, params) = decoded(&sent[already_sent]);
    let symbol_session = params[1].as_str().unwrap().to_string();
    push_server_message(socket, "symbol_resolved", vec![Value::from("cs"), Value::from(symbol_session.as_str()), symbol_metadata("TCS")]).await;

    let sent = wait_for_sent_count(socket, already_sent + 2).await;
    let (method, params) = decoded(&sent[already_sent + 1]);
    assert_eq!(method, "create_series");
    let series_id = params[1].as_str().unwrap().to_string();
    let data = json!({ series_id: { "s": bar_rows(300, 1703376000, 3500.0) } });
    push_server_message(socket, "timescale_update", vec![Value::from("cs"), data]).await;
}

#[tokio::test]
async fn s5_pool_rebuilds_a_closed_connection_transparently() {
    let first_socket = MockSocket::new();
    let second_socket = MockSocket::new();
    let factory = ScriptedFactory::new(vec![Arc::clone(&first_socket), Arc::clone(&second_socket)]);

    let pool_config = PoolConfig::builder().max_connections(1).acquire_poll_interval(Duration::from_millis(5)).build();
    let pool = ConnectionPool::new(pool_config, factory);

    let request = || PoolFetchRequest {
        symbol: Ustr::from("NSE:TCS"),
        resolution: Ustr::from("1D"),
        bars_count: 300,
        adjustment: None,
        session: None,
        cvd_enabled: false,
        cvd_anchor_period: None,
        cvd_timeframe: None,
    };

    let pool_for_first = Arc::clone(&pool);
    let first_fetch = tokio::spawn(async move { pool_for_first.fetch_chart_data(request()).await });
    drive_one_fetch(&first_socket, 4).await;
    let first_result = first_fetch.await.unwrap().unwrap();
    assert_eq!(first_result.bars.len(), 300);

    // Force the connection dead without the pool's involvement, as a real
    // socket drop would.
    first_socket.close(1006, "simulated drop").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let pool_for_second = Arc::clone(&pool);
    let second_fetch = tokio::spawn(async move { pool_for_second.fetch_chart_data(request()).await });
    drive_one_fetch(&second_socket, 4).await;
    let second_result = second_fetch.await.unwrap().unwrap();
    assert_eq!(second_result.bars.len(), 300);
}
