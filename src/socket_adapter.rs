//! Injected WebSocket collaborator.
//!
//! `TungsteniteSocket` wraps `connect_async_with_config`'s split sink/stream
//! pair. `MockSocket` is the scripted test adapter used by the integration
//! tests in `tests/`.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};

use crate::error::{Error, Result};

#[async_trait]
pub trait WebSocketAdapter: Send + Sync + 'static {
    async fn send(&self, message: Message) -> Result<()>;

    /// Returns `Ok(None)` when the stream has ended cleanly.
    async fn recv(&self) -> Result<Option<Message>>;

    async fn close(&self, code: u16, reason: &str) -> Result<()>;

    fn ready_state(&self) -> ReadyState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closed,
}

/// `Origin`/`User-Agent` headers sent on every handshake, built fresh per
/// connect attempt rather than cached behind a process-wide static.
pub fn default_headers() -> HeaderMap<HeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert("Origin", HeaderValue::from_static("https://www.tradingview.com"));
    headers.insert(
        "User-Agent",
        HeaderValue::from_static("Mozilla/5.0 (compatible; tv-chart-client)"),
    );
    headers
}

pub struct TungsteniteSocket {
    write: Mutex<futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>,
    read: Mutex<futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl TungsteniteSocket {
    pub async fn connect(url: &str, headers: &HeaderMap<HeaderValue>) -> Result<Self> {
        let mut request = url.into_client_request().map_err(tokio_tungstenite::tungstenite::Error::from)?;
        request.headers_mut().extend(headers.clone());

        let config = WebSocketConfig::default()
            .read_buffer_size(1024 * 1024)
            .write_buffer_size(1024 * 1024);

        let (socket, _response) = connect_async_with_config(request, Some(config), false).await?;
        let (write, read) = socket.split();

        Ok(Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl WebSocketAdapter for TungsteniteSocket {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(Error::ConnectionClosed(None));
        }
        self.write.lock().await.send(message).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Message>> {
        let mut read = self.read.lock().await;
        match read.next().await {
            Some(Ok(msg)) => {
                if msg.is_close() {
                    self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
                }
                Ok(Some(msg))
            }
            Some(Err(e)) => {
                self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
                Err(Error::from(e))
            }
            None => {
                self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn close(&self, _code: u16, _reason: &str) -> Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        self.write.lock().await.close().await?;
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            ReadyState::Closed
        } else {
            ReadyState::Open
        }
    }
}

/// Scripted test adapter: a preloaded inbound queue plus an outbound capture
/// list, so tests can assert on exactly what the client sent and script
/// exactly what it receives.
pub struct MockSocket {
    inbound: Mutex<VecDeque<Message>>,
    outbound: Mutex<Vec<Message>>,
    closed: std::sync::atomic::AtomicBool,
    notify: tokio::sync::Notify,
}

impl MockSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Queue a message for the next `recv()` call to return.
    pub async fn push_inbound(&self, message: Message) {
        self.inbound.lock().await.push_back(message);
        self.notify.notify_waiters();
    }

    pub async fn push_inbound_text(&self, text: impl Into<String>) {
        self.push_inbound(Message::text(text.into())).await;
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.outbound.lock().await.clone()
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.outbound
            .lock()
            .await
            .iter()
            .filter_map(|m| m.clone().into_text().ok().map(|t| t.to_string()))
            .collect()
    }
}

#[async_trait]
impl WebSocketAdapter for MockSocket {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(Error::ConnectionClosed(None));
        }
        self.outbound.lock().await.push(message);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Message>> {
        loop {
            if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(None);
            }
            if let Some(msg) = self.inbound.lock().await.pop_front() {
                return Ok(Some(msg));
            }
            self.notify.notified().await;
        }
    }

    async fn close(&self, _code: u16, _reason: &str) -> Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            ReadyState::Closed
        } else {
            ReadyState::Open
        }
    }
}

/// Produces a connected [`WebSocketAdapter`]; the seam `src/init.rs` connects
/// through, so tests can substitute a prebuilt [`MockSocket`] for the real
/// `connect_async_with_config` call.
#[async_trait]
pub trait WebSocketConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn WebSocketAdapter>>;
}

pub struct TungsteniteConnector {
    pub url: String,
    pub headers: HeaderMap<HeaderValue>,
}

#[async_trait]
impl WebSocketConnector for TungsteniteConnector {
    async fn connect(&self) -> Result<Arc<dyn WebSocketAdapter>> {
        let socket = TungsteniteSocket::connect(&self.url, &self.headers).await?;
        Ok(Arc::new(socket))
    }
}

/// Always hands back the same preconstructed [`MockSocket`] — the point is
/// to let tests script a socket before `Connection::connect` runs.
pub struct MockConnector {
    pub socket: Arc<MockSocket>,
}

#[async_trait]
impl WebSocketConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn WebSocketAdapter>> {
        Ok(Arc::clone(&self.socket) as Arc<dyn WebSocketAdapter>)
    }
}
