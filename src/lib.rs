//! Long-lived, full-duplex client for TradingView's chart-data WebSocket
//! protocol: connects, authenticates, and fetches OHLCV bars (plus optional
//! CVD studies) for one symbol at a time per connection, with a pool on top
//! for running several connections under one credential.
//!
//! Each module below owns one piece of the protocol — framing, state,
//! request tracking, heartbeats, series lifecycle, message routing, symbol
//! fetches, and handshake — and [`connection::Connection`] composes them
//! behind one facade. [`pool::ConnectionPool`]/[`pool::PoolRegistry`] manage
//! several connections at once.

pub mod config;
pub mod connection;
pub mod cvd;
pub mod error;
pub mod fetch;
pub mod frame;
pub mod heartbeat;
pub mod init;
pub mod models;
pub mod pool;
pub mod router;
pub mod series;
pub mod socket_adapter;
pub mod state;
pub mod tracker;

pub use config::{ConnectionConfig, PoolConfig, RequestKind};
pub use connection::{Connection, ConnectionStats};
pub use cvd::{CvdConfig, CvdConfigProvider, MockCvdConfigProvider};
pub use error::{Error, InvalidStateContext, Result};
pub use fetch::{FetchRequest, FetchResult, FetchStats, FetchTimings, Indicator, IndicatorResult};
pub use models::{Bar, IndicatorBar, SymbolMetadata};
pub use pool::{ConnectionFactory, ConnectionPool, DefaultConnectionFactory, PoolFetchRequest, PoolRegistry, PoolStats};
pub use socket_adapter::{MockConnector, MockSocket, TungsteniteConnector, TungsteniteSocket, WebSocketAdapter, WebSocketConnector};
pub use state::ConnectionState;
