use serde::{Deserialize, Serialize};
use thiserror::Error;
use ustr::Ustr;

/// Top level error type returned by every public operation in this crate.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    #[error("network error: {0}")]
    Network(Ustr),

    #[error("protocol error: {0}")]
    Protocol(Ustr),

    #[error("symbol error: {0}")]
    SymbolError(Ustr),

    #[error("data request timed out: {0}")]
    DataTimeout(Ustr),

    #[error("CVD study request timed out: {0}")]
    CvdTimeout(Ustr),

    #[error("request cancelled: {0}")]
    RequestCancelled(Ustr),

    #[error("connection closed (code {0:?})")]
    ConnectionClosed(Option<u16>),

    #[error("invalid state: {0}")]
    InvalidState(InvalidStateContext),

    #[error("stale connection: {0}")]
    StaleConnection(Ustr),

    #[error("request queue full (max {0} pending)")]
    QueueFull(usize),

    #[error("JSON error: {0}")]
    Json(Ustr),

    #[error("websocket error: {0}")]
    WebSocket(Ustr),

    #[error("url parse error: {0}")]
    UrlParse(Ustr),

    #[error("internal error: {0}")]
    Internal(Ustr),
}

/// Carries just enough context to decide recoverability for `invalid-state`,
/// whose recoverable-ness depends on *which* state the caller was in: a
/// `Closed` connection is recoverable (a pool can rebuild it transparently),
/// any other non-`Ready` state is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidStateContext {
    Closed,
    Other,
}

impl std::fmt::Display for InvalidStateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidStateContext::Closed => write!(f, "connection is closed"),
            InvalidStateContext::Other => write!(f, "connection not ready"),
        }
    }
}

impl Error {
    /// Whether the caller (or an enclosing pool) may retry/rebuild without
    /// manual intervention.
    pub fn recoverable(&self) -> bool {
        match self {
            Error::ConnectionTimeout(_) => true,
            Error::Network(_) => true,
            Error::Protocol(_) => false,
            Error::SymbolError(_) => false,
            Error::DataTimeout(_) => true,
            Error::CvdTimeout(_) => true,
            Error::RequestCancelled(_) => false,
            Error::ConnectionClosed(code) => matches!(code, Some(1006) | None),
            Error::InvalidState(ctx) => matches!(ctx, InvalidStateContext::Closed),
            Error::StaleConnection(_) => true,
            Error::QueueFull(_) => false,
            Error::Json(_) => false,
            Error::WebSocket(_) => false,
            Error::UrlParse(_) => false,
            Error::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Ustr::from(&err.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as TErr;
        match err {
            TErr::ConnectionClosed | TErr::AlreadyClosed => Error::ConnectionClosed(None),
            other => Error::WebSocket(Ustr::from(&other.to_string())),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParse(Ustr::from(&err.to_string()))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::DataTimeout(Ustr::from("timed out"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
