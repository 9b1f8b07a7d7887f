//! Connect, authenticate, and create the chart/quote sessions.
//!
//! An explicit async factory rather than an eager constructor-started
//! connect: this function is called once by `Connection::connect`, never
//! from a constructor, so a half-initialized `Connection` never escapes.

use std::sync::Arc;

use serde_json::Value;
use ustr::Ustr;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::fetch::SessionIds;
use crate::frame::{self, OutgoingMessage};
use crate::socket_adapter::{WebSocketAdapter, WebSocketConnector};
use crate::state::{ConnectionState, StateMachine};

/// Build the connect URL's query string: `from=chart/<chartId>/`,
/// `date=<ISO now>`, `type=chart`.
pub fn build_connect_url(config: &ConnectionConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(config.websocket_url.as_str())?;
    url.query_pairs_mut()
        .append_pair("from", &format!("chart/{}/", config.chart_id))
        .append_pair("date", &chrono::Utc::now().to_rfc3339())
        .append_pair("type", "chart");
    Ok(url)
}

/// Runs the full init sequence once. Any failure forces the state machine to
/// `Error` and propagates to the caller.
pub async fn initialize(
    config: &ConnectionConfig,
    connector: &dyn WebSocketConnector,
    state: &StateMachine,
    session_ids: &SessionIds,
) -> Result<Arc<dyn WebSocketAdapter>> {
    match run(config, connector, state, session_ids).await {
        Ok(socket) => Ok(socket),
        Err(e) => {
            state.force_transition(ConnectionState::Error);
            Err(e)
        }
    }
}

async fn run(
    config: &ConnectionConfig,
    connector: &dyn WebSocketConnector,
    state: &StateMachine,
    session_ids: &SessionIds,
) -> Result<Arc<dyn WebSocketAdapter>> {
    transition(state, ConnectionState::Connecting)?;

    let socket = tokio::time::timeout(config.connect_timeout, connector.connect())
        .await
        .map_err(|_| Error::ConnectionTimeout(config.connect_timeout))?
        .map_err(|e| Error::Network(Ustr::from(&e.to_string())))?;

    transition(state, ConnectionState::Connected)?;

    transition(state, ConnectionState::Authenticating)?;
    send(socket.as_ref(), "set_auth_token", vec![Value::from(config.jwt_token.as_str())]).await?;
    send(socket.as_ref(), "set_locale", vec![Value::from("en"), Value::from("US")]).await?;
    transition(state, ConnectionState::Authenticated)?;

    send(
        socket.as_ref(),
        "chart_create_session",
        vec![Value::from(session_ids.chart_session.as_str()), Value::from("")],
    )
    .await?;
    send(
        socket.as_ref(),
        "quote_create_session",
        vec![Value::from(session_ids.quote_session.as_str())],
    )
    .await?;
    transition(state, ConnectionState::Ready)?;

    Ok(socket)
}

fn transition(state: &StateMachine, to: ConnectionState) -> Result<()> {
    state
        .transition(to)
        .map_err(|e| Error::Internal(Ustr::from(&e.to_string())))
}

async fn send(socket: &dyn WebSocketAdapter, method: &'static str, params: Vec<Value>) -> Result<()> {
    let msg = OutgoingMessage::new(method, params);
    let encoded = frame::encode(&msg)?;
    socket.send(encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_adapter::{MockConnector, MockSocket};

    fn config() -> ConnectionConfig {
        ConnectionConfig::builder().jwt_token(Ustr::from("t1")).build()
    }

    #[tokio::test]
    async fn initialize_drives_state_to_ready_and_sends_handshake_messages() {
        let socket = MockSocket::new();
        let connector = MockConnector { socket: Arc::clone(&socket) };
        let state = StateMachine::new();
        let session_ids = SessionIds::new();

        let result = initialize(&config(), &connector, &state, &session_ids).await;

        assert!(result.is_ok());
        assert_eq!(state.current(), ConnectionState::Ready);

        let sent = socket.sent_texts().await;
        assert_eq!(sent.len(), 4);
        assert!(sent[0].contains("set_auth_token"));
        assert!(sent[1].contains("set_locale"));
        assert!(sent[2].contains("chart_create_session"));
        assert!(sent[3].contains("quote_create_session"));
    }

    #[tokio::test]
    async fn initialize_times_out_if_connect_never_returns() {
        struct NeverConnects;
        #[async_trait::async_trait]
        impl WebSocketConnector for NeverConnects {
            async fn connect(&self) -> Result<Arc<dyn WebSocketAdapter>> {
                std::future::pending().await
            }
        }

        let mut cfg = config();
        cfg.connect_timeout = std::time::Duration::from_millis(20);
        let state = StateMachine::new();
        let session_ids = SessionIds::new();

        let result = initialize(&cfg, &NeverConnects, &state, &session_ids).await;
        assert!(matches!(result, Err(Error::ConnectionTimeout(_))));
        assert_eq!(state.current(), ConnectionState::Error);
    }

    #[test]
    fn connect_url_carries_required_query_params() {
        let cfg = config();
        let url = build_connect_url(&cfg).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("type").unwrap(), "chart");
        assert!(query.get("from").unwrap().starts_with("chart/"));
        assert!(query.contains_key("date"));
    }
}
