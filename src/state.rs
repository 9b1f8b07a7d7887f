//! Connection lifecycle state machine.
//!
//! An explicit state graph rather than a bare `is_closed: AtomicBool`, using
//! a `tokio::sync::watch` channel for subscription/fan-out.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{error, warn};

const HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Ready,
    Error,
    Closed,
}

impl ConnectionState {
    /// Is `to` a legal next state from `self`?
    fn allows(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Authenticating)
                | (Connected, Error)
                | (Authenticating, Authenticated)
                | (Authenticating, Error)
                | (Authenticated, Ready)
                | (Authenticated, Error)
                | (Ready, Ready)
                | (Ready, Error)
                | (Ready, Closed)
                | (Error, Disconnected)
                | (Error, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: Instant,
}

/// Thread-safe observable state machine. `transition` enforces the legal
/// table; `force_transition` is the escape hatch for error-recovery paths
/// (e.g. an unexpected socket close always drives state to `Closed`).
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
    history: std::sync::Mutex<VecDeque<Transition>>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            history: std::sync::Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Attempt a legal transition. Fails loudly (returns `Err`) if illegal.
    pub fn transition(&self, to: ConnectionState) -> Result<(), IllegalTransition> {
        let from = self.current();
        if !from.allows(to) {
            error!("illegal state transition attempted: {from:?} -> {to:?}");
            return Err(IllegalTransition { from, to });
        }
        self.record(from, to);
        let _ = self.tx.send(to);
        Ok(())
    }

    /// Force a transition regardless of the legal table. Used for recovery
    /// paths such as "socket died unexpectedly -> Closed".
    pub fn force_transition(&self, to: ConnectionState) {
        let from = self.current();
        if !from.allows(to) {
            warn!("forcing illegal transition {from:?} -> {to:?} for error recovery");
        }
        self.record(from, to);
        let _ = self.tx.send(to);
    }

    fn record(&self, from: ConnectionState, to: ConnectionState) {
        let mut history = self.history.lock().expect("state history lock poisoned");
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(Transition {
            from,
            to,
            at: Instant::now(),
        });
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history
            .lock()
            .expect("state history lock poisoned")
            .iter()
            .copied()
            .collect()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("illegal state transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}
