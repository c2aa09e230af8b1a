//! Connection state machine
//!
//! Every legal move is one row of `TRANSITIONS`. Link loss is accepted from
//! any state and always lands in `Disconnected`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    ServicesDiscovered,
    Ready,
    Authenticating,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ServicesDiscovered => write!(f, "services discovered"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
        }
    }
}

/// Input to the state machine, derived from transport events and local
/// decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    ScanStarted,
    ReconnectRequested,
    TargetDiscovered,
    LinkUp,
    ServicesResolved,
    CharacteristicsResolved,
    HandshakeDispatched,
    HandshakeFinished,
    HandshakeAborted,
    LinkLost,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition: {trigger} in state {from}")]
    InvalidTransition {
        from: ConnectionState,
        trigger: Trigger,
    },
}

use ConnectionState as S;

/// (from, trigger, to)
static TRANSITIONS: &[(ConnectionState, Trigger, ConnectionState)] = &[
    (S::Disconnected, Trigger::ScanStarted, S::Scanning),
    (S::Disconnected, Trigger::ReconnectRequested, S::Connecting),
    (S::Scanning, Trigger::TargetDiscovered, S::Connecting),
    (S::Connecting, Trigger::LinkUp, S::Connected),
    (S::Connected, Trigger::ServicesResolved, S::ServicesDiscovered),
    (S::ServicesDiscovered, Trigger::CharacteristicsResolved, S::Ready),
    (S::Ready, Trigger::HandshakeDispatched, S::Authenticating),
    (S::Authenticating, Trigger::HandshakeFinished, S::Ready),
    (S::Authenticating, Trigger::HandshakeAborted, S::Ready),
];

impl ConnectionState {
    /// Look up the successor state for `trigger`
    pub fn apply(self, trigger: Trigger) -> Result<ConnectionState, StateError> {
        if trigger == Trigger::LinkLost {
            return Ok(S::Disconnected);
        }

        TRANSITIONS
            .iter()
            .find(|(from, t, _)| *from == self && *t == trigger)
            .map(|(_, _, to)| *to)
            .ok_or(StateError::InvalidTransition {
                from: self,
                trigger,
            })
    }

    /// A link to the peripheral is up
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            S::Connected | S::ServicesDiscovered | S::Ready | S::Authenticating
        )
    }

    /// Nothing in progress; safe to begin discovery
    pub fn is_idle(&self) -> bool {
        *self == S::Disconnected
    }
}
