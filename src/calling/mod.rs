//! Call lifecycle engine: local call state, negotiation, media and the
//! pollers that reconcile it with the remote session store.

pub mod controller;
pub mod devices;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod orchestrator;
pub mod poller;
pub mod sdp;
pub mod transport;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use media::MediaError;
use negotiation::NegotiationError;

pub use controller::CallSessionController;
pub use orchestrator::{CallHandle, CallOrchestrator, CallView};

/// Opaque reference to a user known to the session store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used when no display name is known.
    pub fn short(&self) -> &str {
        let id = self.0.as_str();
        match id.char_indices().nth(12) {
            Some((idx, _)) => &id[..idx],
            None => id,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    /// Capture profile needed to take part in a call of this kind.
    pub fn capture_profile(self) -> media::CaptureProfile {
        media::CaptureProfile {
            audio: true,
            video: self == CallKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }
}

/// Status of a call session as recorded by the store.
///
/// Statuses only move forward along `Initiated → Ringing → InProgress → Ended`,
/// or `Ringing → Missed`. `Ended` and `Missed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Missed)
    }

    fn rank(self) -> u8 {
        match self {
            CallStatus::Initiated => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            CallStatus::Ended | CallStatus::Missed => 3,
        }
    }

    /// Whether `self → next` is a legal forward transition.
    ///
    /// Staying on the same status is not a transition; callers treat it as
    /// an idempotent resubmission.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            CallStatus::Missed => self == CallStatus::Ringing,
            _ => next.rank() > self.rank(),
        }
    }

    /// Whether `self` is further along the lifecycle than `other`.
    pub fn is_ahead_of(self, other: CallStatus) -> bool {
        self.rank() > other.rank()
    }

    /// Human-readable label for status displays.
    pub fn label(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "Initiated",
            CallStatus::Ringing => "Ringing",
            CallStatus::InProgress => "In Progress",
            CallStatus::Ended => "Ended",
            CallStatus::Missed => "Missed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }
}

/// Local, never-persisted view of the active call.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCallView {
    /// Store-assigned id; empty until an outgoing call is registered.
    pub id: String,
    pub kind: CallKind,
    pub peer: Identity,
    pub peer_name: String,
    pub direction: Direction,
    pub status: CallStatus,
    pub minimized: bool,
    pub muted: bool,
}

impl LocalCallView {
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Tunables of the call engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSettings {
    /// Interval between fetches of the active call's session.
    pub poll_interval: Duration,
    /// Interval between listings of calls addressed to us.
    pub incoming_poll_interval: Duration,
    /// Consecutive fetch failures before an error is surfaced.
    pub fetch_retry_limit: usize,
    /// Upper bound on address gathering per offer/answer.
    pub gathering_timeout: Duration,
    pub stun_servers: Vec<String>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            incoming_poll_interval: Duration::from_secs(2),
            fetch_retry_limit: 3,
            gathering_timeout: negotiation::DEFAULT_GATHERING_TIMEOUT,
            stun_servers: vec![ice::DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

/// Failure of a call setup step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
