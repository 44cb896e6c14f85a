//! Call session store: the polled record that stands in for a push
//! signaling channel.
//!
//! The store is an external collaborator. `HttpSessionStore` talks to a REST
//! deployment; `MemoryBackend` keeps sessions in-process for demos and tests.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calling::{CallKind, CallStatus, Identity};

pub use http::HttpSessionStore;
pub use memory::{MemoryBackend, MemorySessionStore};

/// Snapshot of a call session as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub caller: Identity,
    pub callee: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Errors reported by a session store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("call session {0} not found")]
    NotFound(String),

    #[error("call session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: CallStatus,
        to: CallStatus,
    },

    #[error("call session {0} already carries a different answer")]
    AnswerConflict(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("store request failed: {0}")]
    Transport(String),

    #[error("malformed store response: {0}")]
    Decode(String),
}

/// Operations the call engine consumes from the session store.
///
/// Implementations must tolerate duplicate `(id, status)` and `(id, answer)`
/// submissions: repeating one returns the current snapshot unchanged.
#[async_trait]
pub trait CallSessionStore: Send + Sync {
    /// Register an outgoing call. The store assigns the id atomically with
    /// the initial offer; the returned snapshot has status `initiated`.
    async fn create_call(
        &self,
        callee: &Identity,
        kind: CallKind,
        offer: &str,
    ) -> Result<CallSession, StoreError>;

    /// Fetch one session. `None` when the store no longer knows the id.
    async fn fetch_session(&self, id: &str) -> Result<Option<CallSession>, StoreError>;

    async fn update_status(&self, id: &str, status: CallStatus)
        -> Result<CallSession, StoreError>;

    async fn submit_answer(&self, id: &str, answer: &str) -> Result<CallSession, StoreError>;

    /// Calls addressed to `callee` that are still awaiting a response.
    async fn list_pending_inbound(&self, callee: &Identity)
        -> Result<Vec<CallSession>, StoreError>;

    /// Display name lookup for prompts. Stores without a directory return `None`.
    async fn display_name(&self, _who: &Identity) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}
