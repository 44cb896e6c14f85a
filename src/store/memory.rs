//! In-process session store.
//!
//! One `MemoryBackend` holds every session; each participant talks to it
//! through its own `MemorySessionStore`, which plays the role of an
//! authenticated client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{CallSession, CallSessionStore, StoreError};
use crate::calling::{CallKind, CallStatus, Identity};

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, CallSession>,
    /// Registration order, so listings are stable.
    order: Vec<String>,
    names: HashMap<Identity, String>,
}

/// Shared state behind every `MemorySessionStore`.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    sessions: Arc<Mutex<Sessions>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client view of the backend acting as `identity`.
    pub fn connect(&self, identity: Identity) -> MemorySessionStore {
        MemorySessionStore {
            backend: self.clone(),
            identity,
        }
    }

    pub fn set_display_name(&self, who: &Identity, name: &str) {
        self.lock().names.insert(who.clone(), name.to_string());
    }

    /// Snapshot of one session, bypassing participant checks.
    pub fn session(&self, id: &str) -> Option<CallSession> {
        self.lock().by_id.get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sessions> {
        // A poisoned lock only means a panicking test thread; the map is still usable.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `CallSessionStore` bound to one participant of a `MemoryBackend`.
#[derive(Clone)]
pub struct MemorySessionStore {
    backend: MemoryBackend,
    identity: Identity,
}

impl MemorySessionStore {
    fn with_participant_session<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut CallSession) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut sessions = self.backend.lock();
        let session = sessions
            .by_id
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if session.caller != self.identity && session.callee != self.identity {
            return Err(StoreError::Unauthorized(format!(
                "{} is not a participant of {}",
                self.identity, id
            )));
        }
        f(session)
    }
}

#[async_trait]
impl CallSessionStore for MemorySessionStore {
    async fn create_call(
        &self,
        callee: &Identity,
        kind: CallKind,
        offer: &str,
    ) -> Result<CallSession, StoreError> {
        let session = CallSession {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: CallStatus::Initiated,
            caller: self.identity.clone(),
            callee: callee.clone(),
            offer: Some(offer.to_string()),
            answer: None,
            start_time: Utc::now(),
            end_time: None,
        };
        let mut sessions = self.backend.lock();
        sessions.order.push(session.id.clone());
        sessions.by_id.insert(session.id.clone(), session.clone());
        tracing::debug!("Memory store: registered call {} -> {}", session.id, callee);
        Ok(session)
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        match self.with_participant_session(id, |s| Ok(s.clone())) {
            Ok(session) => Ok(Some(session)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_status(
        &self,
        id: &str,
        status: CallStatus,
    ) -> Result<CallSession, StoreError> {
        self.with_participant_session(id, |session| {
            if session.status == status {
                return Ok(session.clone());
            }
            if !session.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: session.status,
                    to: status,
                });
            }
            session.status = status;
            if status.is_terminal() {
                session.end_time = Some(Utc::now());
            }
            Ok(session.clone())
        })
    }

    async fn submit_answer(&self, id: &str, answer: &str) -> Result<CallSession, StoreError> {
        self.with_participant_session(id, |session| match session.answer {
            Some(ref existing) if existing == answer => Ok(session.clone()),
            Some(_) => Err(StoreError::AnswerConflict(id.to_string())),
            None if session.status.is_terminal() => Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: session.status,
                to: CallStatus::InProgress,
            }),
            None => {
                session.answer = Some(answer.to_string());
                Ok(session.clone())
            }
        })
    }

    async fn list_pending_inbound(
        &self,
        callee: &Identity,
    ) -> Result<Vec<CallSession>, StoreError> {
        let sessions = self.backend.lock();
        Ok(sessions
            .order
            .iter()
            .filter_map(|id| sessions.by_id.get(id))
            .filter(|s| &s.callee == callee && !s.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn display_name(&self, who: &Identity) -> Result<Option<String>, StoreError> {
        Ok(self.backend.lock().names.get(who).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn pair() -> (MemoryBackend, MemorySessionStore, MemorySessionStore) {
        let backend = MemoryBackend::new();
        let alice = backend.connect(Identity::from("alice"));
        let bob = backend.connect(Identity::from("bob"));
        (backend, alice, bob)
    }

    #[tokio::test]
    async fn test_create_assigns_id_with_offer() {
        let (_, alice, bob) = pair();
        let s = alice
            .create_call(&Identity::from("bob"), CallKind::Video, "offer-sdp")
            .await
            .unwrap();
        assert!(!s.id.is_empty());
        assert_eq!(s.status, CallStatus::Initiated);
        assert_eq!(s.offer.as_deref(), Some("offer-sdp"));

        let pending = bob.list_pending_inbound(&Identity::from("bob")).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, s.id);
    }

    #[tokio::test]
    async fn test_duplicate_status_is_noop() {
        let (_, alice, bob) = pair();
        let s = alice
            .create_call(&Identity::from("bob"), CallKind::Voice, "o")
            .await
            .unwrap();
        let first = alice.update_status(&s.id, CallStatus::Ringing).await.unwrap();
        let second = bob.update_status(&s.id, CallStatus::Ringing).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let (_, alice, bob) = pair();
        let s = alice
            .create_call(&Identity::from("bob"), CallKind::Voice, "o")
            .await
            .unwrap();
        assert_ok!(alice.update_status(&s.id, CallStatus::Ringing).await);
        let missed = bob.update_status(&s.id, CallStatus::Missed).await.unwrap();
        assert!(missed.end_time.is_some());
        assert_err!(alice.update_status(&s.id, CallStatus::InProgress).await);
        assert_err!(bob.submit_answer(&s.id, "late").await);

        let pending = bob.list_pending_inbound(&Identity::from("bob")).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_answer_idempotent_and_conflicting() {
        let (_, alice, bob) = pair();
        let s = alice
            .create_call(&Identity::from("bob"), CallKind::Voice, "o")
            .await
            .unwrap();
        let a1 = bob.submit_answer(&s.id, "answer").await.unwrap();
        let a2 = bob.submit_answer(&s.id, "answer").await.unwrap();
        assert_eq!(a1, a2);
        assert_eq!(
            bob.submit_answer(&s.id, "other").await,
            Err(StoreError::AnswerConflict(s.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_outsider_rejected() {
        let (backend, alice, _) = pair();
        let eve = backend.connect(Identity::from("eve"));
        let s = alice
            .create_call(&Identity::from("bob"), CallKind::Voice, "o")
            .await
            .unwrap();
        assert!(matches!(
            eve.update_status(&s.id, CallStatus::Ended).await,
            Err(StoreError::Unauthorized(_))
        ));
        assert_eq!(alice.fetch_session("unknown").await, Ok(None));
    }
}
