//! Watches the store for calls addressed to the local identity.
//!
//! Each call id is surfaced at most once for the lifetime of the watcher,
//! and a surfaced call is reported closed once when it ends or disappears.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::poller::{FailureEdge, FailureGate};
use super::Identity;
use crate::store::{CallSession, CallSessionStore, StoreError};

/// A newly seen inbound call with the caller's name resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub session: CallSession,
    pub caller_name: String,
}

impl InboundCall {
    pub fn id(&self) -> &str {
        &self.session.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewInbound(InboundCall),
    /// A surfaced call ended, was missed, or is no longer listed.
    InboundClosed { call_id: String },
    FetchFailing(StoreError),
    FetchRecovered,
}

/// Change computed by `InboundTracker` from one listing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundChange {
    Surfaced(CallSession),
    Closed(String),
    Failing(StoreError),
    Recovered,
}

/// Seen-set and open-set of inbound calls.
#[derive(Debug)]
pub struct InboundTracker {
    seen: HashSet<String>,
    open: Vec<String>,
    failures: FailureGate,
}

impl InboundTracker {
    pub fn new(retry_limit: usize) -> Self {
        Self {
            seen: HashSet::new(),
            open: Vec::new(),
            failures: FailureGate::new(retry_limit),
        }
    }

    pub fn observe(
        &mut self,
        fetched: Result<Vec<CallSession>, StoreError>,
    ) -> Vec<InboundChange> {
        let mut changes = Vec::new();
        let calls = match fetched {
            Ok(calls) => {
                if let Some(FailureEdge::Recovered) = self.failures.success() {
                    changes.push(InboundChange::Recovered);
                }
                calls
            }
            Err(error) => {
                tracing::debug!("Inbound listing failed: {}", error);
                if let Some(FailureEdge::Failing) = self.failures.failure() {
                    tracing::warn!("Cannot check for incoming calls: {}", error);
                    changes.push(InboundChange::Failing(error));
                }
                return changes;
            }
        };

        // Close surfaced calls that ended or vanished.
        let mut still_open = Vec::with_capacity(self.open.len());
        for id in self.open.drain(..) {
            let live = calls
                .iter()
                .any(|c| c.id == id && !c.status.is_terminal());
            if live {
                still_open.push(id);
            } else {
                tracing::debug!("Inbound call {} closed remotely", id);
                changes.push(InboundChange::Closed(id));
            }
        }
        self.open = still_open;

        for call in calls {
            if !self.seen.insert(call.id.clone()) {
                continue;
            }
            if call.status.is_terminal() {
                continue;
            }
            tracing::info!("Incoming {} call {} from {}", call.kind.as_str(), call.id, call.caller);
            self.open.push(call.id.clone());
            changes.push(InboundChange::Surfaced(call));
        }
        changes
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.open.iter().any(|o| o == id)
    }
}

/// Interval task listing inbound calls. Aborted on drop.
pub struct IncomingCallWatcher {
    task: JoinHandle<()>,
}

impl IncomingCallWatcher {
    /// Start watching for calls to `identity`; the first poll is immediate.
    pub fn spawn<E>(
        store: Arc<dyn CallSessionStore>,
        identity: Identity,
        interval: Duration,
        retry_limit: usize,
        events: mpsc::UnboundedSender<E>,
    ) -> Self
    where
        E: From<InboundEvent> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut tracker = InboundTracker::new(retry_limit);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!("Watching for incoming calls to {}", identity);
            loop {
                ticker.tick().await;
                let fetched = store.list_pending_inbound(&identity).await;
                let changes = tracker.observe(fetched);
                for event in resolve(store.as_ref(), changes).await {
                    if events.send(E::from(event)).is_err() {
                        return;
                    }
                }
            }
        });
        Self { task }
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Turn tracker changes into events, looking up caller names concurrently.
async fn resolve(store: &dyn CallSessionStore, changes: Vec<InboundChange>) -> Vec<InboundEvent> {
    let lookups = changes.into_iter().map(|change| async move {
        match change {
            InboundChange::Surfaced(session) => {
                let caller_name = match store.display_name(&session.caller).await {
                    Ok(Some(name)) => name,
                    Ok(None) => session.caller.to_string(),
                    Err(e) => {
                        tracing::debug!("Name lookup for {} failed: {}", session.caller, e);
                        session.caller.to_string()
                    }
                };
                InboundEvent::NewInbound(InboundCall {
                    session,
                    caller_name,
                })
            }
            InboundChange::Closed(call_id) => InboundEvent::InboundClosed { call_id },
            InboundChange::Failing(error) => InboundEvent::FetchFailing(error),
            InboundChange::Recovered => InboundEvent::FetchRecovered,
        }
    });
    join_all(lookups).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::testing::FlakyStore;
    use crate::calling::{CallKind, CallStatus};
    use crate::store::MemoryBackend;
    use chrono::Utc;

    fn call(id: &str, status: CallStatus) -> CallSession {
        CallSession {
            id: id.into(),
            kind: CallKind::Video,
            status,
            caller: Identity::from("alice"),
            callee: Identity::from("bob"),
            offer: Some("offer".into()),
            answer: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    #[test]
    fn test_each_call_surfaces_once() {
        let mut t = InboundTracker::new(3);
        let changes = t.observe(Ok(vec![call("x", CallStatus::Ringing)]));
        assert!(matches!(changes[..], [InboundChange::Surfaced(ref s)] if s.id == "x"));
        for _ in 0..5 {
            assert!(t.observe(Ok(vec![call("x", CallStatus::Ringing)])).is_empty());
        }
    }

    #[test]
    fn test_terminal_calls_never_surface() {
        let mut t = InboundTracker::new(3);
        assert!(t.observe(Ok(vec![call("x", CallStatus::Missed)])).is_empty());
        assert!(!t.is_open("x"));
    }

    #[test]
    fn test_closed_when_ended_or_gone() {
        let mut t = InboundTracker::new(3);
        t.observe(Ok(vec![call("a", CallStatus::Ringing), call("b", CallStatus::Ringing)]));

        let changes = t.observe(Ok(vec![
            call("a", CallStatus::Ended),
            call("b", CallStatus::Ringing),
        ]));
        assert_eq!(changes, vec![InboundChange::Closed("a".into())]);

        let changes = t.observe(Ok(vec![]));
        assert_eq!(changes, vec![InboundChange::Closed("b".into())]);
        assert!(t.observe(Ok(vec![])).is_empty());
    }

    #[test]
    fn test_dismissed_call_never_resurfaces() {
        let mut t = InboundTracker::new(3);
        t.observe(Ok(vec![call("x", CallStatus::Ringing)]));
        t.observe(Ok(vec![]));
        assert!(t.observe(Ok(vec![call("x", CallStatus::Ringing)])).is_empty());
    }

    #[test]
    fn test_failures_do_not_close_open_calls() {
        let mut t = InboundTracker::new(2);
        t.observe(Ok(vec![call("x", CallStatus::Ringing)]));
        let unavailable = StoreError::Transport("down".into());
        assert!(t.observe(Err(unavailable.clone())).is_empty());
        assert_eq!(
            t.observe(Err(unavailable.clone())),
            vec![InboundChange::Failing(unavailable)]
        );
        assert!(t.is_open("x"));
        assert_eq!(
            t.observe(Ok(vec![call("x", CallStatus::Ringing)])),
            vec![InboundChange::Recovered]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_resolves_caller_name() {
        let backend = MemoryBackend::new();
        backend.set_display_name(&Identity::from("alice"), "Alice");
        let alice = backend.connect(Identity::from("alice"));
        let bob = FlakyStore::new(backend.connect(Identity::from("bob")));

        let (tx, mut rx) = mpsc::unbounded_channel::<InboundEvent>();
        let _watcher = IncomingCallWatcher::spawn(
            bob.clone(),
            Identity::from("bob"),
            Duration::from_secs(2),
            3,
            tx,
        );

        let created = alice
            .create_call(&Identity::from("bob"), CallKind::Video, "offer")
            .await
            .unwrap();
        match rx.recv().await {
            Some(InboundEvent::NewInbound(inbound)) => {
                assert_eq!(inbound.id(), created.id);
                assert_eq!(inbound.caller_name, "Alice");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        alice.update_status(&created.id, CallStatus::Ended).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::InboundClosed {
                call_id: created.id.clone()
            })
        );
    }
}
