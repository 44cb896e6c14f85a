//! Polls the store for one call's session and reports edges, not levels.
//!
//! `SignalingTracker` holds the last-seen state and turns each fetch result
//! into events; `SignalingPoller` runs it on an interval until dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::CallStatus;
use crate::store::{CallSession, CallSessionStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    StatusChanged { call_id: String, status: CallStatus },
    OfferAvailable { call_id: String, offer: String },
    AnswerAvailable { call_id: String, answer: String },
    /// Consecutive fetch failures reached the retry limit. Polling goes on.
    FetchFailing { call_id: String, error: StoreError },
    FetchRecovered { call_id: String },
    /// The store no longer knows the call.
    SessionMissing { call_id: String },
}

impl SignalingEvent {
    pub fn call_id(&self) -> &str {
        match self {
            SignalingEvent::StatusChanged { call_id, .. }
            | SignalingEvent::OfferAvailable { call_id, .. }
            | SignalingEvent::AnswerAvailable { call_id, .. }
            | SignalingEvent::FetchFailing { call_id, .. }
            | SignalingEvent::FetchRecovered { call_id }
            | SignalingEvent::SessionMissing { call_id } => call_id,
        }
    }
}

/// Counts consecutive failures; reports once at the limit and once on recovery.
#[derive(Debug, Clone)]
pub struct FailureGate {
    limit: usize,
    consecutive: usize,
    failing: bool,
}

/// Edge produced by `FailureGate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEdge {
    Failing,
    Recovered,
}

impl FailureGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
            failing: false,
        }
    }

    pub fn failure(&mut self) -> Option<FailureEdge> {
        self.consecutive += 1;
        if !self.failing && self.consecutive >= self.limit {
            self.failing = true;
            return Some(FailureEdge::Failing);
        }
        None
    }

    pub fn success(&mut self) -> Option<FailureEdge> {
        self.consecutive = 0;
        if self.failing {
            self.failing = false;
            return Some(FailureEdge::Recovered);
        }
        None
    }
}

/// Last-seen state of one session.
#[derive(Debug)]
pub struct SignalingTracker {
    call_id: String,
    status: Option<CallStatus>,
    offer_seen: bool,
    answer_seen: bool,
    missing_reported: bool,
    failures: FailureGate,
}

impl SignalingTracker {
    pub fn new(call_id: impl Into<String>, retry_limit: usize) -> Self {
        Self {
            call_id: call_id.into(),
            status: None,
            offer_seen: false,
            answer_seen: false,
            missing_reported: false,
            failures: FailureGate::new(retry_limit),
        }
    }

    /// Fold one fetch result into the tracker.
    pub fn observe(
        &mut self,
        fetched: Result<Option<CallSession>, StoreError>,
    ) -> Vec<SignalingEvent> {
        let call_id = self.call_id.clone();
        let mut events = Vec::new();

        let snapshot = match fetched {
            Ok(snapshot) => {
                if let Some(FailureEdge::Recovered) = self.failures.success() {
                    events.push(SignalingEvent::FetchRecovered {
                        call_id: call_id.clone(),
                    });
                }
                snapshot
            }
            Err(error) => {
                tracing::debug!("Fetch of call {} failed: {}", call_id, error);
                if let Some(FailureEdge::Failing) = self.failures.failure() {
                    tracing::warn!("Call {} unreachable in store: {}", call_id, error);
                    events.push(SignalingEvent::FetchFailing { call_id, error });
                }
                return events;
            }
        };

        let session = match snapshot {
            Some(session) => session,
            None => {
                if !self.missing_reported {
                    self.missing_reported = true;
                    tracing::warn!("Call {} no longer exists in store", call_id);
                    events.push(SignalingEvent::SessionMissing { call_id });
                }
                return events;
            }
        };

        if !self.offer_seen {
            if let Some(offer) = session.offer {
                self.offer_seen = true;
                events.push(SignalingEvent::OfferAvailable {
                    call_id: call_id.clone(),
                    offer,
                });
            }
        }
        if !self.answer_seen {
            if let Some(answer) = session.answer {
                self.answer_seen = true;
                events.push(SignalingEvent::AnswerAvailable {
                    call_id: call_id.clone(),
                    answer,
                });
            }
        }
        if self.status != Some(session.status) {
            self.status = Some(session.status);
            events.push(SignalingEvent::StatusChanged {
                call_id,
                status: session.status,
            });
        }
        events
    }
}

/// Interval task polling one call. Aborted on drop.
pub struct SignalingPoller {
    call_id: String,
    task: JoinHandle<()>,
}

impl SignalingPoller {
    /// Start polling `call_id`; the first fetch happens immediately.
    pub fn spawn<E>(
        store: Arc<dyn CallSessionStore>,
        call_id: String,
        interval: Duration,
        retry_limit: usize,
        events: mpsc::UnboundedSender<E>,
    ) -> Self
    where
        E: From<SignalingEvent> + Send + 'static,
    {
        let mut tracker = SignalingTracker::new(call_id.clone(), retry_limit);
        let id = call_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fetched = store.fetch_session(&id).await;
                for event in tracker.observe(fetched) {
                    if events.send(E::from(event)).is_err() {
                        return;
                    }
                }
            }
        });
        tracing::debug!("Signaling poller started for call {}", call_id);
        Self { call_id, task }
    }
}

impl Drop for SignalingPoller {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!("Signaling poller stopped for call {}", self.call_id);
    }
}
