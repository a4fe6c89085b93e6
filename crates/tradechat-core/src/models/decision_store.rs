use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::message::Message;

/// A trade action proposed by the assistant, awaiting the user's call
#[derive(Clone, Debug, PartialEq)]
pub struct PendingDecision {
    /// Backend-issued decision identifier
    pub id: String,
    /// The transcript entry that proposed the action
    pub message: Message,
    pub timestamp: DateTime<Utc>,
}

impl PendingDecision {
    pub fn new(id: impl Into<String>, message: Message) -> Self {
        Self {
            id: id.into(),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Result of offering a decision to the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Became the pending decision
    Pending,
    /// Another decision is pending; this one waits its turn
    Queued { position: usize },
    /// Already pending, queued or resolved
    Ignored,
}

#[derive(Default)]
struct DecisionQueue {
    pending: Option<PendingDecision>,
    queued: VecDeque<PendingDecision>,
    resolved: HashSet<String>,
}

impl DecisionQueue {
    fn knows(&self, id: &str) -> bool {
        self.resolved.contains(id)
            || self.pending.as_ref().is_some_and(|d| d.id == id)
            || self.queued.iter().any(|d| d.id == id)
    }
}

/// Holds the single pending trade decision of a session.
///
/// At most one decision is pending. Later ones queue behind it in arrival
/// order and are promoted when the pending one is taken for resolution.
pub struct DecisionStore {
    inner: Mutex<DecisionQueue>,
}

impl DecisionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DecisionQueue::default()),
        }
    }

    pub fn offer(&self, decision: PendingDecision) -> OfferOutcome {
        let mut inner = self.inner.lock();
        if inner.knows(&decision.id) {
            return OfferOutcome::Ignored;
        }
        if inner.pending.is_none() {
            inner.pending = Some(decision);
            OfferOutcome::Pending
        } else {
            inner.queued.push_back(decision);
            OfferOutcome::Queued {
                position: inner.queued.len(),
            }
        }
    }

    pub fn pending(&self) -> Option<PendingDecision> {
        self.inner.lock().pending.clone()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().queued.len()
    }

    /// Remove the pending decision if its id matches, marking it resolved and
    /// promoting the next queued one. Any other id is a no-op.
    pub fn take_if_pending(&self, id: &str) -> Option<PendingDecision> {
        let mut inner = self.inner.lock();
        if inner.pending.as_ref().is_none_or(|d| d.id != id) {
            return None;
        }
        let taken = inner.pending.take();
        inner.resolved.insert(id.to_string());
        inner.pending = inner.queued.pop_front();
        taken
    }

    pub fn is_resolved(&self, id: &str) -> bool {
        self.inner.lock().resolved.contains(id)
    }

    pub fn clear(&self) {
        *self.inner.lock() = DecisionQueue::default();
    }
}

impl Default for DecisionStore {
    fn default() -> Self {
        Self::new()
    }
}
