//! Answered directives, kept for polling and idempotent resubmission.
//!
//! Terminal records live for the audit window; pending ones until every
//! ledger entry they wait on has been decided.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lattice_ledger::ValidationStatus;
use lattice_protocol::{ReasonCode, Response, Status};
use serde_json::Value;
use uuid::Uuid;

use crate::detail::{aggregate, NodeDetail};

/// Signs a rebuilt response: `(id, status, reason_code, reason, payload)`.
pub(crate) type Resign<'a> = &'a dyn Fn(Uuid, Status, Option<ReasonCode>, String, Value) -> Response;

struct Tracked {
    digest: [u8; 32],
    details: BTreeMap<String, NodeDetail>,
    response: Response,
    pending: BTreeSet<u64>,
    settled_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<Uuid, Tracked>,
    by_sequence: HashMap<u64, Uuid>,
    in_progress: HashSet<Uuid>,
}

pub(crate) struct Tracker {
    inner: Mutex<Inner>,
    audit_window: Duration,
}

/// Reservation of a directive id while its dispatch runs. Released on
/// drop, so a dispatch abandoned before recording frees the id again.
pub(crate) struct Claim<'a> {
    tracker: &'a Tracker,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.tracker.lock().in_progress.remove(&self.id);
    }
}

impl Tracker {
    pub(crate) fn new(audit_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            audit_window,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` for a new dispatch. `None` if the id is already
    /// recorded or another dispatch holds it.
    pub(crate) fn claim(&self, id: Uuid) -> Option<Claim<'_>> {
        let mut inner = self.lock();
        inner.prune(self.audit_window);
        if inner.by_id.contains_key(&id) || !inner.in_progress.insert(id) {
            return None;
        }
        Some(Claim { tracker: self, id })
    }

    /// Record an answered directive.
    ///
    /// `decided` reports the ledger's current status for a sequence number;
    /// entries decided before the record lands are settled on the spot, so
    /// a fast validator cannot leave a directive pending forever. Returns
    /// the response to hand back, which differs from `response` only in
    /// that case.
    pub(crate) fn record(
        &self,
        claim: Claim<'_>,
        digest: [u8; 32],
        details: BTreeMap<String, NodeDetail>,
        response: Response,
        decided: impl Fn(u64) -> Option<ValidationStatus>,
        resign: Resign<'_>,
    ) -> Response {
        let mut inner = self.lock();
        inner.prune(self.audit_window);

        let id = claim.id;
        inner.in_progress.remove(&id);
        if inner.by_id.contains_key(&id) {
            return response;
        }

        let pending: BTreeSet<u64> = if response.status() == Status::Pending {
            details.values().filter_map(NodeDetail::pending_sequence).collect()
        } else {
            BTreeSet::new()
        };
        let mut tracked = Tracked {
            digest,
            details,
            settled_at: pending.is_empty().then(Instant::now),
            response,
            pending: BTreeSet::new(),
        };

        for seq in pending {
            match decided(seq) {
                Some(status) if !status.is_pending() => {
                    tracked.settle(seq, status);
                }
                _ => {
                    tracked.pending.insert(seq);
                    inner.by_sequence.insert(seq, id);
                }
            }
        }
        if tracked.pending.is_empty() && !tracked.response.status().is_terminal() {
            tracked.resolve(resign);
        }

        let out = tracked.response.clone();
        inner.by_id.insert(id, tracked);
        drop(inner);
        drop(claim);
        out
    }

    /// The recorded response for `id` if `digest` matches the original.
    pub(crate) fn replay_of(&self, id: Uuid, digest: &[u8; 32]) -> Option<Response> {
        let inner = self.lock();
        inner
            .by_id
            .get(&id)
            .filter(|t| &t.digest == digest)
            .map(|t| t.response.clone())
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<Response> {
        self.lock().by_id.get(&id).map(|t| t.response.clone())
    }

    /// Apply a ledger decision to the directive waiting on `seq`.
    ///
    /// Returns the re-signed response once the directive has no pending
    /// entries left.
    pub(crate) fn decide(&self, seq: u64, status: ValidationStatus, resign: Resign<'_>) -> Option<Response> {
        let mut inner = self.lock();
        let id = inner.by_sequence.remove(&seq)?;
        let tracked = inner.by_id.get_mut(&id)?;
        tracked.settle(seq, status);
        if !tracked.pending.is_empty() {
            return None;
        }
        tracked.resolve(resign);
        Some(tracked.response.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().by_id.len()
    }
}

impl Tracked {
    fn settle(&mut self, seq: u64, status: ValidationStatus) {
        self.pending.remove(&seq);
        if let Some(detail) = self
            .details
            .values_mut()
            .find(|d| d.ledger.as_ref().map(|l| l.sequence_number) == Some(seq))
        {
            detail.settle(status);
        }
    }

    fn resolve(&mut self, resign: Resign<'_>) {
        let agg = aggregate(&self.details);
        self.response = resign(self.response.id(), agg.status, agg.reason_code, agg.reason, agg.payload);
        self.settled_at = Some(Instant::now());
    }
}

impl Inner {
    fn prune(&mut self, window: Duration) {
        self.by_id.retain(|_, t| match t.settled_at {
            Some(at) => at.elapsed() < window,
            None => true,
        });
    }
}
