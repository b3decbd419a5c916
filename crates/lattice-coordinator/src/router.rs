//! Directive router.
//!
//! The router owns the guard, the node workers and the response tracker.
//! A directive flows through it as follows:
//!
//! 1. the guard admits it (skew, signature, replay) and, inside the origin's
//!    critical section, the router enqueues one job per resolved target, so
//!    jobs reach each node in the order the guard accepted them
//! 2. every target is awaited with its own timeout, concurrently
//! 3. per-node details are aggregated, signed and recorded for polling
//!
//! Boundary rejections never reach a node. Nothing is retried.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use futures::future::join_all;
use lattice_ledger::{ConvergenceLedger, LedgerEntry, ValidationStatus};
use lattice_node::{NodeHandle, NodeOutcome, NodeRuntime, StateModel, Unavailable, DEFAULT_MAILBOX};
use lattice_protocol::{
    CounterStore, Directive, Guard, GuardConfig, MemoryCounterStore, ReasonCode, Registry, Response,
    ResponseSigner, Status, ValidationAction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::detail::{aggregate, NodeDetail};
use crate::error::{Error, Result};
use crate::tracker::Tracker;

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_AUDIT_WINDOW: Duration = Duration::from_secs(3600);

const EVENT_BUFFER: usize = 256;

type Job = std::result::Result<oneshot::Receiver<NodeOutcome>, Unavailable>;

/// Registry view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: String,
    pub capabilities: Vec<String>,
    pub running: bool,
    pub queue_depth: usize,
}

/// Builder for [`DirectiveRouter`].
pub struct RouterBuilder {
    registry: Arc<Registry>,
    ledger: Arc<ConvergenceLedger>,
    signer: ResponseSigner,
    guard_config: GuardConfig,
    counter_store: Option<Arc<dyn CounterStore>>,
    dispatch_timeout: Duration,
    mailbox_capacity: usize,
    audit_window: Duration,
    default_model: Option<Arc<dyn StateModel>>,
    models: HashMap<String, Arc<dyn StateModel>>,
    initial_states: HashMap<String, Vec<f64>>,
}

impl RouterBuilder {
    pub fn new(registry: Arc<Registry>, ledger: Arc<ConvergenceLedger>, signer: ResponseSigner) -> Self {
        Self {
            registry,
            ledger,
            signer,
            guard_config: GuardConfig::default(),
            counter_store: None,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            mailbox_capacity: DEFAULT_MAILBOX,
            audit_window: DEFAULT_AUDIT_WINDOW,
            default_model: None,
            models: HashMap::new(),
            initial_states: HashMap::new(),
        }
    }

    pub fn guard_config(mut self, config: GuardConfig) -> Self {
        self.guard_config = config;
        self
    }

    /// Where accepted replay counters are persisted. In memory by default.
    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn audit_window(mut self, window: Duration) -> Self {
        self.audit_window = window;
        self
    }

    /// Model for every node without its own.
    pub fn default_model(mut self, model: Arc<dyn StateModel>) -> Self {
        self.default_model = Some(model);
        self
    }

    pub fn model_for(mut self, node_id: impl Into<String>, model: Arc<dyn StateModel>) -> Self {
        self.models.insert(node_id.into(), model);
        self
    }

    pub fn initial_state(mut self, node_id: impl Into<String>, state: Vec<f64>) -> Self {
        self.initial_states.insert(node_id.into(), state);
        self
    }

    /// Load replay state, bootstrap every registered node and start its
    /// worker. Must run inside a Tokio runtime.
    pub fn build(mut self) -> Result<DirectiveRouter> {
        let store: Arc<dyn CounterStore> = match self.counter_store.take() {
            Some(store) => store,
            None => Arc::new(MemoryCounterStore::new()),
        };
        let guard = Guard::new(self.registry.clone(), self.guard_config, store)?;

        let mut nodes = BTreeMap::new();
        for record in self.registry.nodes() {
            let model = self
                .models
                .get(&record.id)
                .or(self.default_model.as_ref())
                .cloned()
                .ok_or_else(|| Error::Config(format!("no state model for node {}", record.id)))?;
            let runtime = NodeRuntime::bootstrap(&record.id, model, self.initial_states.remove(&record.id))?;
            let handle = NodeHandle::spawn(runtime, self.ledger.clone(), self.mailbox_capacity);
            nodes.insert(record.id.clone(), handle);
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        info!(
            nodes = nodes.len(),
            timeout = ?self.dispatch_timeout,
            "router ready"
        );

        Ok(DirectiveRouter {
            registry: self.registry,
            ledger: self.ledger,
            guard,
            signer: self.signer,
            nodes,
            tracker: Tracker::new(self.audit_window),
            dispatch_timeout: self.dispatch_timeout,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            events,
        })
    }
}

/// Process-scoped coordinator state: created once at startup, torn down
/// with [`DirectiveRouter::shutdown`].
pub struct DirectiveRouter {
    registry: Arc<Registry>,
    ledger: Arc<ConvergenceLedger>,
    guard: Guard,
    signer: ResponseSigner,
    nodes: BTreeMap<String, NodeHandle>,
    tracker: Tracker,
    dispatch_timeout: Duration,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    events: broadcast::Sender<Response>,
}

/// Counts a dispatch as in flight until dropped.
struct InFlight<'a> {
    router: &'a DirectiveRouter,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.router.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.router.drained.notify_waiters();
        }
    }
}

impl DirectiveRouter {
    pub fn builder(registry: Arc<Registry>, ledger: Arc<ConvergenceLedger>, signer: ResponseSigner) -> RouterBuilder {
        RouterBuilder::new(registry, ledger, signer)
    }

    /// Admit, route and answer one directive. Always returns a signed
    /// response carrying the directive's id.
    pub async fn dispatch(&self, directive: Directive) -> Response {
        let id = directive.id();
        let Some(_flight) = self.enter() else {
            return self.signer.sign(
                id,
                Status::Failure,
                Some(ReasonCode::NodeUnavailable),
                "coordinator is shutting down",
                Value::Null,
            );
        };

        let digest = directive.digest();
        let targets = self.registry.resolve(directive.target());
        // The id is claimed inside the origin's critical section so a
        // reused id never reaches a node.
        let admitted = self.guard.admit(&directive, || {
            let claim = self.tracker.claim(id)?;
            Some((claim, self.enqueue(&directive, &targets)))
        });
        let (claim, submitted) = match admitted {
            Ok(Some(admitted)) => admitted,
            Ok(None) => {
                warn!(directive = %id, origin = directive.origin(), "directive id already in use");
                let err = lattice_protocol::Error::ReplayDetected(format!("directive id {id} already in use"));
                return self.signer.reject(id, &err);
            }
            Err(err) => {
                if matches!(err, lattice_protocol::Error::ReplayDetected(_)) {
                    if let Some(previous) = self.tracker.replay_of(id, &digest) {
                        debug!(directive = %id, "identical resubmission, returning recorded response");
                        return previous;
                    }
                }
                debug!(directive = %id, error = %err, "directive rejected at the boundary");
                return self.signer.reject(id, &err);
            }
        };

        let waits = submitted.into_iter().map(|(node, job)| self.await_node(node, job));
        let details: BTreeMap<String, NodeDetail> = join_all(waits).await.into_iter().collect();

        let agg = aggregate(&details);
        let response = self.signer.sign(id, agg.status, agg.reason_code, agg.reason, agg.payload);
        let response = self.tracker.record(
            claim,
            digest,
            details,
            response,
            |seq| self.ledger_status(seq),
            &|id, status, code, reason, payload| self.signer.sign(id, status, code, reason, payload),
        );

        info!(
            directive = %id,
            action = %directive.action(),
            targets = targets.len(),
            status = %response.status(),
            "directive answered"
        );
        response
    }

    fn enter(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let flight = InFlight { router: self };
        self.accepting.load(Ordering::SeqCst).then_some(flight)
    }

    /// Runs inside the guard's critical section: no waiting here.
    fn enqueue(&self, directive: &Directive, targets: &[String]) -> Vec<(String, Job)> {
        targets
            .iter()
            .map(|node| {
                let job = match self.nodes.get(node) {
                    Some(handle) => handle.submit(directive.id(), directive.action(), directive.payload().clone()),
                    None => Err(Unavailable::Stopped),
                };
                (node.clone(), job)
            })
            .collect()
    }

    async fn await_node(&self, node: String, job: Job) -> (String, NodeDetail) {
        let detail = match job {
            Err(e) => NodeDetail::unavailable(e.to_string()),
            Ok(reply) => match tokio::time::timeout(self.dispatch_timeout, reply).await {
                Ok(Ok(outcome)) => NodeDetail::from_outcome(outcome),
                Ok(Err(_)) => NodeDetail::unavailable("node worker dropped the job"),
                Err(_) => {
                    let timeout = self.dispatch_timeout;
                    warn!(node = %node, timeout = ?timeout, "node did not answer in time");
                    NodeDetail::unavailable(format!("no answer within {timeout:?}"))
                }
            },
        };
        (node, detail)
    }

    fn ledger_status(&self, seq: u64) -> Option<ValidationStatus> {
        match self.ledger.entry(seq) {
            Ok(entry) => entry.map(|e| e.validation_status),
            Err(e) => {
                error!(sequence = seq, error = %e, "cannot read ledger entry");
                None
            }
        }
    }

    /// Apply a signed human decision and resolve the directive waiting on
    /// it, if this was its last pending entry.
    pub fn validate(&self, action: &ValidationAction) -> lattice_ledger::Result<LedgerEntry> {
        let entry = self.ledger.decide(action)?;
        let resolved = self.tracker.decide(
            entry.sequence_number(),
            entry.validation_status,
            &|id, status, code, reason, payload| self.signer.sign(id, status, code, reason, payload),
        );
        if let Some(response) = resolved {
            info!(directive = %response.id(), status = %response.status(), "pending directive resolved");
            // No subscribers is fine.
            let _ = self.events.send(response);
        }
        Ok(entry)
    }

    /// Latest response for a tracked directive.
    pub fn poll(&self, id: Uuid) -> Option<Response> {
        self.tracker.get(id)
    }

    /// Responses of pending directives as they resolve.
    pub fn subscribe(&self) -> broadcast::Receiver<Response> {
        self.events.subscribe()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    pub fn signer_name(&self) -> &str {
        self.signer.name()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<ConvergenceLedger> {
        &self.ledger
    }

    pub fn nodes(&self) -> Vec<NodeView> {
        self.registry
            .nodes()
            .map(|record| {
                let handle = self.nodes.get(&record.id);
                NodeView {
                    id: record.id.clone(),
                    capabilities: record.capabilities.iter().cloned().collect(),
                    running: handle.is_some_and(NodeHandle::is_running),
                    queue_depth: handle.map_or(0, NodeHandle::queue_depth),
                }
            })
            .collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting, wait for in-flight dispatches, let every worker
    /// finish its queue, then flush the ledger. Idempotent.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight.load(Ordering::SeqCst), "draining in-flight directives");
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }

        for handle in self.nodes.values() {
            handle.stop().await;
        }

        match self.ledger.flush() {
            Ok(()) => info!(next_sequence = self.ledger.next_sequence(), "ledger flushed"),
            Err(e) => error!(error = %e, "ledger flush failed"),
        }
    }
}

impl std::fmt::Debug for DirectiveRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectiveRouter")
            .field("signer", &self.signer)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}
