//! Per-node worker.
//!
//! Each node runs on its own blocking thread fed by a bounded mailbox. Jobs
//! are taken strictly in mailbox order and one at a time, so the node's
//! state has a single writer. Sending never blocks: a full mailbox is
//! reported to the caller as unavailability.
//!
//! A job carries a oneshot reply channel. If the caller stopped waiting
//! (timeout, dropped request) before the job is picked up, the job is
//! skipped without touching state.

use std::sync::{Arc, Mutex, PoisonError};

use lattice_consensus::Convergence;
use lattice_ledger::{CommitRequest, ConvergenceLedger, LedgerEntry};
use lattice_protocol::Action;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{NodeFailure, Unavailable};
use crate::runtime::NodeRuntime;

/// Default mailbox capacity per node.
pub const DEFAULT_MAILBOX: usize = 64;

/// What a node reports back for one job.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// A transition was installed.
    Applied {
        version: u64,
        output: Vec<f64>,
        convergence: Convergence,
        /// Present when the transition converged enough to be recorded.
        entry: Option<LedgerEntry>,
    },
    /// A read-only action was answered.
    Observed(Value),
    Failed(NodeFailure),
}

struct Job {
    directive_id: Uuid,
    action: Action,
    payload: Value,
    reply: oneshot::Sender<NodeOutcome>,
}

enum Command {
    Run(Job),
    Stop,
}

/// Handle to a running node worker.
pub struct NodeHandle {
    node_id: String,
    capacity: usize,
    tx: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<NodeRuntime>>>,
}

impl NodeHandle {
    /// Start a worker that owns `runtime` and commits through `ledger`.
    pub fn spawn(runtime: NodeRuntime, ledger: Arc<ConvergenceLedger>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let node_id = runtime.node_id().to_string();
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::task::spawn_blocking(move || run(runtime, ledger, rx));
        info!(node = %node_id, capacity, "node worker started");
        Self {
            node_id,
            capacity,
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Queue a job. Never waits for mailbox space.
    pub fn submit(
        &self,
        directive_id: Uuid,
        action: Action,
        payload: Value,
    ) -> Result<oneshot::Receiver<NodeOutcome>, Unavailable> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            directive_id,
            action,
            payload,
            reply,
        };
        self.tx.try_send(Command::Run(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(node = %self.node_id, "mailbox full");
                Unavailable::MailboxFull
            }
            mpsc::error::TrySendError::Closed(_) => Unavailable::Stopped,
        })?;
        Ok(rx)
    }

    /// Jobs waiting in the mailbox.
    pub fn queue_depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Finish queued jobs, then stop. Returns the final runtime, or `None`
    /// if the worker was already stopped.
    pub async fn stop(&self) -> Option<NodeRuntime> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        // The worker may already be gone; the join below still reports it.
        let _ = self.tx.send(Command::Stop).await;
        match task.await {
            Ok(runtime) => {
                info!(node = %self.node_id, version = runtime.state().version, "node worker stopped");
                Some(runtime)
            }
            Err(e) => {
                error!(node = %self.node_id, error = %e, "node worker panicked");
                None
            }
        }
    }
}

fn run(
    mut runtime: NodeRuntime,
    ledger: Arc<ConvergenceLedger>,
    mut rx: mpsc::Receiver<Command>,
) -> NodeRuntime {
    while let Some(command) = rx.blocking_recv() {
        let job = match command {
            Command::Run(job) => job,
            Command::Stop => break,
        };
        if job.reply.is_closed() {
            debug!(node = %runtime.node_id(), directive = %job.directive_id, "caller gone, job skipped");
            continue;
        }
        let outcome = process(&mut runtime, &ledger, &job);
        // Caller may have timed out while the job ran.
        let _ = job.reply.send(outcome);
    }
    runtime
}

fn process(runtime: &mut NodeRuntime, ledger: &ConvergenceLedger, job: &Job) -> NodeOutcome {
    if !job.action.is_mutating() {
        return NodeOutcome::Observed(runtime.observe(job.action));
    }

    let prepared = match runtime.prepare(job.action, &job.payload) {
        Ok(prepared) => prepared,
        Err(e) => {
            debug!(node = %runtime.node_id(), directive = %job.directive_id, error = %e, "transition refused");
            return NodeOutcome::Failed(e.into());
        }
    };

    let convergence = ledger.evaluate(
        runtime.node_id(),
        &runtime.state().state_vector,
        &prepared.next_state,
    );
    let request = CommitRequest {
        node_id: runtime.node_id(),
        directive_id: job.directive_id,
        prior_version: prepared.prior_version,
        new_version: prepared.new_version(),
        state: &prepared.next_state,
    };
    let entry = match ledger.commit(request, &convergence) {
        Ok(entry) => entry,
        Err(e) => {
            error!(node = %runtime.node_id(), directive = %job.directive_id, error = %e, "ledger commit failed, transition dropped");
            return NodeOutcome::Failed(NodeFailure::Ledger(e.to_string()));
        }
    };

    let committed_at = entry
        .as_ref()
        .map(|e| e.record.committed_at)
        .unwrap_or_else(lattice_protocol::now_millis);
    let output = prepared.output.clone();
    let version = runtime.install(prepared, committed_at);
    debug!(node = %runtime.node_id(), version, score = convergence.score, "transition installed");

    NodeOutcome::Applied {
        version,
        output,
        convergence,
        entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransitionError;
    use crate::model::{LinearRecurrence, StateModel, Step};
    use lattice_consensus::{ConvergenceDecision, ConvergencePolicy};
    use lattice_ledger::{Storage, ValidationStatus};
    use lattice_protocol::Registry;
    use serde_json::json;
    use tempfile::TempDir;

    /// Adds `delta` to every component; the output is the next state.
    struct Shift;

    impl StateModel for Shift {
        fn state_dim(&self) -> usize {
            4
        }

        fn input_dim(&self) -> usize {
            1
        }

        fn step(&self, state: &[f64], input: &[f64]) -> Result<Step, TransitionError> {
            let next: Vec<f64> = state.iter().map(|x| x + input[0]).collect();
            Ok(Step {
                output: next.clone(),
                next_state: next,
            })
        }
    }

    fn ledger() -> (TempDir, Arc<ConvergenceLedger>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let signer = storage.get_or_create_signing_key("coordinator").unwrap();
        let ledger = ConvergenceLedger::open(
            storage,
            ConvergencePolicy::default(),
            signer,
            Arc::new(Registry::new()),
        )
        .unwrap();
        (dir, Arc::new(ledger))
    }

    fn shift_node(ledger: Arc<ConvergenceLedger>) -> NodeHandle {
        let runtime = NodeRuntime::bootstrap("N1", Arc::new(Shift), None).unwrap();
        NodeHandle::spawn(runtime, ledger, 8)
    }

    async fn run_job(node: &NodeHandle, delta: f64) -> NodeOutcome {
        node.submit(Uuid::new_v4(), Action::Analyze, json!({"input": [delta]}))
            .unwrap()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn non_converged_transition_has_no_entry() {
        let (_dir, ledger) = ledger();
        let node = shift_node(ledger.clone());
        match run_job(&node, 1.5).await {
            NodeOutcome::Applied { version, convergence, entry, .. } => {
                assert_eq!(version, 2);
                assert!((convergence.score - 0.4).abs() < 1e-12);
                assert_eq!(convergence.decision, ConvergenceDecision::None);
                assert!(entry.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ledger.next_sequence(), 1);
    }

    #[tokio::test]
    async fn converged_transition_commits_before_install() {
        let (_dir, ledger) = ledger();
        let node = shift_node(ledger.clone());
        match run_job(&node, 0.05).await {
            NodeOutcome::Applied { version, entry: Some(entry), .. } => {
                assert_eq!(version, 2);
                assert_eq!(entry.sequence_number(), 1);
                assert_eq!(entry.record.new_version, 2);
                assert_eq!(entry.validation_status, ValidationStatus::AutoCommitted);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let runtime = node.stop().await.unwrap();
        assert_eq!(runtime.state().last_updated, ledger.entry(1).unwrap().unwrap().record.committed_at);
    }

    #[tokio::test]
    async fn transition_error_leaves_version() {
        let (_dir, ledger) = ledger();
        let node = shift_node(ledger);
        let outcome = node
            .submit(Uuid::new_v4(), Action::Generate, json!([1, 2]))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, NodeOutcome::Failed(NodeFailure::Transition(_))));

        let snapshot = node.submit(Uuid::new_v4(), Action::Snapshot, json!({})).unwrap().await.unwrap();
        match snapshot {
            NodeOutcome::Observed(value) => assert_eq!(value["version"], 1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let (_dir, ledger) = ledger();
        let runtime = NodeRuntime::bootstrap("N1", Arc::new(LinearRecurrence::new(4, 2, 2)), None).unwrap();
        let node = NodeHandle::spawn(runtime, ledger, 32);
        let receivers: Vec<_> = (0..10)
            .map(|i| node.submit(Uuid::new_v4(), Action::Analyze, json!({"input": [i]})).unwrap())
            .collect();
        let mut versions = Vec::new();
        for rx in receivers {
            if let NodeOutcome::Applied { version, .. } = rx.await.unwrap() {
                versions.push(version);
            }
        }
        assert_eq!(versions, (2..=11).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn abandoned_job_is_skipped() {
        let (_dir, ledger) = ledger();
        let node = shift_node(ledger);
        let abandoned = node.submit(Uuid::new_v4(), Action::Analyze, json!({"input": [1.0]})).unwrap();
        drop(abandoned);
        let outcome = run_job(&node, 1.0).await;
        assert!(matches!(outcome, NodeOutcome::Applied { version: 2, .. }));
    }

    #[tokio::test]
    async fn halted_ledger_fails_transition_without_install() {
        let (_dir, ledger) = ledger();
        let node = shift_node(ledger.clone());
        ledger.halt("operator hold");

        let outcome = run_job(&node, 0.05).await;
        assert!(matches!(outcome, NodeOutcome::Failed(NodeFailure::Ledger(_))));

        // Non-converged transitions never touch the ledger.
        assert!(matches!(run_job(&node, 1.5).await, NodeOutcome::Applied { version: 2, .. }));
        let runtime = node.stop().await.unwrap();
        assert_eq!(runtime.state().state_vector, vec![1.5; 4]);
    }

    #[tokio::test]
    async fn stopped_worker_is_unavailable() {
        let (_dir, ledger) = ledger();
        let node = shift_node(ledger);
        assert!(node.stop().await.is_some());
        assert!(node.stop().await.is_none());
        assert!(matches!(
            node.submit(Uuid::new_v4(), Action::Heartbeat, json!({})),
            Err(Unavailable::Stopped)
        ));
    }

    #[tokio::test]
    async fn full_mailbox_is_reported() {
        struct Slow;
        impl StateModel for Slow {
            fn state_dim(&self) -> usize {
                1
            }
            fn input_dim(&self) -> usize {
                1
            }
            fn step(&self, state: &[f64], _: &[f64]) -> Result<Step, TransitionError> {
                std::thread::sleep(std::time::Duration::from_millis(200));
                Ok(Step {
                    next_state: state.to_vec(),
                    output: vec![],
                })
            }
        }
        let (_dir, ledger) = ledger();
        let runtime = NodeRuntime::bootstrap("N1", Arc::new(Slow), None).unwrap();
        let node = NodeHandle::spawn(runtime, ledger, 1);
        let mut held = Vec::new();
        let mut full = false;
        for _ in 0..4 {
            match node.submit(Uuid::new_v4(), Action::Analyze, json!({})) {
                Ok(rx) => held.push(rx),
                Err(Unavailable::MailboxFull) => full = true,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(full);
    }
}
