//! End-to-end dispatch scenarios against a RocksDB-backed ledger.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use lattice_consensus::ConvergencePolicy;
use lattice_coordinator::{DirectiveRouter, RouterBuilder};
use lattice_ledger::{ConvergenceLedger, Error as LedgerError, Storage, ValidationStatus};
use lattice_node::{StateModel, Step, TransitionError};
use lattice_protocol::{
    Action, Decision, Directive, DirectiveBody, NodeRecord, ReasonCode, Registry, ResponseSigner, Status, Target,
    ValidationBody,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const UI_A: u8 = 10;
const UI_B: u8 = 11;
const V1: u8 = 20;

fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Adds `input[0]` to every component, so a shift of `d` scores
/// `1 / (1 + |d|)` under the default metric.
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
            output: vec![input[0]],
            next_state: next,
        })
    }
}

/// [`Shift`] that takes far longer than the dispatch timeout.
struct Slow;

impl StateModel for Slow {
    fn state_dim(&self) -> usize {
        4
    }

    fn input_dim(&self) -> usize {
        1
    }

    fn step(&self, state: &[f64], input: &[f64]) -> Result<Step, TransitionError> {
        std::thread::sleep(Duration::from_millis(400));
        Shift.step(state, input)
    }
}

fn registry() -> Registry {
    Registry::new()
        .with_node(NodeRecord::new("N1", key(1).verifying_key(), ["vision"]))
        .with_node(NodeRecord::new("N2", key(2).verifying_key(), Vec::<String>::new()))
        .with_node(NodeRecord::new("N3", key(3).verifying_key(), ["planning"]))
        .with_caller("UI-A", key(UI_A).verifying_key())
        .with_caller("UI-B", key(UI_B).verifying_key())
        .with_validator("V1", key(V1).verifying_key())
}

struct Fixture {
    _dir: TempDir,
    storage: Arc<Storage>,
    ledger: Arc<ConvergenceLedger>,
    registry: Arc<Registry>,
    router: DirectiveRouter,
}

fn builder(storage: &Arc<Storage>, ledger: &Arc<ConvergenceLedger>, registry: &Arc<Registry>) -> RouterBuilder {
    let signer = ResponseSigner::new("coordinator", storage.get_or_create_signing_key("coordinator").unwrap());
    DirectiveRouter::builder(registry.clone(), ledger.clone(), signer)
        .counter_store(storage.clone())
        .dispatch_timeout(Duration::from_millis(150))
        .default_model(Arc::new(Shift))
}

fn fixture_with(configure: impl FnOnce(RouterBuilder) -> RouterBuilder) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(dir.path()).unwrap());
    let registry = Arc::new(registry());
    let ledger = Arc::new(
        ConvergenceLedger::open(
            storage.clone(),
            ConvergencePolicy::default(),
            storage.get_or_create_signing_key("coordinator").unwrap(),
            registry.clone(),
        )
        .unwrap(),
    );
    let router = configure(builder(&storage, &ledger, &registry)).build().unwrap();
    Fixture {
        _dir: dir,
        storage,
        ledger,
        registry,
        router,
    }
}

fn fixture() -> Fixture {
    fixture_with(|b| b)
}

fn signed(seed: u8, origin: &str, target: Target, action: Action, payload: Value, seq: u64) -> Directive {
    DirectiveBody::new(origin, target, action, payload, seq).sign(&key(seed))
}

fn shift(target: Target, delta: f64, seq: u64) -> Directive {
    signed(UI_A, "UI-A", target, Action::Analyze, json!({ "input": [delta] }), seq)
}

fn snapshot(node: &str, seq: u64) -> Directive {
    signed(UI_A, "UI-A", Target::node(node), Action::Snapshot, json!({}), seq)
}

#[tokio::test]
async fn non_converged_transition_then_duplicate_counter() {
    let fx = fixture();

    let d1 = shift(Target::node("N1"), 1.5, 1);
    let response = fx.router.dispatch(d1.clone()).await;
    assert_eq!(response.id(), d1.id());
    assert_eq!(response.status(), Status::Success);
    assert!(response.verify(&fx.router.verifying_key()).is_ok());

    let n1 = &response.result_payload()["nodes"]["N1"];
    assert_eq!(n1["version"], 2);
    assert_eq!(n1["convergence"]["decision"], "NONE");
    assert!((n1["convergence"]["score"].as_f64().unwrap() - 0.4).abs() < 1e-9);
    assert!(n1.get("ledger").is_none());
    assert_eq!(fx.ledger.next_sequence(), 1);

    // Same counter, fresh id and nonce
    let d2 = shift(Target::node("N1"), 1.5, 1);
    let response = fx.router.dispatch(d2.clone()).await;
    assert_eq!(response.id(), d2.id());
    assert_eq!(response.status(), Status::Rejected);
    assert_eq!(response.reason_code(), Some(ReasonCode::ReplayDetected));

    let response = fx.router.dispatch(snapshot("N1", 2)).await;
    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.result_payload()["nodes"]["N1"]["result"]["version"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_with_a_timed_out_node_fails() {
    let fx = fixture_with(|b| b.model_for("N2", Arc::new(Slow)));

    let response = fx.router.dispatch(shift(Target::Broadcast, 1.5, 1)).await;
    assert_eq!(response.status(), Status::Failure);
    assert_eq!(response.reason_code(), Some(ReasonCode::NodeUnavailable));

    let nodes = &response.result_payload()["nodes"];
    assert_eq!(nodes["N1"]["status"], "SUCCESS");
    assert_eq!(nodes["N3"]["status"], "SUCCESS");
    assert_eq!(nodes["N2"]["status"], "FAILURE");
    assert_eq!(nodes["N2"]["reason_code"], "NODE_UNAVAILABLE");
}

#[tokio::test]
async fn converged_transition_auto_commits() {
    let fx = fixture();

    let response = fx.router.dispatch(shift(Target::node("N3"), 0.05, 1)).await;
    assert_eq!(response.status(), Status::Success);

    let n3 = &response.result_payload()["nodes"]["N3"];
    assert_eq!(n3["convergence"]["decision"], "AUTO_COMMIT");
    assert_eq!(n3["ledger"]["sequence_number"], 1);
    assert_eq!(n3["ledger"]["validation_status"], "AUTO_COMMITTED");

    let entry = fx.ledger.entry(1).unwrap().unwrap();
    assert_eq!(entry.validation_status, ValidationStatus::AutoCommitted);
    assert_eq!(entry.node_id(), "N3");
    assert_eq!(entry.record.new_version, 2);
    assert_eq!(fx.ledger.next_sequence(), 2);
}

#[tokio::test]
async fn pending_directive_resolves_on_approval() {
    let fx = fixture();
    let mut events = fx.router.subscribe();

    let d = shift(Target::node("N1"), 0.2, 1);
    let response = fx.router.dispatch(d.clone()).await;
    assert_eq!(response.status(), Status::Pending);
    assert_eq!(response.reason_code(), Some(ReasonCode::AwaitingValidation));
    assert_eq!(fx.router.poll(d.id()).unwrap().status(), Status::Pending);

    let approve = ValidationBody::new(1, Decision::Approve, "V1").sign(&key(V1));
    let entry = fx.router.validate(&approve).unwrap();
    assert_eq!(entry.validation_status, ValidationStatus::Approved);

    let resolved = fx.router.poll(d.id()).unwrap();
    assert_eq!(resolved.status(), Status::Success);
    assert!(resolved.verify(&fx.router.verifying_key()).is_ok());
    assert_eq!(events.recv().await.unwrap(), resolved);

    let again = ValidationBody::new(1, Decision::Reject, "V1").sign(&key(V1));
    assert!(matches!(fx.router.validate(&again), Err(LedgerError::AlreadyDecided(1))));
    assert_eq!(fx.router.poll(d.id()).unwrap(), resolved);
}

#[tokio::test]
async fn rejected_validation_keeps_node_state() {
    let fx = fixture();

    let d = shift(Target::node("N1"), 0.2, 1);
    assert_eq!(fx.router.dispatch(d.clone()).await.status(), Status::Pending);

    let reject = ValidationBody::new(1, Decision::Reject, "V1").sign(&key(V1));
    fx.router.validate(&reject).unwrap();

    let resolved = fx.router.poll(d.id()).unwrap();
    assert_eq!(resolved.status(), Status::Rejected);
    assert_eq!(resolved.reason_code(), Some(ReasonCode::ValidationRejected));

    let snap = fx.router.dispatch(snapshot("N1", 2)).await;
    assert_eq!(snap.result_payload()["nodes"]["N1"]["result"]["version"], 2);
}

#[tokio::test]
async fn validation_from_unknown_key_is_refused() {
    let fx = fixture();
    fx.router.dispatch(shift(Target::node("N1"), 0.2, 1)).await;

    let forged = ValidationBody::new(1, Decision::Approve, "V1").sign(&key(UI_A));
    assert!(matches!(fx.router.validate(&forged), Err(LedgerError::InvalidSignature(_))));
    let stranger = ValidationBody::new(1, Decision::Approve, "V9").sign(&key(V1));
    assert!(matches!(fx.router.validate(&stranger), Err(LedgerError::UnknownValidator(_))));
    assert!(fx.ledger.entry(1).unwrap().unwrap().validation_status.is_pending());
}

#[tokio::test]
async fn boundary_rejections_never_reach_a_node() {
    let fx = fixture();

    // Signed with the wrong key
    let forged = signed(UI_B, "UI-A", Target::node("N1"), Action::Analyze, json!({"input": [1.0]}), 1);
    let response = fx.router.dispatch(forged).await;
    assert_eq!(response.status(), Status::Rejected);
    assert_eq!(response.reason_code(), Some(ReasonCode::AuthFailure));

    let unknown = signed(UI_B, "UI-Z", Target::node("N1"), Action::Analyze, json!({"input": [1.0]}), 1);
    assert_eq!(fx.router.dispatch(unknown).await.reason_code(), Some(ReasonCode::AuthFailure));

    let stale = DirectiveBody::new("UI-A", Target::node("N1"), Action::Analyze, json!({"input": [1.0]}), 1)
        .with_timestamp(lattice_protocol::now_millis() - 3_600_000)
        .sign(&key(UI_A));
    assert_eq!(fx.router.dispatch(stale).await.reason_code(), Some(ReasonCode::MalformedEnvelope));

    let snap = fx.router.dispatch(snapshot("N1", 1)).await;
    assert_eq!(snap.status(), Status::Success);
    assert_eq!(snap.result_payload()["nodes"]["N1"]["result"]["version"], 1);
}

#[tokio::test]
async fn identical_resubmission_returns_recorded_response() {
    let fx = fixture();
    let d = shift(Target::node("N2"), 1.5, 1);

    let first = fx.router.dispatch(d.clone()).await;
    let second = fx.router.dispatch(d.clone()).await;
    assert_eq!(first, second);

    let snap = fx.router.dispatch(snapshot("N2", 2)).await;
    assert_eq!(snap.result_payload()["nodes"]["N2"]["result"]["version"], 2);
}

#[tokio::test]
async fn reused_id_with_a_new_body_is_rejected() {
    let fx = fixture();
    let first = shift(Target::node("N1"), 0.2, 1);
    assert_eq!(fx.router.dispatch(first.clone()).await.status(), Status::Pending);

    let reuse = DirectiveBody::new("UI-A", Target::node("N1"), Action::Analyze, json!({ "input": [0.2] }), 2)
        .with_id(first.id())
        .sign(&key(UI_A));
    let response = fx.router.dispatch(reuse).await;
    assert_eq!(response.status(), Status::Rejected);
    assert_eq!(response.reason_code(), Some(ReasonCode::ReplayDetected));

    let other_origin = DirectiveBody::new("UI-B", Target::node("N1"), Action::Analyze, json!({ "input": [0.2] }), 1)
        .with_id(first.id())
        .sign(&key(UI_B));
    assert_eq!(fx.router.dispatch(other_origin).await.reason_code(), Some(ReasonCode::ReplayDetected));

    // Neither reached N1 and the ledger holds only the first entry.
    let snap = fx.router.dispatch(snapshot("N1", 3)).await;
    assert_eq!(snap.result_payload()["nodes"]["N1"]["result"]["version"], 2);
    assert_eq!(fx.ledger.next_sequence(), 2);
    assert_eq!(fx.router.poll(first.id()).unwrap().status(), Status::Pending);
}

#[tokio::test]
async fn capability_targets_resolve_through_the_registry() {
    let fx = fixture();

    let response = fx.router.dispatch(shift(Target::Capability("vision".into()), 1.5, 1)).await;
    assert_eq!(response.status(), Status::Success);
    let nodes = response.result_payload()["nodes"].as_object().unwrap();
    assert_eq!(nodes.keys().collect::<Vec<_>>(), vec!["N1"]);

    let response = fx.router.dispatch(shift(Target::Capability("nothing".into()), 1.5, 2)).await;
    assert_eq!(response.status(), Status::Failure);
    assert_eq!(response.reason_code(), Some(ReasonCode::NodeUnavailable));

    let response = fx.router.dispatch(shift(Target::node("N9"), 1.5, 3)).await;
    assert_eq!(response.reason_code(), Some(ReasonCode::NodeUnavailable));
}

#[tokio::test]
async fn transition_errors_leave_state_unchanged() {
    let fx = fixture();

    let bad = signed(UI_A, "UI-A", Target::node("N1"), Action::Generate, json!({"input": [1.0, 2.0]}), 1);
    let response = fx.router.dispatch(bad).await;
    assert_eq!(response.status(), Status::Failure);
    assert_eq!(response.reason_code(), Some(ReasonCode::TransitionError));

    let snap = fx.router.dispatch(snapshot("N1", 2)).await;
    assert_eq!(snap.result_payload()["nodes"]["N1"]["result"]["version"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_origins_share_one_writer_per_node() {
    let fx = fixture();
    let router = Arc::new(fx.router);

    let mut tasks = Vec::new();
    for (seed, origin) in [(UI_A, "UI-A"), (UI_B, "UI-B")] {
        for seq in 1..=10 {
            let router = router.clone();
            let d = signed(seed, origin, Target::node("N1"), Action::Analyze, json!({"input": [1.5]}), seq);
            tasks.push(tokio::spawn(async move { router.dispatch(d).await }));
        }
    }

    let mut applied = 0;
    for task in tasks {
        let response = task.await.unwrap();
        match response.status() {
            Status::Success => applied += 1,
            Status::Rejected => assert_eq!(response.reason_code(), Some(ReasonCode::ReplayDetected)),
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(applied >= 2);

    let snap = router.dispatch(snapshot("N1", 11)).await;
    assert_eq!(snap.result_payload()["nodes"]["N1"]["result"]["version"], 1 + applied);
}

#[tokio::test]
async fn shutdown_drains_and_counters_survive_restart() {
    let fx = fixture();
    assert_eq!(fx.router.dispatch(shift(Target::node("N1"), 0.05, 1)).await.status(), Status::Success);

    fx.router.shutdown().await;
    assert!(!fx.router.is_accepting());
    let late = fx.router.dispatch(shift(Target::node("N1"), 1.5, 2)).await;
    assert_eq!(late.status(), Status::Failure);
    assert_eq!(late.reason_code(), Some(ReasonCode::NodeUnavailable));
    assert!(fx.router.nodes().iter().all(|n| !n.running));

    let restarted = builder(&fx.storage, &fx.ledger, &fx.registry).build().unwrap();
    let replay = restarted.dispatch(shift(Target::node("N1"), 1.5, 1)).await;
    assert_eq!(replay.reason_code(), Some(ReasonCode::ReplayDetected));

    let next = restarted.dispatch(shift(Target::node("N1"), 0.05, 2)).await;
    assert_eq!(next.status(), Status::Success);
    assert_eq!(next.result_payload()["nodes"]["N1"]["ledger"]["sequence_number"], 2);
}
