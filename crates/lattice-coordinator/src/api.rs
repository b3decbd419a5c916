//! HTTP API for the coordinator.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lattice_ledger::{LedgerEntry, LedgerPage, MAX_PAGE};
use lattice_protocol::{Directive, ReasonCode, Response, Status, ValidationAction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::router::{DirectiveRouter, NodeView};

type AppState = Arc<DirectiveRouter>;

type ApiError = (StatusCode, Json<Value>);

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        .route("/api/v1/identity", get(identity))
        // Directives
        .route("/api/v1/directives", post(submit_directive))
        .route("/api/v1/directives/:id", get(poll_directive))
        // Registry
        .route("/api/v1/nodes", get(list_nodes))
        // Ledger export and human validation
        .route("/api/v1/ledger", get(export_ledger))
        .route("/api/v1/ledger/:sequence", get(get_entry))
        .route("/api/v1/validations", post(submit_validation))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Health and identity ---

async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.ledger().is_halted() {
        (StatusCode::SERVICE_UNAVAILABLE, "LEDGER HALTED")
    } else {
        (StatusCode::OK, "OK")
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Identity {
    pub signer: String,
    pub public_key: String,
    pub nodes: usize,
    pub ledger_halted: bool,
}

async fn identity(State(state): State<AppState>) -> Json<Identity> {
    Json(Identity {
        signer: state.signer_name().to_string(),
        public_key: hex::encode(state.verifying_key().as_bytes()),
        nodes: state.registry().node_count(),
        ledger_halted: state.ledger().is_halted(),
    })
}

// --- Directives ---

/// HTTP status for a directive response. The body always carries the
/// signed response.
pub fn http_status(response: &Response) -> StatusCode {
    match (response.status(), response.reason_code()) {
        (Status::Success, _) => StatusCode::OK,
        (Status::Pending, _) => StatusCode::ACCEPTED,
        (Status::Rejected, Some(ReasonCode::MalformedEnvelope)) => StatusCode::BAD_REQUEST,
        (Status::Rejected, Some(ReasonCode::AuthFailure)) => StatusCode::UNAUTHORIZED,
        (Status::Rejected, Some(ReasonCode::ReplayDetected)) => StatusCode::CONFLICT,
        (Status::Rejected, Some(ReasonCode::StateUnavailable)) => StatusCode::SERVICE_UNAVAILABLE,
        (Status::Rejected, _) => StatusCode::OK,
        (Status::Failure, Some(ReasonCode::NodeUnavailable)) => StatusCode::SERVICE_UNAVAILABLE,
        (Status::Failure, Some(ReasonCode::TransitionError)) => StatusCode::UNPROCESSABLE_ENTITY,
        (Status::Failure, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn submit_directive(
    State(state): State<AppState>,
    Json(directive): Json<Directive>,
) -> Result<(StatusCode, Json<Response>), ApiError> {
    // Run on its own task so a dropped connection cannot cut the dispatch
    // short between admission and recording.
    let router = state.clone();
    let response = tokio::spawn(async move { router.dispatch(directive).await })
        .await
        .map_err(|e| {
            error!(error = %e, "dispatch task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "dispatch failed")
        })?;
    Ok((http_status(&response), Json(response)))
}

async fn poll_directive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Response>, ApiError> {
    state
        .poll(id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no tracked directive {id}")))
}

// --- Registry ---

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeView>> {
    Json(state.nodes())
}

// --- Ledger ---

#[derive(Debug, Deserialize)]
struct ExportQuery {
    after: Option<u64>,
    limit: Option<usize>,
}

fn ledger_error(e: lattice_ledger::Error) -> ApiError {
    use lattice_ledger::Error;

    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::UnknownValidator(_) | Error::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
        Error::NotPending(_) | Error::AlreadyDecided(_) => StatusCode::CONFLICT,
        Error::Halted(_) | Error::Integrity(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Storage(_) | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if e.is_integrity() {
        return (
            status,
            Json(json!({ "error": e.to_string(), "reason_code": ReasonCode::LedgerIntegrityError })),
        );
    }
    api_error(status, e.to_string())
}

async fn export_ledger(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<LedgerPage>, ApiError> {
    let page = state
        .ledger()
        .export(query.after.unwrap_or(0), query.limit.unwrap_or(MAX_PAGE))
        .map_err(ledger_error)?;
    Ok(Json(page))
}

async fn get_entry(
    State(state): State<AppState>,
    Path(sequence): Path<u64>,
) -> Result<Json<LedgerEntry>, ApiError> {
    match state.ledger().entry(sequence) {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no ledger entry with sequence number {sequence}"),
        )),
        Err(e) => Err(ledger_error(e)),
    }
}

async fn submit_validation(
    State(state): State<AppState>,
    Json(action): Json<ValidationAction>,
) -> Result<Json<LedgerEntry>, ApiError> {
    state.validate(&action).map(Json).map_err(ledger_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use lattice_protocol::ResponseSigner;

    fn response(status: Status, code: Option<ReasonCode>) -> Response {
        ResponseSigner::new("coordinator", SigningKey::from_bytes(&[5; 32])).sign(
            Uuid::new_v4(),
            status,
            code,
            "",
            Value::Null,
        )
    }

    #[test]
    fn maps_outcomes_to_http_status() {
        assert_eq!(http_status(&response(Status::Success, None)), StatusCode::OK);
        assert_eq!(
            http_status(&response(Status::Pending, Some(ReasonCode::AwaitingValidation))),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            http_status(&response(Status::Rejected, Some(ReasonCode::AuthFailure))),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            http_status(&response(Status::Rejected, Some(ReasonCode::ReplayDetected))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            http_status(&response(Status::Failure, Some(ReasonCode::NodeUnavailable))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_status(&response(Status::Failure, Some(ReasonCode::LedgerIntegrityError))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn ledger_errors_map_to_http_status() {
        use lattice_ledger::Error;
        assert_eq!(ledger_error(Error::NotFound(3)).0, StatusCode::NOT_FOUND);
        assert_eq!(ledger_error(Error::AlreadyDecided(3)).0, StatusCode::CONFLICT);
        let (status, Json(body)) = ledger_error(Error::Halted("hash mismatch".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason_code"], "LEDGER_INTEGRITY_ERROR");
    }
}
