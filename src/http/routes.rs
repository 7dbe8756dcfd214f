use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::core::domain::{ExecutionRequest, ExecutionResult, SessionId};
use crate::core::pipeline::coordinator::Coordinator;
use crate::http::mappers::ApiError;
use crate::http::models::{CancelBody, ExecuteBody, HealthBody, LanguageInfo, SessionStateBody};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/v1/executions", post(execute))
        .route("/v1/sessions/{id}", get(session_state).delete(cancel_session))
        .route("/v1/languages", get(languages))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn execute(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let (session, request): (SessionId, ExecutionRequest) = body.into();
    let result = coordinator.submit(&session, request).await?;
    Ok(Json(result))
}

async fn session_state(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<SessionStateBody>, ApiError> {
    let session = SessionId::from(id);
    let state = coordinator
        .state(&session)
        .ok_or_else(|| ApiError::not_found(format!("no execution for session `{}`", session)))?;
    Ok(Json(SessionStateBody {
        session_id: session.to_string(),
        state,
    }))
}

async fn cancel_session(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelBody>), ApiError> {
    let session = SessionId::from(id);
    if !coordinator.cancel(&session) {
        return Err(ApiError::not_found(format!(
            "no execution for session `{}`",
            session
        )));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelBody {
            session_id: session.to_string(),
            cancelled: true,
        }),
    ))
}

async fn languages(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<LanguageInfo>> {
    Json(coordinator.registry().profiles().map(LanguageInfo::from).collect())
}

async fn health(State(coordinator): State<Arc<Coordinator>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok".to_string(),
        available_slots: coordinator.available_slots(),
        timestamp: chrono::Utc::now(),
    })
}
