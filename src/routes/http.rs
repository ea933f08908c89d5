//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs parameters and basic result info.

use std::sync::Arc;
use axum::{extract::{Path, State}, http::StatusCode, response::IntoResponse, Json};
use tracing::{error, info, instrument};

use crate::ai::AiGradeRequest;
use crate::logic::{submit, SubmitError};
use crate::protocol::*;
use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorOut>);

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut {
    status: "ok",
    cartridges: state.registries.len(),
    ai_grading: state.ai.is_some(),
    openai: state.openai.is_some(),
  })
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_cartridges(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let mut out: Vec<CartridgeOut> = state.registries.values().map(to_out).collect();
  out.sort_by(|a, b| a.id.cmp(&b.id));
  Json(out)
}

#[instrument(level = "info", skip(state, body), fields(cartridge = %body.cartridge_id, answers = body.answers.len()))]
pub async fn http_post_grade(
  State(state): State<Arc<AppState>>,
  Json(body): Json<SubmitIn>,
) -> Result<Json<GradeOut>, ApiError> {
  match submit(&state, body).await {
    Ok(out) => {
      info!(target: "grading", session = %out.session_id, stale = out.stale, score = %out.result.composite_score, "HTTP grade served");
      Ok(Json(out))
    }
    Err(e @ SubmitError::UnknownCartridge(_)) => Err((StatusCode::NOT_FOUND, Json(ErrorOut::new(e.to_string())))),
  }
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<crate::domain::CompositeResult>, ApiError> {
  state
    .submissions
    .latest(&session_id)
    .await
    .map(Json)
    .ok_or_else(|| (StatusCode::NOT_FOUND, Json(ErrorOut::new(format!("no graded submission for session {}", session_id)))))
}

/// Our own implementation of the AI grading wire format, backed by OpenAI.
#[instrument(level = "info", skip(state, body), fields(fields = body.answers.len()))]
pub async fn http_post_ai_grade(
  State(state): State<Arc<AppState>>,
  Json(body): Json<AiGradeRequest>,
) -> Result<Json<crate::ai::AiVerdict>, ApiError> {
  let Some(oa) = &state.openai else {
    return Err((StatusCode::SERVICE_UNAVAILABLE, Json(ErrorOut::new("AI grading is not configured on this server"))));
  };
  oa.grade(&state.prompts, &body).await.map(Json).map_err(|e| {
    error!(target: "grading", error = %e, "AI grade request failed");
    (StatusCode::BAD_GATEWAY, Json(ErrorOut::new(e)))
  })
}
