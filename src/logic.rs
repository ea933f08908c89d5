//! Core behaviors shared by both HTTP and WebSocket handlers.
//!
//! This includes:
//!   - Grading every field of a submission concurrently
//!   - Folding field results into the composite with the cartridge's labels and mode
//!   - Discarding results overtaken by a newer submission for the same session

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::composite::{self, TierBasis};
use crate::context::GradingContext;
use crate::domain::{AnswerValue, FieldResult};
use crate::grader::FieldGrader;
use crate::protocol::{GradeOut, SubmitIn};
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown cartridge: {0}")]
    UnknownCartridge(String),
}

/// Grade all fields at once. Remote grading is I/O bound, so fields wait on
/// the AI service in parallel; the result map is keyed by field regardless
/// of completion order.
pub async fn grade_all(
    grader: FieldGrader<'_>,
    answers: &BTreeMap<String, AnswerValue>,
    ctx: &GradingContext,
) -> BTreeMap<String, FieldResult> {
    let pending = answers.iter().map(|(field, answer)| async move {
        let result = grader.grade(field, answer, ctx).await;
        (field.clone(), result)
    });
    join_all(pending).await.into_iter().collect()
}

#[instrument(level = "info", skip(state, req), fields(cartridge = %req.cartridge_id, answers = req.answers.len()))]
pub async fn submit(state: &AppState, req: SubmitIn) -> Result<GradeOut, SubmitError> {
    let registry = state
        .registry(&req.cartridge_id)
        .ok_or_else(|| SubmitError::UnknownCartridge(req.cartridge_id.clone()))?;

    for (field, key) in registry.missing_context_keys(&req.context) {
        warn!(target: "grading", cartridge = %registry.id(), %field, %key, "Context is missing a key referenced by a rule");
    }

    let session_id = req.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let ticket = state.submissions.begin(&session_id).await;

    let grader = FieldGrader::new(registry, state.ai.as_ref());
    let fields = grade_all(grader, &req.answer_values(), &req.context).await;

    let basis = req.hints_used.map(TierBasis::Hints).unwrap_or(TierBasis::Scores);
    let result = composite::evaluate(fields, registry.mode(), basis, |f| registry.label_for(f).to_string());

    let committed = state.submissions.commit(&session_id, ticket, &result).await;
    if committed {
        info!(target: "grading", %session_id, score = %result.composite_score, tier = ?result.star_tier, "Submission graded");
    } else {
        info!(target: "grading", %session_id, ticket, "Discarding result of a superseded submission");
    }
    Ok(GradeOut { session_id, stale: !committed, result })
}
