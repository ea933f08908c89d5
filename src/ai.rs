//! External grading adapter: delegates free-text answers to a remote AI grading service.
//!
//! Wire format: `POST <serverUrl>/api/ai/grade` with `{scenario, answers: {field: text}, prompt}`;
//! the reply is `{score, feedback, _provider?}`, possibly nested one level under the field id.
//! Every failure (transport, non-2xx, `error` field, malformed body) maps to the same
//! "AI grading unavailable" result carrying an `_error` marker.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::domain::{DualTrace, FieldResult, GradeError, Score, Strategy};
use crate::util::trunc_for_log;

pub const AI_UNAVAILABLE: &str = "AI grading unavailable";

#[derive(Debug, thiserror::Error)]
pub enum AiGradeError {
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("AI grading service returned HTTP {status}: {body}")]
  Status { status: u16, body: String },
  #[error("AI grading service reported an error: {0}")]
  Remote(String),
  #[error("malformed AI grading response: {0}")]
  Malformed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiGradeRequest {
  pub scenario: String,
  pub answers: BTreeMap<String, String>,
  pub prompt: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiVerdict {
  pub score: Score,
  pub feedback: String,
  #[serde(rename = "_provider", default, skip_serializing_if = "Option::is_none")]
  pub provider: Option<String>,
}

impl AiVerdict {
  /// Accept `{score, feedback}` at the top level or under `field_id`.
  pub fn from_body(body: &Value, field_id: &str) -> Result<Self, AiGradeError> {
    if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
      let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
      return Err(AiGradeError::Remote(msg));
    }
    let provider = body.get("_provider").and_then(Value::as_str).map(str::to_string);
    let node = if body.get("score").is_some() { body } else { body.get(field_id).unwrap_or(body) };

    let score = node
      .get("score")
      .and_then(Value::as_str)
      .and_then(Score::parse)
      .ok_or_else(|| AiGradeError::Malformed(format!("no E/P/I score in {}", trunc_for_log(&body.to_string(), 200))))?;
    let feedback = node.get("feedback").and_then(Value::as_str).unwrap_or_default().to_string();
    let provider = node
      .get("_provider")
      .and_then(Value::as_str)
      .map(str::to_string)
      .or(provider);
    Ok(Self { score, feedback, provider })
  }
}

/// Shared HTTP client for the remote grader. `reqwest::Client` pools connections
/// and is cheap to clone, so one instance serves every concurrent field.
#[derive(Clone, Debug)]
pub struct AiGradingClient {
  client: reqwest::Client,
  server_url: String,
}

impl AiGradingClient {
  pub fn new(server_url: &str, timeout: Duration) -> Result<Self, AiGradeError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, server_url: server_url.trim_end_matches('/').to_string() })
  }

  /// `AI_GRADER_URL` (or `default_url`) and `AI_GRADER_TIMEOUT_SECS` (default 20).
  pub fn from_env(default_url: &str) -> Option<Self> {
    let url = std::env::var("AI_GRADER_URL").unwrap_or_else(|_| default_url.to_string());
    let secs = std::env::var("AI_GRADER_TIMEOUT_SECS")
      .ok()
      .and_then(|s| s.parse::<u64>().ok())
      .unwrap_or(20);
    match Self::new(&url, Duration::from_secs(secs)) {
      Ok(c) => Some(c),
      Err(e) => {
        warn!(target: "grading", %url, error = %e, "Could not build AI grading client");
        None
      }
    }
  }

  pub fn server_url(&self) -> &str {
    &self.server_url
  }

  #[instrument(level = "info", skip(self, answer, prompt, scenario), fields(%field_id, answer_len = answer.len()))]
  pub async fn grade(
    &self,
    field_id: &str,
    answer: &str,
    prompt: &str,
    scenario: &str,
  ) -> Result<AiVerdict, AiGradeError> {
    let url = format!("{}/api/ai/grade", self.server_url);
    let req = AiGradeRequest {
      scenario: scenario.to_string(),
      answers: BTreeMap::from([(field_id.to_string(), answer.to_string())]),
      prompt: prompt.to_string(),
    };

    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "stargrade-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .json(&req)
      .send()
      .await?;

    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
      return Err(AiGradeError::Status { status: status.as_u16(), body: trunc_for_log(&text, 200) });
    }
    let body: Value = serde_json::from_str(&text).map_err(|e| AiGradeError::Malformed(e.to_string()))?;
    let verdict = AiVerdict::from_body(&body, field_id)?;
    debug!(target: "grading", %field_id, score = %verdict.score, provider = ?verdict.provider, "AI verdict received");
    Ok(verdict)
  }
}

/// Grade through the remote service, folding every failure into the uniform I-with-marker result.
pub async fn grade_remote(
  client: Option<&AiGradingClient>,
  field_id: &str,
  answer: &str,
  prompt: &str,
  scenario: &str,
) -> FieldResult {
  let Some(client) = client else {
    warn!(target: "grading", %field_id, "No AI grading client configured");
    return FieldResult::failed(GradeError::AiUnavailable, AI_UNAVAILABLE);
  };
  match client.grade(field_id, answer, prompt, scenario).await {
    Ok(v) => {
      let mut r = FieldResult::new(v.score, v.feedback);
      r.provider = v.provider;
      r
    }
    Err(e) => {
      warn!(target: "grading", %field_id, error = %e, "AI grading failed");
      FieldResult::failed(GradeError::AiUnavailable, AI_UNAVAILABLE)
    }
  }
}

/// Keep the better of a local regex grade and a remote AI grade.
/// Ties go to the regex result; an AI failure never surfaces as the dual error.
pub fn best_of(regex: FieldResult, ai: FieldResult) -> FieldResult {
  if ai.is_grading_failure() {
    let mut r = regex;
    r.dual = Some(DualTrace { winner: Strategy::Regex, other_score: ai.score, other_error: ai.error });
    return r;
  }
  if ai.score > regex.score {
    let mut r = ai;
    r.dual = Some(DualTrace { winner: Strategy::Ai, other_score: regex.score, other_error: None });
    r
  } else {
    let mut r = regex;
    r.dual = Some(DualTrace { winner: Strategy::Regex, other_score: ai.score, other_error: None });
    r
  }
}
