//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::GradingContext;
use crate::domain::{AnswerValue, CompositeResult};
use crate::rules::RuleRegistry;

/// One submission: every answer for one cartridge instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIn {
    pub cartridge_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Typed `{type, value}` answers, or bare numbers/strings.
    #[serde(default)]
    pub answers: BTreeMap<String, Value>,
    #[serde(default)]
    pub context: GradingContext,
    /// Present on the game-loop path; switches the star tier to hint-driven.
    #[serde(default)]
    pub hints_used: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOut {
    pub session_id: String,
    /// A newer submission for the same session started before this one finished.
    pub stale: bool,
    pub result: CompositeResult,
}

impl SubmitIn {
    pub fn answer_values(&self) -> BTreeMap<String, AnswerValue> {
        coerce_answers(self.answers.clone())
    }
}

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    Submit(SubmitIn),
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Graded(GradeOut),
    Error { message: String },
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub cartridges: usize,
    pub ai_grading: bool,
    pub openai: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOut {
    pub field: String,
    pub label: String,
    pub kind: &'static str,
    pub context_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartridgeOut {
    pub id: String,
    pub label: String,
    pub mode: String,
    pub fields: Vec<FieldOut>,
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub error: String,
}

impl ErrorOut {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// Convert a registry into its public listing.
pub fn to_out(reg: &RuleRegistry) -> CartridgeOut {
    CartridgeOut {
        id: reg.id().to_string(),
        label: reg.label().to_string(),
        mode: reg.mode().to_string(),
        fields: reg
            .entries()
            .map(|e| FieldOut {
                field: e.field.clone(),
                label: e.display_label().to_string(),
                kind: e.rule.kind_name(),
                context_keys: e.rule.context_keys(),
            })
            .collect(),
        aliases: reg.aliases().clone(),
    }
}

/// Untyped answers: numbers become numeric, anything else is graded as text.
pub fn coerce_answers(raw: BTreeMap<String, Value>) -> BTreeMap<String, AnswerValue> {
    raw.into_iter()
        .map(|(k, v)| {
            let answer = serde_json::from_value::<AnswerValue>(v.clone()).unwrap_or_else(|_| match v {
                Value::Number(n) => AnswerValue::Numeric(n.as_f64().unwrap_or(f64::NAN)),
                Value::String(s) => AnswerValue::Text(s),
                other => AnswerValue::Text(other.to_string()),
            });
            (k, answer)
        })
        .collect()
}
