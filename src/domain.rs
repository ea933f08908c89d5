//! Domain models shared by the grading engine: scores, answer values, per-field and composite results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Three-level verdict. Declaration order is the ranking: `I < P < E`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Score {
  I,
  P,
  E,
}

impl Score {
  pub fn as_str(self) -> &'static str {
    match self {
      Score::E => "E",
      Score::P => "P",
      Score::I => "I",
    }
  }

  /// Lenient parse used for remote verdicts ("e", " P ", "I").
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_uppercase().as_str() {
      "E" => Some(Score::E),
      "P" => Some(Score::P),
      "I" => Some(Score::I),
      _ => None,
    }
  }
}

impl fmt::Display for Score {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Structured answer produced by the radical-grouping widgets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Radical {
  pub coefficient: i64,
  pub radicand: i64,
  #[serde(default)] pub has_imaginary: bool,
  #[serde(default)] pub is_complete: bool,
  #[serde(default)] pub is_fully_simplified: bool,
}

/// A student's answer as handed over by an input widget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
  Numeric(f64),
  Text(String),
  PrimeFactorization(BTreeMap<u64, u32>),
  Radical(Radical),
  FactoredForm(String),
  Choice(String),
}

impl AnswerValue {
  /// Text rendering used by text-based graders and AI prompts.
  pub fn as_text(&self) -> String {
    match self {
      AnswerValue::Numeric(n) => format_number(*n),
      AnswerValue::Text(s) | AnswerValue::FactoredForm(s) | AnswerValue::Choice(s) => s.clone(),
      AnswerValue::PrimeFactorization(map) => map
        .iter()
        .map(|(p, e)| if *e == 1 { p.to_string() } else { format!("{}^{}", p, e) })
        .collect::<Vec<_>>()
        .join("×"),
      AnswerValue::Radical(r) => {
        let unit = if r.has_imaginary { "i" } else { "" };
        format!("{}{}√{}", r.coefficient, unit, r.radicand)
      }
    }
  }
}

/// Render a float without a trailing `.0` for whole numbers.
pub fn format_number(n: f64) -> String {
  if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
    format!("{}", n as i64)
  } else {
    format!("{}", n)
  }
}

/// Why a result could not be graded normally. Serialised as `_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeError {
  AiUnavailable,
  MissingExpected,
  InvalidFormula,
  UnknownField,
  UnknownRule,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  Regex,
  Ai,
}

/// Which strategy won a dual grade and how the other one scored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DualTrace {
  pub winner: Strategy,
  pub other_score: Score,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub other_error: Option<GradeError>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Details {
  #[serde(default, skip_serializing_if = "Option::is_none")] pub expected: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub actual: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub diff: Option<f64>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")] pub missing: Vec<String>,
}

/// Outcome of grading one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
  pub score: Score,
  pub feedback: String,
  pub correct: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub details: Option<Details>,
  #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
  pub error: Option<GradeError>,
  #[serde(rename = "_provider", default, skip_serializing_if = "Option::is_none")]
  pub provider: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dual: Option<DualTrace>,
}

impl FieldResult {
  pub fn new(score: Score, feedback: impl Into<String>) -> Self {
    Self {
      score,
      feedback: feedback.into(),
      correct: score == Score::E,
      details: None,
      error: None,
      provider: None,
      dual: None,
    }
  }

  pub fn excellent(feedback: impl Into<String>) -> Self { Self::new(Score::E, feedback) }
  pub fn partial(feedback: impl Into<String>) -> Self { Self::new(Score::P, feedback) }
  pub fn incorrect(feedback: impl Into<String>) -> Self { Self::new(Score::I, feedback) }

  /// An `I` that means "could not grade", not "graded as wrong".
  pub fn failed(error: GradeError, feedback: impl Into<String>) -> Self {
    let mut r = Self::incorrect(feedback);
    r.error = Some(error);
    r
  }

  pub fn with_details(mut self, details: Details) -> Self {
    self.details = Some(details);
    self
  }

  pub fn is_grading_failure(&self) -> bool {
    self.error.is_some()
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarTier {
  Gold,
  Silver,
  Bronze,
  Tin,
  None,
}

/// Problem-level outcome for one submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeResult {
  pub fields: BTreeMap<String, FieldResult>,
  pub composite_score: Score,
  pub star_tier: StarTier,
  pub composite_feedback: String,
}
