//! Feedback text: numeric error-pattern hints and per-rule templates.

use crate::context::GradingContext;
use crate::domain::{format_number, FieldResult, Score};
use crate::rules::FeedbackTemplates;

/// Recognised shape of a numeric miss. Checked in declaration order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NumericMiss {
  SignError,
  DecimalShift,
  InvertedRatio,
  Off { percent: Option<f64>, diff: f64 },
}

/// Classify a wrong numeric answer. A miss can loosely fit more than one
/// heuristic, so the first match in priority order wins.
pub fn detect_numeric_miss(student: f64, expected: f64) -> NumericMiss {
  if (student + expected).abs() < 0.01 {
    return NumericMiss::SignError;
  }
  if (student * 10.0 - expected).abs() < 0.1 || (student / 10.0 - expected).abs() < 0.1 {
    return NumericMiss::DecimalShift;
  }
  if expected != 0.0 && (student - 1.0 / expected).abs() < 0.1 {
    return NumericMiss::InvertedRatio;
  }
  let diff = (student - expected).abs();
  let percent = if expected != 0.0 { Some(diff / expected.abs() * 100.0) } else { None };
  NumericMiss::Off { percent, diff }
}

pub fn numeric_miss_message(miss: NumericMiss, score: Score, expected: f64, ratio_hint: Option<&str>) -> String {
  match miss {
    NumericMiss::SignError => format!("Check your sign: the answer should be {}.", format_number(expected)),
    NumericMiss::DecimalShift => "Check your decimal point: your answer is off by a factor of 10.".into(),
    NumericMiss::InvertedRatio => match ratio_hint {
      Some(hint) => format!("Did you invert the ratio? It should be {}.", hint),
      None => "Did you invert the ratio? Check which quantity goes on top.".into(),
    },
    NumericMiss::Off { percent, diff } => {
      let lead = if score == Score::P { "Close!" } else { "Not quite." };
      match percent {
        Some(p) => format!("{} You're off by {:.1}%.", lead, p),
        None => format!("{} You're off by {}.", lead, format_number(diff)),
      }
    }
  }
}

/// Replace the computed feedback with the rule's template for this score, if any.
/// Templates see `{{expected}}`, `{{actual}}` and every context key.
pub fn apply_templates(
  mut result: FieldResult,
  templates: &FeedbackTemplates,
  ctx: &GradingContext,
  expected: &str,
  actual: &str,
) -> FieldResult {
  if result.is_grading_failure() {
    return result;
  }
  let tpl = match result.score {
    Score::E => templates.e.as_deref(),
    Score::P => templates.p.as_deref(),
    Score::I => templates.i.as_deref(),
  };
  if let Some(t) = tpl {
    result.feedback = ctx.interpolate(t, &[("expected", expected), ("actual", actual)]);
  }
  result
}
