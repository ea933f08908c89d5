//! Field grader: dispatches one `(field, answer, context)` triple to its rule's algorithm.
//!
//! Grading never fails. Every problem (bad input, missing context value, unknown
//! field, remote outage) becomes an `I` result with feedback saying what went wrong.
//! Only `ai` and `dual` rules suspend; the rest are plain synchronous functions.

use tracing::{debug, instrument, warn};

use crate::ai::{best_of, grade_remote, AiGradingClient};
use crate::context::{ContextError, GradingContext};
use crate::domain::{format_number, AnswerValue, Details, FieldResult, GradeError, Score};
use crate::expr;
use crate::feedback::{apply_templates, detect_numeric_miss, numeric_miss_message};
use crate::normalize::{
  extract_groups, factorization_value, has_square_factor, is_prime, normalize_compact, normalize_factored,
  normalize_radical, normalize_text, parse_prime_factorization, Factorization,
};
use crate::rules::{
  forbidden_word_pattern, ExpectedRef, GradingRule, PatternSet, RequiredPattern, RuleRegistry, Tolerance, ToleranceSpec,
};
use crate::util::{placeholders, trunc_for_log};

/// Grades fields against one cartridge's rules.
#[derive(Clone, Copy)]
pub struct FieldGrader<'a> {
  registry: &'a RuleRegistry,
  ai: Option<&'a AiGradingClient>,
}

impl<'a> FieldGrader<'a> {
  pub fn new(registry: &'a RuleRegistry, ai: Option<&'a AiGradingClient>) -> Self {
    Self { registry, ai }
  }

  pub fn registry(&self) -> &'a RuleRegistry {
    self.registry
  }

  #[instrument(level = "debug", skip(self, answer, ctx), fields(cartridge = %self.registry.id()))]
  pub async fn grade(&self, field_id: &str, answer: &AnswerValue, ctx: &GradingContext) -> FieldResult {
    let Some(entry) = self.registry.get_rule(field_id) else {
      warn!(target: "grading", %field_id, "No rule registered for field");
      return FieldResult::failed(GradeError::UnknownField, format!("Unknown field: {}", field_id));
    };

    let result = match &entry.rule {
      GradingRule::Ai { prompt } => grade_ai(self.ai, field_id, prompt, answer, ctx).await,
      GradingRule::Dual { required, forbidden, prompt } => {
        let local = grade_rubric(required, forbidden, answer, ctx, self.registry.patterns());
        let remote = grade_ai(self.ai, field_id, prompt, answer, ctx).await;
        best_of(local, remote)
      }
      GradingRule::Regex { required, forbidden } => {
        grade_rubric(required, forbidden, answer, ctx, self.registry.patterns())
      }
      rule => grade_local(rule, answer, ctx),
    };

    let expected = result.details.as_ref().and_then(|d| d.expected.clone()).unwrap_or_default();
    let result = apply_templates(result, &entry.feedback, ctx, &expected, &answer.as_text());
    debug!(
      target: "grading",
      %field_id,
      kind = entry.rule.kind_name(),
      score = %result.score,
      error = ?result.error,
      answer = %trunc_for_log(&answer.as_text(), 40),
      "Field graded"
    );
    result
  }
}

/// Synchronous grading for every kind that does not need the network.
pub fn grade_local(rule: &GradingRule, answer: &AnswerValue, ctx: &GradingContext) -> FieldResult {
  match rule {
    GradingRule::Numeric { expected, tolerance, partial_tolerance, ratio_hint } => {
      grade_numeric(answer, expected, tolerance.as_ref(), *partial_tolerance, ratio_hint.as_deref(), ctx)
    }
    GradingRule::NumericExact { expected } => grade_numeric_exact(answer, expected, ctx),
    GradingRule::Exact { expected } | GradingRule::Choice { expected } => grade_exact(answer, expected, ctx),
    GradingRule::TextMatch { key } => grade_text_match(answer, key, ctx),
    GradingRule::PrimeFactorization { expected } => grade_prime_factorization(answer, expected, ctx),
    GradingRule::FactoredForm { expected } => grade_factored_form(answer, expected, ctx),
    GradingRule::SimplifiedRadical { coefficient, radicand } => {
      grade_simplified_radical(answer, coefficient, radicand, ctx)
    }
    GradingRule::VisualRadical { target } => grade_visual_radical(answer, target, RadicalVariant::Grouping, ctx),
    GradingRule::VisualRadicalPrime { target } => {
      grade_visual_radical(answer, target, RadicalVariant::PrimeGrouping, ctx)
    }
    GradingRule::VisualRadicalComplex { target } => {
      grade_visual_radical(answer, target, RadicalVariant::Complex, ctx)
    }
    GradingRule::Regex { required, forbidden } => {
      grade_rubric(required, forbidden, answer, ctx, &PatternSet::default())
    }
    GradingRule::Ai { .. } | GradingRule::Dual { .. } => FieldResult::failed(
      GradeError::UnknownRule,
      format!("Rule type `{}` needs the asynchronous grader", rule.kind_name()),
    ),
    GradingRule::Unknown => FieldResult::failed(GradeError::UnknownRule, "Unknown rule type"),
  }
}

// -------- expected-value resolution --------

#[derive(Debug, thiserror::Error)]
enum ExpectedError {
  #[error(transparent)]
  Context(#[from] ContextError),
  #[error("formula `{formula}` could not be evaluated: {source}")]
  Formula {
    formula: String,
    #[source]
    source: expr::ExprError,
  },
}

impl ExpectedError {
  fn into_result(self) -> FieldResult {
    warn!(target: "grading", error = %self, "Expected value unavailable; check the cartridge and problem context");
    match self {
      ExpectedError::Context(ContextError::Missing(key)) => FieldResult::failed(
        GradeError::MissingExpected,
        format!("Can't grade this yet: the problem is missing its expected value ({}).", key),
      ),
      ExpectedError::Context(ContextError::NotNumeric(key)) => FieldResult::failed(
        GradeError::MissingExpected,
        format!("Can't grade this yet: the expected value ({}) is not a number.", key),
      ),
      ExpectedError::Formula { .. } => {
        FieldResult::failed(GradeError::InvalidFormula, "Can't grade this yet: the expected-value formula is invalid.")
      }
    }
  }
}

fn resolve_number(expected: &ExpectedRef, ctx: &GradingContext) -> Result<f64, ExpectedError> {
  match expected {
    ExpectedRef::Number(n) => Ok(*n),
    ExpectedRef::Key(k) => Ok(ctx.get_number(k)?),
    ExpectedRef::Literal { literal } => literal
      .trim()
      .parse::<f64>()
      .map_err(|_| ContextError::NotNumeric(literal.clone()).into()),
    ExpectedRef::Formula { formula } => {
      // Only numbers are substituted; context strings never reach the parser.
      let values = placeholders(formula)
        .into_iter()
        .map(|key| ctx.get_number(&key).map(|n| (key, format!("({})", format_number(n)))))
        .collect::<Result<Vec<_>, _>>()?;
      let pairs: Vec<(&str, &str)> = values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
      let substituted = ctx.interpolate(formula, &pairs);
      expr::evaluate(&substituted).map_err(|source| ExpectedError::Formula { formula: formula.clone(), source })
    }
  }
}

fn resolve_text(expected: &ExpectedRef, ctx: &GradingContext) -> Result<String, ExpectedError> {
  match expected {
    ExpectedRef::Literal { literal } => Ok(literal.clone()),
    ExpectedRef::Key(k) => ctx.get_text(k).ok_or_else(|| ContextError::Missing(k.clone()).into()),
    ExpectedRef::Number(_) | ExpectedRef::Formula { .. } => resolve_number(expected, ctx).map(format_number),
  }
}

fn parse_student_number(answer: &AnswerValue) -> Option<f64> {
  let n = match answer {
    AnswerValue::Numeric(n) => *n,
    AnswerValue::Text(s) | AnswerValue::Choice(s) | AnswerValue::FactoredForm(s) => s.trim().parse::<f64>().ok()?,
    AnswerValue::PrimeFactorization(_) | AnswerValue::Radical(_) => return None,
  };
  n.is_finite().then_some(n)
}

fn invalid_number() -> FieldResult {
  FieldResult::incorrect("Please enter a valid number.")
}

fn is_blank(answer: &AnswerValue) -> bool {
  answer.as_text().trim().is_empty()
}

// -------- numeric --------

fn grade_numeric(
  answer: &AnswerValue,
  expected: &ExpectedRef,
  tolerance: Option<&ToleranceSpec>,
  partial: Option<Tolerance>,
  ratio_hint: Option<&str>,
  ctx: &GradingContext,
) -> FieldResult {
  let Some(student) = parse_student_number(answer) else { return invalid_number() };
  let expected = match resolve_number(expected, ctx) {
    Ok(v) => v,
    Err(e) => return e.into_result(),
  };

  let tol = tolerance.map(ToleranceSpec::tolerance).unwrap_or(Tolerance::STANDARD);
  // An explicit zero tolerance also switches off the default partial band.
  let partial = partial.or(if tol.is_zero() { None } else { Some(Tolerance::PARTIAL) });

  let absolute_diff = (student - expected).abs();
  let relative_diff = if expected != 0.0 { (absolute_diff / expected).abs() } else { absolute_diff };
  let details = Details {
    expected: Some(format_number(expected)),
    actual: Some(format_number(student)),
    diff: Some(absolute_diff),
    missing: Vec::new(),
  };

  if tol.admits(absolute_diff, relative_diff) {
    return FieldResult::excellent("Correct!").with_details(details);
  }
  let score = match partial {
    Some(p) if p.admits(absolute_diff, relative_diff) => Score::P,
    _ => Score::I,
  };
  let message = numeric_miss_message(detect_numeric_miss(student, expected), score, expected, ratio_hint);
  FieldResult::new(score, message).with_details(details)
}

fn grade_numeric_exact(answer: &AnswerValue, key: &str, ctx: &GradingContext) -> FieldResult {
  let Some(student) = parse_student_number(answer) else { return invalid_number() };
  let expected = match ctx.get_number(key) {
    Ok(v) => v,
    Err(e) => return ExpectedError::from(e).into_result(),
  };
  let diff = (student - expected).abs();
  let details = Details {
    expected: Some(format_number(expected)),
    actual: Some(format_number(student)),
    diff: Some(diff),
    missing: Vec::new(),
  };
  if diff < 1e-9 {
    FieldResult::excellent("Correct!").with_details(details)
  } else {
    let message = numeric_miss_message(detect_numeric_miss(student, expected), Score::I, expected, None);
    FieldResult::incorrect(message).with_details(details)
  }
}

// -------- exact / choice / text-match --------

fn grade_exact(answer: &AnswerValue, expected: &ExpectedRef, ctx: &GradingContext) -> FieldResult {
  if is_blank(answer) {
    return FieldResult::incorrect("Please enter an answer.");
  }
  let expected = match resolve_text(expected, ctx) {
    Ok(v) => v,
    Err(e) => return e.into_result(),
  };
  let actual = answer.as_text();
  let details = Details { expected: Some(expected.clone()), actual: Some(actual.clone()), ..Details::default() };
  if normalize_compact(&actual) == normalize_compact(&expected) {
    FieldResult::excellent("Correct!").with_details(details)
  } else {
    FieldResult::incorrect("That's not the expected answer.").with_details(details)
  }
}

fn grade_text_match(answer: &AnswerValue, key: &str, ctx: &GradingContext) -> FieldResult {
  if is_blank(answer) {
    return FieldResult::incorrect("Please enter an answer.");
  }
  let Some(expected) = ctx.answer_value(key).or_else(|| ctx.get_text(key)) else {
    return ExpectedError::from(ContextError::Missing(key.to_string())).into_result();
  };
  let actual = answer.as_text();
  let details = Details { expected: Some(expected.clone()), actual: Some(actual.clone()), ..Details::default() };
  if normalize_compact(&actual) == normalize_compact(&expected) {
    FieldResult::excellent("Correct!").with_details(details)
  } else {
    FieldResult::incorrect("That doesn't match the expected answer.").with_details(details)
  }
}

// -------- prime factorization --------

fn grade_prime_factorization(answer: &AnswerValue, key: &str, ctx: &GradingContext) -> FieldResult {
  let parsed: Option<Factorization> = match answer {
    AnswerValue::PrimeFactorization(map) if !map.is_empty() && !map.contains_key(&0) => Some(map.clone()),
    AnswerValue::PrimeFactorization(_) | AnswerValue::Numeric(_) | AnswerValue::Radical(_) => None,
    AnswerValue::Text(s) | AnswerValue::Choice(s) | AnswerValue::FactoredForm(s) => parse_prime_factorization(s),
  };
  let Some(factors) = parsed else {
    return FieldResult::incorrect("Write the factorization like 2^3 × 5 or 2 × 2 × 2 × 5.");
  };

  let expected = match ctx.get_number(key) {
    Ok(v) if v >= 1.0 && v.fract() == 0.0 => v as u64,
    Ok(_) => return ExpectedError::from(ContextError::NotNumeric(key.to_string())).into_result(),
    Err(e) => return ExpectedError::from(e).into_result(),
  };
  let rendered = AnswerValue::PrimeFactorization(factors.clone()).as_text();
  let mut details = Details { expected: Some(expected.to_string()), actual: Some(rendered), ..Details::default() };

  let Some(value) = factorization_value(&factors) else {
    return FieldResult::incorrect(format!("Your factors multiply to more than {}.", expected)).with_details(details);
  };
  if value != expected {
    details.diff = Some((value as f64 - expected as f64).abs());
    return FieldResult::incorrect(format!("Your factorization equals {}, not {}.", value, expected))
      .with_details(details);
  }

  let composite: Vec<String> = factors.keys().filter(|f| !is_prime(**f)).map(u64::to_string).collect();
  if !composite.is_empty() {
    details.missing = composite.clone();
    return FieldResult::partial(format!(
      "Your factors multiply to {}, but {} {} not prime. Keep factoring.",
      expected,
      composite.join(", "),
      if composite.len() == 1 { "is" } else { "are" }
    ))
    .with_details(details);
  }
  FieldResult::excellent("Correct! That's the prime factorization.").with_details(details)
}

// -------- factored form --------

/// Partial credit here only compares the number of parenthesized factors.
/// It does not check algebraic equivalence.
fn grade_factored_form(answer: &AnswerValue, expected: &ExpectedRef, ctx: &GradingContext) -> FieldResult {
  if is_blank(answer) {
    return FieldResult::incorrect("Please enter the factored form.");
  }
  let expected = match resolve_text(expected, ctx) {
    Ok(v) => v,
    Err(e) => return e.into_result(),
  };
  let actual = answer.as_text();
  let student = normalize_factored(&actual);
  let target = normalize_factored(&expected);
  let details = Details { expected: Some(expected.clone()), actual: Some(actual), ..Details::default() };

  if student == target {
    return FieldResult::excellent("Correct! That's fully factored.").with_details(details);
  }
  if extract_groups(&student).len() == extract_groups(&target).len() {
    return FieldResult::partial("Right structure. Check your signs or coefficients.").with_details(details);
  }
  FieldResult::incorrect("Not quite. Check how many factors the expression should have.").with_details(details)
}

// -------- radicals --------

fn grade_simplified_radical(
  answer: &AnswerValue,
  coefficient_key: &str,
  radicand_key: &str,
  ctx: &GradingContext,
) -> FieldResult {
  if is_blank(answer) {
    return FieldResult::incorrect("Please enter the simplified radical, like 3√2.");
  }
  let coefficient = match ctx.get_number(coefficient_key) {
    Ok(v) => format_number(v),
    Err(e) => return ExpectedError::from(e).into_result(),
  };
  let radicand = match ctx.get_number(radicand_key) {
    Ok(v) => format_number(v),
    Err(e) => return ExpectedError::from(e).into_result(),
  };

  let student = normalize_radical(&answer.as_text());
  let mut accepted = vec![format!("{}sqrt{}", coefficient, radicand), format!("{}sqrt({})", coefficient, radicand)];
  if coefficient == "1" {
    accepted.push(format!("sqrt{}", radicand));
    accepted.push(format!("sqrt({})", radicand));
  }
  let canonical = if coefficient == "1" { format!("√{}", radicand) } else { format!("{}√{}", coefficient, radicand) };
  let details = Details { expected: Some(canonical), actual: Some(answer.as_text()), ..Details::default() };

  if accepted.contains(&student) {
    return FieldResult::excellent("Correct! That's fully simplified.").with_details(details);
  }
  let student_coefficient = student.split("sqrt").next().unwrap_or_default();
  let coefficient_matches =
    student.contains("sqrt") && (student_coefficient == coefficient || (student_coefficient.is_empty() && coefficient == "1"));
  if coefficient_matches {
    return FieldResult::partial("Your coefficient is right. Check what's left under the radical.").with_details(details);
  }
  FieldResult::incorrect("Not quite. Look for the largest perfect square factor.").with_details(details)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum RadicalVariant {
  Grouping,
  PrimeGrouping,
  Complex,
}

/// Shared by all three board variants: recompute `sign × coefficient² × radicand`,
/// then check the radicand for a remaining perfect-square factor.
fn grade_visual_radical(answer: &AnswerValue, target_key: &str, variant: RadicalVariant, ctx: &GradingContext) -> FieldResult {
  let AnswerValue::Radical(r) = answer else {
    return FieldResult::incorrect("Use the grouping board to build your answer.");
  };
  let target = match ctx.get_number(target_key) {
    Ok(v) if v.fract() == 0.0 => v as i128,
    Ok(_) => return ExpectedError::from(ContextError::NotNumeric(target_key.to_string())).into_result(),
    Err(e) => return ExpectedError::from(e).into_result(),
  };

  let sign: i128 = if variant == RadicalVariant::Complex && r.has_imaginary { -1 } else { 1 };
  let c = r.coefficient as i128;
  let mut details = Details { expected: Some(target.to_string()), actual: Some(answer.as_text()), ..Details::default() };

  // Widget values come straight off the wire, so the product may not fit.
  let Some(total) = c.checked_mul(c).and_then(|sq| sq.checked_mul(r.radicand as i128)).and_then(|t| t.checked_mul(sign)) else {
    return FieldResult::incorrect(format!(
      "Your grouping doesn't equal the original value: {}² × {} is not {}.",
      r.coefficient, r.radicand, target
    ))
    .with_details(details);
  };
  details.diff = total.checked_sub(target).map(|d| d.unsigned_abs() as f64);

  if total != target {
    let unit = if sign < 0 { "−1 × " } else { "" };
    return FieldResult::incorrect(format!(
      "Your grouping doesn't equal the original value: {}{}² × {} = {}, not {}.",
      unit, r.coefficient, r.radicand, total, target
    ))
    .with_details(details);
  }

  if has_square_factor(r.radicand.unsigned_abs()) {
    let hint = match variant {
      RadicalVariant::PrimeGrouping => "There's still a pair of matching primes under the radical.",
      _ => "Almost! The radicand still has a perfect-square factor you can pull out.",
    };
    return FieldResult::partial(hint).with_details(details);
  }
  if variant == RadicalVariant::Complex && r.radicand < 0 {
    return FieldResult::partial("Almost! Pull the −1 out of the radical as i.").with_details(details);
  }
  FieldResult::excellent("Correct! That's fully simplified.").with_details(details)
}

// -------- rubric (regex) --------

/// Required ideas must match; any forbidden word forces `I`.
/// `patterns` holds the registry's precompiled regexes.
pub fn grade_rubric(
  required: &[RequiredPattern],
  forbidden: &[String],
  answer: &AnswerValue,
  ctx: &GradingContext,
  patterns: &PatternSet,
) -> FieldResult {
  let text = normalize_text(&answer.as_text());
  if text.is_empty() {
    return FieldResult::incorrect("Please write an answer.");
  }
  if let Some(word) = forbidden.iter().find(|w| !w.trim().is_empty() && patterns.is_match(&forbidden_word_pattern(w), &text)) {
    return FieldResult::incorrect(format!("Your answer uses \"{}\", which this question rules out.", word.trim()));
  }

  let missing: Vec<String> = required
    .iter()
    .filter(|req| !req.patterns.sources(ctx).iter().any(|src| patterns.is_match(src, &text)))
    .map(|req| req.display_name().to_string())
    .collect();
  let total = required.len();
  let matched = total - missing.len();
  let details = Details { missing: missing.clone(), ..Details::default() };

  if missing.is_empty() {
    return FieldResult::excellent("Great explanation! You covered every key idea.").with_details(details);
  }
  let ratio = matched as f64 / total as f64;
  if ratio >= 0.5 {
    FieldResult::partial(format!("Good start. Still missing: {}.", missing.join(", "))).with_details(details)
  } else {
    FieldResult::incorrect(format!("Your answer is missing key ideas: {}.", missing.join(", "))).with_details(details)
  }
}

// -------- ai --------

async fn grade_ai(
  client: Option<&AiGradingClient>,
  field_id: &str,
  prompt: &str,
  answer: &AnswerValue,
  ctx: &GradingContext,
) -> FieldResult {
  let text = answer.as_text();
  if text.trim().is_empty() {
    return FieldResult::incorrect("Please write an answer.");
  }
  let prompt = ctx.interpolate(prompt, &[("answer", text.as_str())]);
  grade_remote(client, field_id, &text, &prompt, &ctx.scenario()).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Radical;
  use crate::rules::{CartridgeDef, Patterns, RuleEntry, ToleranceLevel};
  use serde_json::json;
  use std::collections::BTreeMap;

  fn numeric(expected: ExpectedRef, tolerance: Option<ToleranceSpec>) -> GradingRule {
    GradingRule::Numeric { expected, tolerance, partial_tolerance: None, ratio_hint: None }
  }

  fn num(n: f64) -> AnswerValue {
    AnswerValue::Numeric(n)
  }

  fn text(s: &str) -> AnswerValue {
    AnswerValue::Text(s.to_string())
  }

  fn radical(coefficient: i64, radicand: i64, has_imaginary: bool) -> AnswerValue {
    AnswerValue::Radical(Radical { coefficient, radicand, has_imaginary, is_complete: true, is_fully_simplified: false })
  }

  #[test]
  fn numeric_tolerance_is_an_or() {
    let ctx = GradingContext::new().with("small", 2.0).with("big", 1000.0);
    let rule = numeric(ExpectedRef::Key("small".into()), Some(ToleranceSpec::Level(ToleranceLevel::Standard)));
    // 0.04 away: inside the absolute bound, outside the 2% relative one.
    assert_eq!(grade_local(&rule, &num(2.04), &ctx).score, Score::E);

    let big = numeric(ExpectedRef::Key("big".into()), Some(ToleranceSpec::Level(ToleranceLevel::Standard)));
    // 2% of 1000 = 20, far beyond 0.05 absolute.
    assert_eq!(grade_local(&big, &num(1020.0), &ctx).score, Score::E);
    assert_eq!(grade_local(&big, &num(1000.05), &ctx).score, Score::E);
    assert_eq!(grade_local(&big, &num(1070.0), &ctx).score, Score::P);
    assert_eq!(grade_local(&big, &num(1200.0), &ctx).score, Score::I);
  }

  #[test]
  fn numeric_bands_are_monotonic() {
    let ctx = GradingContext::new().with("x", 10.0);
    let rule = numeric(ExpectedRef::Key("x".into()), None);
    let mut last = Score::E;
    for step in 0..400 {
      let student = 10.0 + step as f64 * 0.005;
      let s = grade_local(&rule, &num(student), &ctx).score;
      assert!(s <= last, "score rose from {:?} to {:?} at {}", last, s, student);
      last = s;
    }
    assert_eq!(last, Score::I);
  }

  #[test]
  fn zero_tolerance_disables_partial_band() {
    let ctx = GradingContext::new().with("gcf", 12);
    let rule = numeric(ExpectedRef::Key("gcf".into()), Some(ToleranceSpec::Absolute(0.0)));
    assert_eq!(grade_local(&rule, &text("12"), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &text("13"), &ctx).score, Score::I);
    assert_eq!(grade_local(&rule, &text("12.0001"), &ctx).score, Score::I);
  }

  #[test]
  fn numeric_input_and_context_failures() {
    let ctx = GradingContext::new().with("a", 3).with("b", 4);
    let rule = numeric(ExpectedRef::Key("gcf".into()), None);
    let bad = grade_local(&rule, &text("twelve"), &ctx);
    assert_eq!((bad.score, bad.error), (Score::I, None));
    assert_eq!(bad.feedback, "Please enter a valid number.");

    let missing = grade_local(&rule, &num(3.0), &ctx);
    assert_eq!(missing.error, Some(GradeError::MissingExpected));

    let formula = numeric(ExpectedRef::Formula { formula: "{{a}} * {{b}} + 1".into() }, None);
    assert_eq!(grade_local(&formula, &num(13.0), &ctx).score, Score::E);

    let injected = GradingContext::new().with("a", "alert(1)").with("b", 4);
    let r = grade_local(&formula, &num(13.0), &injected);
    assert_eq!((r.score, r.error), (Score::I, Some(GradeError::MissingExpected)));

    let numeric_text = GradingContext::new().with("a", "3").with("b", 4);
    assert_eq!(grade_local(&formula, &num(13.0), &numeric_text).score, Score::E);

    let broken = numeric(ExpectedRef::Formula { formula: "{{a}} * ".into() }, None);
    assert_eq!(grade_local(&broken, &num(3.0), &ctx).error, Some(GradeError::InvalidFormula));
  }

  #[test]
  fn formula_context_strings_never_reach_the_parser() {
    let ctx = GradingContext::new().with("a", "(".repeat(200_000));
    let rule = numeric(ExpectedRef::Formula { formula: "{{a}}".into() }, None);
    let r = grade_local(&rule, &num(1.0), &ctx);
    assert_eq!((r.score, r.error), (Score::I, Some(GradeError::MissingExpected)));
    assert!(r.is_grading_failure());
  }

  #[test]
  fn tolerance_presets_admit_their_own_boundary() {
    for level in [ToleranceLevel::Tight, ToleranceLevel::Standard, ToleranceLevel::Loose] {
      let spec = ToleranceSpec::Level(level);
      let t = spec.tolerance();
      for e in [0.4, 1.0, 3.0, 7.0, 12.5, 250.0, 1000.0] {
        let ctx = GradingContext::new().with("x", e);
        let rule = numeric(ExpectedRef::Key("x".into()), Some(spec.clone()));
        for student in [e + t.absolute, e - t.absolute, e + e * t.relative, e - e * t.relative] {
          let r = grade_local(&rule, &num(student), &ctx);
          assert_eq!(r.score, Score::E, "{:?}: expected {} answered {}", level, e, student);
        }
      }
    }
    let ctx = GradingContext::new().with("x", 3.0);
    let standard = numeric(ExpectedRef::Key("x".into()), Some(ToleranceSpec::Level(ToleranceLevel::Standard)));
    assert_eq!(grade_local(&standard, &num(3.06), &ctx).score, Score::E);
    assert_eq!(grade_local(&standard, &num(3.07), &ctx).score, Score::P);
    let ctx = GradingContext::new().with("x", 1.0);
    let tight = numeric(ExpectedRef::Key("x".into()), Some(ToleranceSpec::Level(ToleranceLevel::Tight)));
    assert_eq!(grade_local(&tight, &num(1.01), &ctx).score, Score::E);
    assert_eq!(grade_local(&tight, &num(1.02), &ctx).score, Score::P);
  }

  #[test]
  fn numeric_misses_get_pattern_feedback() {
    let ctx = GradingContext::new().with("slope", 4.0);
    let rule = GradingRule::Numeric {
      expected: ExpectedRef::Key("slope".into()),
      tolerance: None,
      partial_tolerance: None,
      ratio_hint: Some("rise / run".into()),
    };
    assert!(grade_local(&rule, &num(-4.0), &ctx).feedback.contains("sign"));
    assert!(grade_local(&rule, &num(0.4), &ctx).feedback.contains("decimal"));
    assert!(grade_local(&rule, &num(0.25), &ctx).feedback.contains("rise / run"));
  }

  #[test]
  fn numeric_exact_uses_its_own_key() {
    let ctx = GradingContext::new().with("coefficient", 6).with("imaginaryCoefficient", 3);
    let rule = GradingRule::NumericExact { expected: "imaginaryCoefficient".into() };
    assert_eq!(grade_local(&rule, &text("3"), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &text("6"), &ctx).score, Score::I);
  }

  #[test]
  fn exact_and_choice_ignore_case_and_space() {
    let ctx = GradingContext::from_value(json!({"best": {"value": "Scatter Plot"}}));
    let rule = GradingRule::Choice { expected: ExpectedRef::Key("best".into()) };
    assert_eq!(grade_local(&rule, &AnswerValue::Choice("scatterplot".into()), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &AnswerValue::Choice("bar chart".into()), &ctx).score, Score::I);

    let literal = GradingRule::Exact { expected: ExpectedRef::Literal { literal: "B".into() } };
    assert_eq!(grade_local(&literal, &text(" b "), &ctx).score, Score::E);
  }

  #[test]
  fn text_match_tries_answers_then_plain_key() {
    let ctx = GradingContext::from_value(json!({
      "answers": { "factors": { "value": "2, 3" } },
      "unit": "cm"
    }));
    let via_answers = GradingRule::TextMatch { key: "factors".into() };
    assert_eq!(grade_local(&via_answers, &text("2,3"), &ctx).score, Score::E);
    let plain = GradingRule::TextMatch { key: "unit".into() };
    assert_eq!(grade_local(&plain, &text("CM"), &ctx).score, Score::E);
    let missing = GradingRule::TextMatch { key: "nope".into() };
    assert_eq!(grade_local(&missing, &text("x"), &ctx).error, Some(GradeError::MissingExpected));
  }

  #[test]
  fn prime_factorization_grades() {
    let ctx = GradingContext::new().with("num1", 40);
    let rule = GradingRule::PrimeFactorization { expected: "num1".into() };
    assert_eq!(grade_local(&rule, &text("2^3×5"), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &text("2*2*2*5"), &ctx).score, Score::E);
    assert_eq!(
      grade_local(&rule, &AnswerValue::PrimeFactorization(BTreeMap::from([(2, 3), (5, 1)])), &ctx).score,
      Score::E
    );

    let non_prime = grade_local(&rule, &text("4×10"), &ctx);
    assert_eq!(non_prime.score, Score::P);
    assert!(non_prime.feedback.contains("4, 10 are not prime"));

    let wrong = grade_local(&rule, &text("2^3×3"), &ctx);
    assert_eq!(wrong.score, Score::I);
    assert!(wrong.feedback.contains("equals 24, not 40"));

    let garbage = grade_local(&rule, &text("forty"), &ctx);
    assert_eq!((garbage.score, garbage.error), (Score::I, None));
  }

  #[test]
  fn factored_form_structure_heuristic() {
    let ctx = GradingContext::new().with("factored", "(x+2)(x+3)");
    let rule = GradingRule::FactoredForm { expected: ExpectedRef::Key("factored".into()) };
    assert_eq!(grade_local(&rule, &text("(X + 2) * (x + 3)"), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &text("(x-2)(x-3)"), &ctx).score, Score::P);
    // Equivalent but reordered factors only earn the structural partial.
    assert_eq!(grade_local(&rule, &text("(x+3)(x+2)"), &ctx).score, Score::P);
    assert_eq!(grade_local(&rule, &text("x^2+5x+6"), &ctx).score, Score::I);
  }

  #[test]
  fn simplified_radical_text() {
    let ctx = GradingContext::new().with("coefficient", 6).with("radicand", 2);
    let rule = GradingRule::SimplifiedRadical { coefficient: "coefficient".into(), radicand: "radicand".into() };
    assert_eq!(grade_local(&rule, &text("6√2"), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &text("6 * sqrt(2)"), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &text("6√8"), &ctx).score, Score::P);
    assert_eq!(grade_local(&rule, &text("3√8"), &ctx).score, Score::I);
  }

  #[test]
  fn visual_radical_requires_equal_total_then_simplest_form() {
    let ctx = GradingContext::new().with("radicand", 72);
    for rule in [
      GradingRule::VisualRadical { target: "radicand".into() },
      GradingRule::VisualRadicalPrime { target: "radicand".into() },
    ] {
      assert_eq!(grade_local(&rule, &radical(6, 2, false), &ctx).score, Score::E);
      assert_eq!(grade_local(&rule, &radical(3, 8, false), &ctx).score, Score::P);
      assert_eq!(grade_local(&rule, &radical(2, 18, false), &ctx).score, Score::P);
      let wrong = grade_local(&rule, &radical(4, 2, false), &ctx);
      assert_eq!(wrong.score, Score::I);
      assert!(wrong.feedback.contains("doesn't equal the original value"));
    }
    let not_radical = grade_local(&GradingRule::VisualRadical { target: "radicand".into() }, &num(72.0), &ctx);
    assert_eq!(not_radical.score, Score::I);
  }

  #[test]
  fn complex_radical_tracks_imaginary_unit() {
    let ctx = GradingContext::new().with("radicand", -72);
    let rule = GradingRule::VisualRadicalComplex { target: "radicand".into() };
    assert_eq!(grade_local(&rule, &radical(6, 2, true), &ctx).score, Score::E);
    assert_eq!(grade_local(&rule, &radical(3, 8, true), &ctx).score, Score::P);
    // −1 left under the radical.
    assert_eq!(grade_local(&rule, &radical(6, -2, false), &ctx).score, Score::P);
    assert_eq!(grade_local(&rule, &radical(6, 2, false), &ctx).score, Score::I);
  }

  #[test]
  fn oversized_radical_widgets_are_wrong_not_broken() {
    let ctx = GradingContext::new().with("radicand", 72);
    let rule = GradingRule::VisualRadical { target: "radicand".into() };
    for answer in [radical(i64::MAX, i64::MAX, false), radical(i64::MIN, i64::MAX, false), radical(i64::MAX, i64::MIN, false)] {
      let r = grade_local(&rule, &answer, &ctx);
      assert_eq!((r.score, r.error), (Score::I, None));
      assert!(r.feedback.contains("doesn't equal the original value"), "{}", r.feedback);
    }
    let complex = GradingRule::VisualRadicalComplex { target: "radicand".into() };
    let r = grade_local(&complex, &radical(i64::MAX, i64::MAX, true), &GradingContext::new().with("radicand", -72));
    assert_eq!((r.score, r.error), (Score::I, None));
  }

  fn correlation_rubric() -> (Vec<RequiredPattern>, Vec<String>) {
    let required = vec![
      RequiredPattern {
        id: "direction".into(),
        patterns: Patterns::BySign {
          sign_of: "r".into(),
          positive: Box::new(Patterns::One("positive|increas".into())),
          negative: Box::new(Patterns::AnyOf(vec!["negative".into(), "decreas".into()])),
          zero: None,
        },
        label: None,
      },
      RequiredPattern { id: "strength".into(), patterns: Patterns::One("strong|weak|moderate".into()), label: None },
      RequiredPattern {
        id: "context".into(),
        patterns: Patterns::AnyOf(vec!["temperature".into(), "sales".into()]),
        label: Some("the variables in context".into()),
      },
    ];
    (required, vec!["causes".into()])
  }

  #[test]
  fn rubric_ratio_bands_and_forbidden_words() {
    let (required, forbidden) = correlation_rubric();
    let pos = GradingContext::new().with("r", 0.82);
    let neg = GradingContext::new().with("r", -0.82);

    let full = text("A strong positive relationship between temperature and sales.");
    assert_eq!(grade_rubric(&required, &forbidden, &full, &pos, &PatternSet::default()).score, Score::E);
    assert_eq!(grade_rubric(&required, &forbidden, &full, &neg, &PatternSet::default()).score, Score::P);

    let partial = grade_rubric(&required, &forbidden, &text("Strong and increasing."), &pos, &PatternSet::default());
    assert_eq!(partial.score, Score::P);
    assert!(partial.feedback.contains("the variables in context"));

    assert_eq!(grade_rubric(&required, &forbidden, &text("It is strong."), &pos, &PatternSet::default()).score, Score::I);

    let causal = text("A strong positive link: temperature causes sales.");
    let r = grade_rubric(&required, &forbidden, &causal, &pos, &PatternSet::default());
    assert_eq!(r.score, Score::I);
    assert!(r.feedback.contains("causes"));
    // Word boundary: "because" is not "causes"/"cause".
    assert_eq!(
      grade_rubric(&required, &forbidden, &text("Strong positive, because temperature drives sales."), &pos, &PatternSet::default()).score,
      Score::E
    );
  }

  fn rubric_of(n: usize) -> Vec<RequiredPattern> {
    ["alpha", "beta", "gamma", "delta"][..n]
      .iter()
      .map(|w| RequiredPattern { id: w.to_string(), patterns: Patterns::One(w.to_string()), label: None })
      .collect()
  }

  #[test]
  fn rubric_half_coverage_is_partial() {
    let ctx = GradingContext::new();
    let none = PatternSet::default();
    assert_eq!(grade_rubric(&rubric_of(2), &[], &text("alpha only"), &ctx, &none).score, Score::P);
    assert_eq!(grade_rubric(&rubric_of(4), &[], &text("alpha and beta"), &ctx, &none).score, Score::P);
    assert_eq!(grade_rubric(&rubric_of(4), &[], &text("alpha"), &ctx, &none).score, Score::I);
    assert_eq!(grade_rubric(&rubric_of(4), &[], &text("alpha beta gamma delta"), &ctx, &none).score, Score::E);
  }

  #[test]
  fn rubric_without_required_elements() {
    let ctx = GradingContext::new();
    let none = PatternSet::default();
    assert_eq!(grade_rubric(&[], &[], &text("Anything at all."), &ctx, &none).score, Score::E);
    assert_eq!(grade_rubric(&[], &[], &text("   "), &ctx, &none).score, Score::I);
    let forbidden = vec!["causes".to_string()];
    assert_eq!(grade_rubric(&[], &forbidden, &text("It causes it."), &ctx, &none).score, Score::I);
  }

  #[tokio::test]
  async fn regex_rules_use_the_registry_patterns() {
    let (required, forbidden) = correlation_rubric();
    let def = CartridgeDef {
      id: "stats".into(),
      label: None,
      mode: "practice".into(),
      aliases: BTreeMap::new(),
      rules: vec![RuleEntry::new("explain", GradingRule::Regex { required: required.clone(), forbidden: forbidden.clone() })],
    };
    let registry = RuleRegistry::new(def).unwrap();
    assert!(registry.patterns().contains("strong|weak|moderate"));
    assert!(registry.patterns().contains(&forbidden_word_pattern("causes")));

    let grader = FieldGrader::new(&registry, None);
    let ctx = GradingContext::new().with("r", 0.82);
    for (answer, score) in [
      ("A strong positive relationship between temperature and sales.", Score::E),
      ("Strong and increasing.", Score::P),
      ("Temperature causes strong positive sales.", Score::I),
    ] {
      let via_registry = grader.grade("explain", &text(answer), &ctx).await;
      let uncached = grade_rubric(&required, &forbidden, &text(answer), &ctx, &PatternSet::default());
      assert_eq!((via_registry.score, uncached.score), (score, score), "{}", answer);
    }
  }

  #[tokio::test]
  async fn dispatcher_handles_unknown_fields_kinds_and_templates() {
    let mut gcf = RuleEntry::new("gcf", numeric(ExpectedRef::Key("gcf".into()), Some(ToleranceSpec::Absolute(0.0))));
    gcf.feedback.e = Some("Yes! The GCF is {{expected}}.".into());
    let def = CartridgeDef {
      id: "primes".into(),
      label: None,
      mode: "practice".into(),
      aliases: BTreeMap::new(),
      rules: vec![gcf, RuleEntry::new("mystery", GradingRule::Unknown)],
    };
    let registry = RuleRegistry::new(def).unwrap();
    let grader = FieldGrader::new(&registry, None);
    let ctx = GradingContext::new().with("gcf", 12);

    let ok = grader.grade("gcf", &text("12"), &ctx).await;
    assert_eq!((ok.score, ok.feedback.as_str()), (Score::E, "Yes! The GCF is 12."));
    assert_eq!(grader.grade("gcf", &text("13"), &ctx).await.score, Score::I);

    let unknown = grader.grade("lcm", &text("12"), &ctx).await;
    assert_eq!(unknown.error, Some(GradeError::UnknownField));
    let mystery = grader.grade("mystery", &text("12"), &ctx).await;
    assert_eq!(mystery.error, Some(GradeError::UnknownRule));
  }

  #[tokio::test]
  async fn dual_without_ai_falls_back_to_regex() {
    let (required, forbidden) = correlation_rubric();
    let def = CartridgeDef {
      id: "stats".into(),
      label: None,
      mode: "practice".into(),
      aliases: BTreeMap::new(),
      rules: vec![RuleEntry::new(
        "explain",
        GradingRule::Dual { required: required.clone(), forbidden: forbidden.clone(), prompt: "{{answer}}".into() },
      )],
    };
    let registry = RuleRegistry::new(def).unwrap();
    let grader = FieldGrader::new(&registry, None);
    let ctx = GradingContext::new().with("r", 0.5);
    let answer = text("Strong and increasing.");

    let dual = grader.grade("explain", &answer, &ctx).await;
    let regex = grade_rubric(&required, &forbidden, &answer, &ctx, registry.patterns());
    assert_eq!(dual.score, regex.score);
    assert_eq!(dual.error, None);
    assert_eq!(dual.dual.as_ref().and_then(|d| d.other_error), Some(GradeError::AiUnavailable));
  }
}
