//! Composite evaluation: fold per-field results into one score, a star tier and feedback.
//!
//! Tier thresholds are hand-tuned step functions evaluated first-match-wins.
//! They depend on the multiset of field scores, never on field order.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;

use crate::domain::{CompositeResult, FieldResult, Score, StarTier};

/// What drives the star tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierBasis {
  /// Rubric path: derived from the per-field scores.
  Scores,
  /// Game-loop path: derived from hints used during the attempt.
  Hints(u32),
}

const GENERIC_CONGRATS: &[&str] = &["Excellent work! Every answer is correct."];

fn congratulations(mode: &str) -> &'static [&'static str] {
  match mode {
    "practice" => &["Perfect! Every part is correct.", "Nailed it! All answers are right."],
    "challenge" => &["Challenge cleared! Flawless.", "Every part correct. Impressive!"],
    "review" => &["All correct. You've got this topic down."],
    "speed" => &["Fast and flawless!", "Lightning round: all correct!"],
    _ => GENERIC_CONGRATS,
  }
}

pub fn composite_score(fields: &BTreeMap<String, FieldResult>) -> Score {
  if fields.is_empty() {
    return Score::I;
  }
  if fields.values().all(|r| r.score == Score::E) {
    Score::E
  } else if fields.values().any(|r| r.score >= Score::P) {
    Score::P
  } else {
    Score::I
  }
}

pub fn score_tier(fields: &BTreeMap<String, FieldResult>) -> StarTier {
  let total = fields.len();
  if total == 0 {
    return StarTier::None;
  }
  let e_count = fields.values().filter(|r| r.score == Score::E).count();
  let p_count = fields.values().filter(|r| r.score == Score::P).count();

  if e_count == total {
    StarTier::Gold
  } else if e_count + p_count == total && p_count <= 1 {
    StarTier::Silver
  } else if e_count >= 1 {
    StarTier::Bronze
  } else if p_count >= 1 {
    StarTier::Tin
  } else {
    StarTier::None
  }
}

/// Hint-driven tier. A submission with no credit at all earns nothing.
pub fn hint_tier(hints_used: u32, composite: Score) -> StarTier {
  if composite == Score::I {
    return StarTier::None;
  }
  match hints_used {
    0 => StarTier::Gold,
    1 => StarTier::Silver,
    2 => StarTier::Bronze,
    _ => StarTier::Tin,
  }
}

/// Congratulate on a perfect submission, otherwise list each non-E field's feedback.
pub fn composite_feedback<L>(fields: &BTreeMap<String, FieldResult>, mode: &str, label: L) -> String
where
  L: Fn(&str) -> String,
{
  if fields.is_empty() {
    return "No answers were submitted.".into();
  }
  if fields.values().all(|r| r.score == Score::E) {
    let pool = congratulations(mode);
    return pool
      .choose(&mut rand::thread_rng())
      .copied()
      .unwrap_or(GENERIC_CONGRATS[0])
      .to_string();
  }
  fields
    .iter()
    .filter(|(_, r)| r.score != Score::E)
    .map(|(field, r)| format!("{}: {}", label(field), r.feedback))
    .collect::<Vec<_>>()
    .join(" | ")
}

pub fn evaluate<L>(fields: BTreeMap<String, FieldResult>, mode: &str, basis: TierBasis, label: L) -> CompositeResult
where
  L: Fn(&str) -> String,
{
  let score = composite_score(&fields);
  let star_tier = match basis {
    TierBasis::Scores => score_tier(&fields),
    TierBasis::Hints(n) => hint_tier(n, score),
  };
  let composite_feedback = composite_feedback(&fields, mode, label);
  CompositeResult { fields, composite_score: score, star_tier, composite_feedback }
}
