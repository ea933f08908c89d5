//! Grading rules and the per-cartridge rule registry.
//!
//! A rule names how one field is graded and where its expected value lives.
//! Expected values are usually context keys, resolved per generated problem.
//! Rules are immutable once a registry is built.

use std::collections::{BTreeMap, HashMap};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::GradingContext;
use crate::util::placeholders;

/// Slack for binary rounding: 3.06 - 3 is 0.06000000000000005, not 0.06.
const EPSILON: f64 = 1e-9;

/// A value is within tolerance if it satisfies the absolute OR the relative bound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
  pub absolute: f64,
  pub relative: f64,
}

impl Tolerance {
  pub const TIGHT: Tolerance = Tolerance { absolute: 0.01, relative: 0.01 };
  pub const STANDARD: Tolerance = Tolerance { absolute: 0.05, relative: 0.02 };
  pub const LOOSE: Tolerance = Tolerance { absolute: 0.1, relative: 0.05 };
  /// Default partial-credit band.
  pub const PARTIAL: Tolerance = Tolerance { absolute: 0.15, relative: 0.08 };
  pub const EXACT: Tolerance = Tolerance { absolute: 0.0, relative: 0.0 };

  pub fn admits(&self, absolute_diff: f64, relative_diff: f64) -> bool {
    absolute_diff <= self.absolute + EPSILON || relative_diff <= self.relative + EPSILON
  }

  pub fn is_zero(&self) -> bool {
    self.absolute == 0.0 && self.relative == 0.0
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceLevel {
  Tight,
  Standard,
  Loose,
}

/// How a rule writes its tolerance: a preset name, a single absolute bound, or both bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToleranceSpec {
  Level(ToleranceLevel),
  Absolute(f64),
  Custom(Tolerance),
}

impl ToleranceSpec {
  pub fn tolerance(&self) -> Tolerance {
    match self {
      ToleranceSpec::Level(ToleranceLevel::Tight) => Tolerance::TIGHT,
      ToleranceSpec::Level(ToleranceLevel::Standard) => Tolerance::STANDARD,
      ToleranceSpec::Level(ToleranceLevel::Loose) => Tolerance::LOOSE,
      ToleranceSpec::Absolute(abs) => Tolerance { absolute: *abs, relative: 0.0 },
      ToleranceSpec::Custom(t) => *t,
    }
  }
}

/// Where the expected value comes from.
///
/// A bare string is a context key, a bare number a literal. Literal strings and
/// formulas use the table forms `{ literal = "..." }` and `{ formula = "..." }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedRef {
  Number(f64),
  Key(String),
  Formula { formula: String },
  Literal { literal: String },
}

impl ExpectedRef {
  fn keys(&self) -> Vec<String> {
    match self {
      ExpectedRef::Key(k) => vec![k.clone()],
      ExpectedRef::Formula { formula } => placeholders(formula),
      ExpectedRef::Number(_) | ExpectedRef::Literal { .. } => Vec::new(),
    }
  }
}

/// Acceptable phrasings for one required rubric element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Patterns {
  One(String),
  AnyOf(Vec<String>),
  /// Picks the alternatives by the sign of a context value, e.g. a correlation coefficient.
  BySign {
    sign_of: String,
    positive: Box<Patterns>,
    negative: Box<Patterns>,
    #[serde(default)]
    zero: Option<Box<Patterns>>,
  },
}

impl Patterns {
  /// Regex sources applicable for this problem instance.
  pub fn sources(&self, ctx: &GradingContext) -> Vec<String> {
    match self {
      Patterns::One(s) => vec![s.clone()],
      Patterns::AnyOf(v) => v.clone(),
      Patterns::BySign { sign_of, positive, negative, zero } => match ctx.get_number(sign_of) {
        Ok(n) if n > 0.0 => positive.sources(ctx),
        Ok(n) if n < 0.0 => negative.sources(ctx),
        Ok(_) => zero.as_ref().map(|z| z.sources(ctx)).unwrap_or_default(),
        Err(e) => {
          warn!(target: "grading", error = %e, "Sign-dependent pattern has no usable context value");
          Vec::new()
        }
      },
    }
  }

  fn all_sources(&self) -> Vec<&str> {
    match self {
      Patterns::One(s) => vec![s.as_str()],
      Patterns::AnyOf(v) => v.iter().map(String::as_str).collect(),
      Patterns::BySign { positive, negative, zero, .. } => {
        let mut out = positive.all_sources();
        out.extend(negative.all_sources());
        if let Some(z) = zero {
          out.extend(z.all_sources());
        }
        out
      }
    }
  }

  fn keys(&self) -> Vec<String> {
    match self {
      Patterns::BySign { sign_of, .. } => vec![sign_of.clone()],
      _ => Vec::new(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequiredPattern {
  pub id: String,
  pub patterns: Patterns,
  /// Shown in "missing" feedback; defaults to `id`.
  #[serde(default)]
  pub label: Option<String>,
}

impl RequiredPattern {
  pub fn display_name(&self) -> &str {
    self.label.as_deref().unwrap_or(&self.id)
  }
}

fn default_num1() -> String { "num1".into() }
fn default_coefficient() -> String { "coefficient".into() }
fn default_radicand() -> String { "radicand".into() }

/// One field's grading method. Each kind carries only what it needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GradingRule {
  Numeric {
    expected: ExpectedRef,
    #[serde(default)]
    tolerance: Option<ToleranceSpec>,
    #[serde(default)]
    partial_tolerance: Option<Tolerance>,
    /// Correct direction of a ratio, quoted when the answer looks inverted (e.g. "rise / run").
    #[serde(default)]
    ratio_hint: Option<String>,
  },
  NumericExact {
    expected: String,
  },
  Exact {
    expected: ExpectedRef,
  },
  Choice {
    expected: ExpectedRef,
  },
  TextMatch {
    key: String,
  },
  PrimeFactorization {
    #[serde(default = "default_num1")]
    expected: String,
  },
  FactoredForm {
    expected: ExpectedRef,
  },
  SimplifiedRadical {
    #[serde(default = "default_coefficient")]
    coefficient: String,
    #[serde(default = "default_radicand")]
    radicand: String,
  },
  VisualRadical {
    #[serde(default = "default_radicand")]
    target: String,
  },
  VisualRadicalPrime {
    #[serde(default = "default_radicand")]
    target: String,
  },
  VisualRadicalComplex {
    #[serde(default = "default_radicand")]
    target: String,
  },
  Regex {
    required: Vec<RequiredPattern>,
    #[serde(default)]
    forbidden: Vec<String>,
  },
  Ai {
    prompt: String,
  },
  Dual {
    required: Vec<RequiredPattern>,
    #[serde(default)]
    forbidden: Vec<String>,
    prompt: String,
  },
  /// Any `kind` this build does not know. Grades as `I` instead of failing the cartridge.
  #[serde(other)]
  Unknown,
}

impl GradingRule {
  pub fn kind_name(&self) -> &'static str {
    match self {
      GradingRule::Numeric { .. } => "numeric",
      GradingRule::NumericExact { .. } => "numeric-exact",
      GradingRule::Exact { .. } => "exact",
      GradingRule::Choice { .. } => "choice",
      GradingRule::TextMatch { .. } => "text-match",
      GradingRule::PrimeFactorization { .. } => "prime-factorization",
      GradingRule::FactoredForm { .. } => "factored-form",
      GradingRule::SimplifiedRadical { .. } => "simplified-radical",
      GradingRule::VisualRadical { .. } => "visual-radical",
      GradingRule::VisualRadicalPrime { .. } => "visual-radical-prime",
      GradingRule::VisualRadicalComplex { .. } => "visual-radical-complex",
      GradingRule::Regex { .. } => "regex",
      GradingRule::Ai { .. } => "ai",
      GradingRule::Dual { .. } => "dual",
      GradingRule::Unknown => "unknown",
    }
  }

  /// True for kinds that may suspend on network I/O.
  pub fn is_remote(&self) -> bool {
    matches!(self, GradingRule::Ai { .. } | GradingRule::Dual { .. })
  }

  /// Context keys this rule reads.
  pub fn context_keys(&self) -> Vec<String> {
    let keys = match self {
      GradingRule::Numeric { expected, .. }
      | GradingRule::Exact { expected }
      | GradingRule::Choice { expected }
      | GradingRule::FactoredForm { expected } => expected.keys(),
      GradingRule::NumericExact { expected } | GradingRule::PrimeFactorization { expected } => {
        vec![expected.clone()]
      }
      GradingRule::TextMatch { key } => vec![key.clone()],
      GradingRule::SimplifiedRadical { coefficient, radicand } => vec![coefficient.clone(), radicand.clone()],
      GradingRule::VisualRadical { target }
      | GradingRule::VisualRadicalPrime { target }
      | GradingRule::VisualRadicalComplex { target } => vec![target.clone()],
      GradingRule::Regex { required, .. } => required.iter().flat_map(|r| r.patterns.keys()).collect(),
      GradingRule::Ai { prompt } => prompt_keys(prompt),
      GradingRule::Dual { required, prompt, .. } => {
        let mut k: Vec<String> = required.iter().flat_map(|r| r.patterns.keys()).collect();
        k.extend(prompt_keys(prompt));
        k
      }
      GradingRule::Unknown => Vec::new(),
    };
    let mut unique: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
      if !unique.contains(&key) {
        unique.push(key);
      }
    }
    unique
  }

  /// Keys this rule reads that `ctx` does not provide.
  pub fn missing_context_keys(&self, ctx: &GradingContext) -> Vec<String> {
    self
      .context_keys()
      .into_iter()
      .filter(|k| match self {
        GradingRule::TextMatch { .. } => ctx.answer_value(k).is_none() && !ctx.contains(k),
        _ => !ctx.contains(k),
      })
      .collect()
  }

  fn regex_sources(&self) -> Vec<&str> {
    match self {
      GradingRule::Regex { required, .. } | GradingRule::Dual { required, .. } => {
        required.iter().flat_map(|r| r.patterns.all_sources()).collect()
      }
      _ => Vec::new(),
    }
  }

  fn forbidden_words(&self) -> &[String] {
    match self {
      GradingRule::Regex { forbidden, .. } | GradingRule::Dual { forbidden, .. } => forbidden,
      _ => &[],
    }
  }
}

fn prompt_keys(prompt: &str) -> Vec<String> {
  placeholders(prompt).into_iter().filter(|k| k != "answer").collect()
}

/// Per-rule overrides of the feedback message for each score.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackTemplates {
  #[serde(rename = "E", default)] pub e: Option<String>,
  #[serde(rename = "P", default)] pub p: Option<String>,
  #[serde(rename = "I", default)] pub i: Option<String>,
}

/// A rule bound to the field it grades.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleEntry {
  pub field: String,
  #[serde(default)]
  pub label: Option<String>,
  #[serde(flatten)]
  pub rule: GradingRule,
  #[serde(default)]
  pub feedback: FeedbackTemplates,
}

impl RuleEntry {
  pub fn new(field: &str, rule: GradingRule) -> Self {
    Self { field: field.to_string(), label: None, rule, feedback: FeedbackTemplates::default() }
  }

  pub fn labelled(mut self, label: &str) -> Self {
    self.label = Some(label.to_string());
    self
  }

  pub fn display_label(&self) -> &str {
    self.label.as_deref().unwrap_or(&self.field)
  }
}

fn default_mode() -> String { "practice".into() }

/// Cartridge definition as written in TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartridgeDef {
  pub id: String,
  #[serde(default)]
  pub label: Option<String>,
  #[serde(default = "default_mode")]
  pub mode: String,
  /// UI field id -> rule field id.
  #[serde(default)]
  pub aliases: BTreeMap<String, String>,
  #[serde(default)]
  pub rules: Vec<RuleEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("cartridge `{cartridge}` defines field `{field}` twice")]
  DuplicateField { cartridge: String, field: String },
  #[error("cartridge `{cartridge}` alias `{alias}` points at unknown field `{target}`")]
  DanglingAlias { cartridge: String, alias: String, target: String },
  #[error("cartridge `{cartridge}` field `{field}` has an invalid pattern: {source}")]
  InvalidPattern {
    cartridge: String,
    field: String,
    #[source]
    source: regex::Error,
  },
}

/// Word-boundary pattern that flags a forbidden word.
pub fn forbidden_word_pattern(word: &str) -> String {
  format!(r"\b{}\b", regex::escape(word.trim()))
}

fn compile_pattern(source: &str) -> Result<Regex, regex::Error> {
  RegexBuilder::new(source).case_insensitive(true).build()
}

/// Case-insensitive rubric regexes compiled once when a registry is built.
/// Sources it has not seen are compiled on demand.
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
  compiled: HashMap<String, Regex>,
}

impl PatternSet {
  fn insert(&mut self, source: &str) -> Result<(), regex::Error> {
    if !self.compiled.contains_key(source) {
      let re = compile_pattern(source)?;
      self.compiled.insert(source.to_string(), re);
    }
    Ok(())
  }

  pub fn contains(&self, source: &str) -> bool {
    self.compiled.contains_key(source)
  }

  pub fn is_match(&self, source: &str, text: &str) -> bool {
    if let Some(re) = self.compiled.get(source) {
      return re.is_match(text);
    }
    match compile_pattern(source) {
      Ok(re) => re.is_match(text),
      Err(e) => {
        warn!(target: "grading", pattern = %source, error = %e, "Skipping invalid rubric pattern");
        false
      }
    }
  }
}

/// Validated, read-only rule lookup for one cartridge.
#[derive(Clone, Debug)]
pub struct RuleRegistry {
  def: CartridgeDef,
  index: HashMap<String, usize>,
  patterns: PatternSet,
}

impl RuleRegistry {
  pub fn new(def: CartridgeDef) -> Result<Self, RegistryError> {
    let mut index = HashMap::new();
    let mut patterns = PatternSet::default();
    for (i, entry) in def.rules.iter().enumerate() {
      if index.insert(entry.field.clone(), i).is_some() {
        return Err(RegistryError::DuplicateField { cartridge: def.id.clone(), field: entry.field.clone() });
      }
      let invalid = |source: regex::Error| RegistryError::InvalidPattern { cartridge: def.id.clone(), field: entry.field.clone(), source };
      for src in entry.rule.regex_sources() {
        patterns.insert(src).map_err(invalid)?;
      }
      for word in entry.rule.forbidden_words().iter().filter(|w| !w.trim().is_empty()) {
        patterns.insert(&forbidden_word_pattern(word)).map_err(invalid)?;
      }
    }
    for (alias, target) in &def.aliases {
      if !index.contains_key(target) {
        return Err(RegistryError::DanglingAlias {
          cartridge: def.id.clone(),
          alias: alias.clone(),
          target: target.clone(),
        });
      }
    }
    Ok(Self { def, index, patterns })
  }

  pub fn id(&self) -> &str { &self.def.id }
  pub fn label(&self) -> &str { self.def.label.as_deref().unwrap_or(&self.def.id) }
  pub fn mode(&self) -> &str { &self.def.mode }
  pub fn aliases(&self) -> &BTreeMap<String, String> { &self.def.aliases }
  pub fn patterns(&self) -> &PatternSet { &self.patterns }

  pub fn get_rule(&self, field: &str) -> Option<&RuleEntry> {
    let key = self.def.aliases.get(field).map(String::as_str).unwrap_or(field);
    self.index.get(key).map(|i| &self.def.rules[*i])
  }

  pub fn entries(&self) -> impl Iterator<Item = &RuleEntry> {
    self.def.rules.iter()
  }

  /// Field label for composite feedback; unknown fields fall back to the raw id.
  pub fn label_for<'a>(&'a self, field: &'a str) -> &'a str {
    self.get_rule(field).map(RuleEntry::display_label).unwrap_or(field)
  }

  /// Every rule's missing keys, as `(field, key)` pairs.
  pub fn missing_context_keys(&self, ctx: &GradingContext) -> Vec<(String, String)> {
    self
      .def
      .rules
      .iter()
      .flat_map(|e| e.rule.missing_context_keys(ctx).into_iter().map(move |k| (e.field.clone(), k)))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const TOML_CARTRIDGE: &str = r#"
id = "radicals"
label = "Simplifying Radicals"
mode = "challenge"
aliases = { "coefficient-box" = "typed-coefficient" }

[[rules]]
field = "gcf"
kind = "numeric"
expected = "gcf"
tolerance = 0

[[rules]]
field = "slope"
kind = "numeric"
expected = { formula = "({{y2}} - {{y1}}) / ({{x2}} - {{x1}})" }
tolerance = "tight"
ratio_hint = "rise / run"

[[rules]]
field = "typed-coefficient"
label = "Coefficient"
kind = "numeric-exact"
expected = "coefficient"

[[rules]]
field = "grouping"
kind = "visual-radical"
feedback = { E = "Nice grouping!" }

[[rules]]
field = "direction"
kind = "regex"
forbidden = ["causes"]
required = [
  { id = "direction", patterns = { sign_of = "r", positive = "positive|increas", negative = ["negative", "decreas"] } },
  { id = "strength", patterns = "strong|weak|moderate" },
]
"#;

  fn registry() -> RuleRegistry {
    let def: CartridgeDef = toml::from_str(TOML_CARTRIDGE).unwrap();
    RuleRegistry::new(def).unwrap()
  }

  #[test]
  fn tolerance_is_or_not_and() {
    assert!(Tolerance::STANDARD.admits(0.04, 0.5));
    assert!(Tolerance::STANDARD.admits(5.0, 0.01));
    assert!(!Tolerance::STANDARD.admits(0.06, 0.03));
  }

  #[test]
  fn tolerance_bounds_survive_float_rounding() {
    let diff = 3.06_f64 - 3.0;
    assert!(diff > 0.06);
    assert!(Tolerance::STANDARD.admits(diff, diff / 3.0));
    let diff = 1.01_f64 - 1.0;
    assert!(Tolerance::TIGHT.admits(diff, diff));
    assert!(Tolerance::PARTIAL.admits(12.15_f64 - 12.0, 0.5));
    assert!(!Tolerance::EXACT.admits(1e-6, 1e-6));
  }

  #[test]
  fn context_keys_are_unique_in_first_seen_order() {
    let rule = GradingRule::Dual {
      required: vec![RequiredPattern {
        id: "direction".into(),
        patterns: Patterns::BySign {
          sign_of: "r".into(),
          positive: Box::new(Patterns::One("positive".into())),
          negative: Box::new(Patterns::One("negative".into())),
          zero: None,
        },
        label: None,
      }],
      forbidden: vec![],
      prompt: "{{r}} {{scenario}} {{r}} {{answer}}".into(),
    };
    assert_eq!(rule.context_keys(), vec!["r".to_string(), "scenario".to_string()]);
  }

  #[test]
  fn registry_compiles_rubric_patterns_once() {
    let reg = registry();
    let patterns = reg.patterns();
    assert!(patterns.contains("strong|weak|moderate"));
    assert!(patterns.contains("decreas"));
    assert!(patterns.contains(&forbidden_word_pattern("causes")));
    assert!(patterns.is_match("strong|weak|moderate", "a STRONG link"));
    assert!(!patterns.is_match(&forbidden_word_pattern("causes"), "because of heat"));
    // Unknown sources still work; invalid ones never match.
    assert!(patterns.is_match("heat", "because of heat"));
    assert!(!patterns.is_match("(unclosed", "(unclosed"));
  }

  #[test]
  fn toml_rules_deserialize_into_tagged_kinds() {
    let reg = registry();
    assert_eq!(reg.mode(), "challenge");
    match &reg.get_rule("gcf").unwrap().rule {
      GradingRule::Numeric { expected, tolerance, .. } => {
        assert_eq!(expected, &ExpectedRef::Key("gcf".into()));
        assert_eq!(tolerance.as_ref().map(ToleranceSpec::tolerance), Some(Tolerance::EXACT));
      }
      other => panic!("unexpected {:?}", other),
    }
    match &reg.get_rule("slope").unwrap().rule {
      GradingRule::Numeric { expected: ExpectedRef::Formula { .. }, tolerance, ratio_hint, .. } => {
        assert_eq!(tolerance.as_ref().map(ToleranceSpec::tolerance), Some(Tolerance::TIGHT));
        assert_eq!(ratio_hint.as_deref(), Some("rise / run"));
      }
      other => panic!("unexpected {:?}", other),
    }
    let grouping = reg.get_rule("grouping").unwrap();
    assert_eq!(grouping.rule, GradingRule::VisualRadical { target: "radicand".into() });
    assert_eq!(grouping.feedback.e.as_deref(), Some("Nice grouping!"));
    assert_eq!(reg.get_rule("direction").unwrap().rule.kind_name(), "regex");
  }

  #[test]
  fn aliases_resolve_to_the_same_rule() {
    let reg = registry();
    let via_alias = reg.get_rule("coefficient-box").unwrap();
    assert_eq!(via_alias.field, "typed-coefficient");
    assert_eq!(reg.label_for("coefficient-box"), "Coefficient");
    assert_eq!(reg.label_for("nope"), "nope");
    assert!(reg.get_rule("nope").is_none());
  }

  #[test]
  fn missing_context_keys_are_reported_per_field() {
    let reg = registry();
    let ctx = GradingContext::from_value(json!({
      "gcf": 12, "y1": 1, "y2": 5, "x1": 0, "coefficient": 6, "radicand": 72
    }));
    let missing = reg.missing_context_keys(&ctx);
    assert_eq!(
      missing,
      vec![("slope".to_string(), "x2".to_string()), ("direction".to_string(), "r".to_string())]
    );
  }

  #[test]
  fn invalid_patterns_and_dangling_aliases_are_rejected() {
    let mut def: CartridgeDef = toml::from_str(TOML_CARTRIDGE).unwrap();
    def.rules.push(RuleEntry::new(
      "broken",
      GradingRule::Regex {
        required: vec![RequiredPattern { id: "x".into(), patterns: Patterns::One("(unclosed".into()), label: None }],
        forbidden: vec![],
      },
    ));
    assert!(matches!(RuleRegistry::new(def), Err(RegistryError::InvalidPattern { .. })));

    let mut def: CartridgeDef = toml::from_str(TOML_CARTRIDGE).unwrap();
    def.aliases.insert("ghost".into(), "missing-field".into());
    assert!(matches!(RuleRegistry::new(def), Err(RegistryError::DanglingAlias { .. })));
  }
}
