//! Built-in cartridges that keep the server useful without a config file.

use std::collections::BTreeMap;

use crate::rules::{
  CartridgeDef, ExpectedRef, GradingRule, Patterns, RequiredPattern, RuleEntry, Tolerance, ToleranceLevel,
  ToleranceSpec,
};

fn exact_integer(key: &str) -> GradingRule {
  GradingRule::Numeric {
    expected: ExpectedRef::Key(key.into()),
    tolerance: Some(ToleranceSpec::Absolute(0.0)),
    partial_tolerance: None,
    ratio_hint: None,
  }
}

fn required(id: &str, patterns: Patterns) -> RequiredPattern {
  RequiredPattern { id: id.into(), patterns, label: None }
}

fn correlation_rubric() -> Vec<RequiredPattern> {
  vec![
    required(
      "direction",
      Patterns::BySign {
        sign_of: "r".into(),
        positive: Box::new(Patterns::AnyOf(vec!["positive".into(), r"increas\w*".into(), "go(es)? up".into()])),
        negative: Box::new(Patterns::AnyOf(vec!["negative".into(), r"decreas\w*".into(), "go(es)? down".into()])),
        zero: Some(Box::new(Patterns::One(r"\bno (linear )?(relationship|correlation)".into()))),
      },
    ),
    required("strength", Patterns::One(r"\b(strong|moderate|weak)\b".into())),
    RequiredPattern {
      id: "context".into(),
      patterns: Patterns::One(r"\b(as|when)\b.*\b(increases?|decreases?|rises?|falls?)\b".into()),
      label: Some("how one variable changes with the other".into()),
    },
  ]
}

/// Minimal set of built-in cartridges. Rules reference context keys only;
/// problem generators supply the values per instance.
pub fn seed_cartridges() -> Vec<CartridgeDef> {
  vec![
    CartridgeDef {
      id: "primes".into(),
      label: Some("Primes, GCF and LCM".into()),
      mode: "practice".into(),
      aliases: BTreeMap::new(),
      rules: vec![
        RuleEntry::new("factorization", GradingRule::PrimeFactorization { expected: "num1".into() })
          .labelled("Prime factorization"),
        RuleEntry::new("gcf", exact_integer("gcf")).labelled("GCF"),
        RuleEntry::new("lcm", exact_integer("lcm")).labelled("LCM"),
      ],
    },
    CartridgeDef {
      id: "radicals".into(),
      label: Some("Simplifying Radicals".into()),
      mode: "challenge".into(),
      aliases: BTreeMap::from([
        ("coefficient-input".to_string(), "typed-coefficient".to_string()),
        ("complex-coefficient-input".to_string(), "typed-complex-coefficient".to_string()),
      ]),
      rules: vec![
        RuleEntry::new(
          "simplified",
          GradingRule::SimplifiedRadical { coefficient: "coefficient".into(), radicand: "simplifiedRadicand".into() },
        )
        .labelled("Simplified form"),
        RuleEntry::new("grouping", GradingRule::VisualRadical { target: "original".into() }).labelled("Grouping"),
        RuleEntry::new("prime-grouping", GradingRule::VisualRadicalPrime { target: "original".into() })
          .labelled("Prime grouping"),
        RuleEntry::new("complex-grouping", GradingRule::VisualRadicalComplex { target: "complexOriginal".into() })
          .labelled("Imaginary grouping"),
        RuleEntry::new("typed-coefficient", GradingRule::NumericExact { expected: "coefficient".into() })
          .labelled("Coefficient"),
        RuleEntry::new("typed-complex-coefficient", GradingRule::NumericExact { expected: "imaginaryCoefficient".into() })
          .labelled("Imaginary coefficient"),
      ],
    },
    CartridgeDef {
      id: "polynomials".into(),
      label: Some("Factoring Trinomials".into()),
      mode: "practice".into(),
      aliases: BTreeMap::new(),
      rules: vec![
        RuleEntry::new("factored", GradingRule::FactoredForm { expected: ExpectedRef::Key("factored".into()) })
          .labelled("Factored form"),
      ],
    },
    CartridgeDef {
      id: "correlation".into(),
      label: Some("Scatter Plots and Correlation".into()),
      mode: "review".into(),
      aliases: BTreeMap::new(),
      rules: vec![
        RuleEntry::new(
          "slope",
          GradingRule::Numeric {
            expected: ExpectedRef::Formula { formula: "({{y2}} - {{y1}}) / ({{x2}} - {{x1}})".into() },
            tolerance: Some(ToleranceSpec::Level(ToleranceLevel::Standard)),
            partial_tolerance: None,
            ratio_hint: Some("change in y / change in x".into()),
          },
        )
        .labelled("Slope"),
        RuleEntry::new(
          "r",
          GradingRule::Numeric {
            expected: ExpectedRef::Key("r".into()),
            tolerance: Some(ToleranceSpec::Level(ToleranceLevel::Tight)),
            partial_tolerance: Some(Tolerance { absolute: 0.05, relative: 0.05 }),
            ratio_hint: None,
          },
        )
        .labelled("Correlation coefficient"),
        RuleEntry::new("chart", GradingRule::Choice { expected: ExpectedRef::Key("chartType".into()) })
          .labelled("Chart type"),
        RuleEntry::new(
          "explain",
          GradingRule::Dual {
            required: correlation_rubric(),
            forbidden: vec!["causes".into(), "caused".into()],
            prompt: "The correlation coefficient is {{r}}. Does the answer \"{{answer}}\" describe the direction and strength of the relationship without claiming causation?".into(),
          },
        )
        .labelled("Explanation"),
        RuleEntry::new(
          "interpret",
          GradingRule::Ai {
            prompt: "Grade this interpretation of the slope {{slope}} in context: {{answer}}".into(),
          },
        )
        .labelled("Slope interpretation"),
      ],
    },
  ]
}
