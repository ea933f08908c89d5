//! Answer normalizers: turn raw widget input into comparable canonical values.
//!
//! None of these functions fail loudly. Unparsable input comes back as `None`
//! and the field grader turns that into an `I` result with format guidance.

use std::collections::BTreeMap;

/// Canonical prime factorization: prime -> exponent.
pub type Factorization = BTreeMap<u64, u32>;

const MULTIPLY: [char; 3] = ['×', '·', '*'];

fn superscript_digit(ch: char) -> Option<u32> {
  match ch {
    '⁰' => Some(0),
    '¹' => Some(1),
    '²' => Some(2),
    '³' => Some(3),
    '⁴' => Some(4),
    '⁵' => Some(5),
    '⁶' => Some(6),
    '⁷' => Some(7),
    '⁸' => Some(8),
    '⁹' => Some(9),
    _ => None,
  }
}

/// Parse `2^3×5`, `2*2*2*5`, `2³ · 5` and friends.
/// Repeated bases accumulate their exponents.
pub fn parse_prime_factorization(input: &str) -> Option<Factorization> {
  let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
  if compact.is_empty() {
    return None;
  }

  let mut out = Factorization::new();
  for term in compact.split(|c| MULTIPLY.contains(&c)) {
    let (base, exp) = parse_power_term(term)?;
    let slot = out.entry(base).or_insert(0);
    *slot = slot.checked_add(exp)?;
  }
  Some(out)
}

fn parse_power_term(term: &str) -> Option<(u64, u32)> {
  let digits_end = term.find(|c: char| !c.is_ascii_digit()).unwrap_or(term.len());
  if digits_end == 0 {
    return None;
  }
  let base: u64 = term[..digits_end].parse().ok()?;
  if base == 0 {
    return None;
  }

  let rest = &term[digits_end..];
  let exp = if rest.is_empty() {
    1
  } else if let Some(caret) = rest.strip_prefix('^') {
    if caret.is_empty() || !caret.chars().all(|c| c.is_ascii_digit()) {
      return None;
    }
    caret.parse::<u32>().ok()?
  } else {
    let mut e: u32 = 0;
    for ch in rest.chars() {
      e = e.checked_mul(10)?.checked_add(superscript_digit(ch)?)?;
    }
    e
  };

  if exp == 0 { None } else { Some((base, exp)) }
}

/// Product of `prime^exponent` over all entries. `None` on overflow.
pub fn factorization_value(f: &Factorization) -> Option<u64> {
  f.iter().try_fold(1u64, |acc, (base, exp)| acc.checked_mul(base.checked_pow(*exp)?))
}

pub fn is_prime(n: u64) -> bool {
  if n < 2 {
    return false;
  }
  if n % 2 == 0 {
    return n == 2;
  }
  let mut i = 3u64;
  while i.saturating_mul(i) <= n {
    if n % i == 0 {
      return false;
    }
    i += 2;
  }
  true
}

/// True when some `i >= 2` has `i*i` dividing `n`. Shared by every radical grader.
pub fn has_square_factor(n: u64) -> bool {
  if n <= 1 {
    return false;
  }
  let mut i = 2u64;
  while i.saturating_mul(i) <= n {
    if n % (i * i) == 0 {
      return true;
    }
    i += 1;
  }
  false
}

/// Free-text radical form: `3 √ 2` and `3*sqrt2` both become `3sqrt2`.
pub fn normalize_radical(s: &str) -> String {
  s.chars()
    .filter(|c| !c.is_whitespace() && *c != '*')
    .collect::<String>()
    .replace('√', "sqrt")
    .to_lowercase()
}

/// Shallow factored-polynomial normalization. Does not expand or reorder factors.
pub fn normalize_factored(s: &str) -> String {
  s.to_lowercase()
    .chars()
    .filter(|c| !c.is_whitespace() && !MULTIPLY.contains(c))
    .collect::<String>()
    // Adjacent groups are kept as-is; a hook for reordering factors later.
    .replace(")(", ")(")
}

/// Top-level parenthesized groups, in order of appearance.
/// Unbalanced input yields only the groups that closed.
pub fn extract_groups(s: &str) -> Vec<String> {
  let mut groups = Vec::new();
  let mut depth = 0usize;
  let mut current = String::new();
  for ch in s.chars() {
    match ch {
      '(' => {
        if depth > 0 {
          current.push(ch);
        }
        depth += 1;
      }
      ')' if depth > 0 => {
        depth -= 1;
        if depth == 0 {
          groups.push(std::mem::take(&mut current));
        } else {
          current.push(ch);
        }
      }
      _ if depth > 0 => current.push(ch),
      _ => {}
    }
  }
  groups
}

/// Loose text equality: trim + lowercase.
pub fn normalize_text(s: &str) -> String {
  s.trim().to_lowercase()
}

/// Case- and whitespace-insensitive form used by exact/choice matching.
pub fn normalize_compact(s: &str) -> String {
  s.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn factorization_notations_agree() {
    let expected = Factorization::from([(2, 3), (5, 1)]);
    assert_eq!(parse_prime_factorization("2^3×5"), Some(expected.clone()));
    assert_eq!(parse_prime_factorization("2*2*2*5"), Some(expected.clone()));
    assert_eq!(parse_prime_factorization("2³×5"), Some(expected.clone()));
    assert_eq!(parse_prime_factorization(" 2 · 2² × 5 "), Some(expected));
  }

  #[test]
  fn factorization_rejects_garbage() {
    for bad in ["", "   ", "abc", "2^", "2××3", "^3", "0*5", "2^0", "2^x"] {
      assert_eq!(parse_prime_factorization(bad), None, "input {:?}", bad);
    }
  }

  #[test]
  fn factorization_value_recovers_integer() {
    let f = parse_prime_factorization("2^2×3^2×7").unwrap();
    assert_eq!(factorization_value(&f), Some(252));
    let huge = parse_prime_factorization("2^70").unwrap();
    assert_eq!(factorization_value(&huge), None);
  }

  #[test]
  fn primality() {
    let primes: Vec<u64> = (0..30).filter(|n| is_prime(*n)).collect();
    assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
  }

  #[test]
  fn square_factor_predicate() {
    assert!(!has_square_factor(0));
    assert!(!has_square_factor(1));
    assert!(!has_square_factor(2));
    assert!(!has_square_factor(30));
    assert!(has_square_factor(8));
    assert!(has_square_factor(72));
    assert!(has_square_factor(50));
  }

  #[test]
  fn radical_and_factored_normalization() {
    assert_eq!(normalize_radical("3 √ 2"), "3sqrt2");
    assert_eq!(normalize_radical("3*SQRT(2)"), "3sqrt(2)");
    assert_eq!(normalize_factored("(X + 2) * (x - 3)"), "(x+2)(x-3)");
    assert_eq!(extract_groups("(x+2)(x-(3))"), vec!["x+2".to_string(), "x-(3)".to_string()]);
    assert_eq!(extract_groups("x+2)(x"), Vec::<String>::new());
  }
}
