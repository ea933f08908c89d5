//! Small utility helpers used across modules.

/// Names of the `{{placeholder}}` slots in a template, in order, without duplicates.
pub fn placeholders(tpl: &str) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  let mut rest = tpl;
  while let Some(start) = rest.find("{{") {
    let after = &rest[start + 2..];
    let Some(end) = after.find("}}") else { break };
    let key = after[..end].trim().to_string();
    if !key.is_empty() && !out.contains(&key) {
      out.push(key);
    }
    rest = &after[end + 2..];
  }
  out
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with whole student answers or remote payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}
