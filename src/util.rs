//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Log-safe truncation for large strings, cut on a char boundary.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut end = max;
  while !s.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}… ({} bytes total)", &s[..end], s.len())
}

/// First hop of an `x-forwarded-for` value.
pub fn first_forwarded_hop(value: &str) -> Option<&str> {
  value.split(',').map(str::trim).find(|hop| !hop.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fills_every_occurrence() {
    assert_eq!(fill_template("{a}-{b}-{a}", &[("a", "x"), ("b", "y")]), "x-y-x");
    assert_eq!(fill_template("{missing}", &[]), "{missing}");
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    assert_eq!(trunc_for_log("short", 10), "short");
    assert_eq!(trunc_for_log("héllo", 2), "h… (6 bytes total)");
  }

  #[test]
  fn forwarded_for_takes_the_client_hop() {
    assert_eq!(first_forwarded_hop("203.0.113.7, 10.0.0.1"), Some("203.0.113.7"));
    assert_eq!(first_forwarded_hop(" , "), None);
  }
}
