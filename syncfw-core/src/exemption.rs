use crate::types::{ThreatKind, WorkingSet};
use anyhow::Context;
use regex::Regex;

/// What `tld` expands to: one of a few generic suffixes, with an optional two-letter
/// country label after it, so `com`, `org`, `co.uk` and `com.au` all match. A bare
/// country code does not.
const TLD_FRAGMENT: &str = "(co|com|net|org|edu|gov)([.][a-z]{2})?";
const WILDCARD_FRAGMENT: &str = "(([^.]+)[.])?";

pub const TLD_TOKEN: &str = "tld";
pub const WILDCARD_TOKEN: &str = "*?";

/// An operator-declared exemption compiled into a fully anchored matcher.
#[derive(Debug, Clone)]
pub struct Exemption {
  pattern: String,
  regex: Regex,
}

impl Exemption {
  pub fn compile(pattern: &str) -> anyhow::Result<Self> {
    let source = pattern_source(pattern);
    let regex =
      Regex::new(&source).with_context(|| format!("compile exemption pattern '{pattern}'"))?;
    Ok(Self {
      pattern: pattern.to_string(),
      regex,
    })
  }

  pub fn regex_source(&self) -> &str {
    self.regex.as_str()
  }

  pub fn is_match(&self, value: &str) -> bool {
    self.regex.is_match(value)
  }

  /// Removes every identifier that matches, either directly or (for domains) through
  /// one of its resolved addresses. Returns the removed identifiers in sorted order.
  pub fn apply(&self, working: &mut WorkingSet) -> Vec<String> {
    let mut exempted = Vec::new();

    for (identifier, addresses) in working.iter() {
      if ThreatKind::classify(identifier) == ThreatKind::Domain {
        if let Some(address) = addresses.iter().find(|a| self.is_match(a)) {
          tracing::warn!(
            identifier = %identifier,
            address = %address,
            pattern = %self.pattern,
            regex = %self.regex_source(),
            "ignoring exempted threat (matched resolved address)"
          );
          exempted.push(identifier.clone());
          continue;
        }
      }

      if self.is_match(identifier) {
        tracing::warn!(
          identifier = %identifier,
          pattern = %self.pattern,
          regex = %self.regex_source(),
          "ignoring exempted threat"
        );
        exempted.push(identifier.clone());
      }
    }

    for identifier in &exempted {
      working.remove(identifier);
    }
    exempted
  }
}

/// Builds the anchored regex for a dotted pattern, walking labels from the most
/// significant (right-most) one.
pub fn pattern_source(pattern: &str) -> String {
  let mut fragments: Vec<String> = Vec::new();

  for (index, token) in pattern.rsplit('.').enumerate() {
    if token.is_empty() {
      continue;
    }
    let fragment = match (index, token) {
      (0, TLD_TOKEN) => TLD_FRAGMENT.to_string(),
      (0, literal) => format!("({})", regex::escape(literal)),
      (_, WILDCARD_TOKEN) => WILDCARD_FRAGMENT.to_string(),
      (_, literal) => format!("({})[.]", regex::escape(literal)),
    };
    fragments.push(fragment);
  }

  fragments.reverse();
  format!("^{}$", fragments.concat())
}
