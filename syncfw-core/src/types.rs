use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier → related addresses (resolved IPs for a domain, reverse names for an IP).
///
/// Ordered so that every phase walks identifiers in the same sorted order.
pub type WorkingSet = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatKind {
  Domain,
  Ip,
}

impl ThreatKind {
  /// A trailing `.` followed by lowercase ASCII letters means domain; anything else is
  /// treated as an IP address.
  pub fn classify(identifier: &str) -> Self {
    let Some((_, suffix)) = identifier.rsplit_once('.') else {
      return Self::Ip;
    };
    if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_lowercase()) {
      Self::Domain
    } else {
      Self::Ip
    }
  }
}

impl fmt::Display for ThreatKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ThreatKind::Domain => f.write_str("domain"),
      ThreatKind::Ip => f.write_str("ip"),
    }
  }
}

/// Rule groups of the IP-level backend. `Drop` is terminal: it is only ever referenced
/// as the target of entries in the other two chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Chain {
  IpBlock,
  DnsBlock,
  Drop,
}

impl fmt::Display for Chain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Chain::IpBlock => f.write_str("ip-block"),
      Chain::DnsBlock => f.write_str("dns-block"),
      Chain::Drop => f.write_str("drop"),
    }
  }
}

pub fn now_unix_s() -> i64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as i64
}
