use super::FeedSnapshot;
use crate::config::ListFormat;
use std::collections::BTreeSet;

const SINKS: [&str; 4] = ["0.0.0.0", "127.0.0.1", "::", "::1"];

const LOCAL_NAMES: [&str; 7] = [
  "localhost",
  "localhost.localdomain",
  "local",
  "broadcasthost",
  "ip6-localhost",
  "ip6-loopback",
  "0.0.0.0",
];

pub fn parse(format: ListFormat, text: &str) -> FeedSnapshot {
  match format {
    ListFormat::List => parse_list(text),
    ListFormat::Hosts => parse_hosts(text),
  }
}

/// `identifier[;addr,addr...]` per line.
fn parse_list(text: &str) -> FeedSnapshot {
  let mut out = FeedSnapshot::new();
  for line in text.lines() {
    let line = strip_comment(line);
    if line.is_empty() {
      continue;
    }

    let (identifier, addresses) = match line.split_once(';') {
      Some((id, rest)) => (id, rest),
      None => (line, ""),
    };
    let identifier = identifier.trim().to_lowercase();
    if identifier.is_empty() {
      continue;
    }

    let addresses: BTreeSet<String> = addresses
      .split(',')
      .map(str::trim)
      .filter(|a| !a.is_empty())
      .map(str::to_lowercase)
      .collect();
    out.insert(identifier, addresses.into_iter().collect());
  }
  out
}

/// `<sink> <name>...` per line, as published by hosts-file blocklists.
fn parse_hosts(text: &str) -> FeedSnapshot {
  let mut out = FeedSnapshot::new();
  for line in text.lines() {
    let mut fields = strip_comment(line).split_whitespace();
    let Some(sink) = fields.next() else {
      continue;
    };
    if !SINKS.contains(&sink) {
      continue;
    }

    for name in fields {
      let name = name.trim_end_matches('.').to_lowercase();
      if name.is_empty() || LOCAL_NAMES.contains(&name.as_str()) {
        continue;
      }
      out.insert(name, Vec::new());
    }
  }
  out
}

fn strip_comment(line: &str) -> &str {
  match line.find('#') {
    Some(i) => line[..i].trim(),
    None => line.trim(),
  }
}
