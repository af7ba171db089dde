use super::{EnforcementBackend, EntryCounts};
use crate::config::FirewallConfig;
use crate::types::Chain;
use anyhow::Context;
use std::io::Write;
use std::net::IpAddr;
use std::process::{Command, Output, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
  V4,
  V6,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
  chain: Chain,
  content: String,
  target: Chain,
}

/// IP-level backend driving two managed chains through `iptables-restore --noflush`.
///
/// Every commit declares the managed chains (which flushes them) and writes the whole
/// model back, so a failed commit is repaired by the next successful one.
pub struct Iptables {
  cfg: FirewallConfig,
  dry_run: bool,
  entries: EntryCounts<Entry>,
}

impl Iptables {
  pub fn new(cfg: FirewallConfig, dry_run: bool) -> Self {
    Self {
      cfg,
      dry_run,
      entries: EntryCounts::default(),
    }
  }

  fn chain_name(&self, chain: Chain) -> &str {
    match chain {
      Chain::IpBlock => &self.cfg.ip_block_chain,
      Chain::DnsBlock => &self.cfg.dns_block_chain,
      Chain::Drop => &self.cfg.drop_target,
    }
  }

  pub(crate) fn render(&self, family: Family) -> String {
    let ipbl = self.chain_name(Chain::IpBlock);
    let dnbl = self.chain_name(Chain::DnsBlock);

    let mut out = String::from("*filter\n");
    out.push_str(&format!(":{ipbl} - [0:0]\n:{dnbl} - [0:0]\n"));
    out.push_str(&format!("-F {ipbl}\n-F {dnbl}\n"));

    for entry in self.entries.keys() {
      if let Some(rule) = self.rule(entry, family) {
        out.push_str(&rule);
        out.push('\n');
      }
    }

    out.push_str("COMMIT\n");
    out
  }

  fn rule(&self, entry: &Entry, family: Family) -> Option<String> {
    let chain = self.chain_name(entry.chain);
    let target = self.chain_name(entry.target);

    match entry.chain {
      Chain::IpBlock => {
        let Ok(addr) = entry.content.parse::<IpAddr>() else {
          if family == Family::V4 {
            tracing::warn!(content = %entry.content, chain = %entry.chain, "skipping non-address entry");
          }
          return None;
        };
        let matches_family = match addr {
          IpAddr::V4(_) => family == Family::V4,
          IpAddr::V6(_) => family == Family::V6,
        };
        matches_family.then(|| format!("-A {chain} -d {addr} -j {target}"))
      }
      Chain::DnsBlock => {
        let Some(hex) = dns_wire_hex(&entry.content) else {
          if family == Family::V4 {
            tracing::warn!(content = %entry.content, chain = %entry.chain, "skipping invalid domain entry");
          }
          return None;
        };
        Some(format!(
          "-A {chain} -p udp --dport 53 -m string --algo bm --hex-string |{hex}| -j {target}"
        ))
      }
      Chain::Drop => None,
    }
  }

  fn apply(&self, family: Family) -> anyhow::Result<()> {
    let (program, iptables) = match family {
      Family::V4 => (&self.cfg.ipv4_restore, &self.cfg.ipv4_iptables),
      Family::V6 => (&self.cfg.ipv6_restore, &self.cfg.ipv6_iptables),
    };
    let rules = self.render(family);

    if self.dry_run {
      tracing::warn!(
        program = %program,
        entries = self.entries.len(),
        hooks = ?self.cfg.hooks,
        "DRY-RUN: would load firewall rules"
      );
      return Ok(());
    }

    restore(program, &rules)?;
    self.ensure_hooks(iptables)
  }

  /// Jumps from every configured built-in chain into both managed chains. The restore
  /// runs with `--noflush`, so jumps are checked first instead of re-added every commit.
  pub(crate) fn ensure_hooks(&self, iptables: &str) -> anyhow::Result<()> {
    for hook in &self.cfg.hooks {
      for chain in [Chain::IpBlock, Chain::DnsBlock] {
        let jump = self.chain_name(chain);
        let present = Command::new(iptables)
          .args(["-C", hook.as_str(), "-j", jump])
          .stdout(Stdio::null())
          .stderr(Stdio::null())
          .status()
          .with_context(|| format!("run {iptables} -C {hook}"))?
          .success();
        if present {
          continue;
        }

        let output = Command::new(iptables)
          .args(["-I", hook.as_str(), "1", "-j", jump])
          .output()
          .with_context(|| format!("run {iptables} -I {hook}"))?;
        check_status(iptables, &output)?;
        tracing::info!(hook = %hook, chain = %jump, "hooked managed chain");
      }
    }
    Ok(())
  }
}

impl EnforcementBackend for Iptables {
  fn name(&self) -> &'static str {
    "iptables"
  }

  fn init(&mut self) -> anyhow::Result<()> {
    self.entries.clear();
    self.commit()
  }

  fn append(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()> {
    self.entries.add(Entry {
      chain,
      content: content.to_string(),
      target,
    });
    Ok(())
  }

  fn delete(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()> {
    let entry = Entry {
      chain,
      content: content.to_string(),
      target,
    };
    if !self.entries.remove(&entry) {
      tracing::debug!(content = %content, chain = %chain, "delete of absent firewall entry");
    }
    Ok(())
  }

  fn commit(&mut self) -> anyhow::Result<()> {
    self.apply(Family::V4)?;
    self.apply(Family::V6)?;
    Ok(())
  }
}

fn restore(program: &str, rules: &str) -> anyhow::Result<()> {
  let mut child = Command::new(program)
    .arg("--noflush")
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .with_context(|| format!("spawn {program}"))?;

  if let Some(mut stdin) = child.stdin.take() {
    stdin
      .write_all(rules.as_bytes())
      .with_context(|| format!("write rules to {program}"))?;
  }

  let output = child
    .wait_with_output()
    .with_context(|| format!("wait for {program}"))?;
  check_status(program, &output)
}

fn check_status(program: &str, output: &Output) -> anyhow::Result<()> {
  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    return Err(anyhow::anyhow!(
      "{program} failed with code {}: stderr='{}'",
      output.status.code().unwrap_or(-1),
      stderr.trim()
    ));
  }
  Ok(())
}

/// Hex of a name in DNS wire format (length-prefixed labels, no terminating root), as
/// it appears inside a query packet.
pub(crate) fn dns_wire_hex(domain: &str) -> Option<String> {
  let mut hex = String::new();
  for label in domain.trim_end_matches('.').split('.') {
    if label.is_empty() || label.len() > 63 {
      return None;
    }
    hex.push_str(&format!("{:02x}", label.len()));
    for b in label.bytes() {
      hex.push_str(&format!("{b:02x}"));
    }
  }
  Some(hex)
}
