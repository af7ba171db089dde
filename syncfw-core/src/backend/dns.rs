use super::{EnforcementBackend, EntryCounts};
use crate::config::{write_atomic, BlocklistFormat, DnsConfig};
use crate::types::Chain;
use anyhow::Context;
use std::process::Command;

/// DNS-level backend: a resolver blocklist file rendered from the blocked domains,
/// followed by an optional reload command.
pub struct DnsBlocklist {
  cfg: DnsConfig,
  dry_run: bool,
  domains: EntryCounts<String>,
}

impl DnsBlocklist {
  pub fn new(cfg: DnsConfig, dry_run: bool) -> Self {
    Self {
      cfg,
      dry_run,
      domains: EntryCounts::default(),
    }
  }

  pub(crate) fn render(&self) -> String {
    let mut out = String::new();
    if self.cfg.format == BlocklistFormat::Unbound {
      out.push_str("server:\n");
    }
    for domain in self.domains.keys() {
      let line = match self.cfg.format {
        BlocklistFormat::Unbound => format!("  local-zone: \"{domain}.\" always_nxdomain\n"),
        BlocklistFormat::Dnsmasq => format!("address=/{domain}/\n"),
        BlocklistFormat::Hosts => format!("0.0.0.0 {domain}\n"),
      };
      out.push_str(&line);
    }
    out
  }

  fn reload(&self) -> anyhow::Result<()> {
    let Some((program, args)) = self.cfg.reload_command.split_first() else {
      return Ok(());
    };
    let output = Command::new(program)
      .args(args)
      .output()
      .with_context(|| format!("run {program}"))?;
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
}

impl EnforcementBackend for DnsBlocklist {
  fn name(&self) -> &'static str {
    "dns-blocklist"
  }

  fn init(&mut self) -> anyhow::Result<()> {
    self.domains.clear();
    self.commit()
  }

  fn append(&mut self, content: &str, _chain: Chain, _target: Chain) -> anyhow::Result<()> {
    self.domains.add(content.to_string());
    Ok(())
  }

  fn delete(&mut self, content: &str, _chain: Chain, _target: Chain) -> anyhow::Result<()> {
    if !self.domains.remove(&content.to_string()) {
      tracing::debug!(content = %content, "delete of absent blocklist entry");
    }
    Ok(())
  }

  fn commit(&mut self) -> anyhow::Result<()> {
    let rendered = self.render();

    if self.dry_run {
      tracing::warn!(
        path = %self.cfg.path.display(),
        domains = self.domains.len(),
        "DRY-RUN: would write DNS blocklist"
      );
      return Ok(());
    }

    write_atomic(&self.cfg.path, &rendered)?;
    self.reload()
  }
}
