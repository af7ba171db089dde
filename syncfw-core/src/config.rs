use crate::paths;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub mode: Mode,
  pub feeds: Vec<String>,
  pub exemptions: Vec<String>,
  pub publish: PathBuf,
  pub refresh_delay: u64,
  pub workers: usize,
  pub query_timeout: u64,
  pub query_user_agent: String,
  pub group_range: usize,
  pub logging: LoggingConfig,
  pub store: StoreConfig,
  pub firewall: FirewallConfig,
  pub dns: DnsConfig,
  pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      mode: Mode::Standalone,
      feeds: Vec::new(),
      exemptions: Vec::new(),
      publish: default_publish_path(),
      refresh_delay: default_refresh_delay(),
      workers: default_workers(),
      query_timeout: default_query_timeout(),
      query_user_agent: default_user_agent(),
      group_range: default_group_range(),
      logging: LoggingConfig::default(),
      store: StoreConfig::default(),
      firewall: FirewallConfig::default(),
      dns: DnsConfig::default(),
      sources: BTreeMap::new(),
    }
  }
}

impl Config {
  pub fn refresh_delay(&self) -> Duration {
    Duration::from_secs(self.refresh_delay)
  }

  pub fn query_timeout(&self) -> Duration {
    Duration::from_secs(self.query_timeout)
  }
}

/// Which phases a node runs each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
  /// Resolves, filters, publishes the snapshot, and enforces.
  Server,
  /// Resolves, filters and enforces, without publishing.
  Standalone,
  /// Enforces what its feeds hand over as-is.
  Client,
}

impl Mode {
  pub fn resolves(self) -> bool {
    matches!(self, Mode::Server | Mode::Standalone)
  }

  pub fn applies_exemptions(self) -> bool {
    matches!(self, Mode::Server | Mode::Standalone)
  }

  pub fn publishes(self) -> bool {
    self == Mode::Server
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
  #[serde(default = "default_store_path")]
  pub path: PathBuf,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: default_store_path(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallConfig {
  #[serde(default = "default_ip_block_chain")]
  pub ip_block_chain: String,

  #[serde(default = "default_dns_block_chain")]
  pub dns_block_chain: String,

  #[serde(default = "default_drop_target")]
  pub drop_target: String,

  #[serde(default = "default_ipv4_restore")]
  pub ipv4_restore: String,

  #[serde(default = "default_ipv6_restore")]
  pub ipv6_restore: String,

  /// Built-in chains that get a jump into both managed chains. Empty leaves hooking
  /// to the operator.
  #[serde(default = "default_hooks")]
  pub hooks: Vec<String>,

  #[serde(default = "default_ipv4_iptables")]
  pub ipv4_iptables: String,

  #[serde(default = "default_ipv6_iptables")]
  pub ipv6_iptables: String,
}

impl Default for FirewallConfig {
  fn default() -> Self {
    Self {
      ip_block_chain: default_ip_block_chain(),
      dns_block_chain: default_dns_block_chain(),
      drop_target: default_drop_target(),
      ipv4_restore: default_ipv4_restore(),
      ipv6_restore: default_ipv6_restore(),
      hooks: default_hooks(),
      ipv4_iptables: default_ipv4_iptables(),
      ipv6_iptables: default_ipv6_iptables(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistFormat {
  Unbound,
  Dnsmasq,
  Hosts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
  #[serde(default = "default_blocklist_format")]
  pub format: BlocklistFormat,

  #[serde(default = "default_blocklist_path")]
  pub path: PathBuf,

  #[serde(default)]
  pub reload_command: Vec<String>,
}

impl Default for DnsConfig {
  fn default() -> Self {
    Self {
      format: default_blocklist_format(),
      path: default_blocklist_path(),
      reload_command: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListFormat {
  List,
  Hosts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
  pub locations: Vec<String>,

  #[serde(default = "default_list_format")]
  pub format: ListFormat,
}

fn default_publish_path() -> PathBuf {
  paths::publish_path(&paths::base_dir())
}

fn default_store_path() -> PathBuf {
  paths::store_path(&paths::base_dir())
}

fn default_blocklist_path() -> PathBuf {
  paths::blocklist_path(&paths::base_dir())
}

fn default_refresh_delay() -> u64 {
  3600
}

fn default_workers() -> usize {
  16
}

fn default_query_timeout() -> u64 {
  10
}

fn default_user_agent() -> String {
  format!("syncfw/{}", env!("CARGO_PKG_VERSION"))
}

fn default_group_range() -> usize {
  4
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

fn default_ip_block_chain() -> String {
  "SYNCFW_IPBL".to_string()
}

fn default_dns_block_chain() -> String {
  "SYNCFW_DNBL".to_string()
}

fn default_drop_target() -> String {
  "DROP".to_string()
}

fn default_ipv4_restore() -> String {
  "iptables-restore".to_string()
}

fn default_ipv6_restore() -> String {
  "ip6tables-restore".to_string()
}

fn default_hooks() -> Vec<String> {
  ["INPUT", "FORWARD", "OUTPUT"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ipv4_iptables() -> String {
  "iptables".to_string()
}

fn default_ipv6_iptables() -> String {
  "ip6tables".to_string()
}

fn default_blocklist_format() -> BlocklistFormat {
  BlocklistFormat::Unbound
}

fn default_list_format() -> ListFormat {
  ListFormat::List
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  pub mode: Option<Mode>,

  #[serde(default)]
  pub feeds: Option<Vec<String>>,

  #[serde(default)]
  pub exemptions: Option<Vec<String>>,

  #[serde(default)]
  pub publish: Option<PathBuf>,

  #[serde(default)]
  pub refresh_delay: Option<u64>,

  #[serde(default)]
  pub workers: Option<usize>,

  #[serde(default)]
  pub query_timeout: Option<u64>,

  #[serde(default)]
  pub query_user_agent: Option<String>,

  #[serde(default)]
  pub group_range: Option<usize>,

  #[serde(default)]
  pub logging: Option<LoggingConfig>,

  #[serde(default)]
  pub store: Option<StoreConfig>,

  #[serde(default)]
  pub firewall: Option<FirewallConfig>,

  #[serde(default)]
  pub dns: Option<DnsConfig>,

  #[serde(default)]
  pub sources: Option<BTreeMap<String, SourceConfig>>,
}

impl ConfigFile {
  fn normalize(self) -> Config {
    let d = Config::default();
    Config {
      mode: self.mode.unwrap_or(d.mode),
      feeds: self.feeds.unwrap_or(d.feeds),
      exemptions: self
        .exemptions
        .unwrap_or(d.exemptions)
        .into_iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect(),
      publish: self.publish.unwrap_or(d.publish),
      refresh_delay: self.refresh_delay.unwrap_or(d.refresh_delay),
      workers: self.workers.unwrap_or(d.workers),
      query_timeout: self.query_timeout.unwrap_or(d.query_timeout),
      query_user_agent: self.query_user_agent.unwrap_or(d.query_user_agent),
      group_range: self.group_range.unwrap_or(d.group_range),
      logging: self.logging.unwrap_or(d.logging),
      store: self.store.unwrap_or(d.store),
      firewall: self.firewall.unwrap_or(d.firewall),
      dns: self.dns.unwrap_or(d.dns),
      sources: self.sources.unwrap_or(d.sources),
    }
  }

  fn needs_upgrade(&self) -> bool {
    self.mode.is_none()
      || self.refresh_delay.is_none()
      || self.workers.is_none()
      || self.query_timeout.is_none()
      || self.logging.is_none()
      || self.store.is_none()
      || self.firewall.is_none()
      || self.dns.is_none()
  }
}

/// Startup load: a missing file is created with defaults and an unparsable one is
/// backed up and replaced, so the daemon can always come up.
pub fn load_or_create_default(path: &Path) -> anyhow::Result<Config> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
  fs::create_dir_all(parent)?;

  if !path.exists() {
    let cfg = Config::default();
    write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
    return Ok(cfg);
  }

  let raw = fs::read_to_string(path)?;
  match toml::from_str::<ConfigFile>(&raw) {
    Ok(file) => {
      let upgrade = file.needs_upgrade();
      let cfg = file.normalize();
      if let Some(reason) = validate(&cfg) {
        anyhow::bail!("invalid config at {}: {reason}", path.display());
      }
      if upgrade {
        let backup = parent.join(format!("config.toml.bak-{}", unix_seconds()));
        let _ = fs::copy(path, &backup);
        let _ = write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?);
        eprintln!(
          "syncfw: upgraded config defaults written to {} (backup: {})",
          path.display(),
          backup.display()
        );
      }
      Ok(cfg)
    }
    Err(e) => {
      let cfg = Config::default();
      let backup = parent.join(format!("config.toml.bad-{}", unix_seconds()));
      let _ = fs::rename(path, &backup);
      write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
      eprintln!(
        "syncfw: invalid config at {} (backed up to {}): {e}",
        path.display(),
        backup.display()
      );
      Ok(cfg)
    }
  }
}

/// In-loop reload: never writes, and any read, parse or validation problem is an error.
pub fn reload(path: &Path) -> anyhow::Result<Config> {
  let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
  let file: ConfigFile =
    toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
  let cfg = file.normalize();
  if let Some(reason) = validate(&cfg) {
    anyhow::bail!("invalid config at {}: {reason}", path.display());
  }
  Ok(cfg)
}

pub fn validate(cfg: &Config) -> Option<String> {
  if cfg.workers == 0 {
    return Some("workers must be > 0".to_string());
  }
  if cfg.query_timeout == 0 {
    return Some("query_timeout must be > 0".to_string());
  }
  if cfg.refresh_delay == 0 {
    return Some("refresh_delay must be > 0".to_string());
  }
  if cfg.group_range == 0 {
    return Some("group_range must be > 0".to_string());
  }
  let fw = &cfg.firewall;
  for (key, value) in [
    ("firewall.ip_block_chain", &fw.ip_block_chain),
    ("firewall.dns_block_chain", &fw.dns_block_chain),
    ("firewall.drop_target", &fw.drop_target),
  ] {
    if value.trim().is_empty() {
      return Some(format!("{key} must not be empty"));
    }
  }
  for (name, source) in &cfg.sources {
    if source.locations.is_empty() {
      return Some(format!("sources.{name}.locations must not be empty"));
    }
  }
  None
}

fn to_config_file(cfg: &Config) -> ConfigFile {
  ConfigFile {
    mode: Some(cfg.mode),
    feeds: Some(cfg.feeds.clone()),
    exemptions: Some(cfg.exemptions.clone()),
    publish: Some(cfg.publish.clone()),
    refresh_delay: Some(cfg.refresh_delay),
    workers: Some(cfg.workers),
    query_timeout: Some(cfg.query_timeout),
    query_user_agent: Some(cfg.query_user_agent.clone()),
    group_range: Some(cfg.group_range),
    logging: Some(cfg.logging.clone()),
    store: Some(cfg.store.clone()),
    firewall: Some(cfg.firewall.clone()),
    dns: Some(cfg.dns.clone()),
    sources: Some(cfg.sources.clone()),
  }
}

/// Writes through a sibling temp file and a rename, creating the parent directory.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("file path has no parent: {}", path.display()))?;
  fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
  let tmp = parent.join(format!(
    ".{}.tmp",
    path.file_name().unwrap_or_default().to_string_lossy()
  ));

  fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
  fs::rename(&tmp, path)
    .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
  Ok(())
}

fn unix_seconds() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}
