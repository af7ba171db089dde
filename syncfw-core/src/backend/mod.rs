use crate::config::Config;
use crate::types::Chain;
use std::collections::BTreeMap;

mod dns;
mod iptables;

pub use dns::DnsBlocklist;
pub use iptables::Iptables;

/// One enforcement system. Mutations are staged and only take effect on `commit`.
pub trait EnforcementBackend: Send {
  fn name(&self) -> &'static str;

  /// Resets the backend to an empty baseline.
  fn init(&mut self) -> anyhow::Result<()>;

  fn append(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()>;

  fn delete(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()>;

  fn commit(&mut self) -> anyhow::Result<()>;
}

/// The only path through which reconciliation touches the two backends.
///
/// Entries for any chain but `drop` go to the IP-level backend; entries for the
/// dns-block chain are mirrored into the DNS-level backend.
pub struct Mutator {
  ip: Box<dyn EnforcementBackend>,
  dns: Box<dyn EnforcementBackend>,
}

impl Mutator {
  pub fn new(ip: Box<dyn EnforcementBackend>, dns: Box<dyn EnforcementBackend>) -> Self {
    Self { ip, dns }
  }

  pub fn from_config(cfg: &Config, dry_run: bool) -> Self {
    Self::new(
      Box::new(Iptables::new(cfg.firewall.clone(), dry_run)),
      Box::new(DnsBlocklist::new(cfg.dns.clone(), dry_run)),
    )
  }

  pub fn init(&mut self) -> anyhow::Result<()> {
    self.ip.init()?;
    self.dns.init()?;
    Ok(())
  }

  pub fn apply(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()> {
    if chain != Chain::Drop {
      self.ip.append(content, chain, target)?;
    }
    if chain == Chain::DnsBlock {
      self.dns.append(content, chain, target)?;
    }
    tracing::debug!("[+] '{content}' ({chain} -> {target})");
    Ok(())
  }

  pub fn remove(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()> {
    if chain != Chain::Drop {
      self.ip.delete(content, chain, target)?;
    }
    if chain == Chain::DnsBlock {
      self.dns.delete(content, chain, target)?;
    }
    tracing::debug!("[-] '{content}' ({chain} -> {target})");
    Ok(())
  }

  /// Commits the IP-level backend, then the DNS-level one. The first failure wins.
  pub fn commit(&mut self) -> anyhow::Result<()> {
    for backend in [&mut self.ip, &mut self.dns] {
      backend.commit()?;
      tracing::debug!(backend = backend.name(), "backend committed");
    }
    Ok(())
  }
}

/// Reference-counted view of staged entries shared by the concrete backends: two
/// threats can contribute the same entry, and removing one must not drop the other.
#[derive(Debug, Clone)]
pub(crate) struct EntryCounts<K: Ord> {
  counts: BTreeMap<K, usize>,
}

impl<K: Ord> Default for EntryCounts<K> {
  fn default() -> Self {
    Self {
      counts: BTreeMap::new(),
    }
  }
}

impl<K: Ord + Clone> EntryCounts<K> {
  pub(crate) fn add(&mut self, key: K) {
    *self.counts.entry(key).or_insert(0) += 1;
  }

  /// Returns false when the entry was not present.
  pub(crate) fn remove(&mut self, key: &K) -> bool {
    match self.counts.get_mut(key) {
      Some(n) if *n > 1 => {
        *n -= 1;
        true
      }
      Some(_) => {
        self.counts.remove(key);
        true
      }
      None => false,
    }
  }

  pub(crate) fn clear(&mut self) {
    self.counts.clear();
  }

  pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
    self.counts.keys()
  }

  pub(crate) fn len(&self) -> usize {
    self.counts.len()
  }
}
