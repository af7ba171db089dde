use crate::backend::Mutator;
use crate::config::{write_atomic, Config};
use crate::exemption::Exemption;
use crate::feeds::{ConfiguredFeeds, Feed, FeedFactory};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::resolver::{self, DnsResolver, Resolver};
use crate::store::{ExemptionRecord, Store};
use crate::types::{now_unix_s, WorkingSet};
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

mod reconcile;

/// Owns every piece of state a reconciliation cycle touches. Phases run one after the
/// other on the calling thread; only resolution fans out.
pub struct Engine {
  working: WorkingSet,
  feeds: BTreeMap<String, Box<dyn Feed>>,
  factory: Box<dyn FeedFactory>,
  resolver: Arc<dyn Resolver>,
  store: Store,
  mutator: Mutator,
  pool: WorkerPool,
  /// Set when a commit failed, so the next cycle rebuilds the backends from the store.
  resync: bool,
}

impl Engine {
  pub fn new(
    factory: Box<dyn FeedFactory>,
    resolver: Arc<dyn Resolver>,
    store: Store,
    mutator: Mutator,
  ) -> anyhow::Result<Self> {
    Ok(Self::with_pool(
      factory,
      resolver,
      store,
      mutator,
      WorkerPool::new()?,
    ))
  }

  fn with_pool(
    factory: Box<dyn FeedFactory>,
    resolver: Arc<dyn Resolver>,
    store: Store,
    mutator: Mutator,
    pool: WorkerPool,
  ) -> Self {
    Self {
      working: WorkingSet::new(),
      feeds: BTreeMap::new(),
      factory,
      resolver,
      store,
      mutator,
      pool,
      resync: false,
    }
  }

  pub fn from_config(cfg: &Config, dry_run: bool) -> anyhow::Result<Self> {
    let store = Store::open(&cfg.store.path)
      .with_context(|| format!("open store {}", cfg.store.path.display()))?;
    let pool = WorkerPool::new()?;
    let resolver = DnsResolver::from_system_conf(pool.handle())?;
    Ok(Self::with_pool(
      Box::new(ConfiguredFeeds),
      Arc::new(resolver),
      store,
      Mutator::from_config(cfg, dry_run),
      pool,
    ))
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  /// Runs one cycle. Which phases run depends on the mode; reset only runs on the first
  /// cycle or after a failed commit.
  pub fn refresh(&mut self, cfg: &Config, counter: u64) -> anyhow::Result<()> {
    self.working.clear();
    let mode = cfg.mode;

    if counter == 0 || self.resync {
      tracing::info!("[!] Starting RESET...");
      self.reset()?;
    }

    tracing::info!("[!] Starting FETCH...");
    self.fetch(cfg)?;

    if mode.resolves() {
      tracing::info!("[!] Starting BUILD...");
      self.build(cfg);
    }

    if mode.applies_exemptions() {
      tracing::info!("[!] Starting CLEAN...");
      self.clean(cfg)?;
    }

    if mode.publishes() {
      tracing::info!("[!] Starting WRITE...");
      self.write(&cfg.publish)?;
    }

    tracing::info!("[!] Starting MERGE...");
    self.merge()
  }

  fn fetch(&mut self, cfg: &Config) -> anyhow::Result<()> {
    for name in &cfg.feeds {
      if !self.feeds.contains_key(name) {
        tracing::info!(feed = %name, "subscribing");
        let feed = self.factory.subscribe(name, cfg)?;
        self.feeds.insert(name.clone(), feed);
      }
    }

    self.feeds.retain(|name, _| {
      let keep = cfg.feeds.contains(name);
      if !keep {
        tracing::warn!(feed = %name, "unsubscribing");
      }
      keep
    });

    let mut refreshed = BTreeSet::new();
    for name in &cfg.feeds {
      if !refreshed.insert(name.as_str()) {
        continue;
      }
      let Some(feed) = self.feeds.get_mut(name) else {
        continue;
      };
      let snapshot = feed
        .refresh()
        .with_context(|| format!("refresh feed '{name}'"))?;
      tracing::debug!(feed = %name, entries = snapshot.len(), "feed refreshed");
      self.working.extend(snapshot);
    }

    if !self.working.is_empty() {
      self.store.recycle()?;
    }

    tracing::info!("[!] FETCH part 1/1 done ({} threats)", self.working.len());
    Ok(())
  }

  fn build(&mut self, cfg: &Config) {
    let keys: Vec<String> = self.working.keys().cloned().collect();
    let total = keys.len();
    let step = ((total as f64 / 100.0).round() as usize).max(1);

    let dns = Arc::clone(&self.resolver);
    let mut results = self.pool.map(
      keys.clone(),
      cfg.workers,
      cfg.query_timeout(),
      move |identifier: String| resolver::resolve(dns.as_ref(), &identifier),
    );

    for (index, (identifier, outcome)) in keys.into_iter().zip(results.by_ref()).enumerate() {
      let addresses = match outcome {
        TaskOutcome::Completed(found) => found,
        TaskOutcome::TimedOut => {
          tracing::debug!(identifier = %identifier, "resolution timed out");
          Vec::new()
        }
        TaskOutcome::Failed => {
          tracing::debug!(identifier = %identifier, "resolution failed");
          Vec::new()
        }
      };
      self.working.insert(identifier, addresses);

      let done = index + 1;
      if done % step == 0 || done == total {
        tracing::info!("{}% done... ({done}/{total})", 100 * done / total);
      }
    }

    if results.has_pending() {
      tracing::warn!("worker pool still holds results after the last expected one");
    }

    tracing::info!("[!] BUILD part 1/1 done ({} threats)", self.working.len());
  }

  fn clean(&mut self, cfg: &Config) -> anyhow::Result<()> {
    let ts = now_unix_s();
    let records: Vec<ExemptionRecord> = cfg
      .exemptions
      .iter()
      .map(|pattern| ExemptionRecord::new(ts, pattern))
      .collect();
    if let Err(e) = self.store.replace_exemptions(&records) {
      tracing::error!(error = %format!("{e:#}"), "failed to store exemptions");
    }
    tracing::info!("[!] CLEAN part 1/2 done ({} threats)", self.working.len());

    for record in self.store.exemptions()? {
      let exemption = match Exemption::compile(&record.pattern) {
        Ok(exemption) => exemption,
        Err(e) => {
          tracing::warn!(
            pattern = %record.pattern,
            error = %format!("{e:#}"),
            "skipping exemption"
          );
          continue;
        }
      };
      exemption.apply(&mut self.working);
    }

    tracing::info!("[!] CLEAN part 2/2 done ({} threats)", self.working.len());
    Ok(())
  }

  fn write(&self, path: &Path) -> anyhow::Result<()> {
    let mut out = String::new();
    for (identifier, addresses) in &self.working {
      out.push_str(identifier);
      out.push(';');
      out.push_str(&addresses.join(","));
      out.push('\n');
    }
    write_atomic(path, &out).with_context(|| format!("publish {}", path.display()))?;

    tracing::info!("[!] WRITE part 1/1 done ({} threats)", self.working.len());
    Ok(())
  }
}
