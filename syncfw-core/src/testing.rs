//! Fakes shared by the unit tests.

use crate::backend::EnforcementBackend;
use crate::config::Config;
use crate::feeds::{Feed, FeedFactory, FeedSnapshot};
use crate::resolver::Resolver;
use crate::types::Chain;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedResolver {
  answers: BTreeMap<String, Vec<String>>,
  hangs: BTreeSet<String>,
  forward_calls: Mutex<Vec<String>>,
  reverse_calls: Mutex<Vec<String>>,
}

impl ScriptedResolver {
  pub fn answer(mut self, identifier: &str, found: &[&str]) -> Self {
    self.answers.insert(
      identifier.to_string(),
      found.iter().map(|s| s.to_string()).collect(),
    );
    self
  }

  /// Lookups for `identifier` block well past any test timeout.
  pub fn hang(mut self, identifier: &str) -> Self {
    self.hangs.insert(identifier.to_string());
    self
  }

  pub fn forward_calls(&self) -> Vec<String> {
    self.forward_calls.lock().unwrap().clone()
  }

  pub fn reverse_calls(&self) -> Vec<String> {
    self.reverse_calls.lock().unwrap().clone()
  }

  fn lookup(&self, identifier: &str) -> anyhow::Result<Vec<String>> {
    if self.hangs.contains(identifier) {
      std::thread::sleep(Duration::from_secs(2));
    }
    self
      .answers
      .get(identifier)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("no answer scripted for {identifier}"))
  }
}

impl Resolver for ScriptedResolver {
  fn forward(&self, domain: &str) -> anyhow::Result<Vec<String>> {
    self.forward_calls.lock().unwrap().push(domain.to_string());
    self.lookup(domain)
  }

  fn reverse(&self, ip: &str) -> anyhow::Result<Vec<String>> {
    self.reverse_calls.lock().unwrap().push(ip.to_string());
    self.lookup(ip)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
  Append {
    backend: &'static str,
    content: String,
    chain: Chain,
    target: Chain,
  },
  Delete {
    backend: &'static str,
    content: String,
    chain: Chain,
    target: Chain,
  },
}

impl BackendCall {
  pub fn append(backend: &'static str, content: &str, chain: Chain, target: Chain) -> Self {
    BackendCall::Append {
      backend,
      content: content.to_string(),
      chain,
      target,
    }
  }

  pub fn delete(backend: &'static str, content: &str, chain: Chain, target: Chain) -> Self {
    BackendCall::Delete {
      backend,
      content: content.to_string(),
      chain,
      target,
    }
  }
}

#[derive(Debug, Clone)]
enum Recorded {
  Call(BackendCall),
  Init(&'static str),
  Commit(&'static str),
}

/// Shared journal written by every [`RecordingBackend`] holding a clone.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
  entries: Arc<Mutex<Vec<Recorded>>>,
}

impl CallLog {
  fn push(&self, entry: Recorded) {
    self.entries.lock().unwrap().push(entry);
  }

  pub fn calls(&self) -> Vec<BackendCall> {
    self
      .entries
      .lock()
      .unwrap()
      .iter()
      .filter_map(|e| match e {
        Recorded::Call(call) => Some(call.clone()),
        _ => None,
      })
      .collect()
  }

  pub fn commits(&self) -> Vec<&'static str> {
    self
      .entries
      .lock()
      .unwrap()
      .iter()
      .filter_map(|e| match e {
        Recorded::Commit(name) => Some(*name),
        _ => None,
      })
      .collect()
  }

  pub fn inits(&self) -> Vec<&'static str> {
    self
      .entries
      .lock()
      .unwrap()
      .iter()
      .filter_map(|e| match e {
        Recorded::Init(name) => Some(*name),
        _ => None,
      })
      .collect()
  }

  pub fn clear(&self) {
    self.entries.lock().unwrap().clear();
  }
}

/// On/off flag a test flips between cycles to inject failures into a fake.
#[derive(Debug, Clone, Default)]
pub struct FailSwitch(Arc<AtomicBool>);

impl FailSwitch {
  pub fn set(&self, failing: bool) {
    self.0.store(failing, Ordering::SeqCst);
  }

  fn is_on(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

pub struct RecordingBackend {
  name: &'static str,
  log: CallLog,
  commit_failure: Option<i32>,
  commit_switch: Option<FailSwitch>,
  append_switch: Option<FailSwitch>,
}

impl RecordingBackend {
  pub fn new(name: &'static str, log: CallLog) -> Self {
    Self {
      name,
      log,
      commit_failure: None,
      commit_switch: None,
      append_switch: None,
    }
  }

  pub fn failing_commit(mut self, code: i32) -> Self {
    self.commit_failure = Some(code);
    self
  }

  /// While the switch is on, `commit` fails and so does `init`, which commits the
  /// empty baseline in the real backends.
  pub fn commit_fails_when(mut self, switch: FailSwitch) -> Self {
    self.commit_switch = Some(switch);
    self
  }

  pub fn append_fails_when(mut self, switch: FailSwitch) -> Self {
    self.append_switch = Some(switch);
    self
  }

  fn switched(switch: &Option<FailSwitch>) -> bool {
    switch.as_ref().is_some_and(FailSwitch::is_on)
  }
}

impl EnforcementBackend for RecordingBackend {
  fn name(&self) -> &'static str {
    self.name
  }

  fn init(&mut self) -> anyhow::Result<()> {
    self.log.push(Recorded::Init(self.name));
    if Self::switched(&self.commit_switch) {
      anyhow::bail!("{} init failed", self.name);
    }
    Ok(())
  }

  fn append(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()> {
    if Self::switched(&self.append_switch) {
      anyhow::bail!("{} rejected '{content}'", self.name);
    }
    self
      .log
      .push(Recorded::Call(BackendCall::append(self.name, content, chain, target)));
    Ok(())
  }

  fn delete(&mut self, content: &str, chain: Chain, target: Chain) -> anyhow::Result<()> {
    self
      .log
      .push(Recorded::Call(BackendCall::delete(self.name, content, chain, target)));
    Ok(())
  }

  fn commit(&mut self) -> anyhow::Result<()> {
    self.log.push(Recorded::Commit(self.name));
    if Self::switched(&self.commit_switch) {
      anyhow::bail!("{} commit failed", self.name);
    }
    match self.commit_failure {
      Some(code) => Err(anyhow::anyhow!("{} failed with code {code}", self.name)),
      None => Ok(()),
    }
  }
}

/// Feed contents keyed by feed name. Clones share state, so a test can change what a
/// feed returns between cycles. A name mapped to `None` fails on refresh.
#[derive(Clone, Default)]
pub struct StaticFactory {
  feeds: Arc<Mutex<BTreeMap<String, Option<FeedSnapshot>>>>,
  subscribed: Arc<Mutex<Vec<String>>>,
}

impl StaticFactory {
  pub fn with(self, name: &str, entries: &[(&str, &[&str])]) -> Self {
    self.set(name, entries);
    self
  }

  pub fn set(&self, name: &str, entries: &[(&str, &[&str])]) {
    let snapshot = entries
      .iter()
      .map(|(id, addrs)| {
        (
          id.to_string(),
          addrs.iter().map(|a| a.to_string()).collect(),
        )
      })
      .collect();
    self
      .feeds
      .lock()
      .unwrap()
      .insert(name.to_string(), Some(snapshot));
  }

  pub fn break_feed(&self, name: &str) {
    self.feeds.lock().unwrap().insert(name.to_string(), None);
  }

  pub fn subscribed(&self) -> Vec<String> {
    self.subscribed.lock().unwrap().clone()
  }
}

impl FeedFactory for StaticFactory {
  fn subscribe(&self, name: &str, _cfg: &Config) -> anyhow::Result<Box<dyn Feed>> {
    if !self.feeds.lock().unwrap().contains_key(name) {
      anyhow::bail!("unknown feed '{name}'");
    }
    self.subscribed.lock().unwrap().push(name.to_string());
    Ok(Box::new(StaticFeed {
      name: name.to_string(),
      feeds: Arc::clone(&self.feeds),
    }))
  }
}

pub struct StaticFeed {
  name: String,
  feeds: Arc<Mutex<BTreeMap<String, Option<FeedSnapshot>>>>,
}

impl Feed for StaticFeed {
  fn refresh(&mut self) -> anyhow::Result<FeedSnapshot> {
    match self.feeds.lock().unwrap().get(&self.name) {
      Some(Some(snapshot)) => Ok(snapshot.clone()),
      _ => anyhow::bail!("feed '{}' is unavailable", self.name),
    }
  }
}
