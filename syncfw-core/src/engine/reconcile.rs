use super::Engine;
use crate::backend::Mutator;
use crate::store::{Batch, NewThreat};
use crate::types::{now_unix_s, Chain, ThreatKind};

/// Adds everything one threat contributes. A domain's addresses go first so that the
/// dns-block chain they jump to is never referenced before its entry exists.
pub(crate) fn enforce(
  mutator: &mut Mutator,
  kind: ThreatKind,
  identifier: &str,
  addresses: &[String],
) -> anyhow::Result<()> {
  match kind {
    ThreatKind::Domain => {
      for address in addresses {
        mutator.apply(address, Chain::IpBlock, Chain::DnsBlock)?;
      }
      mutator.apply(identifier, Chain::DnsBlock, Chain::Drop)
    }
    ThreatKind::Ip => mutator.apply(identifier, Chain::IpBlock, Chain::Drop),
  }
}

/// Mirror of [`enforce`]: addresses referencing dns-block leave before the domain does.
pub(crate) fn withdraw(
  mutator: &mut Mutator,
  kind: ThreatKind,
  identifier: &str,
  addresses: &[String],
) -> anyhow::Result<()> {
  match kind {
    ThreatKind::Domain => {
      for address in addresses {
        mutator.remove(address, Chain::IpBlock, Chain::DnsBlock)?;
      }
      mutator.remove(identifier, Chain::DnsBlock, Chain::Drop)
    }
    ThreatKind::Ip => mutator.remove(identifier, Chain::IpBlock, Chain::Drop),
  }
}

impl Engine {
  /// Brings backends and store in line with the working set, consuming it.
  ///
  /// Phase 1 withdraws persisted threats that are gone or changed and drops unchanged
  /// ones from the working set. Phase 2 enforces whatever is left.
  ///
  /// An error partway through leaves the backend models ahead of the store, so it
  /// schedules a resync before returning.
  pub(crate) fn merge(&mut self) -> anyhow::Result<()> {
    let result = self.merge_phases();
    if result.is_err() {
      self.resync = true;
    }
    result
  }

  fn merge_phases(&mut self) -> anyhow::Result<()> {
    let mut stale = Batch::default();
    for row in self.store.threats() {
      let row = row?;
      if self.working.get(&row.identifier) == Some(&row.addresses) {
        self.working.remove(&row.identifier);
      } else {
        withdraw(&mut self.mutator, row.kind, &row.identifier, &row.addresses)?;
        stale.delete(row.id);
      }
    }
    self.commit(&stale);
    tracing::info!("[!] MERGE part 1/2 done ({} threats)", self.working.len());

    let mut fresh = Batch::default();
    let ts = now_unix_s();
    for (identifier, addresses) in std::mem::take(&mut self.working) {
      let kind = ThreatKind::classify(&identifier);
      enforce(&mut self.mutator, kind, &identifier, &addresses)?;
      fresh.insert(NewThreat {
        ts,
        kind,
        identifier,
        addresses,
      });
    }
    self.commit(&fresh);
    tracing::info!("[!] MERGE part 2/2 done ({} threats)", self.working.len());
    Ok(())
  }

  /// Reinitialises both backends and replays every persisted threat into them. Threats
  /// already in the working set are left to merge.
  ///
  /// The resync flag stays set until the final commit succeeds, so a reset that fails
  /// anywhere is retried on the next cycle.
  pub(crate) fn reset(&mut self) -> anyhow::Result<()> {
    self.resync = true;
    let replayed = self.replay()?;

    match self.mutator.commit() {
      Ok(()) => self.resync = false,
      Err(e) => {
        tracing::error!(error = %format!("{e:#}"), "backend commit failed during reset");
      }
    }

    tracing::info!(
      replayed,
      "[!] RESET part 1/1 done ({} threats)",
      self.working.len()
    );
    Ok(())
  }

  fn replay(&mut self) -> anyhow::Result<usize> {
    self.mutator.init()?;

    let mut replayed = 0usize;
    for row in self.store.threats() {
      let row = row?;
      if self.working.contains_key(&row.identifier) {
        continue;
      }
      enforce(&mut self.mutator, row.kind, &row.identifier, &row.addresses)?;
      replayed += 1;
    }
    Ok(replayed)
  }

  /// IP backend, DNS backend, then store. Any failure discards the store batch.
  fn commit(&mut self, batch: &Batch) {
    let result = match self.mutator.commit() {
      Ok(()) => self.store.commit(batch),
      Err(e) => Err(e),
    };
    if let Err(e) = result {
      tracing::error!(
        error = %format!("{e:#}"),
        inserts = batch.inserts().len(),
        deletes = batch.deletes().len(),
        "commit failed; discarding batch"
      );
      self.resync = true;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Store;
  use crate::testing::{
    BackendCall, CallLog, FailSwitch, RecordingBackend, ScriptedResolver, StaticFactory,
  };
  use crate::types::WorkingSet;
  use std::sync::Arc;

  fn engine() -> (Engine, CallLog) {
    let log = CallLog::default();
    let engine = Engine::new(
      Box::new(StaticFactory::default()),
      Arc::new(ScriptedResolver::default()),
      Store::open_in_memory().unwrap(),
      Mutator::new(
        Box::new(RecordingBackend::new("ip", log.clone())),
        Box::new(RecordingBackend::new("dns", log.clone())),
      ),
    ).unwrap();
    (engine, log)
  }

  fn working(entries: &[(&str, &[&str])]) -> WorkingSet {
    entries
      .iter()
      .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
      .collect()
  }

  fn stored(engine: &Engine) -> Vec<(i64, String, Vec<String>)> {
    engine
      .store
      .threats()
      .map(|r| {
        let r = r.unwrap();
        (r.id, r.identifier, r.addresses)
      })
      .collect()
  }

  #[test]
  fn merging_the_same_working_set_twice_is_a_no_op() {
    let (mut engine, log) = engine();
    let set = working(&[("bad.example", &["1.2.3.4"]), ("5.6.7.8", &[])]);

    engine.working = set.clone();
    engine.merge().unwrap();
    let before = stored(&engine);
    assert_eq!(before.len(), 2);

    log.clear();
    engine.working = set;
    engine.merge().unwrap();
    assert!(log.calls().is_empty());
    assert_eq!(stored(&engine), before);
  }

  #[test]
  fn only_stale_rows_are_replaced() {
    let (mut engine, log) = engine();
    engine.working = working(&[
      ("keep.example", &["1.1.1.1"]),
      ("moved.example", &["2.2.2.2"]),
      ("gone.example", &["3.3.3.3"]),
    ]);
    engine.merge().unwrap();
    let ids: Vec<i64> = stored(&engine).into_iter().map(|(id, _, _)| id).collect();

    log.clear();
    engine.working = working(&[
      ("keep.example", &["1.1.1.1"]),
      ("moved.example", &["4.4.4.4"]),
      ("new.example", &[]),
    ]);
    engine.merge().unwrap();

    let after = stored(&engine);
    let identifiers: Vec<&str> = after.iter().map(|(_, id, _)| id.as_str()).collect();
    assert_eq!(identifiers, vec!["keep.example", "moved.example", "new.example"]);
    // Rows were inserted in sorted order: gone, keep, moved.
    assert_eq!(after[0].0, ids[1]);
    assert!(after[1].0 > ids[2]);
    assert_eq!(after[1].2, vec!["4.4.4.4".to_string()]);

    let calls = log.calls();
    assert!(!calls.iter().any(|c| matches!(
      c,
      BackendCall::Append { content, .. } | BackendCall::Delete { content, .. }
        if content == "keep.example" || content == "1.1.1.1"
    )));
    assert!(calls.contains(&BackendCall::delete(
      "dns",
      "gone.example",
      Chain::DnsBlock,
      Chain::Drop
    )));
    assert!(calls.contains(&BackendCall::append(
      "ip",
      "4.4.4.4",
      Chain::IpBlock,
      Chain::DnsBlock
    )));
  }

  #[test]
  fn stale_domain_addresses_leave_before_the_domain() {
    let (mut engine, log) = engine();
    engine.working = working(&[("bad.example", &["1.1.1.1", "2.2.2.2"])]);
    engine.merge().unwrap();

    log.clear();
    engine.working = WorkingSet::new();
    engine.merge().unwrap();

    assert_eq!(
      log.calls(),
      vec![
        BackendCall::delete("ip", "1.1.1.1", Chain::IpBlock, Chain::DnsBlock),
        BackendCall::delete("ip", "2.2.2.2", Chain::IpBlock, Chain::DnsBlock),
        BackendCall::delete("ip", "bad.example", Chain::DnsBlock, Chain::Drop),
        BackendCall::delete("dns", "bad.example", Chain::DnsBlock, Chain::Drop),
      ]
    );
    assert!(stored(&engine).is_empty());
  }

  #[test]
  fn backend_failure_discards_the_store_batch() {
    let log = CallLog::default();
    let mut engine = Engine::new(
      Box::new(StaticFactory::default()),
      Arc::new(ScriptedResolver::default()),
      Store::open_in_memory().unwrap(),
      Mutator::new(
        Box::new(RecordingBackend::new("ip", log.clone())),
        Box::new(RecordingBackend::new("dns", log.clone()).failing_commit(1)),
      ),
    ).unwrap();
    engine.working = working(&[("5.6.7.8", &[])]);
    engine.merge().unwrap();

    assert!(stored(&engine).is_empty());
    assert!(engine.resync);
    assert_eq!(log.commits(), vec!["ip", "dns", "ip", "dns"]);
  }

  #[test]
  fn reset_replays_the_store_except_pending_identifiers() {
    let (mut engine, log) = engine();
    engine.working = working(&[("bad.example", &["1.2.3.4"]), ("5.6.7.8", &[])]);
    engine.merge().unwrap();

    log.clear();
    engine.working = working(&[("5.6.7.8", &[])]);
    engine.reset().unwrap();

    assert_eq!(log.inits(), vec!["ip", "dns"]);
    assert_eq!(
      log.calls(),
      vec![
        BackendCall::append("ip", "1.2.3.4", Chain::IpBlock, Chain::DnsBlock),
        BackendCall::append("ip", "bad.example", Chain::DnsBlock, Chain::Drop),
        BackendCall::append("dns", "bad.example", Chain::DnsBlock, Chain::Drop),
      ]
    );
    assert_eq!(log.commits(), vec!["ip", "dns"]);
    assert!(!engine.resync);
  }

  fn switched_engine(commit: &FailSwitch, append: &FailSwitch) -> (Engine, CallLog) {
    let log = CallLog::default();
    let engine = Engine::new(
      Box::new(StaticFactory::default()),
      Arc::new(ScriptedResolver::default()),
      Store::open_in_memory().unwrap(),
      Mutator::new(
        Box::new(
          RecordingBackend::new("ip", log.clone())
            .commit_fails_when(commit.clone())
            .append_fails_when(append.clone()),
        ),
        Box::new(RecordingBackend::new("dns", log.clone())),
      ),
    )
    .unwrap();
    (engine, log)
  }

  #[test]
  fn failing_reset_init_keeps_the_resync_flag() {
    let (commit, append) = (FailSwitch::default(), FailSwitch::default());
    let (mut engine, log) = switched_engine(&commit, &append);
    engine.working = working(&[("9.9.9.9", &[])]);
    engine.merge().unwrap();

    commit.set(true);
    assert!(engine.reset().is_err());
    assert!(engine.resync);

    commit.set(false);
    log.clear();
    engine.reset().unwrap();
    assert!(!engine.resync);
    assert_eq!(
      log.calls(),
      vec![BackendCall::append("ip", "9.9.9.9", Chain::IpBlock, Chain::Drop)]
    );
  }

  #[test]
  fn failing_reset_commit_keeps_the_resync_flag() {
    let log = CallLog::default();
    let mut engine = Engine::new(
      Box::new(StaticFactory::default()),
      Arc::new(ScriptedResolver::default()),
      Store::open_in_memory().unwrap(),
      Mutator::new(
        Box::new(RecordingBackend::new("ip", log.clone())),
        Box::new(RecordingBackend::new("dns", log.clone()).failing_commit(3)),
      ),
    )
    .unwrap();
    let mut batch = Batch::default();
    batch.insert(NewThreat {
      ts: 1,
      kind: ThreatKind::Ip,
      identifier: "9.9.9.9".to_string(),
      addresses: Vec::new(),
    });
    engine.store.commit(&batch).unwrap();

    engine.reset().unwrap();
    assert!(engine.resync);
    assert_eq!(log.inits(), vec!["ip", "dns"]);
    assert_eq!(log.commits(), vec!["ip", "dns"]);
  }

  #[test]
  fn rejected_mutation_during_merge_schedules_a_resync() {
    let (commit, append) = (FailSwitch::default(), FailSwitch::default());
    let (mut engine, log) = switched_engine(&commit, &append);

    append.set(true);
    engine.working = working(&[("5.6.7.8", &[])]);
    assert!(engine.merge().is_err());
    assert!(engine.resync);
    assert!(stored(&engine).is_empty());

    append.set(false);
    engine.working = working(&[("5.6.7.8", &[])]);
    engine.reset().unwrap();
    engine.merge().unwrap();
    assert!(!engine.resync);
    assert_eq!(stored(&engine).len(), 1);
    assert!(log
      .calls()
      .contains(&BackendCall::append("ip", "5.6.7.8", Chain::IpBlock, Chain::Drop)));
  }
}
