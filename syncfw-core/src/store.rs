use crate::types::ThreatKind;
use anyhow::Context;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const SCAN_CHUNK: usize = 1000;

const SCHEMA_THREATS: &str = "CREATE TABLE IF NOT EXISTS threats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    domain TEXT,
    ipaddr TEXT,
    jsondata TEXT NOT NULL
  )";

const SCHEMA_EXEMPTIONS: &str = "CREATE TABLE IF NOT EXISTS exemptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    domain TEXT,
    ipaddr TEXT
  )";

/// A threat believed to be enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatRow {
  pub id: i64,
  pub kind: ThreatKind,
  pub identifier: String,
  pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThreat {
  pub ts: i64,
  pub kind: ThreatKind,
  pub identifier: String,
  pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptionRecord {
  pub ts: i64,
  pub kind: ThreatKind,
  pub pattern: String,
}

impl ExemptionRecord {
  pub fn new(ts: i64, pattern: &str) -> Self {
    let pattern = pattern.to_lowercase();
    Self {
      ts,
      kind: ThreatKind::classify(&pattern),
      pattern,
    }
  }
}

/// Row changes that must land together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
  inserts: Vec<NewThreat>,
  deletes: Vec<i64>,
}

impl Batch {
  pub fn insert(&mut self, threat: NewThreat) {
    self.inserts.push(threat);
  }

  pub fn delete(&mut self, id: i64) {
    self.deletes.push(id);
  }

  pub fn is_empty(&self) -> bool {
    self.inserts.is_empty() && self.deletes.is_empty()
  }

  pub fn inserts(&self) -> &[NewThreat] {
    &self.inserts
  }

  pub fn deletes(&self) -> &[i64] {
    &self.deletes
  }
}

pub struct Store {
  path: Option<PathBuf>,
  conn: Connection,
}

impl Store {
  pub fn open(path: &Path) -> anyhow::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let conn = open_connection(path)?;
    Ok(Self {
      path: Some(path.to_path_buf()),
      conn,
    })
  }

  pub fn open_in_memory() -> anyhow::Result<Self> {
    let conn = Connection::open_in_memory().context("open in-memory store")?;
    init_schema(&conn)?;
    Ok(Self { path: None, conn })
  }

  /// Replaces the connection with a fresh one. In-memory stores keep theirs, since a
  /// new connection would start empty.
  pub fn recycle(&mut self) -> anyhow::Result<()> {
    if let Some(path) = &self.path {
      self.conn = open_connection(path)?;
    }
    Ok(())
  }

  /// Every threat row in id order, read in chunks.
  pub fn threats(&self) -> ThreatScan<'_> {
    self.threats_chunked(SCAN_CHUNK)
  }

  fn threats_chunked(&self, chunk: usize) -> ThreatScan<'_> {
    ThreatScan {
      conn: &self.conn,
      chunk: chunk.max(1),
      last_id: 0,
      buffered: VecDeque::new(),
      exhausted: false,
    }
  }

  pub fn count_threats(&self) -> anyhow::Result<(u64, u64)> {
    let (domains, ips): (i64, i64) = self
      .conn
      .query_row(
        "SELECT
           COALESCE(SUM(CASE WHEN domain IS NOT NULL THEN 1 ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN ipaddr IS NOT NULL THEN 1 ELSE 0 END), 0)
         FROM threats",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .context("count threats")?;
    Ok((domains.max(0) as u64, ips.max(0) as u64))
  }

  pub fn commit(&mut self, batch: &Batch) -> anyhow::Result<()> {
    if batch.is_empty() {
      return Ok(());
    }
    let tx = self.conn.transaction().context("begin store transaction")?;
    for id in &batch.deletes {
      tx.execute("DELETE FROM threats WHERE id = ?1", params![id])
        .with_context(|| format!("delete threat row {id}"))?;
    }
    for threat in &batch.inserts {
      let json = serde_json::to_string(&threat.addresses).context("encode addresses")?;
      let (domain, ipaddr) = match threat.kind {
        ThreatKind::Domain => (Some(threat.identifier.as_str()), None),
        ThreatKind::Ip => (None, Some(threat.identifier.as_str())),
      };
      tx.execute(
        "INSERT INTO threats (ts, domain, ipaddr, jsondata) VALUES (?1, ?2, ?3, ?4)",
        params![threat.ts, domain, ipaddr, json],
      )
      .with_context(|| format!("insert threat {}", threat.identifier))?;
    }
    tx.commit().context("commit store transaction")?;
    Ok(())
  }

  /// Drops and recreates the exemptions table, then fills it, in one transaction.
  pub fn replace_exemptions(&mut self, records: &[ExemptionRecord]) -> anyhow::Result<()> {
    let tx = self.conn.transaction().context("begin exemptions transaction")?;
    tx.execute("DROP TABLE IF EXISTS exemptions", [])
      .context("drop exemptions table")?;
    tx.execute(SCHEMA_EXEMPTIONS, [])
      .context("create exemptions table")?;
    for record in records {
      let (domain, ipaddr) = match record.kind {
        ThreatKind::Domain => (Some(record.pattern.as_str()), None),
        ThreatKind::Ip => (None, Some(record.pattern.as_str())),
      };
      tx.execute(
        "INSERT INTO exemptions (ts, domain, ipaddr) VALUES (?1, ?2, ?3)",
        params![record.ts, domain, ipaddr],
      )
      .with_context(|| format!("insert exemption {}", record.pattern))?;
    }
    tx.commit().context("commit exemptions transaction")?;
    Ok(())
  }

  pub fn exemptions(&self) -> anyhow::Result<Vec<ExemptionRecord>> {
    let mut stmt = self
      .conn
      .prepare("SELECT ts, domain, ipaddr FROM exemptions ORDER BY id")
      .context("prepare exemptions query")?;
    let rows = stmt
      .query_map([], |row| {
        let ts: i64 = row.get(0)?;
        let domain: Option<String> = row.get(1)?;
        let ipaddr: Option<String> = row.get(2)?;
        Ok((ts, domain, ipaddr))
      })
      .context("query exemptions")?;

    let mut out = Vec::new();
    for row in rows {
      let (ts, domain, ipaddr) = row.context("decode exemption row")?;
      let record = match (domain, ipaddr) {
        (Some(pattern), _) => ExemptionRecord {
          ts,
          kind: ThreatKind::Domain,
          pattern,
        },
        (None, Some(pattern)) => ExemptionRecord {
          ts,
          kind: ThreatKind::Ip,
          pattern,
        },
        (None, None) => continue,
      };
      out.push(record);
    }
    Ok(out)
  }
}

/// Keyset-paginated scan over the threats table. Holds no statement between chunks, so
/// callers may keep working on other state while iterating.
pub struct ThreatScan<'a> {
  conn: &'a Connection,
  chunk: usize,
  last_id: i64,
  buffered: VecDeque<ThreatRow>,
  exhausted: bool,
}

impl ThreatScan<'_> {
  fn fill(&mut self) -> anyhow::Result<()> {
    let mut stmt = self
      .conn
      .prepare(
        "SELECT id, domain, ipaddr, jsondata FROM threats
         WHERE id > ?1 ORDER BY id LIMIT ?2",
      )
      .context("prepare threats scan")?;
    let rows = stmt
      .query_map(params![self.last_id, self.chunk as i64], |row| {
        let id: i64 = row.get(0)?;
        let domain: Option<String> = row.get(1)?;
        let ipaddr: Option<String> = row.get(2)?;
        let json: String = row.get(3)?;
        Ok((id, domain, ipaddr, json))
      })
      .context("scan threats")?;

    let mut fetched = 0usize;
    for row in rows {
      let (id, domain, ipaddr, json) = row.context("decode threat row")?;
      fetched += 1;
      self.last_id = id;
      let (kind, identifier) = match (domain, ipaddr) {
        (Some(d), _) => (ThreatKind::Domain, d),
        (None, Some(ip)) => (ThreatKind::Ip, ip),
        (None, None) => {
          tracing::warn!(row_id = id, "threat row has neither domain nor address; skipping");
          continue;
        }
      };
      let addresses: Vec<String> = serde_json::from_str(&json)
        .with_context(|| format!("decode addresses of threat row {id}"))?;
      self.buffered.push_back(ThreatRow {
        id,
        kind,
        identifier,
        addresses,
      });
    }

    if fetched < self.chunk {
      self.exhausted = true;
    }
    Ok(())
  }
}

impl Iterator for ThreatScan<'_> {
  type Item = anyhow::Result<ThreatRow>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(row) = self.buffered.pop_front() {
        return Some(Ok(row));
      }
      if self.exhausted {
        return None;
      }
      if let Err(e) = self.fill() {
        self.exhausted = true;
        return Some(Err(e));
      }
    }
  }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
  let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
  init_schema(&conn)?;
  Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
  conn
    .execute(SCHEMA_THREATS, [])
    .context("create threats table")?;
  conn
    .execute(SCHEMA_EXEMPTIONS, [])
    .context("create exemptions table")?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn threat(identifier: &str, addresses: &[&str]) -> NewThreat {
    NewThreat {
      ts: 1_700_000_000,
      kind: ThreatKind::classify(identifier),
      identifier: identifier.to_string(),
      addresses: addresses.iter().map(|s| s.to_string()).collect(),
    }
  }

  fn identifiers(store: &Store) -> Vec<String> {
    store
      .threats()
      .map(|r| r.unwrap().identifier)
      .collect()
  }

  #[test]
  fn batch_inserts_and_deletes_atomically() {
    let mut store = Store::open_in_memory().unwrap();
    let mut batch = Batch::default();
    batch.insert(threat("bad.example", &["1.2.3.4"]));
    batch.insert(threat("5.6.7.8", &[]));
    store.commit(&batch).unwrap();

    let rows: Vec<ThreatRow> = store.threats().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].kind, ThreatKind::Domain);
    assert_eq!(rows[0].addresses, vec!["1.2.3.4".to_string()]);
    assert_eq!(rows[1].kind, ThreatKind::Ip);
    assert_eq!(store.count_threats().unwrap(), (1, 1));

    let mut batch = Batch::default();
    batch.delete(rows[0].id);
    batch.insert(threat("new.example", &[]));
    store.commit(&batch).unwrap();
    assert_eq!(identifiers(&store), vec!["5.6.7.8", "new.example"]);
  }

  #[test]
  fn chunked_scan_visits_every_row_in_order() {
    let mut store = Store::open_in_memory().unwrap();
    let mut batch = Batch::default();
    for i in 0..7 {
      batch.insert(threat(&format!("host{i}.example"), &[]));
    }
    store.commit(&batch).unwrap();

    let seen: Vec<String> = store
      .threats_chunked(3)
      .map(|r| r.unwrap().identifier)
      .collect();
    let expected: Vec<String> = (0..7).map(|i| format!("host{i}.example")).collect();
    assert_eq!(seen, expected);
  }

  #[test]
  fn exemptions_are_replaced_wholesale() {
    let mut store = Store::open_in_memory().unwrap();
    store
      .replace_exemptions(&[
        ExemptionRecord::new(1, "*?.Example.TLD"),
        ExemptionRecord::new(1, "10.0.0.1"),
      ])
      .unwrap();
    store
      .replace_exemptions(&[ExemptionRecord::new(2, "good.example")])
      .unwrap();

    let records = store.exemptions().unwrap();
    assert_eq!(records, vec![ExemptionRecord::new(2, "good.example")]);

    store.replace_exemptions(&[]).unwrap();
    assert!(store.exemptions().unwrap().is_empty());
  }

  #[test]
  fn exemption_kind_follows_identifier_rule() {
    assert_eq!(ExemptionRecord::new(0, "*?.Example.TLD").kind, ThreatKind::Domain);
    assert_eq!(ExemptionRecord::new(0, "*?.Example.TLD").pattern, "*?.example.tld");
    assert_eq!(ExemptionRecord::new(0, "10.0.0.*?").kind, ThreatKind::Ip);
  }

  #[test]
  fn file_store_survives_recycle_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("syncfw.sqlite");

    let mut store = Store::open(&path).unwrap();
    let mut batch = Batch::default();
    batch.insert(threat("bad.example", &["1.2.3.4"]));
    store.commit(&batch).unwrap();
    store.recycle().unwrap();
    assert_eq!(identifiers(&store), vec!["bad.example"]);
    drop(store);

    let reopened = Store::open(&path).unwrap();
    assert_eq!(identifiers(&reopened), vec!["bad.example"]);
  }
}
