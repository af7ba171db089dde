use anyhow::Context;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use reqwest::Url;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const MAX_LIST_BYTES: usize = 64 * 1024 * 1024;

/// Where one feed location lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
  Http(Url),
  File(PathBuf),
}

impl Location {
  pub fn parse(raw: &str) -> anyhow::Result<Self> {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
      let url = Url::parse(raw).with_context(|| format!("invalid feed location: {raw}"))?;
      return Ok(Location::Http(url));
    }
    let path = raw.strip_prefix("file://").unwrap_or(raw);
    if path.is_empty() {
      anyhow::bail!("empty feed location");
    }
    Ok(Location::File(PathBuf::from(path)))
  }

  pub fn label(&self) -> String {
    match self {
      Location::Http(url) => safe_url_label(url),
      Location::File(path) => path.display().to_string(),
    }
  }
}

/// Cache validators remembered from the last successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
  pub etag: Option<String>,
  pub last_modified: Option<String>,
  pub mtime: Option<SystemTime>,
}

pub enum Fetched {
  Body(Vec<u8>, Validators),
  NotModified,
}

pub fn build_client(user_agent: &str, timeout: Duration) -> anyhow::Result<Client> {
  Client::builder()
    .user_agent(user_agent.to_string())
    .timeout(timeout)
    .build()
    .context("build HTTP client")
}

pub fn fetch(client: &Client, location: &Location, known: &Validators) -> anyhow::Result<Fetched> {
  match location {
    Location::Http(url) => http_get(client, url, known),
    Location::File(path) => read_file(path, known),
  }
}

fn http_get(client: &Client, url: &Url, known: &Validators) -> anyhow::Result<Fetched> {
  let mut request = client.get(url.clone());
  if let Some(etag) = &known.etag {
    request = request.header(IF_NONE_MATCH, etag);
  }
  if let Some(modified) = &known.last_modified {
    request = request.header(IF_MODIFIED_SINCE, modified);
  }

  let response = request
    .send()
    .with_context(|| format!("GET {}", safe_url_label(url)))?;

  let status = response.status();
  if status == StatusCode::NOT_MODIFIED {
    return Ok(Fetched::NotModified);
  }
  if status != StatusCode::OK {
    anyhow::bail!(
      "unexpected HTTP status {} for {}",
      status.as_u16(),
      safe_url_label(url)
    );
  }

  let header = |name: HeaderName| {
    response
      .headers()
      .get(name)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string)
  };
  let validators = Validators {
    etag: header(ETAG),
    last_modified: header(LAST_MODIFIED),
    mtime: None,
  };

  let body = read_response_with_limit(response, MAX_LIST_BYTES)
    .with_context(|| format!("read {}", safe_url_label(url)))?;
  Ok(Fetched::Body(body, validators))
}

fn read_file(path: &Path, known: &Validators) -> anyhow::Result<Fetched> {
  let md = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
  let mtime = md.modified().ok();
  if mtime.is_some() && mtime == known.mtime {
    return Ok(Fetched::NotModified);
  }
  if md.len() > MAX_LIST_BYTES as u64 {
    anyhow::bail!(
      "{} exceeds max size {} bytes",
      path.display(),
      MAX_LIST_BYTES
    );
  }

  let body = fs::read(path).with_context(|| format!("read {}", path.display()))?;
  Ok(Fetched::Body(
    body,
    Validators {
      mtime,
      ..Validators::default()
    },
  ))
}

fn read_response_with_limit(response: Response, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
  let mut out = Vec::new();
  let mut limited = response.take((max_bytes.saturating_add(1)) as u64);
  limited
    .read_to_end(&mut out)
    .context("read response body")?;

  if out.len() > max_bytes {
    anyhow::bail!("response exceeds max size {} bytes", max_bytes);
  }

  Ok(out)
}

/// Host and path only, so credentials or tokens in the query never reach the logs.
fn safe_url_label(url: &Url) -> String {
  let host = url.host_str().unwrap_or("<no-host>");
  let mut path = url.path().to_string();
  if path.is_empty() {
    path = "/".to_string();
  }
  format!("{host}{path}")
}
