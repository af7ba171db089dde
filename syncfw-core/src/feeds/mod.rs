use crate::config::{Config, ListFormat, SourceConfig};
use anyhow::Context;
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

pub mod fetch;
pub mod parse;

use fetch::{Fetched, Location, Validators};

/// What one refresh of a feed hands over: identifier to already-known addresses.
pub type FeedSnapshot = BTreeMap<String, Vec<String>>;

/// A subscribed threat source.
pub trait Feed: Send {
  fn refresh(&mut self) -> anyhow::Result<FeedSnapshot>;
}

/// Creates feeds by configured name.
pub trait FeedFactory {
  fn subscribe(&self, name: &str, cfg: &Config) -> anyhow::Result<Box<dyn Feed>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedContext {
  /// How many locations of one feed are fetched at once.
  pub group_range: usize,
  pub user_agent: String,
  pub timeout: Duration,
}

impl FeedContext {
  pub fn from_config(cfg: &Config) -> Self {
    Self {
      group_range: cfg.group_range.max(1),
      user_agent: cfg.query_user_agent.clone(),
      timeout: cfg.query_timeout(),
    }
  }
}

/// Builds feeds from the `[sources.<name>]` sections of the config.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredFeeds;

impl FeedFactory for ConfiguredFeeds {
  fn subscribe(&self, name: &str, cfg: &Config) -> anyhow::Result<Box<dyn Feed>> {
    let source = cfg
      .sources
      .get(name)
      .ok_or_else(|| anyhow::anyhow!("feed '{name}' has no [sources.{name}] section"))?;
    let feed = ListFeed::new(name, source, FeedContext::from_config(cfg))
      .with_context(|| format!("set up feed '{name}'"))?;
    Ok(Box::new(feed))
  }
}

#[derive(Default)]
struct LocationState {
  validators: Validators,
  parsed: Option<FeedSnapshot>,
}

/// A feed assembled from one or more list locations, fetched `group_range` at a time.
/// Later locations win when they disagree about an identifier.
pub struct ListFeed {
  name: String,
  format: ListFormat,
  group_range: usize,
  client: Client,
  locations: Vec<Location>,
  states: Vec<LocationState>,
}

impl ListFeed {
  pub fn new(name: &str, source: &SourceConfig, ctx: FeedContext) -> anyhow::Result<Self> {
    let locations = source
      .locations
      .iter()
      .map(|raw| Location::parse(raw))
      .collect::<anyhow::Result<Vec<_>>>()?;
    let states = locations.iter().map(|_| LocationState::default()).collect();

    Ok(Self {
      name: name.to_string(),
      format: source.format,
      group_range: ctx.group_range.max(1),
      client: fetch::build_client(&ctx.user_agent, ctx.timeout)?,
      locations,
      states,
    })
  }
}

impl Feed for ListFeed {
  fn refresh(&mut self) -> anyhow::Result<FeedSnapshot> {
    let total = self.locations.len();
    let format = self.format;
    let client = &self.client;

    for (part, (locations, states)) in self
      .locations
      .chunks(self.group_range)
      .zip(self.states.chunks_mut(self.group_range))
      .enumerate()
    {
      thread::scope(|s| -> anyhow::Result<()> {
        let handles: Vec<_> = locations
          .iter()
          .zip(states.iter_mut())
          .map(|(location, state)| {
            s.spawn(move || refresh_location(client, format, location, state))
          })
          .collect();

        let joined: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        for (location, outcome) in locations.iter().zip(joined) {
          match outcome {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("fetch of {} panicked", location.label()),
          }
        }
        Ok(())
      })
      .with_context(|| format!("refresh feed '{}'", self.name))?;

      tracing::debug!(
        feed = %self.name,
        done = (part * self.group_range + locations.len()).min(total),
        total,
        "feed locations fetched"
      );
    }

    let mut out = FeedSnapshot::new();
    for state in &self.states {
      if let Some(parsed) = &state.parsed {
        out.extend(parsed.iter().map(|(k, v)| (k.clone(), v.clone())));
      }
    }
    Ok(out)
  }
}

fn refresh_location(
  client: &Client,
  format: ListFormat,
  location: &Location,
  state: &mut LocationState,
) -> anyhow::Result<()> {
  match fetch::fetch(client, location, &state.validators)? {
    Fetched::NotModified if state.parsed.is_some() => {
      tracing::debug!(location = %location.label(), "not modified; reusing last parse");
    }
    Fetched::NotModified => {
      state.validators = Validators::default();
      anyhow::bail!("{} reported not modified with nothing cached", location.label());
    }
    Fetched::Body(body, validators) => {
      let text = String::from_utf8_lossy(&body);
      let parsed = parse::parse(format, &text);
      tracing::debug!(location = %location.label(), entries = parsed.len(), "feed location parsed");
      state.parsed = Some(parsed);
      state.validators = validators;
    }
  }
  Ok(())
}
