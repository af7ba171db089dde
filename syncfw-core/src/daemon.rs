use crate::config::{self, Config};
use crate::engine::Engine;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct Daemon {
  config_path: PathBuf,
  engine: Engine,
  counter: u64,
  last_start: Option<Instant>,
}

impl Daemon {
  pub fn new(config_path: PathBuf, engine: Engine) -> Self {
    Self {
      config_path,
      engine,
      counter: 0,
      last_start: None,
    }
  }

  /// Runs cycles every `refresh_delay` until a stop is requested. The configuration is
  /// reloaded on every iteration; a reload failure ends the loop with an error.
  pub fn run(&mut self, stop_rx: mpsc::Receiver<()>, poll: Duration) -> anyhow::Result<()> {
    tracing::info!(config = %self.config_path.display(), "daemon main loop started");

    loop {
      let cfg = self.reload()?;

      if self.is_due(&cfg) {
        self.cycle(&cfg);
        match stop_rx.try_recv() {
          Ok(()) | Err(TryRecvError::Disconnected) => break,
          Err(TryRecvError::Empty) => continue,
        }
      }

      match stop_rx.recv_timeout(poll) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => {}
      }
    }

    tracing::info!(cycles = self.counter, "daemon main loop exiting");
    Ok(())
  }

  /// One full cycle including reset, for `--once`. Errors are returned, not swallowed.
  pub fn run_once(&mut self) -> anyhow::Result<()> {
    let cfg = self.reload()?;
    self.last_start = Some(Instant::now());
    self.engine.refresh(&cfg, 0)?;
    self.counter += 1;
    Ok(())
  }

  fn reload(&self) -> anyhow::Result<Config> {
    config::reload(&self.config_path).map_err(|e| {
      tracing::error!(error = %format!("{e:#}"), "configuration reload failed; exiting");
      e.context("reload configuration")
    })
  }

  fn is_due(&self, cfg: &Config) -> bool {
    match self.last_start {
      None => true,
      Some(started) => started.elapsed() >= cfg.refresh_delay(),
    }
  }

  fn cycle(&mut self, cfg: &Config) {
    let started = Instant::now();
    self.last_start = Some(started);
    tracing::info!(cycle = self.counter, mode = ?cfg.mode, "cycle starting");

    match self.engine.refresh(cfg, self.counter) {
      Ok(()) => {
        self.counter += 1;
        tracing::info!(
          elapsed_ms = started.elapsed().as_millis() as u64,
          "cycle complete"
        );
      }
      Err(e) => {
        tracing::error!(error = %format!("{e:#}"), "cycle failed");
      }
    }
  }
}
