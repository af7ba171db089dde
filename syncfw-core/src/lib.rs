pub mod backend;
pub mod config;
pub mod console;
pub mod daemon;
pub mod engine;
pub mod exemption;
pub mod feeds;
pub mod logging;
pub mod paths;
pub mod pool;
pub mod resolver;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

use anyhow::Context;
use std::sync::mpsc;

pub fn run(args: &[String]) -> anyhow::Result<()> {
  let flags = console::parse_global_flags(args)?;
  let base = paths::base_dir();
  let config_path = flags
    .config_path
    .clone()
    .unwrap_or_else(|| paths::config_path(&base));
  let cfg = config::load_or_create_default(&config_path)?;

  logging::init_file_and_stderr(
    &paths::logs_dir(&base),
    &cfg.logging.level,
    cfg.logging.retention_days,
  )?;

  let action = console::run_console_command(&cfg, args)?;
  if action == console::ConsoleAction::ExitOk {
    return Ok(());
  }

  if flags.dry_run {
    tracing::warn!("DRY-RUN: backends will log their changes without applying them");
  }

  let engine = engine::Engine::from_config(&cfg, flags.dry_run).context("set up engine")?;
  let mut daemon = daemon::Daemon::new(config_path, engine);

  if action == console::ConsoleAction::RunOnce {
    tracing::info!(mode = ?cfg.mode, "running a single cycle");
    return daemon.run_once();
  }

  tracing::info!(mode = ?cfg.mode, "starting syncfw daemon");
  let (stop_tx, stop_rx) = mpsc::channel::<()>();

  let ctrlc_tx = stop_tx.clone();
  ctrlc::set_handler(move || {
    let _ = ctrlc_tx.send(());
  })?;

  daemon.run(stop_rx, daemon::POLL_INTERVAL)?;
  tracing::info!("daemon stopped");
  Ok(())
}
