use crate::config::Config;
use crate::store::Store;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
  RunDaemon,
  RunOnce,
  ExitOk,
}

/// Flags shared by every command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalFlags {
  pub dry_run: bool,
  pub config_path: Option<PathBuf>,
}

pub fn parse_global_flags(args: &[String]) -> anyhow::Result<GlobalFlags> {
  let mut flags = GlobalFlags::default();
  let mut i = 0;
  while i < args.len() {
    match args[i].as_str() {
      "--dry-run" => flags.dry_run = true,
      "--config" => {
        let path = args
          .get(i + 1)
          .filter(|p| !p.starts_with("--"))
          .ok_or_else(|| anyhow::anyhow!("expected: --config <path>"))?;
        flags.config_path = Some(PathBuf::from(path));
        i += 1;
      }
      _ => {}
    }
    i += 1;
  }
  Ok(flags)
}

pub fn run_console_command(cfg: &Config, args: &[String]) -> anyhow::Result<ConsoleAction> {
  let args = strip_global_flags(args);

  if args.iter().any(|a| a == "--help" || a == "-h") {
    print_help();
    return Ok(ConsoleAction::ExitOk);
  }

  if args.iter().any(|a| a == "--status") {
    print_status(cfg)?;
    return Ok(ConsoleAction::ExitOk);
  }

  if args.iter().any(|a| a == "--once") {
    return Ok(ConsoleAction::RunOnce);
  }

  if let Some(unknown) = args.iter().skip(1).find(|a| a.starts_with("--")) {
    eprintln!("Unknown option `{unknown}`.");
    print_help();
    return Ok(ConsoleAction::ExitOk);
  }

  Ok(ConsoleAction::RunDaemon)
}

fn print_status(cfg: &Config) -> anyhow::Result<()> {
  println!("Mode: {:?}", cfg.mode);
  if cfg.feeds.is_empty() {
    println!("Feeds: none");
  } else {
    println!("Feeds: {}", cfg.feeds.join(", "));
  }
  println!("Refresh delay (seconds): {}", cfg.refresh_delay);

  let store = Store::open(&cfg.store.path)?;
  let (domains, ips) = store.count_threats()?;
  println!("Store: {}", cfg.store.path.display());
  println!("Enforced threats: {} ({domains} domains, {ips} addresses)", domains + ips);

  let exemptions = store.exemptions()?;
  if exemptions.is_empty() {
    println!("Exemptions: none");
  } else {
    println!("Exemptions:");
    for record in exemptions {
      println!("- {} ({})", record.pattern, record.kind);
    }
  }
  Ok(())
}

fn strip_global_flags(args: &[String]) -> Vec<String> {
  let mut out = Vec::new();
  let mut skip_next = false;
  for a in args {
    if skip_next {
      skip_next = false;
      continue;
    }
    match a.as_str() {
      "--dry-run" => {}
      "--config" => skip_next = true,
      _ => out.push(a.clone()),
    }
  }
  out
}

fn print_help() {
  println!("syncfw v{}", env!("CARGO_PKG_VERSION"));
  println!("Keeps firewall and DNS blocklists in sync with threat feeds.");
  println!("Options:");
  println!("  --config <path> (global; defaults to $SYNCFW_HOME/config.toml)");
  println!("  --dry-run (global; logs backend changes without applying them)");
  println!("  --status");
  println!("  --once");
  println!("  --version");
  println!("  --help");
}
