use std::path::{Path, PathBuf};

pub fn base_dir() -> PathBuf {
  match std::env::var_os("SYNCFW_HOME") {
    Some(dir) if !dir.is_empty() => PathBuf::from(dir),
    _ => PathBuf::from("/var/lib/syncfw"),
  }
}

pub fn config_path(base: &Path) -> PathBuf {
  base.join("config.toml")
}

pub fn logs_dir(base: &Path) -> PathBuf {
  base.join("logs")
}

pub fn store_path(base: &Path) -> PathBuf {
  base.join("syncfw.sqlite")
}

pub fn publish_path(base: &Path) -> PathBuf {
  base.join("threats.txt")
}

pub fn blocklist_path(base: &Path) -> PathBuf {
  base.join("blocklist.conf")
}
