//! Server configuration, layered from an optional TOML file and `LEADLINE_*`
//! environment variables.
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `LEADLINE_RULES__DURING_CALL_MINUTES=15`.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::TimeDelta;
use leadline_core::{evolution::EvolutionSettings, rules::RuleSettings};
use serde::Deserialize;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `leadline.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:              String,
  #[serde(default = "default_port")]
  pub port:              u16,
  #[serde(default = "default_store_path")]
  pub store_path:        PathBuf,
  /// Where stage-change notifications are POSTed. Unset means log only.
  #[serde(default)]
  pub notify_url:        Option<String>,
  /// Seconds between sweeps of the notification outbox.
  #[serde(default = "default_notify_sweep_secs")]
  pub notify_sweep_secs: u64,
  #[serde(default)]
  pub rules:             RulesConfig,
  #[serde(default)]
  pub migration:         MigrationConfig,
}

fn default_host() -> String { "127.0.0.1".into() }

fn default_port() -> u16 { 8080 }

fn default_notify_sweep_secs() -> u64 { 30 }

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/leadline/leadline.db") }

/// Correlation windows for the auto-tag rules.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
  pub during_call_minutes:   i64,
  pub after_voicemail_hours: i64,
}

impl Default for RulesConfig {
  fn default() -> Self {
    Self { during_call_minutes: 10, after_voicemail_hours: 48 }
  }
}

impl RulesConfig {
  pub fn settings(&self) -> RuleSettings {
    RuleSettings {
      during_call_window:     TimeDelta::minutes(self.during_call_minutes),
      after_voicemail_window: TimeDelta::hours(self.after_voicemail_hours),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
  pub batch_size:      usize,
  pub max_concurrency: usize,
  /// How long cutover must run without shadow-read mismatches before the
  /// contract phase may start.
  pub soak_hours:      i64,
}

impl Default for MigrationConfig {
  fn default() -> Self {
    Self { batch_size: 500, max_concurrency: 4, soak_hours: 24 }
  }
}

impl MigrationConfig {
  pub fn settings(&self) -> EvolutionSettings {
    EvolutionSettings {
      batch_size:      self.batch_size.max(1),
      max_concurrency: self.max_concurrency.max(1),
      soak_period:     TimeDelta::hours(self.soak_hours),
    }
  }
}

// ─── Loading ──────────────────────────────────────────────────────────────────

impl ServerConfig {
  /// Read `path` (if it exists) and overlay the environment.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("LEADLINE")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()
      .context("failed to read config file")?;

    settings
      .try_deserialize()
      .context("failed to deserialise ServerConfig")
  }

  /// The store path with a leading `~` expanded.
  pub fn resolved_store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use std::io::Write as _;

  use super::*;

  #[test]
  fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.notify_url, None);
    assert_eq!(cfg.notify_sweep_secs, 30);
    assert_eq!(cfg.rules.settings(), RuleSettings::default());
    assert_eq!(cfg.migration.settings().soak_period, TimeDelta::hours(24));
  }

  #[test]
  fn file_overrides_selected_keys() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
      file,
      r#"
port = 9000
store_path = "/var/lib/leadline/db.sqlite"
notify_url = "http://dashboard.internal/hooks/stage"
notify_sweep_secs = 5

[rules]
during_call_minutes = 15

[migration]
batch_size = 50
max_concurrency = 0
"#
    )
    .unwrap();

    let cfg = ServerConfig::load(file.path()).unwrap();
    assert_eq!(cfg.address(), "127.0.0.1:9000");
    assert_eq!(cfg.resolved_store_path(), PathBuf::from("/var/lib/leadline/db.sqlite"));
    assert_eq!(cfg.notify_url.as_deref(), Some("http://dashboard.internal/hooks/stage"));
    assert_eq!(cfg.notify_sweep_secs, 5);

    let rules = cfg.rules.settings();
    assert_eq!(rules.during_call_window, TimeDelta::minutes(15));
    assert_eq!(rules.after_voicemail_window, TimeDelta::hours(48));

    let migration = cfg.migration.settings();
    assert_eq!(migration.batch_size, 50);
    assert_eq!(migration.max_concurrency, 1);
  }

  #[test]
  fn tilde_expands_against_home() {
    let Ok(home) = std::env::var("HOME") else { return };
    let expanded = expand_tilde(Path::new("~/leadline.db"));
    assert_eq!(expanded, PathBuf::from(home).join("leadline.db"));
    assert_eq!(expand_tilde(Path::new("/tmp/x.db")), PathBuf::from("/tmp/x.db"));
  }
}
