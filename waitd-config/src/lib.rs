// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Central tunables for the wait engine, mirroring the scattered module-level
//! constants of the reference implementation's `config` module as a single
//! `serde`-deserializable struct, loadable from a TOML file and overridable
//! by environment variables.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("invalid value for {field}: {detail}")]
  Invalid { field: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionBackendKind {
  Ollama,
  Vllm,
  Claude,
  Passthrough,
}

impl Default for VisionBackendKind {
  fn default() -> Self {
    VisionBackendKind::Passthrough
  }
}

/// spec.md §4.4's "alternative simpler profile": a fixed per-job interval
/// with no adaptation, selectable alongside the default adaptive poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollProfile {
  Adaptive,
  Fixed,
}

impl Default for PollProfile {
  fn default() -> Self {
    PollProfile::Adaptive
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base directory for the SQLite journal, screenshots, and the debug event log.
  pub data_dir: PathBuf,
  /// X11 display string used when no display has been allocated yet.
  pub default_display: String,

  pub default_poll_interval_secs: f64,
  pub min_poll_interval_secs: f64,
  pub max_poll_interval_secs: f64,
  pub default_timeout_secs: f64,
  pub poll_profile: PollProfile,

  pub pixel_diff_threshold: f64,
  pub diff_max_width: u32,
  pub max_static_secs: f64,

  pub frame_max_dim: u32,
  pub frame_jpeg_quality: u8,
  pub thumbnail_max_dim: u32,
  pub thumbnail_jpeg_quality: u8,

  pub max_context_frames: usize,
  pub max_context_verdicts: usize,

  pub resolve_confidence_threshold: f64,
  pub partial_streak_resolve: u32,

  pub vision_backend: VisionBackendKind,
  pub vision_model: Option<String>,
  pub vision_base_url: Option<String>,
  pub vision_api_key: Option<String>,

  pub stuck_threshold_secs: f64,
  pub stuck_check_interval_secs: f64,
  pub stuck_alert_cooldown_secs: f64,

  /// Argv of the command spawned to deliver a wake event, e.g.
  /// `["openclaw", "system", "event", "--text"]` — the message is appended
  /// as the final argument.
  pub wake_command: Vec<String>,
  pub wake_timeout_secs: f64,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      data_dir: default_data_dir(),
      default_display: ":99".to_owned(),

      default_poll_interval_secs: 2.0,
      min_poll_interval_secs: 0.5,
      max_poll_interval_secs: 15.0,
      default_timeout_secs: 300.0,
      poll_profile: PollProfile::Adaptive,

      pixel_diff_threshold: 0.01,
      diff_max_width: 320,
      max_static_secs: 30.0,

      frame_max_dim: 1920,
      frame_jpeg_quality: 80,
      thumbnail_max_dim: 360,
      thumbnail_jpeg_quality: 60,

      max_context_frames: 4,
      max_context_verdicts: 3,

      resolve_confidence_threshold: 0.75,
      partial_streak_resolve: 2,

      vision_backend: VisionBackendKind::Passthrough,
      vision_model: None,
      vision_base_url: None,
      vision_api_key: None,

      stuck_threshold_secs: 300.0,
      stuck_check_interval_secs: 60.0,
      stuck_alert_cooldown_secs: 300.0,

      wake_command: vec!["openclaw".to_owned(), "system".to_owned(), "event".to_owned(), "--mode".to_owned(), "now".to_owned(), "--text".to_owned()],
      wake_timeout_secs: 10.0,
    }
  }
}

fn default_data_dir() -> PathBuf {
  dirs_next::home_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join(".waitd")
}

impl Config {
  /// Loads a config, starting from defaults, layering a TOML file (if present)
  /// over them, and finally applying `WAITD_*` environment variable overrides.
  pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = if let Some(path) = path {
      Config::from_file(path)?
    } else {
      Config::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
  }

  pub fn from_file(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
      path: path.to_path_buf(),
      source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: e,
    })
  }

  fn apply_env_overrides(&mut self) {
    if let Ok(v) = env::var("WAITD_DATA_DIR") {
      self.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("DISPLAY") {
      self.default_display = v;
    }
    if let Ok(v) = env::var("WAITD_POLL_PROFILE") {
      self.poll_profile = match v.to_ascii_lowercase().as_str() {
        "fixed" => PollProfile::Fixed,
        _ => PollProfile::Adaptive,
      };
    }
    if let Ok(v) = env::var("WAITD_VISION_BACKEND") {
      self.vision_backend = match v.to_ascii_lowercase().as_str() {
        "ollama" => VisionBackendKind::Ollama,
        "vllm" => VisionBackendKind::Vllm,
        "claude" => VisionBackendKind::Claude,
        _ => VisionBackendKind::Passthrough,
      };
    }
    if let Ok(v) = env::var("WAITD_VISION_MODEL") {
      self.vision_model = Some(v);
    }
    if let Ok(v) = env::var("WAITD_VISION_BASE_URL") {
      self.vision_base_url = Some(v);
    }
    if let Ok(v) = env::var("WAITD_VISION_API_KEY") {
      self.vision_api_key = Some(v);
    }
    if let Ok(v) = env::var("WAITD_WAKE_CLI") {
      if let Some(rest) = self.wake_command.split_first().map(|(_, rest)| rest.to_vec()) {
        self.wake_command = std::iter::once(v).chain(rest).collect();
      }
    }
  }

  fn validate(&self) -> Result<()> {
    if self.min_poll_interval_secs <= 0.0 {
      return Err(ConfigError::Invalid {
        field: "min_poll_interval_secs",
        detail: "must be positive".to_owned(),
      });
    }
    if self.max_poll_interval_secs < self.min_poll_interval_secs {
      return Err(ConfigError::Invalid {
        field: "max_poll_interval_secs",
        detail: "must be >= min_poll_interval_secs".to_owned(),
      });
    }
    if !(0.0..=1.0).contains(&self.pixel_diff_threshold) {
      return Err(ConfigError::Invalid {
        field: "pixel_diff_threshold",
        detail: "must be within [0, 1]".to_owned(),
      });
    }
    Ok(())
  }

  pub fn ensure_data_dir(&self) -> std::io::Result<()> {
    std::fs::create_dir_all(&self.data_dir)?;
    std::fs::create_dir_all(self.screenshots_dir())?;
    Ok(())
  }

  pub fn db_path(&self) -> PathBuf {
    self.data_dir.join("journal.db")
  }

  pub fn screenshots_dir(&self) -> PathBuf {
    self.data_dir.join("screenshots")
  }

  pub fn event_log_path(&self) -> PathBuf {
    self.data_dir.join("events.log")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    Config::default().validate().unwrap();
  }

  #[test]
  fn rejects_inverted_poll_bounds() {
    let mut config = Config::default();
    config.max_poll_interval_secs = 0.1;
    config.min_poll_interval_secs = 1.0;
    assert!(config.validate().is_err());
  }

  #[test]
  fn loads_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("waitd.toml");
    std::fs::write(&path, "default_poll_interval_secs = 5.0\n").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.default_poll_interval_secs, 5.0);
    // Unset fields keep their defaults.
    assert_eq!(config.min_poll_interval_secs, 0.5);
  }

  #[test]
  fn env_overrides_file() {
    env::set_var("WAITD_VISION_MODEL", "llava");
    let config = Config::load(None).unwrap();
    assert_eq!(config.vision_model.as_deref(), Some("llava"));
    env::remove_var("WAITD_VISION_MODEL");
  }
}
