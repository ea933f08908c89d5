//! Loading grader configuration (cartridge rules + AI prompts) from TOML.
//!
//! See `GraderConfig` and `Prompts` for the expected schema.

use std::path::Path;

use serde::Deserialize;
use tracing::{error, info};

use crate::rules::{CartridgeDef, RegistryError, RuleRegistry};

#[derive(Clone, Debug, Deserialize, Default)]
pub struct GraderConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub cartridges: Vec<CartridgeDef>,
}

/// Prompts used when this server answers `/api/ai/grade` itself.
/// Override them in TOML to tune tone or strictness.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub grade_system: String,
  pub grade_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      grade_system: "You grade short math and statistics explanations written by students. Reply as compact JSON only.".into(),
      grade_user_template: "Scenario: {{scenario}}\nGrading instructions: {{prompt}}\nStudent answer: {{answer}}\n\nReturn JSON {\"score\": \"E\" | \"P\" | \"I\", \"feedback\": string}. E = complete and correct, P = partially correct, I = incorrect or off-topic. Feedback: one or two encouraging sentences addressed to the student.".into(),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse {path}: {source}")]
  Toml {
    path: String,
    #[source]
    source: toml::de::Error,
  },
  #[error(transparent)]
  Registry(#[from] RegistryError),
}

impl GraderConfig {
  pub fn from_toml_str(s: &str, path: &str) -> Result<Self, ConfigError> {
    toml::from_str::<GraderConfig>(s).map_err(|source| ConfigError::Toml { path: path.to_string(), source })
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let display = path.display().to_string();
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: display.clone(), source })?;
    Self::from_toml_str(&s, &display)
  }

  /// Validate every cartridge into a registry. One bad cartridge rejects the file.
  pub fn registries(&self) -> Result<Vec<RuleRegistry>, ConfigError> {
    self
      .cartridges
      .iter()
      .cloned()
      .map(|def| RuleRegistry::new(def).map_err(ConfigError::from))
      .collect()
  }
}

/// Load from CARTRIDGE_CONFIG_PATH. On any IO/parse/validation error, returns None.
pub fn load_config_from_env() -> Option<(GraderConfig, Vec<RuleRegistry>)> {
  let path = std::env::var("CARTRIDGE_CONFIG_PATH").ok()?;
  let loaded = GraderConfig::load(Path::new(&path)).and_then(|cfg| {
    let regs = cfg.registries()?;
    Ok((cfg, regs))
  });
  match loaded {
    Ok((cfg, regs)) => {
      info!(target: "stargrade_backend", %path, cartridges = regs.len(), "Loaded cartridge config (TOML)");
      Some((cfg, regs))
    }
    Err(e) => {
      error!(target: "stargrade_backend", %path, error = %e, "Failed to load cartridge config");
      None
    }
  }
}
