use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// What to do when the registry file cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptRegistryPolicy {
    /// Surface `CorruptRegistry` and leave the file untouched.
    #[default]
    Fail,
    /// Move the unreadable file aside and continue with an empty registry.
    Quarantine,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMatcherKind {
    #[default]
    Identifier,
    Naive,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding one subdirectory per conversation.
    pub workspace_root: Option<PathBuf>,
    pub database_file: String,
    pub registry_file: String,
    pub busy_timeout_ms: u64,
    pub corrupt_registry: CorruptRegistryPolicy,
    pub usage_matcher: UsageMatcherKind,
    pub max_name_attempts: u32,
    /// Also take an advisory file lock so several processes can share a workspace.
    pub cross_process_lock: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            database_file: "database.db".to_string(),
            registry_file: "views.json".to_string(),
            busy_timeout_ms: 5000,
            corrupt_registry: CorruptRegistryPolicy::Fail,
            usage_matcher: UsageMatcherKind::Identifier,
            max_name_attempts: 64,
            cross_process_lock: true,
        }
    }
}

impl RegistryConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: RegistryConfig =
            toml::from_str(content).map_err(|e| RegistryError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Configuration(format!("read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("database_file", &self.database_file),
            ("registry_file", &self.registry_file),
        ] {
            if value.trim().is_empty() || value.contains(['/', '\\']) {
                return Err(RegistryError::Configuration(format!(
                    "{key} must be a plain file name, got {value:?}"
                )));
            }
        }
        if self.database_file == self.registry_file {
            return Err(RegistryError::Configuration(
                "database_file and registry_file must differ".into(),
            ));
        }
        if self.max_name_attempts == 0 {
            return Err(RegistryError::Configuration(
                "max_name_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
