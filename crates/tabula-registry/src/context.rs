use std::path::{Path, PathBuf};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};

/// Storage location of one conversation. Built by the caller and passed into
/// every registry operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryContext {
    conversation_dir: PathBuf,
}

impl RegistryContext {
    pub fn new(conversation_dir: impl Into<PathBuf>) -> Self {
        Self {
            conversation_dir: conversation_dir.into(),
        }
    }

    pub fn conversation_dir(&self) -> &Path {
        &self.conversation_dir
    }

    pub fn database_path(&self, cfg: &RegistryConfig) -> PathBuf {
        self.conversation_dir.join(&cfg.database_file)
    }

    pub fn registry_path(&self, cfg: &RegistryConfig) -> PathBuf {
        self.conversation_dir.join(&cfg.registry_file)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.conversation_dir.join(".lock")
    }

    /// Key used to serialize writers of the same conversation.
    pub(crate) fn lock_key(&self) -> String {
        self.conversation_dir.to_string_lossy().into_owned()
    }
}

/// Resolves conversation ids below a configured workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(cfg: &RegistryConfig) -> Result<Self> {
        match cfg.workspace_root.as_ref() {
            Some(root) if !root.as_os_str().is_empty() => Ok(Self::new(root.clone())),
            _ => Err(RegistryError::Configuration(
                "workspace_root is not configured".into(),
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn context(&self, conversation_id: &str) -> Result<RegistryContext> {
        let id = conversation_id.trim();
        if id.is_empty() {
            return Err(RegistryError::Configuration(
                "conversation id is empty".into(),
            ));
        }
        if id == "." || id.contains("..") || id.contains(['/', '\\', '\0']) {
            return Err(RegistryError::Configuration(format!(
                "conversation id {conversation_id:?} is not a plain directory name"
            )));
        }
        Ok(RegistryContext::new(self.root.join(id)))
    }
}
