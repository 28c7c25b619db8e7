//! Per-conversation reader/writer discipline.
//!
//! Writers (import, rename, delete, usage updates) are exclusive per
//! conversation; schema reads and queries share. The in-process lock covers
//! tasks of one process, the optional advisory file lock covers several
//! processes pointed at the same workspace.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::context::RegistryContext;
use crate::error::{join_error, RegistryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileLockMode {
    Shared,
    Exclusive,
}

pub struct ReadGuard {
    _local: OwnedRwLockReadGuard<()>,
    _file: Option<FileLockGuard>,
}

pub struct WriteGuard {
    _local: OwnedRwLockWriteGuard<()>,
    _file: Option<FileLockGuard>,
}

struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Default)]
pub struct ConversationLocks {
    local: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    cross_process: bool,
}

impl ConversationLocks {
    pub fn new(cross_process: bool) -> Self {
        Self {
            local: Mutex::new(HashMap::new()),
            cross_process,
        }
    }

    fn entry(&self, ctx: &RegistryContext) -> Arc<RwLock<()>> {
        let mut map = self.local.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            map.entry(ctx.lock_key())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    pub async fn read(&self, ctx: &RegistryContext) -> Result<ReadGuard> {
        let local = self.entry(ctx).read_owned().await;
        let file = self.file_lock(ctx, FileLockMode::Shared).await?;
        Ok(ReadGuard {
            _local: local,
            _file: file,
        })
    }

    pub async fn write(&self, ctx: &RegistryContext) -> Result<WriteGuard> {
        let local = self.entry(ctx).write_owned().await;
        let file = self.file_lock(ctx, FileLockMode::Exclusive).await?;
        Ok(WriteGuard {
            _local: local,
            _file: file,
        })
    }

    async fn file_lock(
        &self,
        ctx: &RegistryContext,
        mode: FileLockMode,
    ) -> Result<Option<FileLockGuard>> {
        if !self.cross_process {
            return Ok(None);
        }
        let dir = ctx.conversation_dir().to_path_buf();
        let path: PathBuf = ctx.lock_path();
        let guard = tokio::task::spawn_blocking(move || -> Result<FileLockGuard> {
            std::fs::create_dir_all(&dir)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            match mode {
                FileLockMode::Shared => FileExt::lock_shared(&file),
                FileLockMode::Exclusive => FileExt::lock_exclusive(&file),
            }
            .map_err(|e| {
                RegistryError::Connection(format!("lock {}: {}", path.display(), e))
            })?;
            Ok(FileLockGuard { file })
        })
        .await
        .map_err(join_error)??;
        Ok(Some(guard))
    }
}
