//! Durable per-conversation list of [`ViewRecord`]s, kept as a JSON array in
//! the conversation directory.
//!
//! The store does not lock: [`crate::catalog::ViewCatalog`] holds the
//! conversation write lock around every read-modify-write it issues.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs as afs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{CorruptRegistryPolicy, RegistryConfig};
use crate::context::RegistryContext;
use crate::error::{ErrorDetail, RegistryError, Result};
use crate::record::ViewRecord;
use crate::source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemFailure {
    pub name: String,
    pub error: ErrorDetail,
}

impl ItemFailure {
    pub fn new(name: impl Into<String>, err: &RegistryError) -> Self {
        Self {
            name: name.into(),
            error: err.detail(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    cfg: Arc<RegistryConfig>,
}

impl RegistryStore {
    pub fn new(cfg: Arc<RegistryConfig>) -> Self {
        Self { cfg }
    }

    pub fn path(&self, ctx: &RegistryContext) -> PathBuf {
        ctx.registry_path(&self.cfg)
    }

    /// All records of the conversation. A missing file is an empty registry.
    pub async fn load(&self, ctx: &RegistryContext) -> Result<Vec<ViewRecord>> {
        let path = self.path(ctx);
        let bytes = match afs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RegistryError::CorruptRegistry {
                    path,
                    reason: format!("unreadable: {}", e),
                })
            }
        };
        match decode_registry(&bytes) {
            Ok(records) => Ok(records),
            Err(reason) => match self.cfg.corrupt_registry {
                CorruptRegistryPolicy::Fail => Err(RegistryError::CorruptRegistry { path, reason }),
                CorruptRegistryPolicy::Quarantine => {
                    let aside = quarantine_path(&path, Utc::now());
                    warn!(
                        target: "tabula::store",
                        path = %path.display(),
                        quarantined = %aside.display(),
                        %reason,
                        "registry is corrupt; moving it aside and starting empty"
                    );
                    afs::rename(&path, &aside).await?;
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Replace the stored set. Readers see either the old or the new file.
    pub async fn save(&self, ctx: &RegistryContext, records: &[ViewRecord]) -> Result<()> {
        check_unique(records)?;
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?;
        let path = self.path(ctx);
        save_bytes_atomic(&path, &bytes).await?;
        debug!(
            target: "tabula::store",
            path = %path.display(),
            count = records.len(),
            "registry saved"
        );
        Ok(())
    }

    /// Replace the record with the same `sourceId`, or append it.
    pub async fn upsert(&self, ctx: &RegistryContext, record: ViewRecord) -> Result<UpsertOutcome> {
        let mut records = self.load(ctx).await?;
        let outcome = match records
            .iter()
            .position(|r| r.source_id() == record.source_id())
        {
            Some(idx) => {
                records[idx] = record;
                UpsertOutcome::Replaced
            }
            None => {
                records.push(record);
                UpsertOutcome::Inserted
            }
        };
        self.save(ctx, &records).await?;
        Ok(outcome)
    }

    /// Delete records by view name; unknown names come back as failures.
    pub async fn remove(
        &self,
        ctx: &RegistryContext,
        view_names: &[String],
    ) -> Result<RemoveReport> {
        let mut records = self.load(ctx).await?;
        let mut report = RemoveReport::default();
        for name in view_names {
            match records.iter().position(|r| r.view_name() == name) {
                Some(idx) => {
                    records.remove(idx);
                    report.removed.push(name.clone());
                }
                None => report.failed.push(ItemFailure::new(
                    name.clone(),
                    &RegistryError::NotFound(format!("view {}", name)),
                )),
            }
        }
        if !report.removed.is_empty() {
            self.save(ctx, &records).await?;
        }
        Ok(report)
    }

    /// Advance `lastUsedAt` for the named views; returns the names touched.
    pub async fn touch(
        &self,
        ctx: &RegistryContext,
        view_names: &[String],
        at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if view_names.is_empty() {
            return Ok(Vec::new());
        }
        let mut records = self.load(ctx).await?;
        let mut touched = Vec::new();
        for record in records.iter_mut() {
            if view_names.iter().any(|n| n == record.view_name()) {
                record.touch(at);
                touched.push(record.view_name().to_string());
            }
        }
        if !touched.is_empty() {
            self.save(ctx, &records).await?;
        }
        Ok(touched)
    }
}

fn check_unique(records: &[ViewRecord]) -> Result<()> {
    let mut names = HashSet::new();
    let mut sources = HashSet::new();
    for r in records {
        if !names.insert(r.view_name()) {
            return Err(RegistryError::DuplicateName(r.view_name().to_string()));
        }
        if !sources.insert(r.source_id()) {
            return Err(RegistryError::DuplicateName(format!(
                "{} (source {} registered twice)",
                r.view_name(),
                r.source_id()
            )));
        }
    }
    Ok(())
}

fn quarantine_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", now.format("%Y%m%dT%H%M%S%3f")));
    path.with_file_name(name)
}

pub(crate) async fn save_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        afs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = afs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    match afs::rename(&tmp, path).await {
        Ok(_) => Ok(()),
        Err(_) => {
            let _ = afs::remove_file(path).await;
            let res = afs::rename(&tmp, path).await;
            if res.is_err() {
                let _ = afs::remove_file(&tmp).await;
            }
            res
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<StoredRecord>),
    Wrapped { views: Vec<StoredRecord> },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    view_name: String,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default, alias = "sharedLink")]
    source_ref: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_used_at: Option<DateTime<Utc>>,
}

/// Decode a registry file, accepting the historical shapes.
///
/// Current files are a bare array of records. Older files may wrap the array
/// in `{"views": [...]}`, name the reference `sharedLink`, and omit
/// `sourceId` or `lastUsedAt`. Fallback rules: a missing `sourceId` is
/// recomputed from the reference (the reference itself if it no longer
/// parses), a missing `lastUsedAt` equals `createdAt`. Whitespace-only input
/// is an empty registry.
pub fn decode_registry(bytes: &[u8]) -> Result<Vec<ViewRecord>, String> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    let file: RegistryFile = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let stored = match file {
        RegistryFile::List(list) => list,
        RegistryFile::Wrapped { views } => views,
    };
    let mut out = Vec::with_capacity(stored.len());
    for s in stored {
        if s.view_name.trim().is_empty() {
            return Err("record with empty viewName".to_string());
        }
        let source_ref = s.source_ref.unwrap_or_default();
        let source_id = match s.source_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None if !source_ref.is_empty() => {
                source::canonicalize(&source_ref).unwrap_or_else(|_| source_ref.clone())
            }
            None => return Err(format!("record {} has neither sourceId nor link", s.view_name)),
        };
        let last_used = s.last_used_at.unwrap_or(s.created_at);
        out.push(ViewRecord::restore(
            s.view_name,
            source_id,
            source_ref,
            s.created_at,
            last_used,
        ));
    }
    check_unique(&out).map_err(|e| e.to_string())?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(policy: CorruptRegistryPolicy) -> RegistryStore {
        RegistryStore::new(Arc::new(RegistryConfig {
            corrupt_registry: policy,
            ..RegistryConfig::default()
        }))
    }

    fn rec(name: &str, source: &str) -> ViewRecord {
        ViewRecord::new(name, source, source, Utc::now())
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path().join("conv"));
        let s = store(CorruptRegistryPolicy::Fail);
        assert!(s.load(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_source_id() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let s = store(CorruptRegistryPolicy::Fail);
        assert_eq!(
            s.upsert(&ctx, rec("a_000001", "csv:/a.csv")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        s.upsert(&ctx, rec("b_000002", "csv:/b.csv")).await.unwrap();
        assert_eq!(
            s.upsert(&ctx, rec("a_000001", "csv:/a.csv")).await.unwrap(),
            UpsertOutcome::Replaced
        );
        let names: Vec<_> = s
            .load(&ctx)
            .await
            .unwrap()
            .iter()
            .map(|r| r.view_name().to_string())
            .collect();
        assert_eq!(names, vec!["a_000001", "b_000002"]);
    }

    #[tokio::test]
    async fn upsert_rejects_name_taken_by_other_source() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let s = store(CorruptRegistryPolicy::Fail);
        s.upsert(&ctx, rec("a_000001", "csv:/a.csv")).await.unwrap();
        let err = s
            .upsert(&ctx, rec("a_000001", "csv:/other.csv"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "duplicate_name");
        assert_eq!(s.load(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_reports_unknown_names() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let s = store(CorruptRegistryPolicy::Fail);
        s.upsert(&ctx, rec("a_000001", "csv:/a.csv")).await.unwrap();
        let report = s
            .remove(&ctx, &["a_000001".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(report.removed, vec!["a_000001"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "ghost");
        assert_eq!(report.failed[0].error.kind, "not_found");
        assert!(s.load(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_fails_or_quarantines() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let path = ctx.registry_path(&RegistryConfig::default());
        std::fs::write(&path, b"{ not json").unwrap();

        let err = store(CorruptRegistryPolicy::Fail).load(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), "corrupt_registry");
        assert!(path.exists());

        let records = store(CorruptRegistryPolicy::Quarantine)
            .load(&ctx)
            .await
            .unwrap();
        assert!(records.is_empty());
        assert!(!path.exists());
        let moved = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("views.json.corrupt-"));
        assert!(moved);
    }

    #[test]
    fn decodes_legacy_shapes() {
        let legacy = br#"{"views":[{"viewName":"sheet_abc123","sharedLink":"https://docs.google.com/spreadsheets/d/XYZ/edit?usp=sharing","createdAt":"2025-01-02T03:04:05.000Z"}]}"#;
        let records = decode_registry(legacy).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_id(), "gsheet:XYZ#gid=0");
        assert_eq!(records[0].last_used_at(), records[0].created_at());
        assert!(records[0].source_ref().starts_with("https://docs.google.com"));

        assert!(decode_registry(b"  \n").unwrap().is_empty());
        let dupes = br#"[{"viewName":"a","sourceId":"x","sourceRef":"x","createdAt":"2025-01-02T03:04:05Z"},{"viewName":"a","sourceId":"y","sourceRef":"y","createdAt":"2025-01-02T03:04:05Z"}]"#;
        assert!(decode_registry(dupes).is_err());
    }

    #[tokio::test]
    async fn touch_advances_only_named_views() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let s = store(CorruptRegistryPolicy::Fail);
        s.upsert(&ctx, rec("a_000001", "csv:/a.csv")).await.unwrap();
        s.upsert(&ctx, rec("b_000002", "csv:/b.csv")).await.unwrap();
        let before = s.load(&ctx).await.unwrap();
        let touched = s
            .touch(&ctx, &["b_000002".to_string()], Utc::now())
            .await
            .unwrap();
        assert_eq!(touched, vec!["b_000002"]);
        let after = s.load(&ctx).await.unwrap();
        assert_eq!(after[0].last_used_at(), before[0].last_used_at());
        assert!(after[1].last_used_at() > before[1].last_used_at());
    }
}
