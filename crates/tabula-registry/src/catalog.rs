//! The service the tool layer talks to: registration, listing, schema,
//! queries, rename and delete for one conversation at a time.
//!
//! Every operation that changes the engine or the registry holds the
//! conversation's write lock for the whole engine + registry critical
//! section. Schema reads and queries hold the shared side.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::allocator::{is_valid_view_name, ViewNameAllocator};
use crate::config::RegistryConfig;
use crate::context::RegistryContext;
use crate::engine::{self, ConnectionManager};
use crate::error::{RegistryError, Result};
use crate::import::{default_importers, ImportSummary, SourceImporter};
use crate::introspect::{CatalogSnapshot, SchemaIntrospector};
use crate::locks::ConversationLocks;
use crate::query::{QueryExecutor, QueryResult};
use crate::record::{ViewRecord, ViewSummary};
use crate::source::SourceRef;
use crate::store::{ItemFailure, RegistryStore};
use crate::usage::{matcher_for, UsageMatcher};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub view_name: String,
    pub is_new: bool,
    pub record: ViewRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterReport {
    pub registered: Vec<Registration>,
    pub failed: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

#[derive(Clone)]
pub struct ViewCatalog {
    cfg: Arc<RegistryConfig>,
    store: RegistryStore,
    conns: ConnectionManager,
    locks: Arc<ConversationLocks>,
    allocator: ViewNameAllocator,
    importers: Arc<Vec<Arc<dyn SourceImporter>>>,
    matcher: Arc<dyn UsageMatcher>,
}

impl ViewCatalog {
    pub fn new(cfg: RegistryConfig) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        Ok(Self {
            store: RegistryStore::new(cfg.clone()),
            conns: ConnectionManager::new(cfg.clone()),
            locks: Arc::new(ConversationLocks::new(cfg.cross_process_lock)),
            allocator: ViewNameAllocator::new(cfg.max_name_attempts),
            importers: Arc::new(default_importers()),
            matcher: Arc::from(matcher_for(cfg.usage_matcher)),
            cfg,
        })
    }

    /// Replace the importer chain. The first importer accepting a source wins.
    pub fn with_importers(mut self, importers: Vec<Arc<dyn SourceImporter>>) -> Self {
        self.importers = Arc::new(importers);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.cfg
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub async fn test_connection(&self, ctx: &RegistryContext) -> bool {
        self.conns.probe(ctx).await
    }

    pub async fn register_source(&self, ctx: &RegistryContext, raw: &str) -> Result<Registration> {
        let source = SourceRef::parse(raw)?;
        let _guard = self.locks.write(ctx).await?;
        self.register_locked(ctx, &source).await
    }

    /// Register several sources; each item succeeds or fails on its own.
    pub async fn register_sources(
        &self,
        ctx: &RegistryContext,
        raws: &[String],
    ) -> Result<RegisterReport> {
        let _guard = self.locks.write(ctx).await?;
        let mut report = RegisterReport::default();
        for raw in raws {
            let outcome = match SourceRef::parse(raw) {
                Ok(source) => self.register_locked(ctx, &source).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(reg) => report.registered.push(reg),
                Err(err) => {
                    debug!(
                        target: "tabula::catalog",
                        source = %raw,
                        error = %err,
                        "registration failed"
                    );
                    report.failed.push(ItemFailure::new(raw.clone(), &err));
                }
            }
        }
        Ok(report)
    }

    async fn register_locked(
        &self,
        ctx: &RegistryContext,
        source: &SourceRef,
    ) -> Result<Registration> {
        let records = self.store.load(ctx).await?;
        let source_id = source.source_id();
        if let Some(existing) = records.iter().find(|r| r.source_id() == source_id) {
            debug!(
                target: "tabula::catalog",
                view = %existing.view_name(),
                %source_id,
                "source already registered"
            );
            return Ok(Registration {
                view_name: existing.view_name().to_string(),
                is_new: false,
                record: existing.clone(),
                import: None,
            });
        }
        let importer = self
            .importers
            .iter()
            .find(|imp| imp.accepts(source))
            .cloned()
            .ok_or_else(|| {
                RegistryError::Import(format!("no importer can load {}", source.raw()))
            })?;

        let allocator = self.allocator.clone();
        let src = source.clone();
        let now = Utc::now();
        let (allocation, summary) = self
            .conns
            .with_connection(ctx, move |conn| {
                let engine_names = engine::local_object_names(conn)?;
                let allocation = allocator.allocate(&records, &src, now, &engine_names)?;
                let summary = importer.materialize(conn, allocation.record.view_name(), &src)?;
                Ok((allocation, summary))
            })
            .await?;

        let record = allocation.record;
        if let Err(err) = self.store.upsert(ctx, record.clone()).await {
            warn!(
                target: "tabula::catalog",
                conversation = %ctx.conversation_dir().display(),
                view = %record.view_name(),
                error = %err,
                "registry update failed; dropping the imported object"
            );
            let name = record.view_name().to_string();
            if let Err(drop_err) = self
                .conns
                .with_connection(ctx, move |conn| engine::drop_object(conn, &name))
                .await
            {
                warn!(
                    target: "tabula::catalog",
                    view = %record.view_name(),
                    error = %drop_err,
                    "could not drop imported object; engine and registry disagree"
                );
            }
            return Err(err);
        }
        info!(
            target: "tabula::catalog",
            conversation = %ctx.conversation_dir().display(),
            view = %record.view_name(),
            source_id = %record.source_id(),
            importer = summary.importer,
            "view registered"
        );
        Ok(Registration {
            view_name: record.view_name().to_string(),
            is_new: true,
            record,
            import: Some(summary),
        })
    }

    /// Registered views in creation order.
    pub async fn list_views(&self, ctx: &RegistryContext) -> Result<Vec<ViewSummary>> {
        let _guard = self.locks.read(ctx).await?;
        let mut records = self.store.load(ctx).await?;
        records.sort_by_key(|r| r.created_at());
        Ok(records.iter().map(ViewSummary::from).collect())
    }

    pub async fn describe(
        &self,
        ctx: &RegistryContext,
        view_name: Option<&str>,
    ) -> Result<CatalogSnapshot> {
        let _guard = self.locks.read(ctx).await?;
        let name = view_name.map(str::to_string);
        self.conns
            .with_connection(ctx, move |conn| {
                SchemaIntrospector::describe(conn, name.as_deref())
            })
            .await
    }

    /// Run read-only SQL, then advance `lastUsedAt` of the views it mentions.
    ///
    /// A failed usage update is logged and does not fail the query.
    pub async fn run_query(&self, ctx: &RegistryContext, sql: &str) -> Result<QueryResult> {
        let result = {
            let _guard = self.locks.read(ctx).await?;
            let text = sql.to_string();
            self.conns
                .with_connection(ctx, move |conn| QueryExecutor::run(conn, &text))
                .await?
        };
        if let Err(err) = self.record_usage(ctx, sql).await {
            warn!(
                target: "tabula::catalog",
                conversation = %ctx.conversation_dir().display(),
                error = %err,
                "usage update failed"
            );
        }
        Ok(result)
    }

    async fn record_usage(&self, ctx: &RegistryContext, sql: &str) -> Result<()> {
        let _guard = self.locks.write(ctx).await?;
        let names: Vec<String> = self
            .store
            .load(ctx)
            .await?
            .iter()
            .map(|r| r.view_name().to_string())
            .collect();
        let referenced = self.matcher.referenced(sql, &names);
        if referenced.is_empty() {
            return Ok(());
        }
        let touched = self.store.touch(ctx, &referenced, Utc::now()).await?;
        debug!(
            target: "tabula::catalog",
            matcher = self.matcher.name(),
            views = ?touched,
            "usage recorded"
        );
        Ok(())
    }

    pub async fn rename_view(
        &self,
        ctx: &RegistryContext,
        old: &str,
        new: &str,
    ) -> Result<ViewRecord> {
        if !is_valid_view_name(new) {
            return Err(RegistryError::InvalidName(format!(
                "{new}: use lowercase letters, digits and underscores"
            )));
        }
        let _guard = self.locks.write(ctx).await?;
        let mut records = self.store.load(ctx).await?;
        let idx = records
            .iter()
            .position(|r| r.view_name() == old)
            .ok_or_else(|| RegistryError::NotFound(format!("view {old}")))?;
        if old == new {
            return Ok(records[idx].clone());
        }
        let taken = records
            .iter()
            .enumerate()
            .any(|(i, r)| i != idx && r.view_name().eq_ignore_ascii_case(new));
        if taken {
            return Err(RegistryError::DuplicateName(new.to_string()));
        }

        let (from, to) = (old.to_string(), new.to_string());
        self.conns
            .with_connection(ctx, move |conn| engine::rename_object(conn, &from, &to))
            .await?;

        records[idx] = records[idx].renamed(new);
        if let Err(err) = self.store.save(ctx, &records).await {
            let (from, to) = (new.to_string(), old.to_string());
            if let Err(undo) = self
                .conns
                .with_connection(ctx, move |conn| engine::rename_object(conn, &from, &to))
                .await
            {
                warn!(
                    target: "tabula::catalog",
                    view = %new,
                    error = %undo,
                    "could not undo engine rename; engine and registry disagree"
                );
            }
            return Err(err);
        }
        info!(
            target: "tabula::catalog",
            conversation = %ctx.conversation_dir().display(),
            from = %old,
            to = %new,
            "view renamed"
        );
        Ok(records[idx].clone())
    }

    /// Drop each named view from the engine and the registry. Unknown names
    /// and engine failures are reported per item.
    pub async fn delete_views(
        &self,
        ctx: &RegistryContext,
        names: &[String],
    ) -> Result<DeleteReport> {
        let _guard = self.locks.write(ctx).await?;
        let records = self.store.load(ctx).await?;
        let mut report = DeleteReport::default();
        let mut seen = HashSet::new();
        let mut known = Vec::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if records.iter().any(|r| r.view_name() == name) {
                known.push(name.clone());
            } else {
                report.failed.push(ItemFailure::new(
                    name.clone(),
                    &RegistryError::NotFound(format!("view {name}")),
                ));
            }
        }
        if known.is_empty() {
            return Ok(report);
        }

        let targets = known.clone();
        let outcomes = self
            .conns
            .with_connection(ctx, move |conn| {
                Ok(targets
                    .into_iter()
                    .map(|name| {
                        let outcome = engine::drop_object(conn, &name);
                        (name, outcome)
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let mut dropped = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(true) => dropped.push(name),
                Ok(false) => {
                    warn!(
                        target: "tabula::catalog",
                        conversation = %ctx.conversation_dir().display(),
                        view = %name,
                        "engine object already gone; removing registry entry"
                    );
                    dropped.push(name);
                }
                Err(err) => report.failed.push(ItemFailure::new(name, &err)),
            }
        }
        let removed = self.store.remove(ctx, &dropped).await?;
        report.failed.extend(removed.failed);
        report.deleted = removed.removed;
        // Keep the caller's order for failures.
        report
            .failed
            .sort_by_key(|f| names.iter().position(|n| *n == f.name).unwrap_or(usize::MAX));
        info!(
            target: "tabula::catalog",
            conversation = %ctx.conversation_dir().display(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "views deleted"
        );
        Ok(report)
    }
}
