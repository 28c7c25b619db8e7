//! Per-conversation view registry over an embedded SQLite engine: source
//! deduplication, stable view names, live schema introspection and queries
//! with usage tracking.
//!
//! [`ViewCatalog`] is the entry point; [`tools::run_tool`] exposes it as JSON
//! tools.

pub mod allocator;
pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod import;
pub mod introspect;
pub mod locks;
pub mod query;
pub mod record;
pub mod source;
pub mod store;
pub mod tools;
pub mod usage;

pub use allocator::{Allocation, ViewNameAllocator};
pub use catalog::{DeleteReport, RegisterReport, Registration, ViewCatalog};
pub use config::{CorruptRegistryPolicy, RegistryConfig, UsageMatcherKind};
pub use context::{RegistryContext, Workspace};
pub use engine::ConnectionManager;
pub use error::{ErrorDetail, RegistryError, Result};
pub use import::{
    DelimitedFileImporter, ImportSummary, SourceImporter, SqliteAttachImporter,
};
pub use introspect::{CatalogSnapshot, ColumnInfo, SchemaIntrospector, TableSchema};
pub use query::{QueryExecutor, QueryResult};
pub use record::{ViewRecord, ViewSummary};
pub use source::{canonicalize, SourceKind, SourceRef};
pub use store::{ItemFailure, RegistryStore};
pub use tools::{run_tool, ToolError};
pub use usage::{IdentifierScan, NaiveLexicalScan, UsageMatcher};
