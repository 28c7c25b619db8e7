//! Materialization of a source under an allocated view name.
//!
//! The registry only needs to know that an engine object by that name exists
//! afterwards. Fetching remote sources is not done here; a source no importer
//! accepts fails the registration without touching the engine.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::allocator::sanitize_identifier;
use crate::engine::{self, quote_ident, Binding};
use crate::error::{RegistryError, Result};
use crate::introspect::{ColumnInfo, SchemaIntrospector};
use crate::source::{SourceKind, SourceRef};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub importer: &'static str,
    pub view_name: String,
    pub columns: Vec<ColumnInfo>,
    /// Rows copied into the engine; `None` when the data stays in an
    /// attached file.
    pub rows: Option<u64>,
}

pub trait SourceImporter: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, source: &SourceRef) -> bool;

    /// Create an engine object called `view_name` holding the source's rows.
    /// On error nothing named `view_name` may be left behind.
    fn materialize(
        &self,
        conn: &mut Connection,
        view_name: &str,
        source: &SourceRef,
    ) -> Result<ImportSummary>;
}

pub fn default_importers() -> Vec<Arc<dyn SourceImporter>> {
    vec![
        Arc::new(DelimitedFileImporter::default()),
        Arc::new(SqliteAttachImporter),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Integer,
    Double,
    Varchar,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar => "VARCHAR",
        }
    }

    fn widen(self, cell: &str) -> Self {
        match self {
            ColumnType::Integer if cell.parse::<i64>().is_ok() => ColumnType::Integer,
            ColumnType::Integer | ColumnType::Double if parses_float(cell) => ColumnType::Double,
            _ => ColumnType::Varchar,
        }
    }

    fn value(self, cell: &str) -> Value {
        let cell = cell.trim();
        if cell.is_empty() {
            return Value::Null;
        }
        match self {
            ColumnType::Integer => cell
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(cell.to_string())),
            ColumnType::Double => cell
                .parse::<f64>()
                .map(Value::Real)
                .unwrap_or_else(|_| Value::Text(cell.to_string())),
            ColumnType::Varchar => Value::Text(cell.to_string()),
        }
    }
}

fn parses_float(cell: &str) -> bool {
    cell.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// Loads CSV/TSV files into a table named after the view.
#[derive(Debug, Clone, Default)]
pub struct DelimitedFileImporter {
    /// Maximum number of data rows copied; `None` copies everything.
    pub max_rows: Option<usize>,
}

impl DelimitedFileImporter {
    fn read(&self, path: &Path, delimiter: u8) -> Result<(Vec<String>, Vec<csv::StringRecord>)> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_path(path)
            .map_err(|e| RegistryError::Import(format!("open {}: {}", path.display(), e)))?;
        let headers = reader
            .headers()
            .map_err(|e| RegistryError::Import(format!("read {}: {}", path.display(), e)))?
            .clone();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(RegistryError::Import(format!(
                "{}: missing header row",
                path.display()
            )));
        }
        let mut rows = Vec::new();
        for record in reader.records() {
            if self.max_rows.is_some_and(|max| rows.len() >= max) {
                break;
            }
            let record = record
                .map_err(|e| RegistryError::Import(format!("read {}: {}", path.display(), e)))?;
            rows.push(record);
        }
        Ok((column_names(headers.iter()), rows))
    }
}

/// Header cells as unique identifiers; blanks become `column_<n>`.
fn column_names<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, raw) in headers.enumerate() {
        let base = if raw.trim().is_empty() {
            format!("column_{}", idx + 1)
        } else {
            sanitize_identifier(raw)
        };
        let mut name = base.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{base}_{n}");
            n += 1;
        }
        out.push(name);
    }
    out
}

fn infer_types(width: usize, rows: &[csv::StringRecord]) -> Vec<ColumnType> {
    (0..width)
        .map(|col| {
            let mut ty = ColumnType::Integer;
            let mut any = false;
            for cell in rows.iter().filter_map(|r| r.get(col)).map(str::trim) {
                if cell.is_empty() {
                    continue;
                }
                any = true;
                ty = ty.widen(cell);
                if ty == ColumnType::Varchar {
                    break;
                }
            }
            if any {
                ty
            } else {
                ColumnType::Varchar
            }
        })
        .collect()
}

impl SourceImporter for DelimitedFileImporter {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn accepts(&self, source: &SourceRef) -> bool {
        matches!(source.kind(), SourceKind::DelimitedFile { .. })
    }

    fn materialize(
        &self,
        conn: &mut Connection,
        view_name: &str,
        source: &SourceRef,
    ) -> Result<ImportSummary> {
        let SourceKind::DelimitedFile { path, delimiter } = source.kind() else {
            return Err(RegistryError::Import(format!(
                "{}: not a delimited file",
                source.raw()
            )));
        };
        let (names, rows) = self.read(path, *delimiter)?;
        let types = infer_types(names.len(), &rows);
        let ddl = names
            .iter()
            .zip(&types)
            .map(|(n, t)| format!("{} {}", quote_ident(n), t.sql()))
            .collect::<Vec<_>>()
            .join(", ");
        let table = quote_ident(view_name);
        let placeholders = vec!["?"; names.len()].join(", ");

        let tx = conn.transaction().map_err(RegistryError::query)?;
        tx.execute_batch(&format!("CREATE TABLE main.{table} ({ddl})"))
            .map_err(|e| RegistryError::import(format!("create {view_name}"), e))?;
        {
            let mut insert = tx
                .prepare(&format!("INSERT INTO main.{table} VALUES ({placeholders})"))
                .map_err(RegistryError::query)?;
            for row in &rows {
                let values = types
                    .iter()
                    .enumerate()
                    .map(|(idx, ty)| row.get(idx).map(|c| ty.value(c)).unwrap_or(Value::Null));
                insert
                    .execute(params_from_iter(values))
                    .map_err(|e| RegistryError::import(format!("insert into {view_name}"), e))?;
            }
        }
        tx.commit().map_err(RegistryError::query)?;

        info!(
            target: "tabula::import",
            view = %view_name,
            path = %path.display(),
            rows = rows.len(),
            columns = names.len(),
            "delimited file imported"
        );
        Ok(ImportSummary {
            importer: self.name(),
            view_name: view_name.to_string(),
            columns: names
                .into_iter()
                .zip(types)
                .map(|(n, t)| ColumnInfo::new(n, t.sql()))
                .collect(),
            rows: Some(rows.len() as u64),
        })
    }
}

/// Exposes a table of another SQLite file through an attachment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAttachImporter;

fn alias_for(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("ext_{}", &hex::encode(digest)[..6])
}

impl SourceImporter for SqliteAttachImporter {
    fn name(&self) -> &'static str {
        "sqlite_attach"
    }

    fn accepts(&self, source: &SourceRef) -> bool {
        matches!(source.kind(), SourceKind::SqliteTable { .. })
    }

    fn materialize(
        &self,
        conn: &mut Connection,
        view_name: &str,
        source: &SourceRef,
    ) -> Result<ImportSummary> {
        let SourceKind::SqliteTable { path, table } = source.kind() else {
            return Err(RegistryError::Import(format!(
                "{}: not a sqlite table reference",
                source.raw()
            )));
        };
        if !path.is_file() {
            return Err(RegistryError::Import(format!(
                "{}: no such database file",
                path.display()
            )));
        }
        let alias = match engine::alias_for_path(conn, path)? {
            Some(alias) => alias,
            None => alias_for(path),
        };
        engine::attach(conn, &alias, path)?;
        let object: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT name FROM {}.sqlite_master \
                     WHERE type IN ('table','view') AND name = ?1 COLLATE NOCASE",
                    quote_ident(&alias)
                ),
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(RegistryError::query)?;
        let Some(object) = object else {
            return Err(RegistryError::Import(format!(
                "{}: no table {}",
                path.display(),
                table
            )));
        };
        let binding = Binding {
            view_name: view_name.to_string(),
            alias: alias.clone(),
            object,
        };
        engine::bind(conn, &alias, path, &binding)?;
        let columns = SchemaIntrospector::describe(conn, Some(view_name))?
            .tables
            .into_iter()
            .next()
            .map(|t| t.columns)
            .unwrap_or_default();
        info!(
            target: "tabula::import",
            view = %view_name,
            %alias,
            path = %path.display(),
            table = %binding.object,
            "sqlite table attached"
        );
        Ok(ImportSummary {
            importer: self.name(),
            view_name: view_name.to_string(),
            columns,
            rows: None,
        })
    }
}
