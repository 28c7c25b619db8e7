//! Live catalog reads: which user objects exist and what their columns are.
//! Nothing here is cached; every call reflects the engine at call time.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;

use crate::engine::{
    attached_schemas, is_user_object, load_bindings, quote_ident, ObjectKind, BINDINGS_TABLE,
};
use crate::error::{RegistryError, Result};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub column_name: String,
    pub column_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            column_type: ty.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub tables: Vec<TableSchema>,
}

impl CatalogSnapshot {
    pub fn get(&self, table_name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.table_name == table_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.table_name.as_str())
    }
}

/// A user-visible table or view, located by schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogObject {
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
}

impl CatalogObject {
    /// Name callers use to refer to the object: bare for `main`/`temp`,
    /// `schema.name` inside attached databases.
    pub fn logical_name(&self) -> String {
        match self.schema.as_str() {
            "main" | "temp" => self.name.clone(),
            schema => format!("{}.{}", schema, self.name),
        }
    }
}

pub struct SchemaIntrospector;

impl SchemaIntrospector {
    /// Describe one object, or every user-visible object when `name` is None.
    pub fn describe(conn: &Connection, name: Option<&str>) -> Result<CatalogSnapshot> {
        match name.map(str::trim) {
            Some(n) if !n.is_empty() => {
                let (schema, object) = resolve(conn, n)?;
                let columns = table_columns(conn, &schema, &object)?;
                if columns.is_empty() {
                    return Err(RegistryError::NotFound(format!("table or view {n}")));
                }
                Ok(CatalogSnapshot {
                    tables: vec![TableSchema {
                        table_name: n.to_string(),
                        columns,
                    }],
                })
            }
            _ => {
                let mut tables = Vec::new();
                for obj in Self::list_objects(conn)? {
                    let columns = table_columns(conn, &obj.schema, &obj.name)?;
                    tables.push(TableSchema {
                        table_name: obj.logical_name(),
                        columns,
                    });
                }
                Ok(CatalogSnapshot { tables })
            }
        }
    }

    /// Every user table/view: `main`, then `temp`, then attached databases in
    /// attach order; alphabetical within a schema.
    ///
    /// An attached table that a registered view already exposes is left out;
    /// it stays reachable through its qualified name.
    pub fn list_objects(conn: &Connection) -> Result<Vec<CatalogObject>> {
        let attached = attached_schemas(conn).map_err(RegistryError::query)?;
        let bound = if attached.is_empty() {
            HashSet::new()
        } else {
            bound_objects(conn)?
        };
        let mut out = objects_in(conn, "main")?;
        out.extend(objects_in(conn, "temp")?);
        for schema in attached {
            out.extend(objects_in(conn, &schema)?.into_iter().filter(|o| {
                !bound.contains(&(o.schema.to_ascii_lowercase(), o.name.to_ascii_lowercase()))
            }));
        }
        Ok(out)
    }
}

/// `(alias, object)` pairs behind registered views, lower-cased.
fn bound_objects(conn: &Connection) -> Result<HashSet<(String, String)>> {
    let has_bindings: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM main.sqlite_master WHERE type = 'table' AND name = ?1)",
            [BINDINGS_TABLE],
            |row| row.get(0),
        )
        .map_err(RegistryError::query)?;
    if !has_bindings {
        return Ok(HashSet::new());
    }
    Ok(load_bindings(conn)
        .map_err(RegistryError::query)?
        .into_iter()
        .map(|b| (b.alias.to_ascii_lowercase(), b.object.to_ascii_lowercase()))
        .collect())
}

fn objects_in(conn: &Connection, schema: &str) -> Result<Vec<CatalogObject>> {
    let sql = format!(
        "SELECT name, type FROM {}.sqlite_master WHERE type IN ('table','view') ORDER BY name",
        quote_ident(schema)
    );
    let mut stmt = conn.prepare(&sql).map_err(RegistryError::query)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(RegistryError::query)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(RegistryError::query)?;
    Ok(rows
        .into_iter()
        .filter(|(name, _)| is_user_object(name))
        .map(|(name, ty)| CatalogObject {
            schema: schema.to_string(),
            kind: if ty == "view" {
                ObjectKind::View
            } else {
                ObjectKind::Table
            },
            name,
        })
        .collect())
}

fn table_columns(conn: &Connection, schema: &str, name: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare("SELECT name, type FROM pragma_table_info(?1, ?2) ORDER BY cid")
        .map_err(RegistryError::query)?;
    let columns = stmt
        .query_map([name, schema], |row| {
            Ok(ColumnInfo {
                column_name: row.get(0)?,
                column_type: row.get(1)?,
            })
        })
        .map_err(RegistryError::query)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(RegistryError::query)?;
    Ok(columns)
}

fn unquote(part: &str) -> String {
    let p = part.trim();
    if p.len() >= 2 && p.starts_with('"') && p.ends_with('"') {
        p[1..p.len() - 1].replace("\"\"", "\"")
    } else {
        p.to_string()
    }
}

/// Map a caller-supplied name onto `(schema, object)`.
///
/// `schema.object` is honoured when `schema` is attached (or `main`/`temp`);
/// otherwise the whole string is an object name looked up in `temp` then
/// `main`, the order SQLite itself resolves unqualified names in.
fn resolve(conn: &Connection, name: &str) -> Result<(String, String)> {
    let not_found = || RegistryError::NotFound(format!("table or view {name}"));
    let mut schemas = vec!["main".to_string(), "temp".to_string()];
    schemas.extend(attached_schemas(conn).map_err(RegistryError::query)?);

    if let Some((head, tail)) = split_qualified(name) {
        let head = unquote(head);
        if let Some(schema) = schemas.iter().find(|s| s.eq_ignore_ascii_case(&head)) {
            let object = unquote(tail);
            if !is_user_object(&object) {
                return Err(not_found());
            }
            return Ok((schema.clone(), object));
        }
    }
    let object = unquote(name);
    if !is_user_object(&object) {
        return Err(not_found());
    }
    for schema in ["temp", "main"] {
        if objects_in(conn, schema)?
            .iter()
            .any(|o| o.name.eq_ignore_ascii_case(&object))
        {
            return Ok((schema.to_string(), object));
        }
    }
    Err(not_found())
}

/// Split at the first `.` outside double quotes.
fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (idx, ch) in name.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => return Some((&name[..idx], &name[idx + 1..])),
            _ => {}
        }
    }
    None
}
