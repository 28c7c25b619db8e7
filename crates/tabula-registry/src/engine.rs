//! Scoped access to a conversation's SQLite file.
//!
//! Every call opens its own connection, replays the persisted attachments and
//! closes the connection on every exit path. Views over attached databases
//! only live in a connection's `temp` schema, so the bindings that define
//! them are stored in the main file and recreated on open.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::context::RegistryContext;
use crate::error::{join_error, RegistryError, Result};

pub const INTERNAL_PREFIX: &str = "__tabula_";
pub const ATTACHMENTS_TABLE: &str = "__tabula_attachments";
pub const BINDINGS_TABLE: &str = "__tabula_bindings";

static RE_VIEW_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*CREATE\s+(?:(?:TEMP|TEMPORARY)\s+)?VIEW\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:"(?:[^"]|"")*"|\[[^\]]*\]|`(?:[^`]|``)*`|[^\s(]+)\s*(\([^)]*\))?\s*AS\s+(.*)$"#,
    )
    .expect("view definition regex")
});

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
}

impl ObjectKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(ObjectKind::Table),
            "view" => Some(ObjectKind::View),
            _ => None,
        }
    }
}

/// A view over a table of an attached database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub view_name: String,
    pub alias: String,
    pub object: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    cfg: Arc<RegistryConfig>,
}

impl ConnectionManager {
    pub fn new(cfg: Arc<RegistryConfig>) -> Self {
        Self { cfg }
    }

    fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.busy_timeout_ms)
    }

    /// Open the conversation database, creating it on first use.
    pub fn open(&self, ctx: &RegistryContext) -> Result<Connection> {
        std::fs::create_dir_all(ctx.conversation_dir()).map_err(|e| {
            RegistryError::Connection(format!(
                "create {}: {}",
                ctx.conversation_dir().display(),
                e
            ))
        })?;
        let path = ctx.database_path(&self.cfg);
        let conn = Connection::open(&path).map_err(RegistryError::connection)?;
        conn.busy_timeout(self.busy_timeout())
            .map_err(RegistryError::connection)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(RegistryError::connection)?;
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        ensure_metadata(&conn).map_err(RegistryError::connection)?;
        replay_bindings(&conn)?;
        Ok(conn)
    }

    /// Run `f` on a fresh connection on the blocking pool. The connection is
    /// closed when `f` returns, fails, or unwinds.
    pub async fn with_connection<T, F>(&self, ctx: &RegistryContext, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mgr = self.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = mgr.open(&ctx)?;
            let out = f(&mut conn);
            if let Err((_, err)) = conn.close() {
                warn!(
                    target: "tabula::engine",
                    conversation = %ctx.conversation_dir().display(),
                    error = %err,
                    "closing connection failed"
                );
            }
            out
        })
        .await
        .map_err(join_error)?
    }

    /// Whether the database exists and answers a trivial query. Never creates
    /// the file.
    pub async fn probe(&self, ctx: &RegistryContext) -> bool {
        let path = ctx.database_path(&self.cfg);
        let timeout = self.busy_timeout();
        tokio::task::spawn_blocking(move || probe_file(&path, timeout))
            .await
            .unwrap_or(false)
    }
}

fn probe_file(path: &Path, timeout: Duration) -> bool {
    if !path.is_file() {
        return false;
    }
    // Read-write without CREATE: never creates the file, and still works when
    // the WAL side files have been cleaned up.
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = match Connection::open_with_flags(path, flags) {
        Ok(c) => c,
        Err(err) => {
            debug!(
                target: "tabula::engine",
                path = %path.display(),
                error = %err,
                "probe open failed"
            );
            return false;
        }
    };
    let _ = conn.busy_timeout(timeout);
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|v| v == 1)
        .unwrap_or(false)
}

fn ensure_metadata(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {ATTACHMENTS_TABLE} (
          alias TEXT PRIMARY KEY,
          path TEXT NOT NULL UNIQUE,
          created TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {BINDINGS_TABLE} (
          view_name TEXT PRIMARY KEY COLLATE NOCASE,
          alias TEXT NOT NULL,
          object TEXT NOT NULL,
          created TEXT NOT NULL
        );
        "#
    ))
}

/// Schemas currently attached to `conn`, excluding `main` and `temp`.
pub fn attached_schemas(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_database_list ORDER BY seq")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names
        .into_iter()
        .filter(|n| n != "main" && n != "temp")
        .collect())
}

/// Attach `path` read-only under `alias` unless it already is attached.
pub fn attach(conn: &Connection, alias: &str, path: &Path) -> Result<()> {
    if attached_schemas(conn)
        .map_err(RegistryError::query)?
        .iter()
        .any(|s| s.eq_ignore_ascii_case(alias))
    {
        return Ok(());
    }
    let uri = url::Url::from_file_path(path)
        .map_err(|_| RegistryError::Import(format!("{} is not an absolute path", path.display())))?;
    let uri = format!("{}?mode=ro", uri);
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {}", quote_ident(alias)),
        params![uri],
    )
    .map_err(|e| match e.sqlite_error_code() {
        // CannotOpen here is the source file, not the conversation database.
        Some(rusqlite::ErrorCode::CannotOpen) => {
            RegistryError::Import(format!("attach {}: {}", path.display(), e))
        }
        _ => RegistryError::import(format!("attach {}", path.display()), e),
    })?;
    Ok(())
}

fn create_binding_view(conn: &Connection, binding: &Binding) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TEMP VIEW IF NOT EXISTS {} AS SELECT * FROM {}.{}",
        quote_ident(&binding.view_name),
        quote_ident(&binding.alias),
        quote_ident(&binding.object)
    ))
}

fn load_attachments(conn: &Connection) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT alias, path FROM {ATTACHMENTS_TABLE} ORDER BY created, alias"
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect();
    rows
}

pub fn load_bindings(conn: &Connection) -> rusqlite::Result<Vec<Binding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT view_name, alias, object FROM {BINDINGS_TABLE} ORDER BY view_name"
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Binding {
                view_name: row.get(0)?,
                alias: row.get(1)?,
                object: row.get(2)?,
            })
        })?
        .collect();
    rows
}

fn find_binding(conn: &Connection, view_name: &str) -> rusqlite::Result<Option<Binding>> {
    conn.query_row(
        &format!("SELECT view_name, alias, object FROM {BINDINGS_TABLE} WHERE view_name = ?1"),
        [view_name],
        |row| {
            Ok(Binding {
                view_name: row.get(0)?,
                alias: row.get(1)?,
                object: row.get(2)?,
            })
        },
    )
    .optional()
}

fn replay_bindings(conn: &Connection) -> Result<()> {
    let attachments = load_attachments(conn).map_err(RegistryError::connection)?;
    for (alias, path) in attachments {
        let p = Path::new(&path);
        if !p.is_file() {
            warn!(
                target: "tabula::engine",
                %alias,
                path = %path,
                "attached source is missing; skipping"
            );
            continue;
        }
        if let Err(err) = attach(conn, &alias, p) {
            warn!(target: "tabula::engine", %alias, error = %err, "re-attaching source failed");
        }
    }
    let attached: HashSet<String> = attached_schemas(conn)
        .map_err(RegistryError::connection)?
        .into_iter()
        .collect();
    for binding in load_bindings(conn).map_err(RegistryError::connection)? {
        if !attached.contains(&binding.alias) {
            continue;
        }
        if let Err(err) = create_binding_view(conn, &binding) {
            warn!(
                target: "tabula::engine",
                view = %binding.view_name,
                error = %err,
                "recreating attached view failed"
            );
        }
    }
    Ok(())
}

/// Persist a binding and expose it on `conn`. The alias must already be
/// attached.
pub fn bind(conn: &mut Connection, alias: &str, path: &Path, binding: &Binding) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let tx = conn.transaction().map_err(RegistryError::query)?;
    tx.execute(
        &format!(
            "INSERT OR IGNORE INTO {ATTACHMENTS_TABLE}(alias, path, created) \
             VALUES (?1, ?2, ?3)"
        ),
        params![alias, path.to_string_lossy(), now],
    )
    .map_err(RegistryError::query)?;
    tx.execute(
        &format!(
            "INSERT INTO {BINDINGS_TABLE}(view_name, alias, object, created) \
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![binding.view_name, binding.alias, binding.object, now],
    )
    .map_err(RegistryError::query)?;
    create_binding_view(&tx, binding).map_err(RegistryError::query)?;
    tx.commit().map_err(RegistryError::query)
}

/// Alias already recorded for `path`, if any.
pub fn alias_for_path(conn: &Connection, path: &Path) -> Result<Option<String>> {
    conn.query_row(
        &format!("SELECT alias FROM {ATTACHMENTS_TABLE} WHERE path = ?1"),
        [path.to_string_lossy()],
        |row| row.get(0),
    )
    .optional()
    .map_err(RegistryError::query)
}

pub fn main_object_kind(conn: &Connection, name: &str) -> Result<Option<ObjectKind>> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT type FROM main.sqlite_master \
             WHERE name = ?1 COLLATE NOCASE AND type IN ('table','view')",
            [name],
            |row| row.get(0),
        )
        .optional()
        .map_err(RegistryError::query)?;
    Ok(kind.as_deref().and_then(ObjectKind::parse))
}

/// Names of user objects reachable unqualified (main and temp schemas).
pub fn local_object_names(conn: &Connection) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for schema in ["main", "temp"] {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT name FROM {schema}.sqlite_master \
                 WHERE type IN ('table','view') ORDER BY name"
            ))
            .map_err(RegistryError::query)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(RegistryError::query)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(RegistryError::query)?;
        out.extend(names.into_iter().filter(|n| is_user_object(n)));
    }
    Ok(out)
}

pub fn is_user_object(name: &str) -> bool {
    !name.starts_with(INTERNAL_PREFIX) && !name.to_ascii_lowercase().starts_with("sqlite_")
}

/// Drop the engine object behind a view name. Returns false when nothing by
/// that name existed.
pub fn drop_object(conn: &mut Connection, name: &str) -> Result<bool> {
    let tx = conn.transaction().map_err(RegistryError::query)?;
    let dropped;
    let mut orphaned = Vec::new();
    if find_binding(&tx, name).map_err(RegistryError::query)?.is_some() {
        tx.execute(
            &format!("DELETE FROM {BINDINGS_TABLE} WHERE view_name = ?1"),
            [name],
        )
        .map_err(RegistryError::query)?;
        tx.execute_batch(&format!("DROP VIEW IF EXISTS temp.{}", quote_ident(name)))
            .map_err(RegistryError::query)?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT alias FROM {ATTACHMENTS_TABLE} \
                     WHERE alias NOT IN (SELECT alias FROM {BINDINGS_TABLE})"
                ))
                .map_err(RegistryError::query)?;
            orphaned = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(RegistryError::query)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(RegistryError::query)?;
        }
        tx.execute(
            &format!(
                "DELETE FROM {ATTACHMENTS_TABLE} \
                 WHERE alias NOT IN (SELECT alias FROM {BINDINGS_TABLE})"
            ),
            [],
        )
        .map_err(RegistryError::query)?;
        dropped = true;
    } else {
        dropped = match main_object_kind(&tx, name)? {
            Some(ObjectKind::Table) => {
                tx.execute_batch(&format!("DROP TABLE main.{}", quote_ident(name)))
                    .map_err(RegistryError::query)?;
                true
            }
            Some(ObjectKind::View) => {
                tx.execute_batch(&format!("DROP VIEW main.{}", quote_ident(name)))
                    .map_err(RegistryError::query)?;
                true
            }
            None => false,
        };
    }
    tx.commit().map_err(RegistryError::query)?;
    for alias in orphaned {
        let _ = conn.execute_batch(&format!("DETACH DATABASE {}", quote_ident(&alias)));
    }
    Ok(dropped)
}

/// Rename the engine object behind `old` to `new` in one transaction.
pub fn rename_object(conn: &mut Connection, old: &str, new: &str) -> Result<()> {
    let case_only = old.eq_ignore_ascii_case(new);
    if local_object_names(conn)?
        .iter()
        .any(|n| n.eq_ignore_ascii_case(new) && !(case_only && n.eq_ignore_ascii_case(old)))
    {
        return Err(RegistryError::DuplicateName(new.to_string()));
    }
    let tx = conn.transaction().map_err(RegistryError::query)?;
    if let Some(binding) = find_binding(&tx, old).map_err(RegistryError::query)? {
        tx.execute(
            &format!("UPDATE {BINDINGS_TABLE} SET view_name = ?1 WHERE view_name = ?2"),
            [new, old],
        )
        .map_err(RegistryError::query)?;
        tx.execute_batch(&format!("DROP VIEW IF EXISTS temp.{}", quote_ident(old)))
            .map_err(RegistryError::query)?;
        let renamed = Binding {
            view_name: new.to_string(),
            ..binding
        };
        create_binding_view(&tx, &renamed).map_err(RegistryError::query)?;
    } else {
        match main_object_kind(&tx, old)? {
            Some(ObjectKind::Table) => {
                // SQLite refuses a rename that only changes case.
                let mut from = old.to_string();
                if case_only {
                    let hop = format!("{INTERNAL_PREFIX}rename_{new}");
                    tx.execute_batch(&format!(
                        "ALTER TABLE main.{} RENAME TO {}",
                        quote_ident(old),
                        quote_ident(&hop)
                    ))
                    .map_err(RegistryError::query)?;
                    from = hop;
                }
                tx.execute_batch(&format!(
                    "ALTER TABLE main.{} RENAME TO {}",
                    quote_ident(&from),
                    quote_ident(new)
                ))
                .map_err(RegistryError::query)?;
            }
            Some(ObjectKind::View) => {
                let sql: String = tx
                    .query_row(
                        "SELECT sql FROM main.sqlite_master \
                         WHERE type = 'view' AND name = ?1 COLLATE NOCASE",
                        [old],
                        |row| row.get(0),
                    )
                    .map_err(RegistryError::query)?;
                let (columns, body) = split_view_definition(&sql).ok_or_else(|| {
                    RegistryError::Query(format!("cannot parse definition of view {old}"))
                })?;
                tx.execute_batch(&format!(
                    "DROP VIEW main.{old_q}; CREATE VIEW main.{new_q}{columns} AS {body}",
                    old_q = quote_ident(old),
                    new_q = quote_ident(new),
                ))
                .map_err(RegistryError::query)?;
            }
            None => return Err(RegistryError::NotFound(format!("engine object {old}"))),
        }
    }
    tx.commit().map_err(RegistryError::query)
}

/// Split a stored `CREATE VIEW` statement into its optional column list and
/// the select body.
pub fn split_view_definition(sql: &str) -> Option<(String, String)> {
    let caps = RE_VIEW_DEF.captures(sql)?;
    let columns = caps
        .get(1)
        .map(|m| format!(" {}", m.as_str()))
        .unwrap_or_default();
    let body = caps.get(2)?.as_str().trim().to_string();
    if body.is_empty() {
        return None;
    }
    Some((columns, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Arc::new(RegistryConfig::default()))
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("sales"), "\"sales\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn splits_view_definitions() {
        let (cols, body) =
            split_view_definition("CREATE VIEW \"a b\" AS SELECT 1 AS x").unwrap();
        assert_eq!(cols, "");
        assert_eq!(body, "SELECT 1 AS x");
        let (cols, body) = split_view_definition(
            "create view if not exists v(x, y)\n  as select a, b from t",
        )
        .unwrap();
        assert_eq!(cols, " (x, y)");
        assert_eq!(body, "select a, b from t");
        assert!(split_view_definition("CREATE TABLE t(a)").is_none());
    }

    #[tokio::test]
    async fn with_connection_creates_database_and_metadata() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path().join("conv"));
        let mgr = manager();
        assert!(!mgr.probe(&ctx).await);
        let names = mgr
            .with_connection(&ctx, |conn| {
                conn.execute_batch("CREATE TABLE people(id INTEGER)")
                    .map_err(RegistryError::query)?;
                local_object_names(conn)
            })
            .await
            .unwrap();
        assert_eq!(names, vec!["people"]);
        assert!(mgr.probe(&ctx).await);
    }

    #[tokio::test]
    async fn errors_inside_the_scope_propagate() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let err = manager()
            .with_connection(&ctx, |conn| {
                conn.execute_batch("SELEC nonsense").map_err(RegistryError::query)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query_error");
    }

    #[test]
    fn drop_and_rename_tables_and_views() {
        let dir = TempDir::new().unwrap();
        let ctx = RegistryContext::new(dir.path());
        let mut conn = manager().open(&ctx).unwrap();
        conn.execute_batch(
            "CREATE TABLE t_a(id INTEGER); CREATE VIEW v_a AS SELECT id FROM t_a;",
        )
        .unwrap();

        rename_object(&mut conn, "t_a", "t_b").unwrap();
        rename_object(&mut conn, "v_a", "v_b").unwrap();
        assert_eq!(main_object_kind(&conn, "t_b").unwrap(), Some(ObjectKind::Table));
        assert_eq!(main_object_kind(&conn, "v_b").unwrap(), Some(ObjectKind::View));
        assert_eq!(main_object_kind(&conn, "v_a").unwrap(), None);
        let err = rename_object(&mut conn, "t_b", "v_b").unwrap_err();
        assert_eq!(err.kind(), "duplicate_name");

        assert!(drop_object(&mut conn, "v_b").unwrap());
        assert!(drop_object(&mut conn, "t_b").unwrap());
        assert!(!drop_object(&mut conn, "t_b").unwrap());
        assert!(local_object_names(&conn).unwrap().is_empty());
    }

    #[test]
    fn bindings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let ext_path = dir.path().join("shop.db");
        {
            let ext = Connection::open(&ext_path).unwrap();
            ext.execute_batch(
                "CREATE TABLE customers(id INTEGER, name VARCHAR);
                 INSERT INTO customers VALUES (1,'ada');",
            )
            .unwrap();
        }
        let ctx = RegistryContext::new(dir.path().join("conv"));
        let mgr = manager();
        {
            let mut conn = mgr.open(&ctx).unwrap();
            attach(&conn, "ext_1", &ext_path).unwrap();
            let binding = Binding {
                view_name: "customers_aaaaaa".into(),
                alias: "ext_1".into(),
                object: "customers".into(),
            };
            bind(&mut conn, "ext_1", &ext_path, &binding).unwrap();
        }
        let mut conn = mgr.open(&ctx).unwrap();
        let name: String = conn
            .query_row("SELECT name FROM customers_aaaaaa", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "ada");
        assert_eq!(attached_schemas(&conn).unwrap(), vec!["ext_1"]);

        rename_object(&mut conn, "customers_aaaaaa", "clients").unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM clients", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);

        assert!(drop_object(&mut conn, "clients").unwrap());
        assert!(load_bindings(&conn).unwrap().is_empty());
        drop(conn);
        let conn = mgr.open(&ctx).unwrap();
        assert!(attached_schemas(&conn).unwrap().is_empty());
    }
}
