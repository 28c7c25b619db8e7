use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use crate::error::{RegistryError, Result};

/// Ordered, named columns and ordered rows, exactly as the engine produced
/// them. No row limit is applied here.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

pub struct QueryExecutor;

impl QueryExecutor {
    /// Execute one read-only statement. Engine errors come back as
    /// `QueryError` with the engine's message unchanged.
    pub fn run(conn: &Connection, sql: &str) -> Result<QueryResult> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(RegistryError::Query("empty query".into()));
        }
        let mut stmt = conn.prepare(sql).map_err(RegistryError::query)?;
        if !stmt.readonly() {
            return Err(RegistryError::Query(
                "only read-only statements can be run as queries".into(),
            ));
        }
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([]).map_err(RegistryError::query)?;
        while let Some(row) = cursor.next().map_err(RegistryError::query)? {
            let mut out = Vec::with_capacity(width);
            for idx in 0..width {
                let v = row.get_ref(idx).map_err(RegistryError::query)?;
                out.push(to_json(v));
            }
            rows.push(out);
        }
        Ok(QueryResult { columns, rows })
    }
}

fn to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64_STANDARD.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t(id INTEGER, name VARCHAR, score DOUBLE, raw BLOB);
             INSERT INTO t VALUES (2,'bo',1.5,NULL), (1,'al',NULL,x'0102');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn returns_ordered_columns_and_rows() {
        let res =
            QueryExecutor::run(&conn(), "SELECT id, name, score, raw FROM t ORDER BY id").unwrap();
        assert_eq!(res.columns, vec!["id", "name", "score", "raw"]);
        assert_eq!(res.rows[0], vec![json!(1), json!("al"), Value::Null, json!("AQI=")]);
        assert_eq!(res.rows[1], vec![json!(2), json!("bo"), json!(1.5), Value::Null]);
        assert_eq!(res.row_count(), 2);
    }

    #[test]
    fn engine_errors_are_passed_through() {
        let err = QueryExecutor::run(&conn(), "SELECT * FROM missing").unwrap_err();
        assert_eq!(err.kind(), "query_error");
        assert!(err.to_string().contains("no such table: missing"));
    }

    #[test]
    fn writes_are_rejected() {
        let c = conn();
        for sql in ["DELETE FROM t", "DROP TABLE t", "CREATE TABLE x(a)"] {
            let err = QueryExecutor::run(&c, sql).unwrap_err();
            assert_eq!(err.kind(), "query_error", "{sql}");
        }
        let n: i64 = c.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn empty_query_is_an_error() {
        assert!(QueryExecutor::run(&conn(), "   ").is_err());
    }
}
