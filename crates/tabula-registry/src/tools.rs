//! JSON tool surface handed to the agent layer.
//!
//! Each tool takes a JSON object and returns a JSON value. Input shapes that
//! older callers produced are normalized in one place ([`source_list`]) so the
//! handlers only ever see the current shape.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::catalog::ViewCatalog;
use crate::context::RegistryContext;
use crate::error::{ErrorDetail, RegistryError};

pub const TOOL_TEST_CONNECTION: &str = "views.test_connection";
pub const TOOL_REGISTER: &str = "views.register";
pub const TOOL_LIST: &str = "views.list";
pub const TOOL_SCHEMA: &str = "views.schema";
pub const TOOL_QUERY: &str = "views.query";
pub const TOOL_RENAME: &str = "views.rename";
pub const TOOL_DELETE: &str = "views.delete";

pub const TOOL_IDS: &[&str] = &[
    TOOL_TEST_CONNECTION,
    TOOL_REGISTER,
    TOOL_LIST,
    TOOL_SCHEMA,
    TOOL_QUERY,
    TOOL_RENAME,
    TOOL_DELETE,
];

#[derive(Debug)]
pub enum ToolError {
    Unsupported(String),
    Invalid(String),
    Runtime(String),
    Registry(RegistryError),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::Unsupported(id) => write!(f, "unsupported tool: {}", id),
            ToolError::Invalid(msg) => write!(f, "invalid request: {}", msg),
            ToolError::Runtime(msg) => write!(f, "runtime error: {}", msg),
            ToolError::Registry(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ToolError::Registry(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RegistryError> for ToolError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidSource(_) | RegistryError::InvalidName(_) => {
                ToolError::Invalid(err.to_string())
            }
            other => ToolError::Registry(other),
        }
    }
}

impl ToolError {
    /// Payload shape for error responses.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            ToolError::Registry(err) => err.detail(),
            ToolError::Unsupported(_) => ErrorDetail {
                kind: "unsupported",
                message: self.to_string(),
            },
            ToolError::Invalid(_) => ErrorDetail {
                kind: "invalid_request",
                message: self.to_string(),
            },
            ToolError::Runtime(_) => ErrorDetail {
                kind: "runtime_error",
                message: self.to_string(),
            },
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Runtime(e.to_string()))
}

fn str_field<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

/// Source references carried by a register request.
///
/// Accepted shapes, first match wins: `{"sources": [..]}`, `{"source": ".."}`,
/// the legacy `{"sharedLink": ".."}` / `{"sharedLinks": [..]}`, and a bare
/// JSON string or array of strings.
pub fn source_list(input: &Value) -> Result<Vec<String>, ToolError> {
    let found = ["sources", "source", "sharedLinks", "sharedLink"]
        .iter()
        .find_map(|key| input.get(*key))
        .or(match input {
            Value::String(_) | Value::Array(_) => Some(input),
            _ => None,
        });
    let Some(value) = found else {
        return Err(ToolError::Invalid("missing 'sources'".into()));
    };
    let list = string_list(value)
        .ok_or_else(|| {
            ToolError::Invalid("'sources' must be a string or an array of strings".into())
        })?;
    if list.is_empty() {
        return Err(ToolError::Invalid("'sources' is empty".into()));
    }
    Ok(list)
}

fn view_name_list(input: &Value) -> Result<Vec<String>, ToolError> {
    let value = input
        .get("viewNames")
        .or_else(|| input.get("viewName"))
        .ok_or_else(|| ToolError::Invalid("missing 'viewNames'".into()))?;
    let list = string_list(value)
        .ok_or_else(|| {
            ToolError::Invalid("'viewNames' must be a string or an array of strings".into())
        })?;
    if list.is_empty() {
        return Err(ToolError::Invalid("'viewNames' is empty".into()));
    }
    Ok(list)
}

pub async fn run_tool(
    catalog: &ViewCatalog,
    ctx: &RegistryContext,
    id: &str,
    input: Value,
) -> Result<Value, ToolError> {
    match id {
        TOOL_TEST_CONNECTION => Ok(json!({"ok": catalog.test_connection(ctx).await})),
        TOOL_REGISTER => {
            let sources = source_list(&input)?;
            let report = catalog.register_sources(ctx, &sources).await?;
            to_value(&report)
        }
        TOOL_LIST => {
            let views = catalog.list_views(ctx).await?;
            Ok(json!({"views": to_value(&views)?}))
        }
        TOOL_SCHEMA => {
            let name = str_field(&input, &["viewName", "tableName"]);
            let snapshot = catalog.describe(ctx, name).await?;
            to_value(&snapshot)
        }
        TOOL_QUERY => {
            let sql = str_field(&input, &["sql", "query"])
                .ok_or_else(|| ToolError::Invalid("missing 'sql'".into()))?;
            let result = catalog.run_query(ctx, sql).await?;
            to_value(&result)
        }
        TOOL_RENAME => {
            let old = str_field(&input, &["from", "oldName"])
                .ok_or_else(|| ToolError::Invalid("missing 'from'".into()))?;
            let new = str_field(&input, &["to", "newName"])
                .ok_or_else(|| ToolError::Invalid("missing 'to'".into()))?;
            let record = catalog.rename_view(ctx, old, new).await?;
            Ok(json!({"renamed": to_value(&record)?}))
        }
        TOOL_DELETE => {
            let names = view_name_list(&input)?;
            let report = catalog.delete_views(ctx, &names).await?;
            to_value(&report)
        }
        other => Err(ToolError::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use tempfile::TempDir;

    #[test]
    fn register_input_shapes_normalize() {
        assert_eq!(source_list(&json!({"source": "a.csv"})).unwrap(), vec!["a.csv"]);
        assert_eq!(
            source_list(&json!({"sources": ["a.csv", "b.csv"]})).unwrap(),
            vec!["a.csv", "b.csv"]
        );
        assert_eq!(
            source_list(&json!({"sharedLink": "https://x.test/a.csv"})).unwrap(),
            vec!["https://x.test/a.csv"]
        );
        assert_eq!(source_list(&json!("a.csv")).unwrap(), vec!["a.csv"]);
        assert_eq!(
            source_list(&json!({"sources": "a.csv", "sharedLink": "b.csv"})).unwrap(),
            vec!["a.csv"]
        );
        assert!(matches!(source_list(&json!({})), Err(ToolError::Invalid(_))));
        assert!(matches!(source_list(&json!({"sources": [1]})), Err(ToolError::Invalid(_))));
        assert!(matches!(source_list(&json!({"sources": []})), Err(ToolError::Invalid(_))));
    }

    #[tokio::test]
    async fn tools_round_trip_through_json() {
        let dir = TempDir::new().unwrap();
        let csv = dir.path().join("people.csv");
        std::fs::write(&csv, "id,name\n1,ann\n2,bo\n").unwrap();
        let catalog = ViewCatalog::new(RegistryConfig::default()).unwrap();
        let ctx = RegistryContext::new(dir.path().join("conv"));

        let out = run_tool(&catalog, &ctx, TOOL_TEST_CONNECTION, json!({})).await.unwrap();
        assert_eq!(out, json!({"ok": false}));

        let out = run_tool(&catalog, &ctx, TOOL_REGISTER, json!({"source": csv.to_str().unwrap()}))
            .await
            .unwrap();
        let view = out["registered"][0]["viewName"].as_str().unwrap().to_string();
        assert_eq!(out["registered"][0]["isNew"], json!(true));
        assert!(view.starts_with("people_"));

        let out = run_tool(&catalog, &ctx, TOOL_LIST, json!({})).await.unwrap();
        assert_eq!(out["views"][0]["viewName"], json!(view));
        assert!(out["views"][0]["createdAt"].is_string());

        let out = run_tool(&catalog, &ctx, TOOL_SCHEMA, json!({"viewName": view})).await.unwrap();
        assert_eq!(
            out["tables"][0]["columns"],
            json!([
                {"columnName": "id", "columnType": "INTEGER"},
                {"columnName": "name", "columnType": "VARCHAR"}
            ])
        );

        let sql = format!("SELECT name FROM {view} ORDER BY id");
        let out = run_tool(&catalog, &ctx, TOOL_QUERY, json!({"sql": sql})).await.unwrap();
        assert_eq!(out, json!({"columns": ["name"], "rows": [["ann"], ["bo"]]}));

        let out = run_tool(&catalog, &ctx, TOOL_RENAME, json!({"from": view, "to": "people"}))
            .await
            .unwrap();
        assert_eq!(out["renamed"]["viewName"], json!("people"));

        let out = run_tool(
            &catalog,
            &ctx,
            TOOL_DELETE,
            json!({"viewNames": ["people", "ghost"]}),
        )
        .await
        .unwrap();
        assert_eq!(out["deleted"], json!(["people"]));
        assert_eq!(out["failed"][0]["name"], json!("ghost"));
        assert_eq!(out["failed"][0]["error"]["kind"], json!("not_found"));
    }

    #[tokio::test]
    async fn bad_requests_are_typed() {
        let dir = TempDir::new().unwrap();
        let catalog = ViewCatalog::new(RegistryConfig::default()).unwrap();
        let ctx = RegistryContext::new(dir.path().join("conv"));

        let err = run_tool(&catalog, &ctx, "views.explode", json!({})).await.unwrap_err();
        assert_eq!(err.detail().kind, "unsupported");
        let err = run_tool(&catalog, &ctx, TOOL_QUERY, json!({})).await.unwrap_err();
        assert_eq!(err.detail().kind, "invalid_request");
        let err = run_tool(&catalog, &ctx, TOOL_QUERY, json!({"sql": "SELECT * FROM nowhere"}))
            .await
            .unwrap_err();
        assert_eq!(err.detail().kind, "query_error");
        assert!(err.to_string().contains("no such table"));
        let err = run_tool(&catalog, &ctx, TOOL_SCHEMA, json!({"viewName": "nowhere"}))
            .await
            .unwrap_err();
        assert_eq!(err.detail().kind, "not_found");
    }
}
