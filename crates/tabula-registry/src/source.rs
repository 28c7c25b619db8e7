//! Parsing of caller-supplied source references and derivation of the
//! canonical dedup key (`sourceId`).

use std::fmt;
use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::error::{RegistryError, Result};

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "igshid", "usp", "ref", "mc_cid", "mc_eid",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    GoogleSheet { sheet_id: String, gid: String },
    Web { url: Url },
    DelimitedFile { path: PathBuf, delimiter: u8 },
    SqliteTable { path: PathBuf, table: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    raw: String,
    kind: SourceKind,
}

impl SourceRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::InvalidSource("empty source reference".into()));
        }
        let lower = trimmed.to_ascii_lowercase();
        let kind = if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(trimmed)
                .map_err(|e| RegistryError::InvalidSource(format!("{trimmed}: {e}")))?;
            web_kind(url)
        } else if lower.starts_with("sqlite://") {
            let rest = &trimmed["sqlite://".len()..];
            let (path, table) = split_fragment(rest);
            sqlite_kind(trimmed, Path::new(path), table)?
        } else if lower.starts_with("file://") {
            let url = Url::parse(trimmed)
                .map_err(|e| RegistryError::InvalidSource(format!("{trimmed}: {e}")))?;
            let path = url
                .to_file_path()
                .map_err(|_| RegistryError::InvalidSource(format!("{trimmed}: not a local path")))?;
            file_kind(trimmed, &path, url.fragment())?
        } else if trimmed.contains("://") {
            return Err(RegistryError::InvalidSource(format!(
                "{trimmed}: unsupported scheme"
            )));
        } else {
            let (path, fragment) = split_fragment(trimmed);
            file_kind(trimmed, Path::new(path), fragment)?
        };
        Ok(Self {
            raw: trimmed.to_string(),
            kind,
        })
    }

    /// The reference as supplied by the caller, minus surrounding whitespace.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn source_id(&self) -> String {
        match &self.kind {
            SourceKind::GoogleSheet { sheet_id, gid } => format!("gsheet:{sheet_id}#gid={gid}"),
            SourceKind::Web { url } => format!("url:{url}"),
            SourceKind::DelimitedFile { path, .. } => format!("csv:{}", path.to_string_lossy()),
            SourceKind::SqliteTable { path, table } => format!(
                "sqlite:{}#{}",
                path.to_string_lossy(),
                table.to_ascii_lowercase()
            ),
        }
    }

    /// Short human-readable token the allocator derives view names from.
    pub fn display_hint(&self) -> String {
        match &self.kind {
            SourceKind::GoogleSheet { .. } => "sheet".to_string(),
            SourceKind::Web { url } => url
                .path_segments()
                .and_then(|segs| segs.filter(|s| !s.is_empty()).last())
                .map(|seg| match seg.rsplit_once('.') {
                    Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                    _ => seg.to_string(),
                })
                .or_else(|| url.host_str().map(str::to_string))
                .unwrap_or_default(),
            SourceKind::DelimitedFile { path, .. } => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            SourceKind::SqliteTable { table, .. } => table.clone(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Deterministic dedup key for a raw source reference.
pub fn canonicalize(raw: &str) -> Result<String> {
    SourceRef::parse(raw).map(|s| s.source_id())
}

fn split_fragment(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (s, None),
    }
}

fn web_kind(url: Url) -> SourceKind {
    if let Some(sheet) = google_sheet(&url) {
        return sheet;
    }
    SourceKind::Web {
        url: normalize_url(url),
    }
}

fn google_sheet(url: &Url) -> Option<SourceKind> {
    if url.host_str()? != "docs.google.com" {
        return None;
    }
    let segs: Vec<&str> = url.path_segments()?.collect();
    let sheet_id = match segs.as_slice() {
        ["spreadsheets", "d", id, ..] if !id.is_empty() => (*id).to_string(),
        _ => return None,
    };
    let from_query = url
        .query_pairs()
        .find(|(k, _)| k == "gid")
        .map(|(_, v)| v.into_owned());
    let from_fragment = url.fragment().and_then(|frag| {
        frag.split('&')
            .find_map(|pair| pair.strip_prefix("gid=").map(str::to_string))
    });
    let gid = from_query
        .or(from_fragment)
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| "0".to_string());
    Some(SourceKind::GoogleSheet { sheet_id, gid })
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

fn normalize_url(mut url: Url) -> Url {
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url
}

fn file_kind(raw: &str, path: &Path, fragment: Option<&str>) -> Result<SourceKind> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => Ok(SourceKind::DelimitedFile {
            path: normalize_path(path),
            delimiter: b',',
        }),
        "tsv" => Ok(SourceKind::DelimitedFile {
            path: normalize_path(path),
            delimiter: b'\t',
        }),
        "db" | "sqlite" | "sqlite3" => sqlite_kind(raw, path, fragment),
        _ => Err(RegistryError::InvalidSource(format!(
            "{raw}: unsupported source type"
        ))),
    }
}

fn sqlite_kind(raw: &str, path: &Path, table: Option<&str>) -> Result<SourceKind> {
    let table = table.map(str::trim).filter(|t| !t.is_empty()).ok_or_else(|| {
        RegistryError::InvalidSource(format!("{raw}: expected <path>#<table>"))
    })?;
    if path.as_os_str().is_empty() {
        return Err(RegistryError::InvalidSource(format!("{raw}: empty path")));
    }
    Ok(SourceKind::SqliteTable {
        path: normalize_path(path),
        table: table.to_string(),
    })
}

/// Absolute, lexically normalized path. Does not touch the filesystem, so the
/// key is stable whether or not the file exists yet.
fn normalize_path(path: &Path) -> PathBuf {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
