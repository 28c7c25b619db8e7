//! View name allocation: dedup by `sourceId`, otherwise synthesize a short,
//! legible identifier that does not clash with anything in the conversation.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{RegistryError, Result};
use crate::record::ViewRecord;
use crate::source::SourceRef;

const HINT_MAX_LEN: usize = 32;
const HASH_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct Allocation {
    pub record: ViewRecord,
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct ViewNameAllocator {
    max_attempts: u32,
}

impl Default for ViewNameAllocator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ViewNameAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Resolve `source` against the existing records.
    ///
    /// Returns the stored record untouched when the source is already known.
    /// A new allocation is not persisted here: the caller materializes the
    /// view first and only then upserts `record`.
    pub fn allocate(
        &self,
        records: &[ViewRecord],
        source: &SourceRef,
        now: DateTime<Utc>,
        engine_names: &[String],
    ) -> Result<Allocation> {
        let source_id = source.source_id();
        if let Some(existing) = records.iter().find(|r| r.source_id() == source_id) {
            return Ok(Allocation {
                record: existing.clone(),
                is_new: false,
            });
        }
        let taken = |candidate: &str| {
            records
                .iter()
                .any(|r| r.view_name().eq_ignore_ascii_case(candidate))
                || engine_names
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(candidate))
        };
        let base = base_name(&source.display_hint(), &source_id);
        for attempt in 1..=self.max_attempts {
            let candidate = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}_{attempt}")
            };
            if !taken(&candidate) {
                return Ok(Allocation {
                    record: ViewRecord::new(candidate, source_id, source.raw(), now),
                    is_new: true,
                });
            }
        }
        Err(RegistryError::DuplicateName(format!(
            "{base}: no free name after {} attempts",
            self.max_attempts
        )))
    }
}

/// `<sanitized hint>_<short hash of sourceId>`.
pub fn base_name(hint: &str, source_id: &str) -> String {
    let digest = Sha256::digest(source_id.as_bytes());
    let short = &hex::encode(digest)[..HASH_LEN];
    let mut token = sanitize_identifier(hint);
    if token.len() > HINT_MAX_LEN {
        token.truncate(HINT_MAX_LEN);
        while token.ends_with('_') {
            token.pop();
        }
    }
    format!("{token}_{short}")
}

/// Map arbitrary text onto `[a-z0-9_]`, never empty, never starting with a
/// digit or SQLite's reserved `sqlite` prefix.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return "view".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) || trimmed.starts_with("sqlite") {
        format!("v_{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Whether `name` is already in the identifier form the allocator produces.
pub fn is_valid_view_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with("__") && sanitize_identifier(name) == name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(raw: &str) -> SourceRef {
        SourceRef::parse(raw).unwrap()
    }

    #[test]
    fn sanitizes_to_identifier_charset() {
        assert_eq!(sanitize_identifier("Q3 Sales (final)"), "q3_sales_final");
        assert_eq!(sanitize_identifier("__Orders--2024__"), "orders_2024");
        assert_eq!(sanitize_identifier("2024 budget"), "v_2024_budget");
        assert_eq!(sanitize_identifier("sqlite_stat1"), "v_sqlite_stat1");
        assert_eq!(sanitize_identifier("Ünïcødé"), "n_c_d");
        assert_eq!(sanitize_identifier("!!!"), "view");
    }

    #[test]
    fn base_name_is_deterministic() {
        let a = base_name("Sales", "csv:/data/sales.csv");
        let b = base_name("Sales", "csv:/data/sales.csv");
        let c = base_name("Sales", "csv:/other/sales.csv");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sales_"));
        assert_eq!(a.len(), "sales_".len() + HASH_LEN);
    }

    #[test]
    fn long_hints_are_truncated() {
        let name = base_name(&"x".repeat(100), "csv:/x.csv");
        assert_eq!(name.len(), HINT_MAX_LEN + 1 + HASH_LEN);
    }

    #[test]
    fn existing_source_is_returned_unchanged() {
        let alloc = ViewNameAllocator::default();
        let now = Utc::now();
        let first = alloc
            .allocate(&[], &source("/data/sales.csv"), now, &[])
            .unwrap();
        assert!(first.is_new);
        let again = alloc
            .allocate(
                std::slice::from_ref(&first.record),
                &source("/data/./sales.csv"),
                Utc::now(),
                &[],
            )
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(again.record, first.record);
    }

    #[test]
    fn collisions_get_numeric_suffixes() {
        let alloc = ViewNameAllocator::new(3);
        let src = source("/data/sales.csv");
        let base = base_name(&src.display_hint(), &src.source_id());
        let taken = vec![base.clone(), format!("{base}_2")];
        let got = alloc.allocate(&[], &src, Utc::now(), &taken).unwrap();
        assert_eq!(got.record.view_name(), format!("{base}_3"));

        let taken = vec![base.clone(), format!("{base}_2"), format!("{base}_3")];
        let err = alloc.allocate(&[], &src, Utc::now(), &taken).unwrap_err();
        assert_eq!(err.kind(), "duplicate_name");
    }

    #[test]
    fn valid_names() {
        assert!(is_valid_view_name("sales_abc123"));
        assert!(!is_valid_view_name("Sales"));
        assert!(!is_valid_view_name("has space"));
        assert!(!is_valid_view_name("__tabula_bindings"));
        assert!(!is_valid_view_name(""));
    }
}
