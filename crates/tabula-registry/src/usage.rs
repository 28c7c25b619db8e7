//! Strategies for deciding which registered views a query mentions.
//!
//! Both strategies are lexical approximations. They feed `lastUsedAt`
//! bookkeeping only and must not be used to decide correctness.

use crate::config::UsageMatcherKind;

pub trait UsageMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subset of `view_names` referenced by `sql`, in `view_names` order.
    fn referenced(&self, sql: &str, view_names: &[String]) -> Vec<String>;
}

pub fn matcher_for(kind: UsageMatcherKind) -> Box<dyn UsageMatcher> {
    match kind {
        UsageMatcherKind::Naive => Box::new(NaiveLexicalScan),
        UsageMatcherKind::Identifier => Box::new(IdentifierScan),
    }
}

/// Case-sensitive substring search. False positives when a view name occurs
/// inside a longer identifier, a string literal or a comment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaiveLexicalScan;

impl UsageMatcher for NaiveLexicalScan {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn referenced(&self, sql: &str, view_names: &[String]) -> Vec<String> {
        view_names
            .iter()
            .filter(|name| !name.is_empty() && sql.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Whole-identifier match on a tokenized query. String literals and comments
/// are skipped; `"quoted"`, `` `backticked` `` and `[bracketed]` identifiers
/// are unwrapped; comparison ignores ASCII case like SQLite does.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentifierScan;

impl UsageMatcher for IdentifierScan {
    fn name(&self) -> &'static str {
        "identifier"
    }

    fn referenced(&self, sql: &str, view_names: &[String]) -> Vec<String> {
        let idents = identifiers(sql);
        view_names
            .iter()
            .filter(|name| idents.iter().any(|id| id.eq_ignore_ascii_case(name)))
            .cloned()
            .collect()
    }
}

/// Every identifier-like token in `sql`, with quoting removed.
pub fn identifiers(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' => {
                i = skip_quoted(&chars, i, '\'').1;
            }
            '"' | '`' => {
                let (text, next) = skip_quoted(&chars, i, c);
                out.push(text);
                i = next;
            }
            '[' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                out.push(chars[start..j].iter().collect());
                i = j + 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                out.push(chars[start..i].iter().collect());
            }
            c if c.is_ascii_digit() => {
                // numeric literal, including forms like 1e10 or 0x1f
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    out
}

/// Read a `q`-delimited token starting at `start` (doubled `q` escapes).
/// Returns the unescaped text and the index after the closing delimiter.
fn skip_quoted(chars: &[char], start: usize, q: char) -> (String, usize) {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == q {
            if chars.get(i + 1) == Some(&q) {
                text.push(q);
                i += 2;
                continue;
            }
            return (text, i + 1);
        }
        text.push(chars[i]);
        i += 1;
    }
    (text, i)
}
