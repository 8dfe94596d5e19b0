//! Cursor encoding — the high-water mark that lets a cycle resume without
//! re-reading already-transferred rows.
//!
//! spec.md §9 treats `last_offset` and `last_processed_pk` as two
//! presentations of one concept and suggests a tagged variant. [`Cursor`]
//! is that variant; [`PkStrategy`] on the catalog entry selects which arm
//! is meaningful (catalog invariant 1 in spec.md §3).

use serde::{Deserialize, Serialize};

/// Pagination regime for a table, chosen by Catalog Discovery before the
/// table's first pass (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PkStrategy {
    Pk,
    TemporalPk,
    Offset,
}

impl PkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PkStrategy::Pk => "PK",
            PkStrategy::TemporalPk => "TEMPORAL_PK",
            PkStrategy::Offset => "OFFSET",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, crate::error::RowSyncError> {
        match s {
            "PK" => Ok(PkStrategy::Pk),
            "TEMPORAL_PK" => Ok(PkStrategy::TemporalPk),
            "OFFSET" => Ok(PkStrategy::Offset),
            other => Err(crate::error::RowSyncError::CatalogDecode(format!(
                "unknown pk_strategy: {other}"
            ))),
        }
    }
}

/// The ordering-key high-water mark, in whichever presentation
/// `pk_strategy` selects. Both presentations are still persisted as
/// separate catalog columns (spec.md §9 treats this as "an on-wire
/// compatibility concern"), but in memory there is exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Offset(u64),
    Composite(Vec<Option<String>>),
}

impl Cursor {
    pub fn empty_composite() -> Self {
        Cursor::Composite(Vec::new())
    }

    /// Component-wise comparison over the composite key, or numeric for
    /// offsets. Used to enforce monotonicity (catalog invariant 2).
    ///
    /// Every `SourceAdapter` orders and filters PK tuples with the source's
    /// own native comparison (`WHERE (col1,col2) > (...)` on typed
    /// columns), never byte-wise string order — so an integer PK component
    /// is compared numerically here too (`"18"` is after `"9"` even though
    /// `'1' < '9'` as bytes). Components that don't both parse as integers
    /// fall back to string order.
    pub fn is_at_least(&self, other: &Cursor) -> bool {
        match (self, other) {
            (Cursor::Offset(a), Cursor::Offset(b)) => a >= b,
            (Cursor::Composite(a), Cursor::Composite(b)) => {
                if b.is_empty() {
                    true
                } else {
                    compare_tuples(a, b) != std::cmp::Ordering::Less
                }
            }
            // Mismatched variants only happen across a pk_strategy change,
            // which Catalog Discovery is responsible for resetting explicitly.
            _ => true,
        }
    }
}

/// Lexicographic tuple comparison with numeric-aware components, matching
/// how every `SourceAdapter` orders PK tuples natively.
fn compare_tuples(a: &[Option<String>], b: &[Option<String>]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_components(x, y);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_components(a: &Option<String>, b: &Option<String>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        },
    }
}

/// Encode a composite PK tuple as the `|`-joined wire string.
///
/// Escaping (resolves the open question in spec.md §9): a literal `\` is
/// written as `\\` and a literal `|` as `\|`. A NULL component is written
/// as the bare token `NULL` (never escaped — an escaped empty string is
/// just the empty string, so `NULL` as a literal token is unambiguous as
/// long as no column value is the four-character string "NULL"; columns
/// whose *legitimate* value is exactly `NULL` are not representable, a
/// known, documented limitation rather than a silent one).
pub fn encode_pk(components: &[Option<String>]) -> String {
    components
        .iter()
        .map(|c| match c {
            None => "NULL".to_string(),
            Some(v) => escape_component(v),
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn escape_component(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for ch in v.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            other => out.push(other),
        }
    }
    out
}

/// Decode a `|`-joined wire string into its PK components.
///
/// Accepts both the escaped form written by [`encode_pk`] and the legacy
/// unescaped form (a component that contains no `\` splits identically
/// either way, which covers the overwhelming majority of real PK values).
pub fn decode_pk(encoded: &str) -> Vec<Option<String>> {
    if encoded.is_empty() {
        return Vec::new();
    }
    let mut components = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(&next) = chars.peek() {
                    if next == '\\' || next == '|' {
                        current.push(next);
                        chars.next();
                        continue;
                    }
                }
                current.push('\\');
            }
            '|' => {
                components.push(finish_component(std::mem::take(&mut current)));
            }
            other => current.push(other),
        }
    }
    components.push(finish_component(current));
    components
}

fn finish_component(s: String) -> Option<String> {
    if s == "NULL" { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_composite_key() {
        let components = vec![Some("A".to_string()), Some("1".to_string())];
        let encoded = encode_pk(&components);
        assert_eq!(encoded, "A|1");
        assert_eq!(decode_pk(&encoded), components);
    }

    #[test]
    fn round_trips_null_component() {
        let components = vec![Some("A".to_string()), None];
        let encoded = encode_pk(&components);
        assert_eq!(encoded, "A|NULL");
        assert_eq!(decode_pk(&encoded), components);
    }

    #[test]
    fn escapes_embedded_pipe_and_backslash() {
        let components = vec![Some("a|b".to_string()), Some("c\\d".to_string())];
        let encoded = encode_pk(&components);
        assert_eq!(encoded, "a\\|b|c\\\\d");
        assert_eq!(decode_pk(&encoded), components);
    }

    #[test]
    fn empty_string_decodes_to_no_components() {
        assert_eq!(decode_pk(""), Vec::<Option<String>>::new());
    }

    #[test]
    fn cursor_monotonicity_composite() {
        let a = Cursor::Composite(vec![Some("A".into()), Some("1".into())]);
        let b = Cursor::Composite(vec![Some("A".into()), Some("2".into())]);
        assert!(b.is_at_least(&a));
        assert!(!a.is_at_least(&b));
    }

    #[test]
    fn cursor_monotonicity_is_numeric_not_byte_wise_across_a_power_of_ten() {
        // Lexicographically "18" < "9" (`'1' < '9'`), but an auto-increment
        // integer PK has genuinely advanced from 9 to 18. A single-column
        // integer PK cursor must accept this as forward progress.
        let a = Cursor::Composite(vec![Some("9".into())]);
        let b = Cursor::Composite(vec![Some("18".into())]);
        assert!(b.is_at_least(&a));
        assert!(!a.is_at_least(&b));
    }

    #[test]
    fn cursor_monotonicity_offset() {
        assert!(Cursor::Offset(10).is_at_least(&Cursor::Offset(5)));
        assert!(!Cursor::Offset(5).is_at_least(&Cursor::Offset(10)));
    }
}
