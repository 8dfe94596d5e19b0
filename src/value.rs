//! Value canonicalization — the deterministic rewrite the target writer
//! applies to every cell before it reaches a `VALUES` list (spec.md §4.3).

/// Target column type families the writer distinguishes when canonicalizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Numeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Text,
}

/// A single source cell: either a typed SQL literal ready to splice into a
/// `VALUES` list, or a raw string still needing canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Null,
    Raw(String),
}

const ZERO_DATE_SENTINELS: [&str; 3] = ["0000-", "1900-01-01", "1970-01-01"];

/// Canonicalize one cell per spec.md §4.3:
/// - non-ASCII/control bytes (except TAB/LF/CR) are scrubbed
/// - NULL-sentinel strings map to a type-appropriate default
/// - booleans accept `{Y,1,true,TRUE}`/`{N,0,false,FALSE}`
/// - short or `0000`-containing dates are treated as NULL markers
pub fn canonicalize(value: &CellValue, family: TypeFamily) -> String {
    let raw = match value {
        CellValue::Null => return default_literal(family),
        CellValue::Raw(s) => scrub(s),
    };

    if is_null_sentinel(&raw, family) {
        return default_literal(family);
    }

    match family {
        TypeFamily::Boolean => canonicalize_bool(&raw),
        _ => raw,
    }
}

/// Scrub non-ASCII and control bytes, keeping TAB/LF/CR.
fn scrub(s: &str) -> String {
    s.chars()
        .filter(|c| {
            let kept_control = matches!(c, '\t' | '\n' | '\r');
            c.is_ascii() && (kept_control || !c.is_control())
        })
        .collect()
}

fn is_null_sentinel(raw: &str, family: TypeFamily) -> bool {
    if raw.is_empty() || raw == "NULL" || raw == "\\N" || raw == "\\0" {
        return true;
    }
    if matches!(family, TypeFamily::Date | TypeFamily::Timestamp) {
        if raw.len() < 10 || raw.contains("0000") {
            return true;
        }
        if ZERO_DATE_SENTINELS.iter().any(|s| raw.starts_with(s)) {
            return true;
        }
    }
    false
}

fn canonicalize_bool(raw: &str) -> String {
    match raw {
        "Y" | "1" | "true" | "TRUE" => "true".to_string(),
        "N" | "0" | "false" | "FALSE" => "false".to_string(),
        other => other.to_string(),
    }
}

fn default_literal(family: TypeFamily) -> String {
    match family {
        TypeFamily::Integer => "0".to_string(),
        TypeFamily::Numeric => "0.0".to_string(),
        TypeFamily::Boolean => "false".to_string(),
        TypeFamily::Timestamp => "1970-01-01 00:00:00".to_string(),
        TypeFamily::Date => "1970-01-01".to_string(),
        TypeFamily::Time => "00:00:00".to_string(),
        TypeFamily::Text => "DEFAULT".to_string(),
    }
}
