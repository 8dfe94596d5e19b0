//! Connection string parsing — semicolon-separated `key=value` pairs
//! (spec.md §6). Grounded on the original `getMariaDBConnection` parser
//! (`original_source/`), which trims whitespace around both the key and
//! the value; this parser preserves that tolerance.

use std::collections::HashMap;

/// A parsed `key=value;key=value` connection string.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    entries: HashMap<String, String>,
}

impl ConnectionParams {
    pub fn parse(raw: &str) -> Self {
        let mut entries = HashMap::new();
        for token in raw.split(';') {
            let Some(pos) = token.find('=') else {
                continue;
            };
            let key = token[..pos].trim().to_string();
            let value = token[pos + 1..].trim().to_string();
            if key.is_empty() {
                continue;
            }
            entries.insert(key, value);
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Whether the raw string looks like a URI-style connection string
    /// (`mongodb://`, `mongodb+srv://`, libpq URI) rather than
    /// `key=value;...` pairs.
    pub fn is_uri(raw: &str) -> bool {
        raw.contains("://")
    }
}
