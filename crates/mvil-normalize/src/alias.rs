use std::collections::BTreeMap;

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Base canonicalization: normalize, then resolve through `alias_table`.
/// Unknown terms come back normalized but otherwise untouched.
pub fn canonicalize(value: &str, alias_table: &AliasTable) -> String {
    let normalized = normalize_text(value);
    match alias_table.lookup(&normalized) {
        Some(canonical) => canonical.to_string(),
        None => normalized,
    }
}

/// Alias -> canonical mapping with normalized keys and values.
///
/// Chains (`a -> b`, `b -> c`) are collapsed to their terminal value at
/// construction, so every value is a fixed point of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    entries: BTreeMap<String, String>,
}

impl AliasTable {
    /// Returns the first alias found on a cycle if the pairs cannot be collapsed.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut raw = BTreeMap::new();
        for (alias, canonical) in pairs {
            let alias = normalize_text(alias.as_ref());
            let canonical = normalize_text(canonical.as_ref());
            if alias.is_empty() || canonical.is_empty() || alias == canonical {
                continue;
            }
            raw.insert(alias, canonical);
        }

        let mut entries = BTreeMap::new();
        for alias in raw.keys() {
            let mut current = alias;
            let mut hops = 0usize;
            while let Some(next) = raw.get(current) {
                current = next;
                hops += 1;
                if hops > raw.len() {
                    return Err(alias.clone());
                }
            }
            entries.insert(alias.clone(), current.clone());
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, normalized: &str) -> Option<&str> {
        self.entries.get(normalized).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn canonical_values(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AliasTable {
        AliasTable::from_pairs([
            ("MS Excel", "excel"),
            ("Excel Macros", "excel"),
            ("spreadsheets", "ms excel"),
            ("Py", "python"),
        ])
        .unwrap()
    }

    #[test]
    fn normalizes_before_lookup() {
        let t = table();
        assert_eq!(canonicalize("  MS   EXCEL ", &t), "excel");
        assert_eq!(canonicalize("excel macros", &t), "excel");
        assert_eq!(canonicalize("Rust", &t), "rust");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(canonicalize("", &table()), "");
        assert_eq!(canonicalize("   \t ", &table()), "");
    }

    #[test]
    fn chains_collapse_to_terminal_value() {
        assert_eq!(canonicalize("Spreadsheets", &table()), "excel");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let t = table();
        for input in ["MS Excel", "Spreadsheets", "py", "Unknown Thing", "", "  a  b "] {
            let once = canonicalize(input, &t);
            assert_eq!(canonicalize(&once, &t), once, "input {input:?}");
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let err = AliasTable::from_pairs([("a", "b"), ("b", "a")]).unwrap_err();
        assert!(err == "a" || err == "b");
    }
}
