//! Deduplicated, ordered collection of part numbers.
//!
//! Entries are trimmed, non-empty and unique (case-sensitive). Insertion
//! order is kept for display; it carries no meaning for searches.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::Serialize;
use thiserror::Error;

/// Any run of commas, newlines, carriage returns or tabs.
static DELIMITERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,\r\n\t]+").unwrap());

/// Errors from registry edits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("index {index} out of range for {len} part numbers")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Result of adding a single part number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Added,
    /// Already present; registry unchanged.
    Duplicate,
    /// Blank after trimming; registry unchanged.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PartRegistry {
    parts: Vec<String>,
}

impl PartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, raw: &str) -> AddOutcome {
        let part = raw.trim();
        if part.is_empty() {
            return AddOutcome::Empty;
        }
        if self.contains(part) {
            return AddOutcome::Duplicate;
        }
        self.parts.push(part.to_string());
        AddOutcome::Added
    }

    /// Add a batch, skipping blanks, known values and repeats within the
    /// batch. Returns how many entries were actually appended.
    pub fn add_many<I, S>(&mut self, raw: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.parts.len();
        for item in raw {
            // add() already rejects repeats, including ones earlier in this batch
            self.add(item.as_ref());
        }
        self.parts.len() - before
    }

    /// Split pasted text on commas, newlines, carriage returns and tabs and
    /// add every token.
    pub fn parse_delimited(&mut self, text: &str) -> usize {
        self.add_many(split_delimited(text))
    }

    pub fn remove(&mut self, index: usize) -> Result<String, RegistryError> {
        if index >= self.parts.len() {
            return Err(RegistryError::IndexOutOfRange {
                index,
                len: self.parts.len(),
            });
        }
        Ok(self.parts.remove(index))
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    pub fn contains(&self, part: &str) -> bool {
        self.parts.iter().any(|p| p == part)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.parts
    }
}

/// Tokenize delimited text into trimmed, non-empty values (duplicates kept).
pub fn split_delimited(text: &str) -> Vec<&str> {
    DELIMITERS
        .split(text)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_add_trims_and_appends() {
        let mut registry = PartRegistry::new();
        assert_eq!(registry.add("  LC1D09  "), AddOutcome::Added);
        assert_eq!(registry.as_slice(), &["LC1D09".to_string()]);
    }

    #[test]
    fn test_add_reports_duplicate_and_empty() {
        let mut registry = PartRegistry::new();
        registry.add("ABC123");
        assert_eq!(registry.add("ABC123 "), AddOutcome::Duplicate);
        assert_eq!(registry.add("   "), AddOutcome::Empty);
        assert_eq!(registry.add(""), AddOutcome::Empty);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_is_case_sensitive() {
        let mut registry = PartRegistry::new();
        assert_eq!(registry.add("abc123"), AddOutcome::Added);
        assert_eq!(registry.add("ABC123"), AddOutcome::Added);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_add_many_filters_existing_and_batch_duplicates() {
        let mut registry = PartRegistry::new();
        registry.add("P1");

        let added = registry.add_many(["P2", " P1", "", "P3", "P2", "  "]);

        assert_eq!(added, 2);
        assert_eq!(
            registry.iter().collect::<Vec<_>>(),
            vec!["P1", "P2", "P3"]
        );
    }

    #[test]
    fn test_parse_delimited_mixed_separators() {
        let mut registry = PartRegistry::new();
        let added = registry.parse_delimited("A, B\nC\tD");
        assert_eq!(added, 4);
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_parse_delimited_repeats_and_runs() {
        let mut registry = PartRegistry::new();
        let added = registry.parse_delimited("A,,B\r\n\r\nA\t\tC,\nB,");
        assert_eq!(added, 3);
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_split_delimited_keeps_inner_spaces() {
        assert_eq!(
            split_delimited("EOCR SS-05N, 3RT2015 1BB41"),
            vec!["EOCR SS-05N", "3RT2015 1BB41"]
        );
        assert!(split_delimited(" ,\n\t ").is_empty());
    }

    #[test]
    fn test_remove_by_index() {
        let mut registry = PartRegistry::new();
        registry.add_many(["A", "B", "C"]);

        assert_eq!(registry.remove(1), Ok("B".to_string()));
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec!["A", "C"]);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut registry = PartRegistry::new();
        registry.add("A");
        assert_eq!(
            registry.remove(3),
            Err(RegistryError::IndexOutOfRange { index: 3, len: 1 })
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_size_matches_distinct_inputs() {
        let inputs = [
            " X1", "X2", "x1", "X1 ", "", "X3\t", "X2", "Y", " ", "X3",
        ];
        let mut registry = PartRegistry::new();
        for (i, raw) in inputs.iter().enumerate() {
            if i % 2 == 0 {
                registry.add(raw);
            } else {
                registry.add_many([*raw, *raw]);
            }
        }

        let distinct: HashSet<&str> = inputs
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(registry.len(), distinct.len());

        let unique: HashSet<&str> = registry.iter().collect();
        assert_eq!(unique.len(), registry.len());
    }
}
