//! IRC case-mapping support.
//!
//! Nickname and channel comparisons are case-insensitive under a mapping
//! selected at configuration time. RFC 1459 folding treats `[]\~` as the
//! uppercase forms of `{}|^`; `strict-rfc1459` leaves `~` alone; `ascii`
//! folds only A-Z.

use serde::{Deserialize, Serialize};

/// Which case-insensitive comparison the server uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CaseMapping {
    /// `[` = `{`, `]` = `}`, `\` = `|`, `~` = `^`
    #[default]
    Rfc1459,
    /// `[` = `{`, `]` = `}`, `\` = `|`
    StrictRfc1459,
    /// A-Z = a-z only
    Ascii,
}

impl CaseMapping {
    /// ISUPPORT token value for this mapping.
    pub fn token(&self) -> &'static str {
        match self {
            CaseMapping::Rfc1459 => "rfc1459",
            CaseMapping::StrictRfc1459 => "strict-rfc1459",
            CaseMapping::Ascii => "ascii",
        }
    }

    /// Fold a single character to its canonical lowercase form.
    #[inline]
    pub const fn fold_char(&self, c: char) -> char {
        match (self, c) {
            (CaseMapping::Ascii, 'A'..='Z') => (c as u8 + 32) as char,
            (CaseMapping::Ascii, _) => c,
            (_, '[') => '{',
            (_, ']') => '}',
            (_, '\\') => '|',
            (CaseMapping::Rfc1459, '~') => '^',
            (_, 'A'..='Z') => (c as u8 + 32) as char,
            (_, _) => c,
        }
    }

    /// Fold a whole string.
    pub fn fold(&self, s: &str) -> String {
        s.chars().map(|c| self.fold_char(c)).collect()
    }

    /// Case-insensitive equality under this mapping.
    pub fn eq(&self, a: &str, b: &str) -> bool {
        a.len() == b.len()
            && a.chars()
                .zip(b.chars())
                .all(|(ca, cb)| self.fold_char(ca) == self.fold_char(cb))
    }
}

/// A 256-byte fold table for locale-supplied mappings.
///
/// Built from a `CaseMapping` by default; an external table can be loaded
/// from configuration for national character sets.
#[derive(Clone)]
pub struct FoldTable {
    table: [u8; 256],
}

impl FoldTable {
    /// Build the table for a built-in mapping.
    pub fn new(mapping: CaseMapping) -> Self {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let c = i as u8 as char;
            *slot = if c.is_ascii() {
                mapping.fold_char(c) as u8
            } else {
                i as u8
            };
        }
        Self { table }
    }

    /// Build from a caller-supplied 256-byte table.
    pub fn from_raw(table: [u8; 256]) -> Self {
        Self { table }
    }

    /// Fold a byte string through the table.
    pub fn fold_bytes(&self, s: &[u8]) -> Vec<u8> {
        s.iter().map(|&b| self.table[b as usize]).collect()
    }
}

impl std::fmt::Debug for FoldTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoldTable").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1459_fold() {
        let m = CaseMapping::Rfc1459;
        assert_eq!(m.fold("HELLO"), "hello");
        assert_eq!(m.fold("#Chan[1]"), "#chan{1}");
        assert_eq!(m.fold("Nick\\Away"), "nick|away");
        assert_eq!(m.fold("Test~Name"), "test^name");
    }

    #[test]
    fn test_strict_keeps_tilde() {
        let m = CaseMapping::StrictRfc1459;
        assert_eq!(m.fold("a~b"), "a~b");
        assert_eq!(m.fold("[x]"), "{x}");
    }

    #[test]
    fn test_ascii_fold() {
        let m = CaseMapping::Ascii;
        assert_eq!(m.fold("Nick[1]"), "nick[1]");
        assert!(m.eq("ABC", "abc"));
        assert!(!m.eq("[a]", "{a}"));
    }

    #[test]
    fn test_eq() {
        let m = CaseMapping::Rfc1459;
        assert!(m.eq("#channel[1]", "#CHANNEL{1}"));
        assert!(!m.eq("short", "longer"));
    }

    #[test]
    fn test_fold_table_matches_mapping() {
        let t = FoldTable::new(CaseMapping::Rfc1459);
        assert_eq!(t.fold_bytes(b"AbC[~"), b"abc{^");
    }
}
