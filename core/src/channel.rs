//! Channel objects, membership prefixes and list-mode storage

use std::collections::{HashMap, HashSet};

/// Membership status bits. Higher rank outranks lower in permission
/// checks; a member may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberPrefix(u8);

impl MemberPrefix {
    pub const NONE: MemberPrefix = MemberPrefix(0);
    pub const VOICE: MemberPrefix = MemberPrefix(1);
    pub const HALFOP: MemberPrefix = MemberPrefix(2);
    pub const OP: MemberPrefix = MemberPrefix(4);
    pub const ADMIN: MemberPrefix = MemberPrefix(8);
    pub const FOUNDER: MemberPrefix = MemberPrefix(16);

    pub fn contains(&self, other: MemberPrefix) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MemberPrefix) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MemberPrefix) {
        self.0 &= !other.0;
    }

    pub fn union(&self, other: MemberPrefix) -> MemberPrefix {
        MemberPrefix(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Numeric rank of the highest status held (0 for a plain member).
    pub fn rank(&self) -> u32 {
        if self.contains(Self::FOUNDER) {
            50
        } else if self.contains(Self::ADMIN) {
            40
        } else if self.contains(Self::OP) {
            30
        } else if self.contains(Self::HALFOP) {
            20
        } else if self.contains(Self::VOICE) {
            10
        } else {
            0
        }
    }

    /// The status symbol shown in NAMES for the highest bit, if any.
    pub fn symbol(&self) -> Option<char> {
        match self.rank() {
            50 => Some('~'),
            40 => Some('&'),
            30 => Some('@'),
            20 => Some('%'),
            10 => Some('+'),
            _ => None,
        }
    }

    /// Every held status as prefix symbols, highest first (FJOIN form).
    pub fn all_symbols(&self) -> String {
        let mut s = String::new();
        for (bit, sym) in [
            (Self::FOUNDER, '~'),
            (Self::ADMIN, '&'),
            (Self::OP, '@'),
            (Self::HALFOP, '%'),
            (Self::VOICE, '+'),
        ] {
            if self.contains(bit) {
                s.push(sym);
            }
        }
        s
    }

    /// Every held status as mode letters, highest first.
    pub fn mode_letters(&self) -> Vec<char> {
        let mut letters = Vec::new();
        for (bit, letter) in [
            (Self::FOUNDER, 'q'),
            (Self::ADMIN, 'a'),
            (Self::OP, 'o'),
            (Self::HALFOP, 'h'),
            (Self::VOICE, 'v'),
        ] {
            if self.contains(bit) {
                letters.push(letter);
            }
        }
        letters
    }

    /// Single bit for a prefix mode letter.
    pub fn from_mode_letter(letter: char) -> Option<MemberPrefix> {
        match letter {
            'v' => Some(Self::VOICE),
            'h' => Some(Self::HALFOP),
            'o' => Some(Self::OP),
            'a' => Some(Self::ADMIN),
            'q' => Some(Self::FOUNDER),
            _ => None,
        }
    }

    /// Single bit for a status symbol.
    pub fn from_symbol(symbol: char) -> Option<MemberPrefix> {
        match symbol {
            '+' => Some(Self::VOICE),
            '%' => Some(Self::HALFOP),
            '@' => Some(Self::OP),
            '&' => Some(Self::ADMIN),
            '~' => Some(Self::FOUNDER),
            _ => None,
        }
    }
}

/// One entry in a ban/except/invex list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub mask: String,
    pub setter: String,
    pub set_time: i64,
}

/// The shared list-mode implementation: an ordered, bounded, duplicate-
/// refusing list of masks with attribution. Bans, excepts and invexes
/// all reuse this one type.
#[derive(Debug, Clone, Default)]
pub struct ListModeStore {
    entries: Vec<ListEntry>,
}

impl ListModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mask. Refuses duplicates and entries past `limit`.
    pub fn add(&mut self, mask: &str, setter: &str, set_time: i64, limit: usize) -> bool {
        if self.entries.len() >= limit {
            return false;
        }
        if self.entries.iter().any(|e| e.mask == mask) {
            return false;
        }
        self.entries.push(ListEntry {
            mask: mask.to_string(),
            setter: setter.to_string(),
            set_time,
        });
        true
    }

    /// Remove a mask. Returns whether it was present.
    pub fn remove(&mut self, mask: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.mask != mask);
        self.entries.len() != before
    }

    pub fn contains(&self, mask: &str) -> bool {
        self.entries.iter().any(|e| e.mask == mask)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Channel topic attribution.
#[derive(Debug, Clone, Default)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: i64,
}

/// One channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel name, `#`-prefixed
    pub name: String,
    /// Creation age; the TS used in merge resolution
    pub ts: i64,
    /// Topic, if one has been set
    pub topic: Option<Topic>,
    /// Simple modes currently set
    pub modes: HashSet<char>,
    /// +k key
    pub key: Option<String>,
    /// +l member limit
    pub limit: Option<u32>,
    /// +b list
    pub bans: ListModeStore,
    /// +e list
    pub excepts: ListModeStore,
    /// +I list
    pub invexes: ListModeStore,
    /// Members: uid -> status bits
    pub members: HashMap<String, MemberPrefix>,
    /// Users invited past +i (consumed on join)
    pub invited: HashSet<String>,
    /// Module extension table, propagated via METADATA
    pub metadata: HashMap<String, String>,
}

impl Channel {
    pub fn new(name: String, ts: i64) -> Self {
        Self {
            name,
            ts,
            topic: None,
            modes: HashSet::new(),
            key: None,
            limit: None,
            bans: ListModeStore::new(),
            excepts: ListModeStore::new(),
            invexes: ListModeStore::new(),
            members: HashMap::new(),
            invited: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }

    /// Simple modes plus parametric values as a `+`-string; the key is
    /// replaced by `<key>` unless `show_params` is set (burst form).
    pub fn modes_string(&self, show_params: bool) -> String {
        let mut letters: Vec<char> = self.modes.iter().copied().collect();
        letters.sort_unstable();
        let mut s = String::from("+");
        s.extend(letters.iter());
        let mut params = Vec::new();
        if self.key.is_some() {
            s.push('k');
            params.push(if show_params {
                self.key.clone().unwrap_or_default()
            } else {
                "<key>".to_string()
            });
        }
        if let Some(limit) = self.limit {
            s.push('l');
            params.push(limit.to_string());
        }
        for p in params {
            s.push(' ');
            s.push_str(&p);
        }
        s
    }

    /// The list store for a list-mode letter.
    pub fn list_store(&self, letter: char) -> Option<&ListModeStore> {
        match letter {
            'b' => Some(&self.bans),
            'e' => Some(&self.excepts),
            'I' => Some(&self.invexes),
            _ => None,
        }
    }

    pub fn list_store_mut(&mut self, letter: char) -> Option<&mut ListModeStore> {
        match letter {
            'b' => Some(&mut self.bans),
            'e' => Some(&mut self.excepts),
            'I' => Some(&mut self.invexes),
            _ => None,
        }
    }

    pub fn member_prefix(&self, uid: &str) -> MemberPrefix {
        self.members.get(uid).copied().unwrap_or(MemberPrefix::NONE)
    }

    pub fn is_member(&self, uid: &str) -> bool {
        self.members.contains_key(uid)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Strip every member's status bits, returning what was removed so
    /// the caller can emit the documenting FMODE lines. Used when this
    /// side loses a TS comparison.
    pub fn strip_all_prefixes(&mut self) -> Vec<(String, MemberPrefix)> {
        let mut stripped = Vec::new();
        for (uid, prefix) in self.members.iter_mut() {
            if !prefix.is_empty() {
                stripped.push((uid.clone(), *prefix));
                *prefix = MemberPrefix::NONE;
            }
        }
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_bits() {
        let mut p = MemberPrefix::NONE;
        assert!(p.is_empty());
        p.insert(MemberPrefix::VOICE);
        p.insert(MemberPrefix::OP);
        assert!(p.contains(MemberPrefix::VOICE));
        assert_eq!(p.rank(), 30);
        assert_eq!(p.symbol(), Some('@'));
        assert_eq!(p.all_symbols(), "@+");
        assert_eq!(p.mode_letters(), vec!['o', 'v']);
        p.remove(MemberPrefix::OP);
        assert_eq!(p.rank(), 10);
    }

    #[test]
    fn test_prefix_letter_symbol_mapping() {
        assert_eq!(MemberPrefix::from_mode_letter('o'), Some(MemberPrefix::OP));
        assert_eq!(MemberPrefix::from_symbol('~'), Some(MemberPrefix::FOUNDER));
        assert_eq!(MemberPrefix::from_mode_letter('x'), None);
    }

    #[test]
    fn test_list_store_bounds_and_dups() {
        let mut store = ListModeStore::new();
        assert!(store.add("*!*@spam.example", "oper", 100, 2));
        assert!(!store.add("*!*@spam.example", "oper", 101, 2), "duplicate");
        assert!(store.add("*!*@other.example", "oper", 102, 2));
        assert!(!store.add("*!*@third.example", "oper", 103, 2), "over limit");
        assert!(store.remove("*!*@spam.example"));
        assert!(!store.remove("*!*@spam.example"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_strip_all_prefixes() {
        let mut chan = Channel::new("#a".to_string(), 500);
        chan.members.insert("042AAAAAA".into(), MemberPrefix::OP);
        chan.members.insert("042AAAAAB".into(), MemberPrefix::VOICE);
        chan.members.insert("042AAAAAC".into(), MemberPrefix::NONE);

        let stripped = chan.strip_all_prefixes();
        assert_eq!(stripped.len(), 2);
        assert!(chan.members.values().all(|p| p.is_empty()));
    }

    #[test]
    fn test_modes_string() {
        let mut chan = Channel::new("#a".to_string(), 500);
        chan.modes.insert('n');
        chan.modes.insert('t');
        chan.key = Some("secret".to_string());
        chan.limit = Some(10);
        assert_eq!(chan.modes_string(true), "+ntkl secret 10");
        assert_eq!(chan.modes_string(false), "+ntkl <key> 10");
    }
}
