//! Network and local ban lines (G/K/Z/Q/E)
//!
//! Five ban kinds with independent lists. G, Z and Q propagate across
//! the network via ADDLINE/DELLINE and are replayed in burst; K is
//! local-only; E is a user@host whitelist that suppresses G and K
//! matches. Users are tested on registration completion and on every
//! successful nick change. Expiry is lazy on scan, with a periodic
//! sweep to keep the lists small.

use crate::casemap::CaseMapping;
use crate::user::User;
use crate::utils::{match_mask, unix_time};
use dashmap::DashMap;

/// The five ban kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XLineKind {
    /// user@host, network-wide
    G,
    /// user@host, this server only
    K,
    /// IP address, network-wide
    Z,
    /// Nickname, network-wide
    Q,
    /// user@host exemption from G and K
    E,
}

impl XLineKind {
    pub fn letter(&self) -> char {
        match self {
            XLineKind::G => 'G',
            XLineKind::K => 'K',
            XLineKind::Z => 'Z',
            XLineKind::Q => 'Q',
            XLineKind::E => 'E',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'G' => Some(XLineKind::G),
            'K' => Some(XLineKind::K),
            'Z' => Some(XLineKind::Z),
            'Q' => Some(XLineKind::Q),
            'E' => Some(XLineKind::E),
            _ => None,
        }
    }

    /// Whether lines of this kind propagate to the network.
    pub fn is_global(&self) -> bool {
        !matches!(self, XLineKind::K)
    }
}

/// One ban line.
#[derive(Debug, Clone)]
pub struct XLine {
    pub kind: XLineKind,
    pub mask: String,
    pub setter: String,
    pub set_time: i64,
    /// Seconds; 0 is permanent
    pub duration: u64,
    pub reason: String,
}

impl XLine {
    pub fn is_expired(&self, now: i64) -> bool {
        self.duration != 0 && now >= self.set_time + self.duration as i64
    }

    /// Whether this line matches a user, per-kind semantics.
    pub fn matches(&self, mapping: CaseMapping, user: &User) -> bool {
        match self.kind {
            XLineKind::G | XLineKind::K | XLineKind::E => {
                match_mask(mapping, &self.mask, &user.user_at_host())
                    || match_mask(
                        mapping,
                        &self.mask,
                        &format!("{}@{}", user.ident, user.ip),
                    )
            }
            XLineKind::Z => match_mask(mapping, &self.mask, &user.ip),
            XLineKind::Q => match_mask(mapping, &self.mask, &user.nick),
        }
    }
}

/// A user hit by a ban line, ready to be turned into a quit.
#[derive(Debug, Clone)]
pub struct XLineMatch {
    pub kind: XLineKind,
    pub mask: String,
    pub reason: String,
}

/// All five lists, indexed by mask within each kind.
pub struct XLineManager {
    lines: DashMap<(XLineKind, String), XLine>,
    mapping: CaseMapping,
}

impl XLineManager {
    pub fn new(mapping: CaseMapping) -> Self {
        Self {
            lines: DashMap::new(),
            mapping,
        }
    }

    /// Add a line. An existing line on the same mask is replaced.
    pub fn add(&self, line: XLine) {
        self.lines.insert((line.kind, line.mask.clone()), line);
    }

    /// Remove a line. Returns whether it existed.
    pub fn remove(&self, kind: XLineKind, mask: &str) -> bool {
        self.lines.remove(&(kind, mask.to_string())).is_some()
    }

    pub fn find(&self, kind: XLineKind, mask: &str) -> Option<XLine> {
        let line = self.lines.get(&(kind, mask.to_string()))?;
        if line.is_expired(unix_time()) {
            drop(line);
            self.lines.remove(&(kind, mask.to_string()));
            return None;
        }
        Some(line.clone())
    }

    /// All live lines of one kind.
    pub fn lines_of(&self, kind: XLineKind) -> Vec<XLine> {
        let now = unix_time();
        self.lines
            .iter()
            .filter(|e| e.kind == kind && !e.is_expired(now))
            .map(|e| e.clone())
            .collect()
    }

    /// Test a user against every applicable line. Expired lines are
    /// skipped; an E-line match exempts the user from G and K.
    pub fn check_user(&self, user: &User) -> Option<XLineMatch> {
        let now = unix_time();
        let live = |l: &XLine| !l.is_expired(now);

        let exempt = self
            .lines
            .iter()
            .any(|l| l.kind == XLineKind::E && live(&l) && l.matches(self.mapping, user));

        for entry in self.lines.iter() {
            if !live(&entry) || !entry.matches(self.mapping, user) {
                continue;
            }
            match entry.kind {
                XLineKind::E => continue,
                XLineKind::G | XLineKind::K if exempt => continue,
                _ => {}
            }
            return Some(XLineMatch {
                kind: entry.kind,
                mask: entry.mask.clone(),
                reason: entry.reason.clone(),
            });
        }
        None
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn expire_sweep(&self) -> usize {
        let now = unix_time();
        let expired: Vec<(XLineKind, String)> = self
            .lines
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.lines.remove(&key);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn manager() -> XLineManager {
        XLineManager::new(CaseMapping::Rfc1459)
    }

    fn user(nick: &str, ident: &str, host: &str, ip: &str) -> User {
        User::new_local(
            "042AAAAAA".to_string(),
            nick.to_string(),
            ident.to_string(),
            host.to_string(),
            "Real Name".to_string(),
            ip.to_string(),
            "irc.example.net".to_string(),
            Uuid::new_v4(),
            100,
        )
    }

    fn line(kind: XLineKind, mask: &str, duration: u64) -> XLine {
        XLine {
            kind,
            mask: mask.to_string(),
            setter: "oper".to_string(),
            set_time: unix_time(),
            duration,
            reason: "test ban".to_string(),
        }
    }

    #[test]
    fn test_gline_matches_user_at_host() {
        let m = manager();
        m.add(line(XLineKind::G, "*@*.bad.example", 0));
        let hit = m.check_user(&user("alice", "x", "shell.bad.example", "10.0.0.1"));
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().kind, XLineKind::G);
    }

    #[test]
    fn test_zline_matches_ip() {
        let m = manager();
        m.add(line(XLineKind::Z, "10.0.0.*", 0));
        assert!(m
            .check_user(&user("alice", "x", "irrelevant.example", "10.0.0.7"))
            .is_some());
        assert!(m
            .check_user(&user("alice", "x", "irrelevant.example", "192.168.0.1"))
            .is_none());
    }

    #[test]
    fn test_qline_matches_nick_case_folded() {
        let m = manager();
        m.add(line(XLineKind::Q, "services*", 0));
        assert!(m
            .check_user(&user("ServicesBot", "x", "h.example", "10.0.0.1"))
            .is_some());
    }

    #[test]
    fn test_eline_exempts_gline_but_not_zline() {
        let m = manager();
        m.add(line(XLineKind::G, "*@*.bad.example", 0));
        m.add(line(XLineKind::E, "good@*.bad.example", 0));
        assert!(m
            .check_user(&user("alice", "good", "shell.bad.example", "10.0.0.1"))
            .is_none());
        assert!(m
            .check_user(&user("alice", "evil", "shell.bad.example", "10.0.0.1"))
            .is_some());

        m.add(line(XLineKind::Z, "10.0.0.*", 0));
        assert!(
            m.check_user(&user("alice", "good", "shell.bad.example", "10.0.0.1"))
                .is_some(),
            "E-lines do not cover Z-lines"
        );
    }

    #[test]
    fn test_expired_line_ignored_and_swept() {
        let m = manager();
        let mut l = line(XLineKind::G, "*@*", 10);
        l.set_time = unix_time() - 60;
        m.add(l);
        assert!(m.check_user(&user("a", "b", "c.example", "10.0.0.1")).is_none());
        assert_eq!(m.expire_sweep(), 1);
        assert!(m.is_empty());
    }

    #[test]
    fn test_remove() {
        let m = manager();
        m.add(line(XLineKind::Q, "bad*", 0));
        assert!(m.remove(XLineKind::Q, "bad*"));
        assert!(!m.remove(XLineKind::Q, "bad*"));
    }
}
