//! User records and UID allocation

use crate::Prefix;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Registration progress of a local connection.
///
/// Only a fully registered (`All`) user enters the nickname hash and may
/// appear in channel member lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    None,
    /// NICK seen, USER outstanding
    NickSeen,
    /// USER seen, NICK outstanding
    UserSeen,
    /// Fully registered
    All,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::All)
    }

    /// Advance the state machine on a NICK command.
    pub fn on_nick(self) -> Self {
        match self {
            RegistrationState::None | RegistrationState::NickSeen => RegistrationState::NickSeen,
            RegistrationState::UserSeen | RegistrationState::All => RegistrationState::All,
        }
    }

    /// Advance the state machine on a USER command.
    pub fn on_user(self) -> Self {
        match self {
            RegistrationState::None | RegistrationState::UserSeen => RegistrationState::UserSeen,
            RegistrationState::NickSeen | RegistrationState::All => RegistrationState::All,
        }
    }
}

/// One user, local or remote.
#[derive(Debug, Clone)]
pub struct User {
    /// Network-unique id; first three characters are the introducing
    /// server's SID. Never reused.
    pub uid: String,
    /// Nickname
    pub nick: String,
    /// Ident (username)
    pub ident: String,
    /// Real hostname
    pub host: String,
    /// Displayed hostname
    pub dhost: String,
    /// Real name
    pub gecos: String,
    /// IP address as text
    pub ip: String,
    /// Name of the server this user is on
    pub server: String,
    /// Signon time (Unix seconds)
    pub signon: i64,
    /// Nickname age, the TS used in collision resolution
    pub ts: i64,
    /// User modes
    pub modes: HashSet<char>,
    /// Channels this user is in (back-index of channel membership)
    pub channels: HashSet<String>,
    /// Local connection id; None for remote users
    pub local_id: Option<Uuid>,
    /// Away message, if any
    pub away: Option<String>,
    /// Oper type string; empty when not an oper
    pub oper_type: Option<String>,
    /// Snomask letters this oper subscribed to
    pub snomasks: HashSet<char>,
    /// Module extension table, propagated via METADATA
    pub metadata: HashMap<String, String>,
}

impl User {
    /// Create a locally connected user.
    pub fn new_local(
        uid: String,
        nick: String,
        ident: String,
        host: String,
        gecos: String,
        ip: String,
        server: String,
        local_id: Uuid,
        now: i64,
    ) -> Self {
        Self {
            uid,
            nick,
            ident,
            dhost: host.clone(),
            host,
            gecos,
            ip,
            server,
            signon: now,
            ts: now,
            modes: HashSet::new(),
            channels: HashSet::new(),
            local_id: Some(local_id),
            away: None,
            oper_type: None,
            snomasks: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// Create a user introduced by a remote server (UID line).
    #[allow(clippy::too_many_arguments)]
    pub fn new_remote(
        uid: String,
        nick: String,
        ident: String,
        host: String,
        dhost: String,
        gecos: String,
        ip: String,
        server: String,
        ts: i64,
    ) -> Self {
        Self {
            uid,
            nick,
            ident,
            host,
            dhost,
            gecos,
            ip,
            server,
            signon: ts,
            ts,
            modes: HashSet::new(),
            channels: HashSet::new(),
            local_id: None,
            away: None,
            oper_type: None,
            snomasks: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// The SID of the server that introduced this user.
    pub fn sid(&self) -> &str {
        &self.uid[..3.min(self.uid.len())]
    }

    pub fn is_local(&self) -> bool {
        self.local_id.is_some()
    }

    pub fn is_oper(&self) -> bool {
        self.oper_type.is_some()
    }

    pub fn is_away(&self) -> bool {
        self.away.is_some()
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }

    pub fn set_mode(&mut self, mode: char) {
        self.modes.insert(mode);
    }

    pub fn unset_mode(&mut self, mode: char) {
        self.modes.remove(&mode);
    }

    /// User modes as a sorted `+`-prefixed string.
    pub fn modes_string(&self) -> String {
        let mut modes: Vec<char> = self.modes.iter().copied().collect();
        modes.sort_unstable();
        let mut s = String::from("+");
        s.extend(modes);
        s
    }

    /// Prefix for messages originated by this user (client protocol form).
    pub fn prefix(&self) -> Prefix {
        Prefix::User {
            nick: self.nick.clone(),
            user: self.ident.clone(),
            host: self.dhost.clone(),
        }
    }

    /// `user@host` form used by ban and x-line matching.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.ident, self.host)
    }

    /// `nick!user@host` for notices and kill trails.
    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.dhost)
    }

    /// Grant oper status.
    pub fn oper_up(&mut self, oper_type: String) {
        self.oper_type = Some(oper_type);
        self.modes.insert('o');
    }

    /// Remove oper status.
    pub fn oper_down(&mut self) {
        self.oper_type = None;
        self.modes.remove(&'o');
    }
}

/// Allocator for never-reused UIDs.
///
/// A UID is the 3-character SID followed by six characters from
/// `A-Z 0-9`, incremented like an odometer. Rollover is far beyond any
/// realistic uptime; the counter simply keeps its monotonic order.
pub struct UidGenerator {
    sid: String,
    counter: AtomicU64,
}

const UID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const UID_SUFFIX_LEN: usize = 6;

impl UidGenerator {
    pub fn new(sid: String) -> Self {
        Self {
            sid,
            counter: AtomicU64::new(0),
        }
    }

    /// The SID these UIDs are allocated under.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Allocate the next UID.
    pub fn next_uid(&self) -> String {
        let mut n = self.counter.fetch_add(1, Ordering::Relaxed);
        let base = UID_ALPHABET.len() as u64;
        let mut suffix = [0u8; UID_SUFFIX_LEN];
        for slot in suffix.iter_mut().rev() {
            *slot = UID_ALPHABET[(n % base) as usize];
            n /= base;
        }
        let mut uid = String::with_capacity(3 + UID_SUFFIX_LEN);
        uid.push_str(&self.sid);
        uid.push_str(std::str::from_utf8(&suffix).expect("uid alphabet is ascii"));
        uid
    }
}

/// Whether a string has the shape of a UID (SID + 6 alphanumerics).
pub fn looks_like_uid(s: &str) -> bool {
    s.len() == 9
        && crate::config::is_valid_sid(&s[..3])
        && s[3..]
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_transitions() {
        let s = RegistrationState::None;
        assert_eq!(s.on_nick(), RegistrationState::NickSeen);
        assert_eq!(s.on_user(), RegistrationState::UserSeen);
        assert_eq!(s.on_nick().on_user(), RegistrationState::All);
        assert_eq!(s.on_user().on_nick(), RegistrationState::All);
        assert!(s.on_nick().on_user().is_registered());
    }

    #[test]
    fn test_uid_generation() {
        let g = UidGenerator::new("042".to_string());
        let a = g.next_uid();
        let b = g.next_uid();
        assert_eq!(a, "042AAAAAA");
        assert_eq!(b, "042AAAAAB");
        assert_ne!(a, b);
        assert!(looks_like_uid(&a));
    }

    #[test]
    fn test_uid_odometer_carries() {
        let g = UidGenerator::new("001".to_string());
        for _ in 0..36 {
            g.next_uid();
        }
        assert_eq!(g.next_uid(), "001AAAABA");
    }

    #[test]
    fn test_looks_like_uid() {
        assert!(looks_like_uid("042AAAAAA"));
        assert!(!looks_like_uid("nickname"));
        assert!(!looks_like_uid("X42AAAAAA"));
        assert!(!looks_like_uid("042aaaaaa"));
    }

    #[test]
    fn test_modes_string_sorted() {
        let mut user = User::new_remote(
            "042AAAAAA".into(),
            "alice".into(),
            "a".into(),
            "host".into(),
            "host".into(),
            "Alice".into(),
            "10.0.0.1".into(),
            "irc.example.net".into(),
            100,
        );
        user.set_mode('w');
        user.set_mode('i');
        assert_eq!(user.modes_string(), "+iw");
    }
}
