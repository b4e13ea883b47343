//! The mode system: handler table, parser, stacking and list-mode base
//!
//! Every mode letter is backed by a `ModeHandler` registered in the
//! `ModeRegistry` under (letter, kind). The parser turns a `+/-` sequence
//! with positional parameters into validated `ModeChange`s; the stacker
//! re-canonicalizes changes into output lines, splitting parametered
//! changes at the configured per-line maximum.

use crate::channel::{Channel, MemberPrefix};
use crate::config::ChannelConfig;
use crate::user::User;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Which namespace a mode letter lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    User,
    Channel,
}

/// Outcome of a mode-change permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeVerdict {
    Allow,
    Deny,
}

/// Who is asking for a mode change.
#[derive(Debug, Clone, Copy)]
pub struct ModeSource<'a> {
    /// Membership rank of the source in the target channel (0 for none)
    pub rank: u32,
    /// Servers bypass rank checks entirely
    pub is_server: bool,
    pub is_oper: bool,
    /// Nick or server name, for attribution
    pub name: &'a str,
}

impl<'a> ModeSource<'a> {
    pub fn server(name: &'a str) -> Self {
        Self {
            rank: 0,
            is_server: true,
            is_oper: false,
            name,
        }
    }
}

/// One validated mode change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub adding: bool,
    pub letter: char,
    pub param: Option<String>,
}

/// Capability set implemented by every mode letter.
pub trait ModeHandler: Send + Sync {
    fn letter(&self) -> char;
    fn kind(&self) -> ModeKind;

    /// Whether this mode consumes a parameter in the given direction.
    fn needs_param(&self, adding: bool) -> bool;

    fn is_list_mode(&self) -> bool {
        false
    }

    /// Rank granted when this is a prefix mode.
    fn prefix_rank(&self) -> Option<u32> {
        None
    }

    /// Minimum channel rank required to change this mode.
    fn required_rank(&self) -> u32 {
        30
    }

    /// Permission check; parameter validation belongs here too.
    fn on_change(&self, source: &ModeSource<'_>, adding: bool, param: Option<&str>) -> ModeVerdict {
        let _ = (adding, param);
        if source.is_server || source.rank >= self.required_rank() {
            ModeVerdict::Allow
        } else {
            ModeVerdict::Deny
        }
    }

    /// Whether the mode is currently set on the channel, with its
    /// canonical parameter. Used by the TS merge.
    fn mode_set(&self, channel: &Channel) -> (bool, String) {
        (channel.has_mode(self.letter()), String::new())
    }

    /// Equal-TS parametric conflict: return true to keep our value.
    fn check_timestamp(&self, theirs: &str, ours: &str) -> bool {
        // Textually smaller value wins, both sides agree without talking.
        ours <= theirs
    }
}

/// Simple on/off channel mode (+n, +t, +m, +i, +s, +p).
struct SimpleChannelMode {
    letter: char,
    required: u32,
}

impl ModeHandler for SimpleChannelMode {
    fn letter(&self) -> char {
        self.letter
    }
    fn kind(&self) -> ModeKind {
        ModeKind::Channel
    }
    fn needs_param(&self, _adding: bool) -> bool {
        false
    }
    fn required_rank(&self) -> u32 {
        self.required
    }
}

/// Simple on/off user mode (+i, +w, +s). Oper mode +o is special-cased:
/// it can only be removed by MODE, never added.
struct SimpleUserMode {
    letter: char,
}

impl ModeHandler for SimpleUserMode {
    fn letter(&self) -> char {
        self.letter
    }
    fn kind(&self) -> ModeKind {
        ModeKind::User
    }
    fn needs_param(&self, _adding: bool) -> bool {
        false
    }
    fn on_change(&self, source: &ModeSource<'_>, adding: bool, _param: Option<&str>) -> ModeVerdict {
        if self.letter == 'o' && adding && !source.is_server {
            // Oper status comes from OPER / OPERTYPE only.
            return ModeVerdict::Deny;
        }
        ModeVerdict::Allow
    }
}

/// Channel key (+k).
struct KeyMode;

impl ModeHandler for KeyMode {
    fn letter(&self) -> char {
        'k'
    }
    fn kind(&self) -> ModeKind {
        ModeKind::Channel
    }
    fn needs_param(&self, _adding: bool) -> bool {
        true
    }
    fn on_change(&self, source: &ModeSource<'_>, adding: bool, param: Option<&str>) -> ModeVerdict {
        if !source.is_server && source.rank < self.required_rank() {
            return ModeVerdict::Deny;
        }
        if adding {
            match param {
                Some(key) if !key.is_empty() && !key.contains([' ', ',']) => ModeVerdict::Allow,
                _ => ModeVerdict::Deny,
            }
        } else {
            ModeVerdict::Allow
        }
    }
    fn mode_set(&self, channel: &Channel) -> (bool, String) {
        (
            channel.key.is_some(),
            channel.key.clone().unwrap_or_default(),
        )
    }
}

/// Member limit (+l).
struct LimitMode;

impl ModeHandler for LimitMode {
    fn letter(&self) -> char {
        'l'
    }
    fn kind(&self) -> ModeKind {
        ModeKind::Channel
    }
    fn needs_param(&self, adding: bool) -> bool {
        adding
    }
    fn on_change(&self, source: &ModeSource<'_>, adding: bool, param: Option<&str>) -> ModeVerdict {
        if !source.is_server && source.rank < self.required_rank() {
            return ModeVerdict::Deny;
        }
        if adding {
            match param.and_then(|p| p.parse::<u32>().ok()) {
                Some(n) if n > 0 => ModeVerdict::Allow,
                _ => ModeVerdict::Deny,
            }
        } else {
            ModeVerdict::Allow
        }
    }
    fn mode_set(&self, channel: &Channel) -> (bool, String) {
        (
            channel.limit.is_some(),
            channel.limit.map(|l| l.to_string()).unwrap_or_default(),
        )
    }
    fn check_timestamp(&self, theirs: &str, ours: &str) -> bool {
        // Numerically smaller limit wins.
        let ours_n = ours.parse::<u32>().unwrap_or(u32::MAX);
        let theirs_n = theirs.parse::<u32>().unwrap_or(u32::MAX);
        ours_n <= theirs_n
    }
}

/// The shared list-mode handler (+b, +e, +I and extensions): storage
/// itself lives in the channel's `ListModeStore`s.
struct ListMode {
    letter: char,
    required: u32,
}

impl ModeHandler for ListMode {
    fn letter(&self) -> char {
        self.letter
    }
    fn kind(&self) -> ModeKind {
        ModeKind::Channel
    }
    fn needs_param(&self, _adding: bool) -> bool {
        true
    }
    fn is_list_mode(&self) -> bool {
        true
    }
    fn required_rank(&self) -> u32 {
        self.required
    }
}

/// Prefix mode (+v/+h/+o/+a/+q): decorates a member and grants rank.
struct PrefixMode {
    letter: char,
    rank: u32,
    /// Rank needed to grant/remove; founder and admin require more than op
    required: u32,
}

impl ModeHandler for PrefixMode {
    fn letter(&self) -> char {
        self.letter
    }
    fn kind(&self) -> ModeKind {
        ModeKind::Channel
    }
    fn needs_param(&self, _adding: bool) -> bool {
        true
    }
    fn prefix_rank(&self) -> Option<u32> {
        Some(self.rank)
    }
    fn required_rank(&self) -> u32 {
        self.required
    }
}

/// Mode-handler table for both namespaces.
pub struct ModeRegistry {
    handlers: HashMap<(char, ModeKind), Arc<dyn ModeHandler>>,
}

impl ModeRegistry {
    /// Build the registry with the standard mode set, honouring the
    /// channel feature flags from configuration.
    pub fn with_defaults(channel_config: &ChannelConfig) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };

        for (letter, required) in [('n', 30), ('t', 30), ('m', 30), ('i', 30), ('s', 30), ('p', 30)]
        {
            registry.register(Arc::new(SimpleChannelMode { letter, required }));
        }
        registry.register(Arc::new(KeyMode));
        registry.register(Arc::new(LimitMode));
        for letter in ['b', 'e', 'I'] {
            registry.register(Arc::new(ListMode {
                letter,
                required: 20,
            }));
        }

        registry.register(Arc::new(PrefixMode {
            letter: 'v',
            rank: 10,
            required: 20,
        }));
        if channel_config.halfop {
            registry.register(Arc::new(PrefixMode {
                letter: 'h',
                rank: 20,
                required: 30,
            }));
        }
        registry.register(Arc::new(PrefixMode {
            letter: 'o',
            rank: 30,
            required: 30,
        }));
        if channel_config.admin {
            registry.register(Arc::new(PrefixMode {
                letter: 'a',
                rank: 40,
                required: 40,
            }));
        }
        if channel_config.founder_on_create {
            registry.register(Arc::new(PrefixMode {
                letter: 'q',
                rank: 50,
                required: 50,
            }));
        }

        for letter in ['i', 'w', 's', 'o'] {
            registry.register(Arc::new(SimpleUserMode { letter }));
        }

        registry
    }

    /// Register (or replace) a handler.
    pub fn register(&mut self, handler: Arc<dyn ModeHandler>) {
        self.handlers
            .insert((handler.letter(), handler.kind()), handler);
    }

    pub fn get(&self, letter: char, kind: ModeKind) -> Option<&Arc<dyn ModeHandler>> {
        self.handlers.get(&(letter, kind))
    }

    /// All prefix-mode letters ordered by descending rank.
    pub fn prefix_letters(&self) -> Vec<(char, u32)> {
        let mut letters: Vec<(char, u32)> = self
            .handlers
            .values()
            .filter(|h| h.kind() == ModeKind::Channel)
            .filter_map(|h| h.prefix_rank().map(|r| (h.letter(), r)))
            .collect();
        letters.sort_by(|a, b| b.1.cmp(&a.1));
        letters
    }

    /// The CHANMODES ISUPPORT groups: list, param-always, param-on-set, flag.
    pub fn chanmodes_token(&self) -> String {
        let mut groups: [Vec<char>; 4] = Default::default();
        for handler in self.handlers.values() {
            if handler.kind() != ModeKind::Channel || handler.prefix_rank().is_some() {
                continue;
            }
            let idx = if handler.is_list_mode() {
                0
            } else if handler.needs_param(true) && handler.needs_param(false) {
                1
            } else if handler.needs_param(true) {
                2
            } else {
                3
            };
            groups[idx].push(handler.letter());
        }
        for g in groups.iter_mut() {
            g.sort_unstable();
        }
        groups
            .iter()
            .map(|g| g.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The PREFIX ISUPPORT token, e.g. `(qaohv)~&@%+`.
    pub fn prefix_token(&self) -> String {
        let ordered = self.prefix_letters();
        let letters: String = ordered.iter().map(|(l, _)| *l).collect();
        let symbols: String = ordered
            .iter()
            .filter_map(|(_, rank)| match rank {
                50 => Some('~'),
                40 => Some('&'),
                30 => Some('@'),
                20 => Some('%'),
                10 => Some('+'),
                _ => None,
            })
            .collect();
        format!("({}){}", letters, symbols)
    }
}

/// Parse a mode sequence with positional parameters into changes.
///
/// Unknown letters produce `Error::UnknownCommand`-style failures carried
/// as the offending letter so the caller can pick the right numeric
/// (472 for channels, 501 for users). A list mode with no parameter on
/// `+` is a list query and is returned with `param: None`.
pub fn parse_mode_string(
    registry: &ModeRegistry,
    kind: ModeKind,
    mode_str: &str,
    params: &[String],
) -> Result<Vec<ModeChange>> {
    let mut changes = Vec::new();
    let mut adding = true;
    let mut param_idx = 0usize;

    for c in mode_str.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            letter => {
                let handler = registry
                    .get(letter, kind)
                    .ok_or_else(|| Error::UnknownCommand(letter.to_string()))?;
                let param = if handler.needs_param(adding) {
                    let p = params.get(param_idx).cloned();
                    if p.is_some() {
                        param_idx += 1;
                    } else if !handler.is_list_mode() {
                        // Parametric mode with no parameter: ignore it,
                        // matching classic parser behaviour.
                        continue;
                    }
                    p
                } else {
                    None
                };
                changes.push(ModeChange {
                    adding,
                    letter,
                    param,
                });
            }
        }
    }
    Ok(changes)
}

/// Re-canonicalize applied changes into wire mode strings.
///
/// Like-signed runs are stacked; output is split whenever
/// `max_params_per_line` parametered changes have been emitted.
pub fn stack_mode_changes(
    changes: &[ModeChange],
    max_params_per_line: usize,
) -> Vec<(String, Vec<String>)> {
    let mut lines = Vec::new();
    let mut modes = String::new();
    let mut params: Vec<String> = Vec::new();
    let mut sign: Option<bool> = None;

    for change in changes {
        if params.len() >= max_params_per_line && change.param.is_some() {
            lines.push((std::mem::take(&mut modes), std::mem::take(&mut params)));
            sign = None;
        }
        if sign != Some(change.adding) {
            modes.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        modes.push(change.letter);
        if let Some(ref p) = change.param {
            params.push(p.clone());
        }
    }
    if !modes.is_empty() {
        lines.push((modes, params));
    }
    lines
}

/// Apply one validated change to a channel. Prefix-mode parameters must
/// already be resolved to member UIDs. Returns false when the change was
/// a no-op (already set, not present, list full).
pub fn apply_channel_change(
    registry: &ModeRegistry,
    channel: &mut Channel,
    change: &ModeChange,
    setter: &str,
    now: i64,
    list_limit: usize,
) -> bool {
    let handler = match registry.get(change.letter, ModeKind::Channel) {
        Some(h) => h.clone(),
        None => return false,
    };

    if let Some(_rank) = handler.prefix_rank() {
        let bit = match MemberPrefix::from_mode_letter(change.letter) {
            Some(b) => b,
            None => return false,
        };
        let uid = match change.param {
            Some(ref uid) => uid,
            None => return false,
        };
        if let Some(prefix) = channel.members.get_mut(uid) {
            if change.adding {
                if prefix.contains(bit) {
                    return false;
                }
                prefix.insert(bit);
            } else {
                if !prefix.contains(bit) {
                    return false;
                }
                prefix.remove(bit);
            }
            return true;
        }
        return false;
    }

    if handler.is_list_mode() {
        let param = match change.param {
            Some(ref p) => p.clone(),
            None => return false,
        };
        let store = match channel.list_store_mut(change.letter) {
            Some(s) => s,
            None => return false,
        };
        return if change.adding {
            store.add(&param, setter, now, list_limit)
        } else {
            store.remove(&param)
        };
    }

    match change.letter {
        'k' => {
            if change.adding {
                let key = change.param.clone().unwrap_or_default();
                if channel.key.as_deref() == Some(key.as_str()) {
                    return false;
                }
                channel.key = Some(key);
            } else {
                if channel.key.is_none() {
                    return false;
                }
                channel.key = None;
            }
            true
        }
        'l' => {
            if change.adding {
                let limit = change.param.as_deref().and_then(|p| p.parse().ok());
                match limit {
                    Some(l) if channel.limit != Some(l) => {
                        channel.limit = Some(l);
                        true
                    }
                    _ => false,
                }
            } else {
                if channel.limit.is_none() {
                    return false;
                }
                channel.limit = None;
                true
            }
        }
        letter => {
            if change.adding {
                channel.modes.insert(letter)
            } else {
                channel.modes.remove(&letter)
            }
        }
    }
}

/// Apply one validated change to a user's mode set.
pub fn apply_user_change(user: &mut User, change: &ModeChange) -> bool {
    if change.adding {
        user.modes.insert(change.letter)
    } else {
        user.modes.remove(&change.letter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModeRegistry {
        ModeRegistry::with_defaults(&ChannelConfig::default())
    }

    fn source_op() -> ModeSource<'static> {
        ModeSource {
            rank: 30,
            is_server: false,
            is_oper: false,
            name: "alice",
        }
    }

    #[test]
    fn test_parse_simple() {
        let r = registry();
        let changes =
            parse_mode_string(&r, ModeKind::Channel, "+nt-m", &[]).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes[0].adding && changes[0].letter == 'n');
        assert!(!changes[2].adding && changes[2].letter == 'm');
    }

    #[test]
    fn test_parse_positional_params() {
        let r = registry();
        let params = vec!["secret".to_string(), "10".to_string()];
        let changes = parse_mode_string(&r, ModeKind::Channel, "+kl", &params).unwrap();
        assert_eq!(changes[0].param.as_deref(), Some("secret"));
        assert_eq!(changes[1].param.as_deref(), Some("10"));
    }

    #[test]
    fn test_parse_unknown_letter() {
        let r = registry();
        assert!(parse_mode_string(&r, ModeKind::Channel, "+X", &[]).is_err());
    }

    #[test]
    fn test_limit_removal_takes_no_param() {
        let r = registry();
        let changes = parse_mode_string(&r, ModeKind::Channel, "-l", &[]).unwrap();
        assert_eq!(changes[0].param, None);
    }

    #[test]
    fn test_list_query_without_param() {
        let r = registry();
        let changes = parse_mode_string(&r, ModeKind::Channel, "+b", &[]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].param, None);
    }

    #[test]
    fn test_stacking_splits_at_max() {
        let changes: Vec<ModeChange> = (0..5)
            .map(|i| ModeChange {
                adding: true,
                letter: 'b',
                param: Some(format!("mask{}", i)),
            })
            .collect();
        let lines = stack_mode_changes(&changes, 3);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, "+bbb");
        assert_eq!(lines[0].1.len(), 3);
        assert_eq!(lines[1].0, "+bb");
    }

    #[test]
    fn test_stacking_combines_signs() {
        let changes = vec![
            ModeChange {
                adding: true,
                letter: 'n',
                param: None,
            },
            ModeChange {
                adding: true,
                letter: 't',
                param: None,
            },
            ModeChange {
                adding: false,
                letter: 'm',
                param: None,
            },
        ];
        let lines = stack_mode_changes(&changes, 20);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, "+nt-m");
    }

    #[test]
    fn test_apply_key_and_limit() {
        let r = registry();
        let mut chan = Channel::new("#a".to_string(), 100);
        assert!(apply_channel_change(
            &r,
            &mut chan,
            &ModeChange {
                adding: true,
                letter: 'k',
                param: Some("secret".into())
            },
            "alice",
            100,
            64,
        ));
        assert_eq!(chan.key.as_deref(), Some("secret"));
        // Re-applying the same key is a no-op.
        assert!(!apply_channel_change(
            &r,
            &mut chan,
            &ModeChange {
                adding: true,
                letter: 'k',
                param: Some("secret".into())
            },
            "alice",
            100,
            64,
        ));
    }

    #[test]
    fn test_apply_prefix_change() {
        let r = registry();
        let mut chan = Channel::new("#a".to_string(), 100);
        chan.members.insert("042AAAAAA".into(), MemberPrefix::NONE);
        assert!(apply_channel_change(
            &r,
            &mut chan,
            &ModeChange {
                adding: true,
                letter: 'o',
                param: Some("042AAAAAA".into())
            },
            "alice",
            100,
            64,
        ));
        assert!(chan.member_prefix("042AAAAAA").contains(MemberPrefix::OP));
        // Unknown member is refused.
        assert!(!apply_channel_change(
            &r,
            &mut chan,
            &ModeChange {
                adding: true,
                letter: 'o',
                param: Some("042AAAAAZ".into())
            },
            "alice",
            100,
            64,
        ));
    }

    #[test]
    fn test_user_oper_mode_cannot_be_added() {
        let r = registry();
        let h = r.get('o', ModeKind::User).unwrap();
        assert_eq!(
            h.on_change(&source_op(), true, None),
            ModeVerdict::Deny
        );
        assert_eq!(
            h.on_change(&source_op(), false, None),
            ModeVerdict::Allow
        );
    }

    #[test]
    fn test_limit_timestamp_tiebreak() {
        let r = registry();
        let h = r.get('l', ModeKind::Channel).unwrap();
        assert!(h.check_timestamp("50", "10"), "smaller limit kept");
        assert!(!h.check_timestamp("10", "50"));
    }

    #[test]
    fn test_isupport_tokens() {
        let r = registry();
        assert_eq!(r.prefix_token(), "(ohv)@%+");
        assert_eq!(r.chanmodes_token(), "Ibe,k,l,imnpst");
    }
}
