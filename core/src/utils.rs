//! Small shared helpers: mask matching, duration parsing, validation

use crate::casemap::CaseMapping;

/// Match a string against an IRC wildcard mask (`*` and `?`).
///
/// Comparison is case-insensitive under the given mapping; masks in bans
/// and x-lines are matched this way throughout.
pub fn match_mask(mapping: CaseMapping, mask: &str, text: &str) -> bool {
    let mask: Vec<char> = mask.chars().map(|c| mapping.fold_char(c)).collect();
    let text: Vec<char> = text.chars().map(|c| mapping.fold_char(c)).collect();

    // Iterative glob with single backtrack point, the usual approach.
    let (mut m, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (None::<usize>, 0usize);
    while t < text.len() {
        if m < mask.len() && (mask[m] == '?' || mask[m] == text[t]) {
            m += 1;
            t += 1;
        } else if m < mask.len() && mask[m] == '*' {
            star = Some(m);
            star_t = t;
            m += 1;
        } else if let Some(s) = star {
            m = s + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while m < mask.len() && mask[m] == '*' {
        m += 1;
    }
    m == mask.len()
}

/// Match `user@host` (and, separately, `user@ip`) against a mask.
pub fn match_user_host(mapping: CaseMapping, mask: &str, ident: &str, host: &str) -> bool {
    match_mask(mapping, mask, &format!("{}@{}", ident, host))
}

/// Parse a ban-style duration: plain seconds, or `1d2h3m4s` units.
/// Returns `None` for `0`/empty (permanent).
pub fn parse_duration(s: &str) -> Option<u64> {
    if s.is_empty() || s == "0" {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(secs);
    }
    let mut total = 0u64;
    let mut acc = 0u64;
    for c in s.chars() {
        match c {
            '0'..='9' => acc = acc * 10 + (c as u64 - '0' as u64),
            'w' => {
                total += acc * 604_800;
                acc = 0;
            }
            'd' => {
                total += acc * 86_400;
                acc = 0;
            }
            'h' => {
                total += acc * 3_600;
                acc = 0;
            }
            'm' => {
                total += acc * 60;
                acc = 0;
            }
            's' => {
                total += acc;
                acc = 0;
            }
            _ => return None,
        }
    }
    total += acc;
    if total == 0 {
        None
    } else {
        Some(total)
    }
}

/// Current Unix time in seconds.
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Validate a nickname: leading letter or special, then letters, digits,
/// specials and `-`, within the length limit.
pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    if nick.is_empty() || nick.len() > max_len {
        return false;
    }
    let special = |c: char| "[]\\`_^{|}".contains(c);
    let mut chars = nick.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() && !special(first) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

/// Validate a channel name: `#`-prefixed, no spaces, commas or BEL.
pub fn is_valid_channel_name(name: &str, max_len: usize) -> bool {
    name.len() >= 2
        && name.len() <= max_len
        && name.starts_with('#')
        && !name.contains([' ', ',', '\x07'])
}

/// Split a comma list, dropping empty elements.
pub fn comma_split(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_mask() {
        let m = CaseMapping::Rfc1459;
        assert!(match_mask(m, "*!*@*.example.com", "nick!user@host.example.com"));
        assert!(match_mask(m, "a?c", "abc"));
        assert!(!match_mask(m, "a?c", "abbc"));
        assert!(match_mask(m, "*", "anything"));
        assert!(match_mask(m, "NICK*", "nick123"));
        assert!(!match_mask(m, "needle", "haystack"));
    }

    #[test]
    fn test_match_mask_casemap() {
        assert!(match_mask(CaseMapping::Rfc1459, "n[x]*", "N{X}abc"));
        assert!(!match_mask(CaseMapping::Ascii, "n[x]*", "N{X}abc"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Some(90));
        assert_eq!(parse_duration("1h30m"), Some(5400));
        assert_eq!(parse_duration("1d"), Some(86_400));
        assert_eq!(parse_duration("2w"), Some(1_209_600));
        assert_eq!(parse_duration("0"), None);
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_nick_validation() {
        assert!(is_valid_nick("alice", 30));
        assert!(is_valid_nick("[w]ombat", 30));
        assert!(!is_valid_nick("1alice", 30));
        assert!(!is_valid_nick("", 30));
        assert!(!is_valid_nick("toolongnick", 5));
    }

    #[test]
    fn test_channel_validation() {
        assert!(is_valid_channel_name("#rust", 64));
        assert!(!is_valid_channel_name("rust", 64));
        assert!(!is_valid_channel_name("#a,b", 64));
    }

    #[test]
    fn test_comma_split() {
        assert_eq!(comma_split("#a,#b,,#c"), vec!["#a", "#b", "#c"]);
        assert!(comma_split("").is_empty());
    }
}
