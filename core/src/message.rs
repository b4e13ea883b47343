//! IRC message parsing and formatting
//!
//! One wire line is `[:prefix] COMMAND [params]... [:trailing]` terminated
//! by CR and/or LF. The same codec carries both the client protocol and
//! the server-to-server protocol; only the prefix conventions differ
//! (servers prefix with their SID or name, users with their UID or nick).

use serde::{Deserialize, Serialize};
use std::fmt;

/// IRC message prefix (server or user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name or SID
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl Prefix {
    /// The nick (or server name / bare UID) portion of the prefix.
    pub fn name(&self) -> &str {
        match self {
            Prefix::Server(name) => name,
            Prefix::User { nick, .. } => nick,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
        }
    }
}

/// A parsed IRC line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Optional prefix (server or user)
    pub prefix: Option<Prefix>,
    /// Command verb, uppercased, or a three-digit numeric
    pub command: String,
    /// Parameters; the final one may contain spaces
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Create a new message with prefix
    pub fn with_prefix(prefix: Prefix, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix),
            command: command.into(),
            params,
        }
    }

    /// Parse one IRC line. The terminator (CR, LF or both) may be present
    /// or already stripped; empty lines are a parse error, callers skip
    /// them before getting here.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let input = input.trim_end_matches(['\r', '\n']);
        if input.is_empty() {
            return Err(crate::Error::MessageParse("Empty message".to_string()));
        }

        let mut rest = input;

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix_str, remainder) = match stripped.split_once(' ') {
                Some(pair) => pair,
                None => {
                    return Err(crate::Error::MessageParse(
                        "Prefix with no command".to_string(),
                    ))
                }
            };
            rest = remainder.trim_start_matches(' ');
            Some(Self::parse_prefix(prefix_str)?)
        } else {
            None
        };

        // Trailing parameter: everything after the first " :" keeps its spaces.
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing.to_string())),
            None => (rest, None),
        };

        let mut words = head.split(' ').filter(|w| !w.is_empty());
        let command = words
            .next()
            .ok_or_else(|| crate::Error::MessageParse("No command found".to_string()))?
            .to_uppercase();

        let mut params: Vec<String> = words.map(|w| w.to_string()).collect();
        if let Some(trailing) = trailing {
            params.push(trailing);
        }

        Ok(Message {
            prefix,
            command,
            params,
        })
    }

    fn parse_prefix(prefix_str: &str) -> crate::Result<Prefix> {
        if prefix_str.is_empty() {
            return Err(crate::Error::MessageParse("Empty prefix".to_string()));
        }
        if let Some((nick, user_host)) = prefix_str.split_once('!') {
            let (user, host) = user_host.split_once('@').ok_or_else(|| {
                crate::Error::MessageParse("Invalid user prefix format".to_string())
            })?;
            Ok(Prefix::User {
                nick: nick.to_string(),
                user: user.to_string(),
                host: host.to_string(),
            })
        } else {
            Ok(Prefix::Server(prefix_str.to_string()))
        }
    }

    /// Serialize to wire form including the CRLF terminator.
    pub fn to_wire(&self) -> String {
        let mut result = String::new();

        if let Some(ref prefix) = self.prefix {
            result.push(':');
            result.push_str(&prefix.to_string());
            result.push(' ');
        }

        result.push_str(&self.command);

        for (i, param) in self.params.iter().enumerate() {
            result.push(' ');
            let last = i == self.params.len() - 1;
            if last && (param.contains(' ') || param.is_empty() || param.starts_with(':')) {
                result.push(':');
            }
            result.push_str(param);
        }

        result.push_str("\r\n");
        result
    }

    /// First parameter, if any.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|s| s.as_str())
    }

    /// The name carried in the prefix, or empty.
    pub fn source_name(&self) -> &str {
        self.prefix.as_ref().map(|p| p.name()).unwrap_or("")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire().trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_message() {
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn test_parse_message_with_prefix() {
        let msg = Message::parse(":alice!user@host PRIVMSG #channel :Hello world").unwrap();
        match msg.prefix {
            Some(Prefix::User {
                ref nick,
                ref user,
                ref host,
            }) => {
                assert_eq!(nick, "alice");
                assert_eq!(user, "user");
                assert_eq!(host, "host");
            }
            _ => panic!("Expected user prefix"),
        }
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#channel", "Hello world"]);
    }

    #[test]
    fn test_parse_server_prefix() {
        let msg = Message::parse(":hub.example.net PING :leaf.example.net").unwrap();
        assert_eq!(msg.prefix, Some(Prefix::Server("hub.example.net".into())));
        assert_eq!(msg.params, vec!["leaf.example.net"]);
    }

    #[test]
    fn test_trailing_keeps_spaces_and_colons() {
        let msg = Message::parse("TOPIC #a :one  two :three").unwrap();
        assert_eq!(msg.params, vec!["#a", "one  two :three"]);
    }

    #[test]
    fn test_lowercase_command_normalized() {
        let msg = Message::parse("privmsg bob hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn test_terminators_tolerated() {
        assert!(Message::parse("PING :x\r\n").is_ok());
        assert!(Message::parse("PING :x\n").is_ok());
        assert!(Message::parse("\r\n").is_err());
    }

    #[test]
    fn test_roundtrip() {
        for line in [
            "NICK alice",
            ":alice!user@host PRIVMSG #channel :Hello world",
            ":042 UID 042AAAAAA 1234 alice host dhost ident 10.0.0.1 +iw :Real Name",
            "FJOIN #a 300 :,001AAAAAB",
            "MODE #a +kl secret 42",
        ] {
            let msg = Message::parse(line).unwrap();
            assert_eq!(msg.to_wire().trim_end(), line, "round-trip of {line:?}");
        }
    }

    #[test]
    fn test_roundtrip_optional_trailing_colon() {
        // A trailing param with no spaces may lose its optional colon.
        let msg = Message::parse("PART #a :bye").unwrap();
        assert_eq!(msg.params, vec!["#a", "bye"]);
        assert_eq!(msg.to_wire().trim_end(), "PART #a bye");
    }

    #[test]
    fn test_empty_trailing_preserved() {
        let msg = Message::parse("TOPIC #a :").unwrap();
        assert_eq!(msg.params, vec!["#a", ""]);
        assert_eq!(msg.to_wire().trim_end(), "TOPIC #a :");
    }
}
