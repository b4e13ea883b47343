//! Message-of-the-day handling

use crate::numeric::NumericReply;
use crate::{Message, Result};
use std::path::Path;

/// Loaded MOTD lines, or none when no file is configured.
pub struct MotdManager {
    lines: Option<Vec<String>>,
}

impl MotdManager {
    pub fn empty() -> Self {
        Self { lines: None }
    }

    /// Load the MOTD file. A missing file is not an error; the server
    /// answers 422 instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { lines: None });
            }
            Err(e) => return Err(e.into()),
        };
        let lines = content.lines().map(|l| l.to_string()).collect();
        Ok(Self { lines: Some(lines) })
    }

    /// The numeric sequence for one MOTD request.
    pub fn replies(&self, server: &str, target: &str) -> Vec<Message> {
        match &self.lines {
            None => vec![NumericReply::ErrNoMotd.reply(
                server,
                target,
                vec!["MOTD File is missing".to_string()],
            )],
            Some(lines) => {
                let mut out = Vec::with_capacity(lines.len() + 2);
                out.push(NumericReply::RplMotdStart.reply(
                    server,
                    target,
                    vec![format!("- {} Message of the day - ", server)],
                ));
                for line in lines {
                    out.push(NumericReply::RplMotd.reply(
                        server,
                        target,
                        vec![format!("- {}", line)],
                    ));
                }
                out.push(NumericReply::RplEndOfMotd.reply(
                    server,
                    target,
                    vec!["End of /MOTD command".to_string()],
                ));
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_motd_is_422() {
        let motd = MotdManager::empty();
        let replies = motd.replies("irc.example.net", "alice");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, "422");
    }
}
