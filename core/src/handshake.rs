//! Link handshake: capability exchange and password verification
//!
//! During WAIT_AUTH_1 both sides exchange `CAPAB START` .. `CAPAB END`
//! and compare protocol version, feature list and capability key/values;
//! any mismatch sends ERROR and closes. The SERVER line's password may
//! be an HMAC-SHA256 response to the challenge we advertised in our
//! CAPAB; plaintext comparison is the fallback when either side offered
//! no challenge.

use crate::config::{ChannelConfig, Config, LimitsConfig};
use crate::{Error, Message, Result};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::collections::BTreeMap;

/// Protocol revision spoken by this implementation. Links refuse peers
/// on any other revision.
pub const PROTOCOL_VERSION: u32 = 1202;

/// Prefix marking an HMAC-transformed SERVER password.
const AUTH_PREFIX: &str = "AUTH:";

/// Maximum payload length of one CAPAB MODULES line before splitting.
const CAPAB_LINE_WIDTH: usize = 480;

/// What one side advertises during CAPAB.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Feature names, alphabetically ordered
    pub features: Vec<String>,
    /// Key=value pairs
    pub capabilities: BTreeMap<String, String>,
}

impl CapabilitySet {
    /// Build our own advertisement from configuration.
    pub fn local(config: &Config, challenge: &str) -> Self {
        let mut features = enabled_features(&config.channel);
        features.sort();

        let mut capabilities = BTreeMap::new();
        let limits: &LimitsConfig = &config.limits;
        capabilities.insert("PROTOCOL".into(), PROTOCOL_VERSION.to_string());
        capabilities.insert("NICKMAX".into(), limits.max_nick_length.to_string());
        capabilities.insert("CHANMAX".into(), limits.max_channel_name_length.to_string());
        capabilities.insert("MAXMODES".into(), limits.max_modes_per_line.to_string());
        capabilities.insert(
            "CASEMAPPING".into(),
            config.security.casemapping.token().to_string(),
        );
        capabilities.insert("CHALLENGE".into(), challenge.to_string());
        Self {
            features,
            capabilities,
        }
    }

    /// The CAPAB line sequence advertising this set.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut out = vec![Message::new("CAPAB", vec!["START".to_string()])];

        let mut line = String::new();
        for feature in &self.features {
            if line.len() + feature.len() + 1 > CAPAB_LINE_WIDTH && !line.is_empty() {
                out.push(Message::new(
                    "CAPAB",
                    vec!["MODULES".to_string(), std::mem::take(&mut line)],
                ));
            }
            if !line.is_empty() {
                line.push(',');
            }
            line.push_str(feature);
        }
        if !line.is_empty() {
            out.push(Message::new("CAPAB", vec!["MODULES".to_string(), line]));
        }

        let caps = self
            .capabilities
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        out.push(Message::new(
            "CAPAB",
            vec!["CAPABILITIES".to_string(), caps],
        ));
        out.push(Message::new("CAPAB", vec!["END".to_string()]));
        out
    }

    /// Fold one received CAPAB line into the set being accumulated.
    pub fn absorb(&mut self, message: &Message) -> Result<CapabPhase> {
        let sub = message
            .arg(0)
            .ok_or_else(|| Error::ProtocolViolation("CAPAB with no subcommand".into()))?;
        match sub {
            "START" => Ok(CapabPhase::Open),
            "MODULES" => {
                if let Some(list) = message.arg(1) {
                    self.features
                        .extend(list.split(',').filter(|f| !f.is_empty()).map(String::from));
                }
                Ok(CapabPhase::Open)
            }
            "CAPABILITIES" => {
                if let Some(pairs) = message.arg(1) {
                    for pair in pairs.split(' ') {
                        if let Some((k, v)) = pair.split_once('=') {
                            self.capabilities.insert(k.to_string(), v.to_string());
                        }
                    }
                }
                Ok(CapabPhase::Open)
            }
            "END" => Ok(CapabPhase::Finished),
            other => Err(Error::ProtocolViolation(format!(
                "unknown CAPAB subcommand {}",
                other
            ))),
        }
    }

    /// The challenge nonce the peer advertised, if any.
    pub fn challenge(&self) -> Option<&str> {
        self.capabilities
            .get("CHALLENGE")
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Compare the peer's set against ours. Keys that may legitimately
    /// differ per link (the challenge) are excluded.
    pub fn compare(&self, theirs: &CapabilitySet) -> Result<()> {
        let their_protocol = theirs
            .capabilities
            .get("PROTOCOL")
            .and_then(|v| v.parse::<u32>().ok());
        if their_protocol != Some(PROTOCOL_VERSION) {
            return Err(Error::CapabilityMismatch(format!(
                "protocol version mismatch (ours {}, theirs {})",
                PROTOCOL_VERSION,
                theirs
                    .capabilities
                    .get("PROTOCOL")
                    .map(|s| s.as_str())
                    .unwrap_or("?")
            )));
        }

        if self.features != theirs.features {
            let missing: Vec<&String> = self
                .features
                .iter()
                .filter(|f| !theirs.features.contains(f))
                .collect();
            let extra: Vec<&String> = theirs
                .features
                .iter()
                .filter(|f| !self.features.contains(f))
                .collect();
            return Err(Error::CapabilityMismatch(format!(
                "feature list differs (they lack {:?}, they add {:?})",
                missing, extra
            )));
        }

        for key in ["NICKMAX", "CHANMAX", "MAXMODES", "CASEMAPPING"] {
            let ours = self.capabilities.get(key);
            let their = theirs.capabilities.get(key);
            if ours != their {
                return Err(Error::CapabilityMismatch(format!(
                    "{} mismatch ({:?} vs {:?})",
                    key, ours, their
                )));
            }
        }
        Ok(())
    }
}

/// Whether the CAPAB exchange is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabPhase {
    Open,
    Finished,
}

/// Feature names derived from enabled channel options. Both sides must
/// run the same set or prefix modes would desync.
fn enabled_features(channel: &ChannelConfig) -> Vec<String> {
    let mut features = vec!["listmodes".to_string(), "snomask".to_string()];
    if channel.halfop {
        features.push("halfop".to_string());
    }
    if channel.admin {
        features.push("chanadmin".to_string());
    }
    if channel.founder_on_create {
        features.push("founder".to_string());
    }
    features
}

/// Generate a random challenge nonce for CAPAB.
pub fn generate_challenge() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Transform a link password with the peer's challenge.
pub fn hmac_password(password: &str, challenge: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(password.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(challenge.as_bytes());
    format!(
        "{}{}",
        AUTH_PREFIX,
        crate::config::hex_encode(&mac.finalize().into_bytes())
    )
}

/// Verify a received SERVER password against the expected recv password.
/// An `AUTH:`-prefixed value is checked against the HMAC over the
/// challenge we sent; anything else is compared as plaintext, which is
/// only acceptable when we advertised no challenge.
pub fn verify_password(received: &str, expected: &str, our_challenge: Option<&str>) -> bool {
    if received.starts_with(AUTH_PREFIX) {
        match our_challenge {
            Some(challenge) => {
                received.eq_ignore_ascii_case(&hmac_password(expected, challenge))
            }
            None => false,
        }
    } else {
        received == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ListenerConfig, ListenerRole};

    fn config() -> Config {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig {
            address: "0.0.0.0".to_string(),
            port: 7000,
            role: ListenerRole::Servers,
            transport: None,
        });
        config
    }

    #[test]
    fn test_capab_roundtrip_through_messages() {
        let ours = CapabilitySet::local(&config(), "nonce123");
        let mut theirs = CapabilitySet::default();
        let mut finished = false;
        for msg in ours.to_messages() {
            if theirs.absorb(&msg).unwrap() == CapabPhase::Finished {
                finished = true;
            }
        }
        assert!(finished);
        assert_eq!(theirs.features, ours.features);
        assert_eq!(theirs.capabilities, ours.capabilities);
        assert!(ours.compare(&theirs).is_ok());
    }

    #[test]
    fn test_compare_rejects_protocol_mismatch() {
        let ours = CapabilitySet::local(&config(), "a");
        let mut theirs = ours.clone();
        theirs
            .capabilities
            .insert("PROTOCOL".to_string(), "9999".to_string());
        assert!(matches!(
            ours.compare(&theirs),
            Err(Error::CapabilityMismatch(_))
        ));
    }

    #[test]
    fn test_compare_rejects_feature_diff() {
        let mut cfg = config();
        cfg.channel.halfop = false;
        let ours = CapabilitySet::local(&cfg, "a");
        let theirs = CapabilitySet::local(&config(), "b");
        assert!(ours.compare(&theirs).is_err());
    }

    #[test]
    fn test_challenge_differs_without_mismatch() {
        let ours = CapabilitySet::local(&config(), "aaaa");
        let theirs = CapabilitySet::local(&config(), "bbbb");
        assert!(ours.compare(&theirs).is_ok());
    }

    #[test]
    fn test_hmac_verify() {
        let challenge = "nonce123";
        let sent = hmac_password("linkpass", challenge);
        assert!(sent.starts_with("AUTH:"));
        assert!(verify_password(&sent, "linkpass", Some(challenge)));
        assert!(!verify_password(&sent, "wrongpass", Some(challenge)));
        assert!(!verify_password(&sent, "linkpass", None));
    }

    #[test]
    fn test_plaintext_fallback() {
        assert!(verify_password("linkpass", "linkpass", Some("x")));
        assert!(!verify_password("other", "linkpass", Some("x")));
    }

    #[test]
    fn test_generated_challenges_differ() {
        assert_ne!(generate_challenge(), generate_challenge());
    }
}
