//! Configuration management
//!
//! The whole daemon is configured from one TOML file, deserialized into
//! `Config`. The core consumes the parsed object only; reading and
//! watching the file is the launcher's business.

use crate::casemap::CaseMapping;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server identity
    pub server: ServerConfig,
    /// Network information and links
    pub network: NetworkConfig,
    /// Listener bindings
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Connection limits and timing
    pub limits: LimitsConfig,
    /// Channel behaviour
    pub channel: ChannelConfig,
    /// Security settings
    pub security: SecurityConfig,
    /// X-line defaults
    pub xline: XLineConfig,
}

/// Server identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name (must contain a dot)
    pub name: String,
    /// Server description
    pub description: String,
    /// 3-character server id; derived from name+description when absent
    pub sid: Option<String>,
    /// MOTD file path
    pub motd_file: Option<String>,
    /// PID file path
    pub pid_file: Option<String>,
    /// Administrator email
    pub admin_email: String,
    /// Administrator location lines
    pub admin_location1: String,
    pub admin_location2: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "irc.example.net".to_string(),
            description: "treeircd server".to_string(),
            sid: None,
            motd_file: None,
            pid_file: Some("treeircd.pid".to_string()),
            admin_email: "admin@example.net".to_string(),
            admin_location1: "Example Network".to_string(),
            admin_location2: "Server Admin".to_string(),
        }
    }
}

impl ServerConfig {
    /// The configured SID, or one derived from name+description.
    ///
    /// Derivation hashes the identity so a server keeps the same SID
    /// across restarts without explicit configuration.
    pub fn server_id(&self) -> String {
        if let Some(ref sid) = self.sid {
            return sid.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.description.as_bytes());
        let digest = hasher.finalize();
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        const ALNUM: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        format!(
            "{}{}{}",
            (b'0' + (n % 10) as u8) as char,
            ALNUM[((n / 10) % 36) as usize] as char,
            ALNUM[((n / 360) % 36) as usize] as char,
        )
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network name (RPL_ISUPPORT NETWORK token)
    pub name: String,
    /// Server links
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    /// Operator credentials
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    /// U-lined server names (services; always win TS checks)
    #[serde(default)]
    pub ulines: Vec<String>,
    /// Extra RPL_ISUPPORT tokens
    #[serde(default)]
    pub isupport: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "ExampleNet".to_string(),
            links: Vec::new(),
            operators: Vec::new(),
            ulines: Vec::new(),
            isupport: Vec::new(),
        }
    }
}

/// One listener binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address
    pub address: String,
    /// Bind port
    pub port: u16,
    /// What connects here
    #[serde(default)]
    pub role: ListenerRole,
    /// Transport hook name ("tls" enables the TLS acceptor)
    pub transport: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenerRole {
    #[default]
    Clients,
    Servers,
}

/// Link block for one remote server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Remote server name
    pub name: String,
    /// Remote address
    pub address: String,
    /// Remote port
    pub port: u16,
    /// Password we send
    pub send_password: String,
    /// Password we require
    pub recv_password: String,
    /// Seconds between automatic connection attempts (0 = manual only)
    #[serde(default)]
    pub auto_connect_secs: u64,
    /// Link to try when this one fails
    pub failover: Option<String>,
    /// Handshake timeout in seconds
    #[serde(default = "default_link_timeout")]
    pub timeout_secs: u64,
    /// Transport hook name
    pub transport: Option<String>,
    /// Hide this link from STATS/LINKS output
    #[serde(default)]
    pub hidden: bool,
}

fn default_link_timeout() -> u64 {
    30
}

/// Operator privilege flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorFlag {
    /// Can act on users anywhere on the network
    GlobalOper,
    /// Limited to this server
    LocalOper,
    /// Can CONNECT remote servers together
    RemoteConnect,
    /// Can CONNECT from this server
    LocalConnect,
    /// Can SQUIT links
    Squit,
    /// Can set network bans (G/Z/Q-lines)
    NetworkBan,
}

/// Operator credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Oper name given to OPER
    pub name: String,
    /// SHA-256 password hash (hex)
    pub password_hash: String,
    /// user@host pattern the oper must connect from
    pub hostmask: String,
    /// Oper type string shown in WHOIS and propagated via OPERTYPE
    #[serde(default = "default_oper_type")]
    pub oper_type: String,
    /// Privilege flags
    #[serde(default)]
    pub flags: Vec<OperatorFlag>,
}

fn default_oper_type() -> String {
    "IRCop".to_string()
}

impl OperatorConfig {
    pub fn has_flag(&self, flag: OperatorFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn verify_password(&self, password: &str) -> bool {
        PasswordHasher::verify(password, &self.password_hash)
    }
}

/// Connection limits and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_clients: usize,
    pub max_nick_length: usize,
    pub max_channel_name_length: usize,
    pub max_channels_per_user: usize,
    pub max_topic_length: usize,
    pub max_away_length: usize,
    pub max_kick_length: usize,
    /// Mode changes with parameters per emitted MODE/FMODE line
    pub max_modes_per_line: usize,
    /// Client sendq cap in bytes
    pub sendq_bytes: usize,
    /// Client recvq cap in bytes
    pub recvq_bytes: usize,
    /// Server link sendq cap in bytes
    pub server_sendq_bytes: usize,
    /// Seconds of idle before a PING is sent
    pub ping_frequency_secs: u64,
    /// Seconds of silence before the connection is dropped
    pub connection_timeout_secs: u64,
    /// Maximum tolerated clock skew on BURST, in seconds
    pub max_ts_skew_secs: i64,
    /// WHOWAS entries kept per nickname
    pub whowas_history: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 5000,
            max_nick_length: 30,
            max_channel_name_length: 64,
            max_channels_per_user: 20,
            max_topic_length: 307,
            max_away_length: 200,
            max_kick_length: 255,
            max_modes_per_line: 20,
            sendq_bytes: 262_144,
            recvq_bytes: 8_192,
            server_sendq_bytes: 4_194_304,
            ping_frequency_secs: 120,
            connection_timeout_secs: 300,
            max_ts_skew_secs: 600,
            whowas_history: 16,
        }
    }
}

/// Channel behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Grant founder (+q, `~`) instead of plain op to the first joiner
    pub founder_on_create: bool,
    /// Enable halfop (+h, `%`)
    pub halfop: bool,
    /// Enable admin (+a, `&`)
    pub admin: bool,
    /// Default ban/except/invex list size
    pub default_list_limit: usize,
    /// Per-channel-glob list size overrides
    #[serde(default)]
    pub list_limits: HashMap<String, usize>,
    /// Commands refused outright (sent ERR_UNKNOWNCOMMAND)
    #[serde(default)]
    pub disabled_commands: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            founder_on_create: false,
            halfop: true,
            admin: false,
            default_list_limit: 64,
            list_limits: HashMap::new(),
            disabled_commands: Vec::new(),
        }
    }
}

impl ChannelConfig {
    /// List-mode size limit for a channel name, honouring glob overrides.
    pub fn list_limit_for(&self, mapping: CaseMapping, channel: &str) -> usize {
        for (glob, limit) in &self.list_limits {
            if crate::utils::match_mask(mapping, glob, channel) {
                return *limit;
            }
        }
        self.default_list_limit
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Case mapping for nick/channel comparison
    #[serde(default)]
    pub casemapping: CaseMapping,
    /// Connection password required from clients (PASS)
    pub client_password: Option<String>,
    /// TLS settings for listeners marked with the tls transport
    pub tls: TlsConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            casemapping: CaseMapping::default(),
            client_password: None,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// X-line defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XLineConfig {
    /// Reason template; `%reason%` is replaced by the line's reason
    pub quit_template: String,
    /// Seconds between expiry sweeps
    pub expiry_sweep_secs: u64,
}

impl Default for XLineConfig {
    fn default() -> Self {
        Self {
            quit_template: "Banned: %reason%".to_string(),
            expiry_sweep_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("parse error: {}", e)))
    }

    /// Write configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serialize error: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration, rejecting anything the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.server.name.contains('.') {
            return Err(Error::Config(
                "server name must contain a dot".to_string(),
            ));
        }
        if let Some(ref sid) = self.server.sid {
            if !is_valid_sid(sid) {
                return Err(Error::Config(format!(
                    "invalid SID '{}': must be a digit followed by two alphanumerics",
                    sid
                )));
            }
        }
        if self.listeners.is_empty() {
            return Err(Error::Config("no listeners configured".to_string()));
        }
        for link in &self.network.links {
            if link.name == self.server.name {
                return Err(Error::Config(format!(
                    "link block '{}' refers to ourselves",
                    link.name
                )));
            }
            if link.send_password.is_empty() || link.recv_password.is_empty() {
                return Err(Error::Config(format!(
                    "link block '{}' is missing a password",
                    link.name
                )));
            }
        }
        if self.limits.max_ts_skew_secs <= 0 {
            return Err(Error::Config(
                "max_ts_skew_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Find the link block for a server name.
    pub fn link_block(&self, name: &str) -> Option<&LinkConfig> {
        self.network.links.iter().find(|l| l.name == name)
    }

    /// Whether a server name is u-lined.
    pub fn is_uline(&self, name: &str) -> bool {
        self.network.ulines.iter().any(|u| u == name)
    }
}

/// Validate a server id: digit then two uppercase alphanumerics.
pub fn is_valid_sid(sid: &str) -> bool {
    let bytes = sid.as_bytes();
    sid.len() == 3
        && bytes[0].is_ascii_digit()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// SHA-256 password hashing used for operator credentials
pub struct PasswordHasher;

impl PasswordHasher {
    pub fn hash(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex_encode(&hasher.finalize())
    }

    pub fn verify(password: &str, hash: &str) -> bool {
        Self::hash(password).eq_ignore_ascii_case(hash)
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig {
            address: "0.0.0.0".to_string(),
            port: 6667,
            role: ListenerRole::Clients,
            transport: None,
        });
        config
    }

    #[test]
    fn test_validate_ok() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sid() {
        let mut config = minimal_config();
        config.server.sid = Some("A00".to_string());
        assert!(config.validate().is_err());
        config.server.sid = Some("042".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_sid_is_stable_and_valid() {
        let config = minimal_config();
        let a = config.server.server_id();
        let b = config.server.server_id();
        assert_eq!(a, b);
        assert!(is_valid_sid(&a), "derived SID {a} invalid");
    }

    #[test]
    fn test_password_hashing() {
        let hash = PasswordHasher::hash("hunter2");
        assert!(PasswordHasher::verify("hunter2", &hash));
        assert!(!PasswordHasher::verify("hunter3", &hash));
    }

    #[test]
    fn test_list_limit_glob() {
        let mut config = minimal_config();
        config
            .channel
            .list_limits
            .insert("#big*".to_string(), 512);
        let m = CaseMapping::Rfc1459;
        assert_eq!(config.channel.list_limit_for(m, "#bigchan"), 512);
        assert_eq!(
            config.channel.list_limit_for(m, "#other"),
            config.channel.default_list_limit
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = minimal_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.server.name, config.server.name);
        assert_eq!(back.listeners.len(), 1);
    }
}
