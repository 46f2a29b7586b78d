use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PalaverConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Serve plain HTTP instead of TLS
    #[serde(default)]
    pub insecure: bool,
    /// Path to web client static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Canonical base URL advertised in group statuses
    /// (derived from bind/port when absent)
    pub canonical_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Directory holding per-group JSON descriptions
    #[serde(default = "default_groups_dir")]
    pub dir: String,
    /// Chat messages kept for replay to late joiners
    #[serde(default = "default_chat_history")]
    pub chat_history: usize,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-client outbox depth before the write side is considered stuck
    #[serde(default = "default_outbox")]
    pub outbox: usize,
    /// Per-client action inbox depth
    #[serde(default = "default_actions")]
    pub actions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            insecure: false,
            web_root: default_web_root(),
            canonical_host: None,
        }
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            dir: default_groups_dir(),
            chat_history: default_chat_history(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            outbox: default_outbox(),
            actions: default_actions(),
        }
    }
}

impl PalaverConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist"));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist"));
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                issues.push(
                    "WARNING: only one of tls_cert/tls_key is set. \
                     Both must be set for custom TLS, or omit both for a self-signed certificate."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must not be 0".to_string());
        }

        if self.groups.dir.is_empty() {
            issues.push("ERROR: groups.dir must not be empty".to_string());
        }

        if self.groups.chat_history > 1000 {
            issues.push(format!(
                "WARNING: groups.chat_history = {} keeps a lot of chat in memory per group",
                self.groups.chat_history
            ));
        }

        if !self.turn_configured() && self.ice.turn_username.is_some() {
            issues.push(
                "WARNING: ice.turn_username is set but ice.turn_urls is empty".to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    pub fn turn_configured(&self) -> bool {
        !self.ice.turn_urls.is_empty()
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_web_root() -> String {
    "web/dist".to_string()
}

fn default_groups_dir() -> String {
    "groups".to_string()
}

fn default_chat_history() -> usize {
    20
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_outbox() -> usize {
    64
}

fn default_actions() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: PalaverConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(!config.server.insecure);
        assert_eq!(config.groups.dir, "groups");
        assert_eq!(config.groups.chat_history, 20);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
        assert_eq!(config.limits.outbox, 64);
        assert_eq!(config.limits.actions, 32);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: PalaverConfig = toml::from_str(
            r#"
            [server]
            port = 443
            insecure = true

            [groups]
            dir = "/etc/palaver/groups"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 443);
        assert!(config.server.insecure);
        assert_eq!(config.groups.dir, "/etc/palaver/groups");
        assert_eq!(config.groups.chat_history, 20);
    }

    #[test]
    fn validate_flags_zero_port() {
        let mut config = PalaverConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_flags_lone_tls_key() {
        let mut config = PalaverConfig::default();
        config.server.tls_key = Some("/tmp/key.pem".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
    }
}
