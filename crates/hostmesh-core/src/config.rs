//! Configuration for HostMesh

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub mesh: JoinConfig,

    #[serde(default)]
    pub failure: FailureConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::ConfigLoad(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::ConfigLoad(format!("Failed to parse config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("HOSTMESH_DISPLAY_NAME") {
            config.node.display_name = Some(name);
        }
        if let Ok(interface) = std::env::var("HOSTMESH_INTERNAL_INTERFACE") {
            config.node.internal_interface = interface;
        }
        if let Ok(port) = std::env::var("HOSTMESH_INTERNAL_PORT") {
            if let Ok(p) = port.parse() {
                config.node.internal_port = p;
            }
        }
        if let Ok(count) = std::env::var("HOSTMESH_SUB_CONNECTIONS") {
            if let Ok(c) = count.parse() {
                config.node.sub_connections = c;
            }
        }
        if let Ok(coordinators) = std::env::var("HOSTMESH_COORDINATORS") {
            config.mesh.coordinators = parse_coordinator_list(&coordinators);
        }
        if let Ok(secret) = std::env::var("HOSTMESH_CLUSTER_SECRET") {
            config.mesh.cluster_secret = Some(secret);
        }
        if let Ok(timeout) = std::env::var("HOSTMESH_DEAD_HOST_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                config.failure.dead_host_timeout_ms = t;
            }
        }
        if let Ok(pd) = std::env::var("HOSTMESH_PARTITION_DETECTION") {
            config.failure.partition_detection = pd != "false";
        }
        if let Ok(level) = std::env::var("HOSTMESH_LOG_LEVEL") {
            config.logging.level = level;
        }

        // Frame encryption from environment
        if let Ok(key) = std::env::var("HOSTMESH_FRAME_KEY") {
            config.security.cipher = CipherKind::Aes256Gcm;
            config.security.key = Some(key);
        }

        config
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.node.validate()?;
        self.mesh.validate()?;
        self.failure.validate()?;
        self.security.validate()?;
        Ok(())
    }

    /// Display name advertised by this host
    pub fn display_name(&self) -> String {
        self.node
            .display_name
            .clone()
            .unwrap_or_else(crate::utils::default_display_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable name advertised to the rest of the mesh
    pub display_name: Option<String>,
    /// Interface used for mesh traffic, empty means all interfaces
    pub internal_interface: String,
    /// Port used for mesh traffic
    pub internal_port: u16,
    /// Number of persistent sub-connections per remote host
    pub sub_connections: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            internal_interface: String::new(),
            internal_port: crate::DEFAULT_INTERNAL_PORT,
            sub_connections: 1,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.sub_connections == 0 {
            return Err(crate::Error::InvalidConfig(
                "sub_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Mesh join configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Candidate leader addresses (`host:port`)
    pub coordinators: Vec<String>,
    /// Maximum time spent establishing the mesh
    pub join_timeout_secs: u64,
    /// How long the leader waits for a joining host to report "join complete"
    pub join_complete_timeout_secs: u64,
    /// Retries for a coordinator whose name does not resolve
    pub name_resolution_retries: u32,
    /// Pause between probe rounds while waiting for a leader
    pub probe_interval_ms: u64,
    /// Shared secret used to sign join requests
    pub cluster_secret: Option<String>,
    /// Software version string advertised in handshakes
    pub version: String,
    /// Regex of remote versions this build accepts in addition to an exact match
    pub compatible_version_pattern: Option<String>,
    /// Clock skew that triggers a warning
    pub clock_skew_warn_ms: i64,
    /// Clock skew that prevents the join
    pub clock_skew_max_ms: i64,
    /// Base interval for retrying a rejected join
    pub retry_base_ms: u64,
    /// Cap for the join retry interval
    pub retry_cap_ms: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            coordinators: vec![format!("127.0.0.1:{}", crate::DEFAULT_INTERNAL_PORT)],
            join_timeout_secs: 600,
            join_complete_timeout_secs: 120,
            name_resolution_retries: 10,
            probe_interval_ms: 500,
            cluster_secret: None,
            version: crate::VERSION.to_string(),
            compatible_version_pattern: None,
            clock_skew_warn_ms: 100,
            clock_skew_max_ms: 200,
            retry_base_ms: 1_000,
            retry_cap_ms: 300_000, // 5 minutes
        }
    }
}

impl JoinConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.coordinators.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "At least one coordinator must be configured".into(),
            ));
        }
        if self.join_timeout_secs == 0 || self.join_complete_timeout_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "Join timeouts must be positive".into(),
            ));
        }
        if self.clock_skew_warn_ms >= self.clock_skew_max_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "clock_skew_warn_ms ({}) must be below clock_skew_max_ms ({})",
                self.clock_skew_warn_ms, self.clock_skew_max_ms
            )));
        }
        if self.retry_base_ms == 0 || self.retry_base_ms > self.retry_cap_ms {
            return Err(crate::Error::InvalidConfig(
                "retry_base_ms must be positive and not exceed retry_cap_ms".into(),
            ));
        }
        if self.version.is_empty() {
            return Err(crate::Error::InvalidConfig("version must not be empty".into()));
        }
        Ok(())
    }

    /// The well-known leader address: the lowest coordinator in sorted order,
    /// so every host agrees on it regardless of configuration order
    pub fn leader_coordinator(&self) -> Option<String> {
        let mut sorted: Vec<String> = self
            .coordinators
            .iter()
            .map(|c| normalize_coordinator(c))
            .collect();
        sorted.sort();
        sorted.into_iter().next()
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn join_complete_timeout(&self) -> Duration {
        Duration::from_secs(self.join_complete_timeout_secs)
    }
}

/// Failure detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    /// A remote host silent for longer than this is reported as failed
    pub dead_host_timeout_ms: u64,
    /// Fraction of the timeout after which a warning is logged
    pub warn_fraction: f64,
    /// Minimum spacing of heartbeat-gap warnings per host
    pub warn_interval_ms: u64,
    /// Interval of outgoing heartbeats
    pub heartbeat_interval_ms: u64,
    /// Shut down a minority fragment after a network partition
    pub partition_detection: bool,
    /// Answer messages for unregistered mailboxes with an "unknown site" reply
    pub unknown_site_reply: bool,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            dead_host_timeout_ms: 10_000,
            warn_fraction: 0.5,
            warn_interval_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            partition_detection: true,
            unknown_site_reply: false,
        }
    }
}

impl FailureConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.dead_host_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "dead_host_timeout_ms must be positive".into(),
            ));
        }
        if !(self.warn_fraction > 0.0 && self.warn_fraction < 1.0) {
            return Err(crate::Error::InvalidConfig(format!(
                "warn_fraction must be within (0, 1), got {}",
                self.warn_fraction
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.dead_host_timeout_ms
        {
            return Err(crate::Error::InvalidConfig(
                "heartbeat_interval_ms must be positive and below dead_host_timeout_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Frame encryption configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Cipher applied to every wire frame
    pub cipher: CipherKind,
    /// Hex encoded 256-bit key
    pub key: Option<String>,
    /// Passphrase the key is derived from when no hex key is given
    pub passphrase: Option<String>,
}

impl SecurityConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.cipher == CipherKind::Aes256Gcm && self.key.is_none() && self.passphrase.is_none()
        {
            return Err(crate::Error::InvalidConfig(
                "aes256gcm cipher selected but neither key nor passphrase configured".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    /// Frames travel as-is
    #[default]
    Plaintext,
    /// Frames are sealed with AES-256-GCM
    Aes256Gcm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Add the default internal port to a coordinator spec that lacks one
pub fn normalize_coordinator(spec: &str) -> String {
    let spec = spec.trim();
    match spec.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => spec.to_string(),
        _ => format!("{}:{}", spec, crate::DEFAULT_INTERNAL_PORT),
    }
}

/// Parse a comma separated coordinator list
pub fn parse_coordinator_list(option: &str) -> Vec<String> {
    option
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_coordinator)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.internal_port, 3021);
        assert_eq!(config.failure.dead_host_timeout_ms, 10_000);
        assert!(config.failure.partition_detection);
    }

    #[test]
    fn test_parse_toml() {
        let config = MeshConfig::from_toml(
            r#"
            [node]
            display_name = "alpha"
            internal_interface = ""
            internal_port = 4000
            sub_connections = 3

            [failure]
            dead_host_timeout_ms = 5000
            warn_fraction = 0.25
            warn_interval_ms = 1000
            heartbeat_interval_ms = 250
            partition_detection = false
            unknown_site_reply = true
            "#,
        )
        .unwrap();

        assert_eq!(config.display_name(), "alpha");
        assert_eq!(config.node.sub_connections, 3);
        assert!(!config.failure.partition_detection);
        assert!(config.failure.unknown_site_reply);
        // Missing section falls back to defaults
        assert_eq!(config.mesh.clock_skew_max_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = MeshConfig::default();
        config.node.sub_connections = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.failure.warn_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.mesh.coordinators.clear();
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.mesh.clock_skew_warn_ms = 300;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.security.cipher = CipherKind::Aes256Gcm;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coordinator_normalization() {
        assert_eq!(normalize_coordinator("10.0.0.1"), "10.0.0.1:3021");
        assert_eq!(normalize_coordinator(" node-a:4000 "), "node-a:4000");
        assert_eq!(
            parse_coordinator_list("b:1,a, ,c"),
            vec!["b:1".to_string(), "a:3021".to_string(), "c:3021".to_string()]
        );
    }

    #[test]
    fn test_leader_is_lowest_coordinator() {
        let mut config = JoinConfig::default();
        config.coordinators = vec!["10.0.0.9:3021".into(), "10.0.0.1".into()];
        assert_eq!(config.leader_coordinator().as_deref(), Some("10.0.0.1:3021"));
    }
}
