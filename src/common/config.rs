//! # Configuration
//!
//! TOML configuration for a peer node. Only the `[identity]` table is
//! required; every other table falls back to its defaults.
//!
//! ```toml
//! [identity]
//! username = "alice"
//! host = "0.0.0.0"
//! port = 5001
//!
//! [network]
//! handshake_timeout_secs = 10
//!
//! [peers]
//! addresses = ["127.0.0.1:5002"]
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Example
/// ```ignore
/// let config: NodeConfig = load_config("config/alice.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Complete configuration for one peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Who we are and where we listen
    pub identity: IdentityConfig,
    /// Timeouts and limits for every connection
    #[serde(default)]
    pub network: NetworkConfig,
    /// Peer addresses dialed at startup
    #[serde(default)]
    pub peers: PeersConfig,
    /// Where received files are written
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Inbound connection filtering
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl NodeConfig {
    /// Build a configuration with default network settings.
    pub fn new(username: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            identity: IdentityConfig {
                username: username.into(),
                host: host.into(),
                port,
            },
            network: NetworkConfig::default(),
            peers: PeersConfig::default(),
            transfer: TransferConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

/// The display name and bind address this node presents to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name, used as the registry key on every remote peer
    pub username: String,
    /// Bind host (e.g., "0.0.0.0")
    pub host: String,
    /// Bind port; 0 picks an ephemeral port
    pub port: u16,
}

impl IdentityConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Upper bound on establishing an outbound TCP connection (seconds)
    pub connect_timeout_secs: u64,
    /// Upper bound on receiving the peer's `introduce` frame (seconds)
    pub handshake_timeout_secs: u64,
    /// Upper bound on queueing or writing one frame (seconds)
    pub write_timeout_secs: u64,
    /// Frames buffered per connection before senders wait
    pub outbound_queue: usize,
    /// Largest accepted frame, delimiter excluded (bytes)
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            handshake_timeout_secs: 10,
            write_timeout_secs: 10,
            outbound_queue: 100,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Peer addresses supplied by hand; there is no discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeersConfig {
    /// `host:port` strings (e.g., "127.0.0.1:5002")
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub download_dir: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: "downloads".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Usernames whose connection requests are refused
    #[serde(default)]
    pub blocked: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_only_config_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [identity]
            username = "alice"
            host = "127.0.0.1"
            port = 5001
            "#,
        )
        .unwrap();

        assert_eq!(config.identity.bind_address(), "127.0.0.1:5001");
        assert_eq!(config.network.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.network.outbound_queue, 100);
        assert!(config.peers.addresses.is_empty());
        assert_eq!(config.transfer.download_dir, "downloads");
    }

    #[test]
    fn test_partial_network_table() {
        let config: NodeConfig = toml::from_str(
            r#"
            [identity]
            username = "bob"
            host = "0.0.0.0"
            port = 5002

            [network]
            write_timeout_secs = 3

            [peers]
            addresses = ["127.0.0.1:5001"]

            [admission]
            blocked = ["mallory"]
            "#,
        )
        .unwrap();

        assert_eq!(config.network.write_timeout(), Duration::from_secs(3));
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.peers.addresses, vec!["127.0.0.1:5001"]);
        assert_eq!(config.admission.blocked, vec!["mallory"]);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[identity]\nusername = \"carol\"\nhost = \"127.0.0.1\"\nport = 0\n",
        )
        .unwrap();

        let config: NodeConfig = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.identity.username, "carol");
        assert_eq!(config.identity.port, 0);
    }

    #[test]
    fn test_missing_identity_is_an_error() {
        let result: Result<NodeConfig, _> = toml::from_str("[network]\noutbound_queue = 4\n");
        assert!(result.is_err());
    }
}
