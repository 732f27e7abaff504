//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory (SQLite database and node keypair live here)
    pub data_dir: PathBuf,

    /// Display name attached to locally-authored records
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Reconnect interval for known-but-disconnected peers (seconds)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Dial attempts older than this are abandoned (seconds)
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Broadcast dedup window (milliseconds)
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_ms: u64,

    /// Offline queue capacity; trimmed to half on overflow
    #[serde(default = "default_queue_cap")]
    pub offline_queue_cap: usize,

    /// Store integrity self-check interval (seconds)
    #[serde(default = "default_integrity_interval")]
    pub integrity_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Listen addresses
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Bootstrap nodes for peer discovery
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Enable mDNS discovery on the local network
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
}

// Defaults
fn default_reconnect_interval() -> u64 { 5 }
fn default_dial_timeout() -> u64 { 10 }
fn default_dedup_ttl() -> u64 { 30_000 }
fn default_queue_cap() -> usize { 1000 }
fn default_integrity_interval() -> u64 { 300 }
fn default_true() -> bool { true }
fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/4201".to_string(),
        "/ip4/0.0.0.0/udp/4201/quic-v1".to_string(),
    ]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval(),
            dial_timeout_secs: default_dial_timeout(),
            dedup_ttl_ms: default_dedup_ttl(),
            offline_queue_cap: default_queue_cap(),
            integrity_interval_secs: default_integrity_interval(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_nodes: vec![],
            mdns_enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                data_dir: PathBuf::from("/var/lib/agora"),
                display_name: None,
            },
            sync: SyncConfig::default(),
            p2p: P2pConfig::default(),
        }
    }
}
