use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Interface {
    ///
    /// The address and port the UDP socket binds to. Supports ipv4 and
    /// ipv6.
    ///
    pub listen: SocketAddr,
    ///
    /// Optional pinned remote 2-tuple. When set and sharing is off the
    /// binding is exclusive: a single peer, no connection IDs, and
    /// stateless reset disabled.
    ///
    #[serde(default)]
    pub remote: Option<SocketAddr>,
    ///
    /// Whether multiple connections may share this binding.
    ///
    #[serde(default)]
    pub share: bool,
    ///
    /// ALPN identifiers to listen for on this interface.
    ///
    #[serde(default = "Interface::alpn")]
    pub alpn: Vec<String>,
}

impl Interface {
    fn alpn() -> Vec<String> {
        vec!["h3".to_string()]
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// Maximum number of receive threads per interface.
    ///
    #[serde(default = "Server::max_threads")]
    pub max_threads: usize,
    ///
    /// Maximum Transmission Unit (MTU) size for network packets.
    ///
    #[serde(default = "Server::mtu")]
    pub mtu: usize,
    ///
    /// The interfaces the endpoint binds. Multiple interfaces can be
    /// bound at the same time.
    ///
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

impl Server {
    fn max_threads() -> usize {
        num_cpus::get()
    }

    fn mtu() -> usize {
        1500
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            interfaces: Default::default(),
            max_threads: Self::max_threads(),
            mtu: Self::mtu(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    ///
    /// Fraction of total memory, in 1/65535 units, that handshake
    /// state may consume before new handshakes must present a Retry
    /// token.
    ///
    #[serde(default = "Endpoint::retry_memory_limit")]
    pub retry_memory_limit: u16,
    ///
    /// Total memory estimate in bytes for the Retry gate. Zero leaves
    /// the gate disabled.
    ///
    #[serde(default)]
    pub total_memory: u64,
    ///
    /// Age in milliseconds at which a pending stateless operation is
    /// evicted.
    ///
    #[serde(default = "Endpoint::stateless_operation_expiration")]
    pub stateless_operation_expiration: u64,
    ///
    /// Upper bound on pending stateless operations per binding.
    ///
    #[serde(default = "Endpoint::max_stateless_operations")]
    pub max_stateless_operations: usize,
}

impl Endpoint {
    fn retry_memory_limit() -> u16 {
        65
    }

    fn stateless_operation_expiration() -> u64 {
        service::stateless::STATELESS_OP_EXPIRATION_MS
    }

    fn max_stateless_operations() -> usize {
        service::stateless::MAX_BINDING_STATELESS_OPERATIONS
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            retry_memory_limit: Self::retry_memory_limit(),
            total_memory: 0,
            stateless_operation_expiration: Self::stateless_operation_expiration(),
            max_stateless_operations: Self::max_stateless_operations(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: quic-endpoint --config /etc/quic-endpoint/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}
