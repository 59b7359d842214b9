//! Network configuration and the bootstrap config file
//!
//! The config file is line based and whitespace delimited:
//!
//! ```text
//! local <address> [port] [portOffset] [hexId]
//! entry <address> [port]
//! ```

use crate::peer::id::PeerId;
use crate::peer::routing_table::DEFAULT_BUCKET_SIZE_BITS;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Port used when a config line omits it
pub const DEFAULT_PORT: u16 = 6000;

/// Lookups sent after joining through an entry node
pub const DEFAULT_LOOKUP_COUNT: usize = 64;

/// Pause before each lookup round
pub const DEFAULT_LOOKUP_DELAY: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid peer id '{0}'")]
    InvalidId(String),
}

/// A bootstrap node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryNode {
    pub address: String,
    pub port: u16,
}

/// Overlay network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address announced to other peers
    pub local_address: String,
    /// First port tried for the listener
    pub local_port: u16,
    /// How many successive ports to try when `local_port` is taken
    pub max_port_offset: u16,
    /// Fixed id; random when `None`
    pub local_id: Option<PeerId>,
    /// Bootstrap nodes, tried in order
    pub entry_nodes: Vec<EntryNode>,
    pub lookup_count: usize,
    pub lookup_delay: Duration,
    pub bucket_size_bits: u32,
    pub prefer_ipv4: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_address: "localhost".to_string(),
            local_port: DEFAULT_PORT,
            max_port_offset: 0,
            local_id: None,
            entry_nodes: Vec::new(),
            lookup_count: DEFAULT_LOOKUP_COUNT,
            lookup_delay: DEFAULT_LOOKUP_DELAY,
            bucket_size_bits: DEFAULT_BUCKET_SIZE_BITS,
            prefer_ipv4: false,
        }
    }
}

impl NetworkConfig {
    /// Read a config file on top of the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_file(path)?;
        Ok(config)
    }

    /// Parse config text on top of the defaults
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply(text)?;
        Ok(config)
    }

    pub fn apply_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.apply(&text)
    }

    /// Apply config lines to this config. Numeric fields that do not parse
    /// keep their defaults; lines with only a keyword are ignored.
    pub fn apply(&mut self, text: &str) -> Result<(), ConfigError> {
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }

            match parts[0] {
                "local" => {
                    self.local_address = parts[1].to_string();
                    self.local_port = parse_or(parts.get(2), DEFAULT_PORT);
                    self.max_port_offset = parse_or(parts.get(3), 0);
                    self.local_id = match parts.get(4) {
                        Some(hex) => {
                            let id = PeerId::from_hex(hex)
                                .map_err(|_| ConfigError::InvalidId(hex.to_string()))?;
                            (!id.is_zero()).then_some(id)
                        }
                        None => None,
                    };
                }
                "entry" => {
                    self.entry_nodes.push(EntryNode {
                        address: parts[1].to_string(),
                        port: parse_or(parts.get(2), DEFAULT_PORT),
                    });
                }
                other => log::debug!("Ignoring config line '{}'", other),
            }
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(field: Option<&&str>, default: T) -> T {
    field.and_then(|value| value.parse().ok()).unwrap_or(default)
}
