//! Client configuration loading
//!
//! `frpc.ini` mirrors the server file: a `[common]` section pointing at the
//! relay, plus one section per proxy naming the local port to expose.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("missing [common] section")]
    MissingCommon,

    #[error("section name must not be empty")]
    EmptySection,

    #[error("duplicate proxy section [{0}]")]
    DuplicateSection(String),

    #[error("missing key `{key}` in section [{section}]")]
    MissingKey { section: String, key: &'static str },

    #[error("invalid value `{value}` for key `{key}` in section [{section}]")]
    InvalidValue {
        section: String,
        key: &'static str,
        value: String,
    },
}

/// A proxy as configured on the client host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProxy {
    pub name: String,
    pub passwd: String,
    pub local_port: u16,
}

/// Client process configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub log_file: String,
    pub log_way: String,
    pub log_level: String,
    pub heartbeat_interval: Duration,
    pub proxies: Vec<ClientProxy>,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }
}

impl FromStr for ClientConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let conf = Ini::load_from_str(s)?;
        let common = conf.section(Some("common")).ok_or(ConfigError::MissingCommon)?;

        let server_addr = require(common, "common", "server_addr")?.to_string();
        let server_port = parse_port(common, "common", "server_port")?;
        let log_file = common.get("log_file").unwrap_or("./frpc.log").to_string();
        let log_way = common.get("log_way").unwrap_or("console").to_string();
        let log_level = common.get("log_level").unwrap_or("info").to_string();
        let heartbeat_interval = match common.get("heartbeat_interval") {
            Some(raw) => {
                let secs = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    section: "common".to_string(),
                    key: "heartbeat_interval",
                    value: raw.to_string(),
                })?;
                Duration::from_secs(secs)
            }
            None => DEFAULT_HEARTBEAT_INTERVAL,
        };

        let mut proxies: Vec<ClientProxy> = Vec::new();
        for (section, props) in conf.iter() {
            let name = match section {
                Some(name) if name != "common" => name,
                _ => continue,
            };
            if name.trim().is_empty() {
                return Err(ConfigError::EmptySection);
            }
            if proxies.iter().any(|p| p.name == name) {
                return Err(ConfigError::DuplicateSection(name.to_string()));
            }
            proxies.push(ClientProxy {
                name: name.to_string(),
                passwd: require(props, name, "passwd")?.to_string(),
                local_port: parse_port(props, name, "local_port")?,
            });
        }

        Ok(Self {
            server_addr,
            server_port,
            log_file,
            log_way,
            log_level,
            heartbeat_interval,
            proxies,
        })
    }
}

fn require<'a>(
    props: &'a Properties,
    section: &str,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    props.get(key).ok_or_else(|| ConfigError::MissingKey {
        section: section.to_string(),
        key,
    })
}

fn parse_port(props: &Properties, section: &str, key: &'static str) -> Result<u16, ConfigError> {
    let raw = require(props, section, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key,
        value: raw.to_string(),
    })
}
