//! Server configuration loading
//!
//! `frps.ini` has a `[common]` section for the control plane and logging,
//! plus one section per proxy:
//!
//! ```ini
//! [common]
//! bind_addr = 0.0.0.0
//! bind_port = 7000
//! log_way = console
//! log_level = info
//!
//! [web]
//! passwd = s3cret
//! bind_addr = 0.0.0.0
//! bind_port = 7100
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

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

/// A proxy as configured on the relay: where its public listener binds and
/// the shared secret the client must present. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDefinition {
    pub name: String,
    pub passwd: String,
    pub bind_addr: String,
    pub bind_port: u16,
}

/// Relay process configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub log_file: String,
    pub log_way: String,
    pub log_level: String,
    pub heartbeat_timeout: Duration,
    pub proxies: Vec<ProxyDefinition>,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }
}

impl FromStr for ServerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let conf = Ini::load_from_str(s)?;
        let common = conf.section(Some("common")).ok_or(ConfigError::MissingCommon)?;

        let bind_addr = common.get("bind_addr").unwrap_or("0.0.0.0").to_string();
        let bind_port = parse_port(common, "common", "bind_port")?;
        let log_file = common.get("log_file").unwrap_or("./frps.log").to_string();
        let log_way = common.get("log_way").unwrap_or("console").to_string();
        let log_level = common.get("log_level").unwrap_or("info").to_string();
        let heartbeat_timeout = match common.get("heartbeat_timeout") {
            Some(raw) => Duration::from_secs(parse_u64(raw, "common", "heartbeat_timeout")?),
            None => DEFAULT_HEARTBEAT_TIMEOUT,
        };

        let mut proxies: Vec<ProxyDefinition> = Vec::new();
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
            proxies.push(ProxyDefinition {
                name: name.to_string(),
                passwd: require(props, name, "passwd")?.to_string(),
                bind_addr: props.get("bind_addr").unwrap_or("0.0.0.0").to_string(),
                bind_port: parse_port(props, name, "bind_port")?,
            });
        }

        Ok(Self {
            bind_addr,
            bind_port,
            log_file,
            log_way,
            log_level,
            heartbeat_timeout,
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

fn parse_u64(raw: &str, section: &str, key: &'static str) -> Result<u64, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key,
        value: raw.to_string(),
    })
}
