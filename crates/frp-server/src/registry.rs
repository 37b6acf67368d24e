//! Frozen proxy registry

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ConfigError, ProxyDefinition, ServerConfig};
use crate::proxy::ProxyServer;

/// Name-to-proxy map, built once before the control plane starts accepting
/// and read-only afterwards, so lookups need no locking. Pass it explicitly;
/// there is no process-global instance.
pub struct ProxyRegistry {
    proxies: HashMap<String, Arc<ProxyServer>>,
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("proxies", &self.proxies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProxyRegistry {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Self::from_definitions(config.proxies.iter().cloned())
    }

    /// Colliding proxy names are a configuration error, not a merge.
    pub fn from_definitions(
        defs: impl IntoIterator<Item = ProxyDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut proxies = HashMap::new();
        for def in defs {
            let name = def.name.clone();
            if proxies.insert(name.clone(), ProxyServer::new(def)).is_some() {
                return Err(ConfigError::DuplicateSection(name));
            }
        }
        Ok(Self { proxies })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyServer>> {
        self.proxies.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}
