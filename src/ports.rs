//! Engine-local port registry
//!
//! Maps `"<container-name>:<container-port>"` to the host port the daemon
//! actually assigned. Host-side processes and execs consume this through
//! `resolve_to_localhost` to reach container-network services. The registry
//! lives for one engine instance and is never persisted.

use std::collections::BTreeMap;
use std::collections::HashMap;

use parking_lot::Mutex;

/// Registry of container-port to host-port assignments
#[derive(Default)]
pub struct PortRegistry {
    entries: Mutex<HashMap<String, u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a host-port assignment for `<container-name>:<container-port>`.
    pub fn register(&self, container_name: &str, container_port: u16, host_port: u16) {
        let key = format!("{}:{}", container_name, container_port);
        self.entries.lock().insert(key, host_port);
    }

    /// Rewrite container-network addresses in `value` to their
    /// localhost-ephemeral equivalents.
    pub fn rewrite(&self, value: &str) -> String {
        let entries = self.entries.lock();
        let mut rewritten = value.to_string();
        for (key, host_port) in entries.iter() {
            if rewritten.contains(key.as_str()) {
                rewritten = rewritten.replace(key.as_str(), &format!("localhost:{}", host_port));
            }
        }
        rewritten
    }

    /// Rewrite every value of an environment map.
    pub fn rewrite_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.iter()
            .map(|(k, v)| (k.clone(), self.rewrite(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_known_mapping() {
        let registry = PortRegistry::new();
        registry.register("api", 3000, 54321);

        assert_eq!(
            registry.rewrite("http://api:3000/"),
            "http://localhost:54321/"
        );
    }

    #[test]
    fn test_rewrite_unknown_left_alone() {
        let registry = PortRegistry::new();
        registry.register("api", 3000, 54321);

        assert_eq!(registry.rewrite("http://db:5432/"), "http://db:5432/");
    }

    #[test]
    fn test_rewrite_env() {
        let registry = PortRegistry::new();
        registry.register("api", 3000, 54321);

        let mut env = BTreeMap::new();
        env.insert("API_URL".to_string(), "http://api:3000/".to_string());
        env.insert("NAME".to_string(), "worker".to_string());

        let rewritten = registry.rewrite_env(&env);
        assert_eq!(rewritten["API_URL"], "http://localhost:54321/");
        assert_eq!(rewritten["NAME"], "worker");
    }
}
