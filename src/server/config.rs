//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

use crate::sync::authority::{DEFAULT_OUTBOUND_CAPACITY, DEFAULT_RETENTION};

/// Settings of the collaboration server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Accepted operations kept per document.
    pub retention: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    /// Create unknown documents on join instead of refusing the client.
    pub create_missing_documents: bool,
    /// Messages queued per connection before it is dropped as too slow.
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            retention: DEFAULT_RETENTION,
            idle_timeout: Duration::from_secs(300),
            create_missing_documents: false,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Reads the configuration from the environment.
    ///
    /// * `COLLAB_BIND_ADDR` - listen address, e.g. `0.0.0.0:3000`
    /// * `COLLAB_RETENTION` - operations kept per document
    /// * `COLLAB_IDLE_TIMEOUT_SECS` - idle connection timeout
    /// * `COLLAB_CREATE_MISSING` - `true` to create documents on join
    /// * `COLLAB_OUTBOUND_CAPACITY` - messages queued per connection
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ServerConfig::default();
        if let Some(addr) = parse(&lookup, "COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(retention) = parse(&lookup, "COLLAB_RETENTION") {
            config.retention = retention;
        }
        if let Some(secs) = parse(&lookup, "COLLAB_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(create) = parse(&lookup, "COLLAB_CREATE_MISSING") {
            config.create_missing_documents = create;
        }
        match parse(&lookup, "COLLAB_OUTBOUND_CAPACITY") {
            Some(0) => warn!("COLLAB_OUTBOUND_CAPACITY must be positive, keeping the default"),
            Some(capacity) => config.outbound_capacity = capacity,
            None => {}
        }
        config
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.retention, DEFAULT_RETENTION);
        assert!(!config.create_missing_documents);
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("COLLAB_BIND_ADDR", "0.0.0.0:8080"),
            ("COLLAB_RETENTION", "lots"),
            ("COLLAB_IDLE_TIMEOUT_SECS", "30"),
            ("COLLAB_CREATE_MISSING", "true"),
            ("COLLAB_OUTBOUND_CAPACITY", "0"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.retention, DEFAULT_RETENTION);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert!(config.create_missing_documents);
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);

        let config = ServerConfig::from_lookup(|key| {
            (key == "COLLAB_OUTBOUND_CAPACITY").then(|| "64".to_string())
        });
        assert_eq!(config.outbound_capacity, 64);
    }
}
