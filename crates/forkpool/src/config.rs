//! Pool and server configuration.
//!
//! Everything comes from the environment of the primary process. Parsing
//! goes through a lookup closure so it can be exercised without touching
//! the real process environment.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::restart::{BackoffPolicy, RestartPolicy};

pub const PORT_ENV: &str = "PORT";
pub const HOST_ENV: &str = "HOST";
pub const WORKERS_ENV: &str = "FORKPOOL_WORKERS";
pub const LISTEN_MODE_ENV: &str = "FORKPOOL_LISTEN_MODE";
pub const RESTART_ENV: &str = "FORKPOOL_RESTART";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Pool sizing. Fixed for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    worker_count: usize,
}

impl PoolConfig {
    /// Pool of `worker_count` workers, never fewer than one.
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    /// One worker per logical core.
    pub fn detect() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::detect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::invalid(HOST_ENV, &self.host, "expected an IP address"))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// How connections are distributed across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    /// Each worker binds the port itself with SO_REUSEPORT.
    #[default]
    ReusePort,
    /// The primary binds once and workers inherit the socket.
    Inherited,
}

/// Everything the primary needs to start a pool.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub pool: PoolConfig,
    pub server: ServerConfig,
    pub listen_mode: ListenMode,
    pub restart: RestartPolicy,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::detect(),
            server: ServerConfig::default(),
            listen_mode: ListenMode::default(),
            restart: RestartPolicy::default(),
        }
    }
}

impl LaunchOptions {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(raw) = lookup(WORKERS_ENV) {
            let count: usize = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(WORKERS_ENV, &raw, "expected a positive integer"))?;
            if count == 0 {
                return Err(ConfigError::invalid(WORKERS_ENV, &raw, "pool needs at least one worker"));
            }
            options.pool = PoolConfig::new(count);
        }

        if let Some(raw) = lookup(PORT_ENV) {
            options.server.port = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(PORT_ENV, &raw, "expected a port number"))?;
        }

        if let Some(host) = lookup(HOST_ENV) {
            options.server.host = host.trim().to_string();
        }
        options.server.socket_addr()?;

        if let Some(raw) = lookup(LISTEN_MODE_ENV) {
            options.listen_mode = match raw.trim() {
                "reuseport" | "reuse_port" => ListenMode::ReusePort,
                "inherited" => ListenMode::Inherited,
                _ => {
                    return Err(ConfigError::invalid(
                        LISTEN_MODE_ENV,
                        &raw,
                        "expected 'reuseport' or 'inherited'",
                    ));
                }
            };
        }

        if let Some(raw) = lookup(RESTART_ENV) {
            options.restart = parse_restart_policy(&raw)?;
        }

        Ok(options)
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_listen_mode(mut self, mode: ListenMode) -> Self {
        self.listen_mode = mode;
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

fn parse_restart_policy(raw: &str) -> Result<RestartPolicy, ConfigError> {
    match raw.trim() {
        "immediate" => Ok(RestartPolicy::Immediate),
        "backoff" => Ok(RestartPolicy::ExponentialBackoff(BackoffPolicy::exponential())),
        "circuit-breaker" => Ok(RestartPolicy::CircuitBreaker {
            max_rapid_exits: 5,
            cooldown: Duration::from_secs(10),
        }),
        _ => Err(ConfigError::invalid(
            RESTART_ENV,
            raw,
            "expected 'immediate', 'backoff' or 'circuit-breaker'",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn options_from(pairs: &[(&str, &str)]) -> Result<LaunchOptions, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LaunchOptions::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn pool_never_has_zero_workers() {
        assert_eq!(PoolConfig::new(0).worker_count(), 1);
        assert!(PoolConfig::detect().worker_count() >= 1);
    }

    #[test]
    fn defaults_without_environment() {
        let options = options_from(&[]).unwrap();
        assert_eq!(options.pool, PoolConfig::detect());
        assert_eq!(options.server, ServerConfig::default());
        assert_eq!(options.listen_mode, ListenMode::ReusePort);
        assert_eq!(options.restart, RestartPolicy::Immediate);
    }

    #[test]
    fn reads_port_host_and_worker_override() {
        let options = options_from(&[
            ("PORT", "8080"),
            ("HOST", "127.0.0.1"),
            ("FORKPOOL_WORKERS", "3"),
            ("FORKPOOL_LISTEN_MODE", "inherited"),
            ("FORKPOOL_RESTART", "backoff"),
        ])
        .unwrap();

        assert_eq!(options.pool.worker_count(), 3);
        assert_eq!(
            options.server.socket_addr().unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(options.listen_mode, ListenMode::Inherited);
        assert!(matches!(
            options.restart,
            RestartPolicy::ExponentialBackoff(_)
        ));
    }

    #[test]
    fn builder_overrides_environment_defaults() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let restart = RestartPolicy::CircuitBreaker {
            max_rapid_exits: 2,
            cooldown: Duration::from_millis(500),
        };

        let options = options_from(&[])
            .unwrap()
            .with_pool(PoolConfig::new(2))
            .with_server(server.clone())
            .with_listen_mode(ListenMode::Inherited)
            .with_restart_policy(restart.clone());

        assert_eq!(options.pool.worker_count(), 2);
        assert_eq!(options.server, server);
        assert_eq!(options.listen_mode, ListenMode::Inherited);
        assert_eq!(options.restart, restart);
    }

    #[test]
    fn rejects_bad_values() {
        for pairs in [
            [("PORT", "http")],
            [("PORT", "70000")],
            [("FORKPOOL_WORKERS", "0")],
            [("HOST", "localhost")],
            [("FORKPOOL_RESTART", "never")],
        ] {
            let err = options_from(&pairs).unwrap_err();
            assert!(err.to_string().starts_with("invalid "), "{err}");
        }
    }
}
