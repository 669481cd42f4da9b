//! Config for the client behaviors
//!
//! This module provides the configuration of the environment server to launch
//! ([`ServerConfig`]) and of the client talking to it ([`Configuration`]).
//!
//! Both can be created programmatically or by reading environment variables with their
//! `from_env()` constructor.
//!
//! # Environment Variables
//!
//! All values are optional. Boolean flags are case-insensitive and enabled by `"true"`.
//!
//! - `SPHERE_IMAGE`: Docker image of the environment server (default: `sphereproject/gym`)
//! - `SPHERE_VERSION`: Tag of the image (default: `latest`)
//! - `SPHERE_PORT`: Container port the server listens on (default: `50051/tcp`)
//! - `SPHERE_LOG`: Enable logging to a file (default: `false`)
//! - `SPHERE_REQUEST_TIMEOUT_MS`: Timeout of every remote call (default: `30000`)
//! - `SPHERE_CONNECT_TIMEOUT_MS`: Timeout of a single connection attempt (default: `2000`)
//! - `SPHERE_DOCKER`: Container runtime binary (default: `docker`)
//!
//! The retry budget of the bootstrap handshake is read by [`RetryPolicy::from_env()`].

use std::env;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Environment server image to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Docker image of the environment.
    pub image: String,
    /// Version (tag) of the docker image.
    pub version: String,
    /// Container port the server is exposed on, e.g. `50051/tcp`.
    pub port: String,
}

impl ServerConfig {
    pub fn new(
        image: impl Into<String>,
        version: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            version: version.into(),
            port: port.into(),
        }
    }

    /// The OpenAI Gym environment server.
    pub fn gym() -> Self {
        Self::new("sphereproject/gym", "latest", "50051/tcp")
    }

    /// Read `SPHERE_IMAGE`, `SPHERE_VERSION` and `SPHERE_PORT`, falling back to [`ServerConfig::gym`].
    pub fn from_env() -> Self {
        let gym = Self::gym();
        Self {
            image: env::var("SPHERE_IMAGE").unwrap_or(gym.image),
            version: env::var("SPHERE_VERSION").unwrap_or(gym.version),
            port: env::var("SPHERE_PORT").unwrap_or(gym.port),
        }
    }

    /// `image:version`, as understood by the container runtime.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::gym()
    }
}

/// Configuration of the client.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) log: bool,
    pub(crate) request_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) docker_binary: String,
    pub(crate) retry: RetryPolicy,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Logging to file is disabled.
    /// - Remote calls time out after 30 seconds.
    /// - A single connection attempt times out after 2 seconds.
    /// - Containers are managed with the `docker` binary found in `PATH`.
    /// - The bootstrap handshake uses [`RetryPolicy::default()`].
    pub fn new() -> Self {
        Self {
            log: false,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            docker_binary: "docker".to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create configuration from environment variables (see module documentation).
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_millis(var: &str, default: Duration) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        let defaults = Self::new();
        Self {
            log: get_env_flag("SPHERE_LOG", defaults.log),
            request_timeout: get_env_millis("SPHERE_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            connect_timeout: get_env_millis("SPHERE_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            docker_binary: env::var("SPHERE_DOCKER").unwrap_or(defaults.docker_binary),
            retry: RetryPolicy::from_env(),
        }
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Timeout applied to every remote call.
    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    /// Timeout of one connection attempt of the bootstrap handshake.
    pub fn with_connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Container runtime binary (anything accepting docker's `run`, `port` and `rm` commands).
    pub fn with_docker_binary(mut self, value: impl Into<String>) -> Self {
        self.docker_binary = value.into();
        self
    }

    /// Retry budget of the bootstrap handshake.
    pub fn with_retry(mut self, value: RetryPolicy) -> Self {
        self.retry = value;
        self
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gym_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.reference(), "sphereproject/gym:latest");
        assert_eq!(config.port, "50051/tcp");
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = Configuration::new()
            .with_log(true)
            .with_request_timeout(Duration::from_millis(250))
            .with_docker_binary("podman");
        assert!(config.log);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.docker_binary, "podman");
    }
}
