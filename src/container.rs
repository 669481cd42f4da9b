//! Launching environment server containers.
//!
//! A [`ContainerRuntime`] starts the image described by a [`ServerConfig`] with its server port
//! published on the host, and removes it again on request. [`DockerCli`] drives any runtime
//! binary accepting the docker command line (`docker`, `podman`, ...).
//!
//! Containers are **not** removed when the launching process exits or when a [`Container`] is
//! dropped: call [`Server::close`](crate::server::Server::close) (or [`ContainerRuntime::stop`])
//! or they keep running.

use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info, instrument, warn};

use crate::configuration::ServerConfig;

/// A running container with its server port mapped on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Identifier given by the container runtime.
    pub id: String,
    /// Host the server port is published on.
    pub host: String,
    /// Host port mapped to the server port of the container.
    pub host_port: u16,
}

impl Container {
    /// `host:port` of the environment server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.host_port)
    }
}

/// Starts and stops environment server containers.
pub trait ContainerRuntime: Send + Sync {
    /// Start `config.image:config.version` and resolve the host port mapped to `config.port`.
    fn launch(&self, config: &ServerConfig) -> anyhow::Result<Container>;

    /// Stop and remove the container.
    fn stop(&self, container: &Container) -> anyhow::Result<()>;
}

/// [`ContainerRuntime`] using the docker command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    const HOST: &'static str = "127.0.0.1";

    /// Drive `binary`, looked up in `PATH` unless it is a path.
    pub fn new(binary: impl Into<String>) -> DockerCli {
        DockerCli {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!(binary = %self.binary, ?args, "running container runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("command '{}' not found", self.binary))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'{} {}' failed ({}): {}",
                self.binary,
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }
        let stdout = std::str::from_utf8(&output.stdout).context("output is not a valid string")?;
        Ok(stdout.trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        DockerCli::new("docker")
    }
}

impl ContainerRuntime for DockerCli {
    #[instrument(skip_all, fields(image = %config.image, version = %config.version))]
    fn launch(&self, config: &ServerConfig) -> anyhow::Result<Container> {
        let publish = format!("{}::{}", Self::HOST, config.port);
        let reference = config.reference();
        let id = self
            .run(&["run", "--detach", "--publish", &publish, &reference])
            .context("could not start container")?;
        if id.is_empty() {
            bail!("container runtime returned no container id");
        }
        info!(container = %id, "container started");

        let port = self
            .run(&["port", &id, &config.port])
            .and_then(|output| parse_host_port(&output));
        match port {
            Ok(host_port) => Ok(Container {
                id,
                host: Self::HOST.to_string(),
                host_port,
            }),
            Err(e) => {
                let container = Container {
                    id,
                    host: Self::HOST.to_string(),
                    host_port: 0,
                };
                if let Err(stop_error) = self.stop(&container) {
                    warn!("could not remove container {}: {stop_error:#}", container.id);
                }
                Err(e.context(format!("could not resolve host port of {}", config.port)))
            }
        }
    }

    #[instrument(skip_all, fields(container = %container.id))]
    fn stop(&self, container: &Container) -> anyhow::Result<()> {
        self.run(&["rm", "--force", "--volumes", &container.id])
            .context("could not remove container")?;
        info!("container removed");
        Ok(())
    }
}

/// Parse the output of `docker port`, e.g. `127.0.0.1:49153` or `[::]:49153`.
fn parse_host_port(output: &str) -> anyhow::Result<u16> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("no port mapping reported"))?;
    let (_, port) = line
        .rsplit_once(':')
        .with_context(|| format!("malformed port mapping '{line}'"))?;
    port.parse()
        .with_context(|| format!("malformed port in mapping '{line}'"))
}
