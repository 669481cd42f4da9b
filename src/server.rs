//! Environment servers.
//!
//! A [`Server`] is a ready connection to an environment server, optionally together with the
//! container it runs in. It is the entry point to create environments with [`Server::make`].
//!
//! # Bootstrap
//!
//! [`Server::local`] launches the configured image, then performs a two-step handshake (open a
//! connection, then an `Info` round trip) under the [`RetryPolicy`] of the [`Configuration`],
//! because the server inside a fresh container takes a while to accept connections. The
//! connection of a failed attempt is closed before the next attempt starts. If the handshake
//! never succeeds the container is removed and [`Error::Connect`] is returned.
//!
//! # Sharing
//!
//! Every environment made from a server shares its connection. With the bundled TCP client,
//! environments may be used from several threads: calls are serialized on the connection.
//!
//! # Example
//!
//! ```no_run
//! use sphere_env::prelude::*;
//!
//! fn main() -> sphere_env::Result<()> {
//!     let server = Server::local(&ServerConfig::gym())?;
//!     let env = server.make("CartPole-v1", [with_normalizer(MinMaxNormalizer::new())])?;
//!     for _ in 0..100 {
//!         let action = env.sample_action()?;
//!         if env.step(action)?.done {
//!             env.reset()?;
//!         }
//!     }
//!     let results = env.results()?;
//!     println!("average reward: {}", results.average_reward);
//!     env.close()?;
//!     server.close()
//! }
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, instrument, warn};

use crate::api::{Connector, EnvironmentApi, InfoResponse, TcpConnector};
use crate::configuration::{Configuration, ServerConfig};
use crate::container::{Container, ContainerRuntime, DockerCli};
use crate::env::{Env, EnvOption};
use crate::error::{Error, Result};
use crate::logger::init_logger;
use crate::retry::{retry, RetryError, RetryPolicy};

/// A connected environment server.
pub struct Server {
    client: Arc<dyn EnvironmentApi>,
    server_name: String,
    container: Option<(Container, Box<dyn ContainerRuntime>)>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("server_name", &self.server_name)
            .field("container", &self.container.as_ref().map(|(c, _)| c))
            .finish()
    }
}

fn setup_logging(config: &Configuration) {
    if config.log {
        if let Err(e) = init_logger() {
            eprintln!("could not initialise logging: {e:#}");
        }
    }
}

/// Open a connection and check the server answers, retrying under `policy`.
fn handshake<C: Connector>(
    connector: &C,
    policy: &RetryPolicy,
) -> std::result::Result<(C::Client, InfoResponse), RetryError> {
    retry(policy, |attempt| {
        let client = connector
            .connect()
            .with_context(|| format!("attempt {attempt}: could not open connection"))?;
        // on failure the client is dropped here, closing its connection
        let info = client
            .info()
            .with_context(|| format!("attempt {attempt}: liveness request failed"))?;
        Ok((client, info))
    })
}

impl Server {
    /// Launch `config` and connect to it, with the [`Configuration`] read from the environment.
    pub fn local(config: &ServerConfig) -> Result<Server> {
        let configuration = Configuration::from_env();
        let runtime = DockerCli::new(configuration.docker_binary.clone());
        Self::local_with(config, &configuration, runtime)
    }

    /// Launch `config` with `runtime` and connect to it.
    #[instrument(skip_all, fields(image = %config.image, version = %config.version))]
    pub fn local_with<R: ContainerRuntime + 'static>(
        config: &ServerConfig,
        configuration: &Configuration,
        runtime: R,
    ) -> Result<Server> {
        setup_logging(configuration);
        info!("creating local server");

        let container = runtime.launch(config).map_err(|source| Error::Launch {
            image: config.image.clone(),
            version: config.version.clone(),
            source,
        })?;

        let connector = TcpConnector::new(container.address(), configuration);
        match Self::connect_with(&connector, &configuration.retry) {
            Ok(mut server) => {
                server.container = Some((container, Box::new(runtime)));
                Ok(server)
            }
            Err(e) => {
                if let Err(stop_error) = runtime.stop(&container) {
                    warn!("could not remove container {}: {stop_error:#}", container.id);
                }
                Err(e)
            }
        }
    }

    /// Connect to an already running server at `addr` (`host:port`).
    pub fn connect(addr: &str, configuration: &Configuration) -> Result<Server> {
        setup_logging(configuration);
        let connector = TcpConnector::new(addr, configuration);
        Self::connect_with(&connector, &configuration.retry)
    }

    /// Run the bootstrap handshake with `connector` under `policy`.
    #[instrument(skip_all)]
    pub fn connect_with<C: Connector>(connector: &C, policy: &RetryPolicy) -> Result<Server> {
        let (client, info) =
            handshake(connector, policy).map_err(|RetryError { attempts, last }| {
                Error::Connect {
                    attempts,
                    source: last,
                }
            })?;
        info!("connected to server {:?}", info.server_name);
        Ok(Server {
            client: Arc::new(client),
            server_name: info.server_name,
            container: None,
        })
    }

    /// Wrap an existing client. No handshake is performed.
    pub fn from_client(client: Arc<dyn EnvironmentApi>) -> Server {
        Server {
            client,
            server_name: String::new(),
            container: None,
        }
    }

    /// Name reported by the server during the handshake (empty for [`Server::from_client`]).
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref().map(|(container, _)| container)
    }

    /// The connection shared by every environment of this server.
    pub fn client(&self) -> Arc<dyn EnvironmentApi> {
        Arc::clone(&self.client)
    }

    /// Create an environment for `model`, start recording it, then apply `opts` in order.
    #[instrument(skip(self, opts))]
    pub fn make(&self, model: &str, opts: impl IntoIterator<Item = EnvOption>) -> Result<Env> {
        let create_error = |source| Error::Create {
            model: model.to_string(),
            source,
        };

        let description = self
            .client
            .create_env(model)
            .context("could not create remote environment")
            .map_err(create_error)?
            .environment;
        info!("created env: {}", description.id);

        let recording = self
            .client
            .start_record_env(&description.id)
            .context("could not start recording")
            .map_err(create_error)?;
        info!("{}", recording.message);

        let mut env = Env::new(description, Arc::clone(&self.client));
        for opt in opts {
            opt(&mut env).map_err(create_error)?;
        }
        Ok(env)
    }

    /// Stop and remove the container, if this server launched one.
    pub fn close(self) -> Result<()> {
        let Some((container, runtime)) = self.container else {
            return Ok(());
        };
        runtime
            .stop(&container)
            .map_err(|source| Error::Stop {
                id: container.id.clone(),
                source,
            })
    }
}
