//! # Sphere Env
//!
//! A client library for remote reinforcement-learning environment servers.
//!
//! It provides:
//! - Launching the environment server as a container and connecting to it (`Server`)
//! - Environment handles to step, reset and sample actions (`Env`)
//! - Episode results and recorded videos, downloaded to disk
//! - Observation normalizers, applied to every observation an environment returns
//!
//! The simulation itself runs on the server. Every operation of an [`Env`](crate::env::Env) is a
//! blocking remote call; observations come back as [`ndarray::ArrayD<f32>`] tensors.
//!
//! # Documentation Overview
//!
//! - For launching and connecting to servers, see the [`server`] module.
//! - For the operations of an environment, see [`Env`](crate::env::Env).
//! - For client behavior (timeouts, logging, retries), see
//!   [`Configuration`](crate::configuration::Configuration) and [`retry`].
//! - For plugging another transport, see the [`EnvironmentApi`](crate::api::EnvironmentApi) trait.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//! use sphere_env::prelude::*;
//!
//! fn main() -> sphere_env::Result<()> {
//!     let config = Configuration::new()
//!         .with_log(true)
//!         .with_request_timeout(Duration::from_secs(10));
//!     let server = Server::local_with(&ServerConfig::gym(), &config, DockerCli::default())?;
//!
//!     let mut env = server.make("CartPole-v1", [])?;
//!     println!("observation shape: {:?}", env.observation_space_shape()?);
//!
//!     let mut observation = env.reset()?;
//!     for _ in 0..500 {
//!         let outcome = env.step(env.sample_action()?)?;
//!         observation = if outcome.done { env.reset()? } else { outcome.observation };
//!     }
//!     println!("last observation: {observation}");
//!
//!     // log results, save videos to a temporary directory and delete the environment
//!     let videos = env.end()?;
//!     println!("videos: {videos:?}");
//!     server.close()
//! }
//! ```

pub mod api;
pub mod configuration;
pub mod container;
pub mod env;
pub mod error;
mod logger;
pub mod normalizer;
pub mod retry;
pub mod server;
pub mod space;

pub use anyhow;
pub use error::{Error, Result};

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use sphere_env::prelude::*;
/// ```
pub mod prelude {
    pub use crate::configuration::{Configuration, ServerConfig};
    pub use crate::container::{ContainerRuntime, DockerCli};
    pub use crate::env::{with_normalizer, Env, Outcome, Results};
    pub use crate::error::{Error, Result};
    pub use crate::normalizer::*;
    pub use crate::server::Server;
    pub use crate::space::Space;
}
