//! Client side of the environment API.
//!
//! The server exposes nine operations (`Info`, `CreateEnv`, `StartRecordEnv`, `StepEnv`,
//! `SampleAction`, `ResetEnv`, `DeleteEnv`, `Results` and the streaming `GetVideo`). They are
//! modelled by the [`EnvironmentApi`] trait so environment handles do not depend on a transport;
//! [`TcpClient`] is the bundled blocking implementation.

mod messages;
mod tcp;

pub use messages::*;
pub(crate) use messages::dims;
pub use tcp::{read_frame, write_frame, TcpClient, TcpConnector};

/// Chunks of one video download, in order. The stream ends after the last chunk.
pub type VideoStream<'a> = Box<dyn Iterator<Item = anyhow::Result<Vec<u8>>> + 'a>;

/// Operations offered by an environment server.
///
/// Implementations must be shareable between threads: one connection is handed to every
/// environment created from the same [`Server`](crate::server::Server).
pub trait EnvironmentApi: Send + Sync {
    /// Liveness probe, also used to confirm the server is ready after launch.
    fn info(&self) -> anyhow::Result<InfoResponse>;

    fn create_env(&self, model_name: &str) -> anyhow::Result<CreateEnvResponse>;

    fn start_record_env(&self, id: &str) -> anyhow::Result<MessageResponse>;

    fn step_env(&self, id: &str, action: i32) -> anyhow::Result<StepResponse>;

    fn sample_action(&self, id: &str) -> anyhow::Result<SampleActionResponse>;

    fn reset_env(&self, id: &str) -> anyhow::Result<ResetResponse>;

    fn delete_env(&self, id: &str) -> anyhow::Result<MessageResponse>;

    fn results(&self, id: &str) -> anyhow::Result<ResultsResponse>;

    /// Open the video of `episode_id`. The connection stays busy until the stream is drained or
    /// dropped.
    fn get_video(&self, id: &str, episode_id: i32) -> anyhow::Result<VideoStream<'_>>;
}

/// Something able to open a fresh client connection.
///
/// Used by the bootstrap retry loop: every attempt asks for a new client, and a client from a
/// failed attempt is dropped before the next one.
pub trait Connector {
    type Client: EnvironmentApi + 'static;

    fn connect(&self) -> anyhow::Result<Self::Client>;
}
