//! Error types returned by the public operations of this crate.
//!
//! Internals work with [`anyhow::Result`]; every failure that crosses the public API is wrapped
//! in the [`Error`] variant naming the operation that failed, with the underlying cause kept as
//! its [`source`](std::error::Error::source).

use std::path::PathBuf;

use thiserror::Error;

/// Every failure a caller of this crate can observe.
#[derive(Error, Debug)]
pub enum Error {
    /// The container runtime is unreachable or the image failed to start.
    #[error("could not launch container {image}:{version}")]
    Launch {
        image: String,
        version: String,
        #[source]
        source: anyhow::Error,
    },

    /// The container runtime failed to remove the container.
    #[error("could not remove container {id}")]
    Stop {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The bootstrap handshake did not succeed within the retry budget.
    #[error("could not connect to environment server after {attempts} attempt(s)")]
    Connect {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// `CreateEnv` or `StartRecordEnv` failed, or an option could not be applied.
    #[error("could not create environment for model {model:?}")]
    Create {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    /// `StepEnv` failed or returned a malformed observation.
    #[error("could not step environment {id}")]
    Step {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not sample an action for environment {id}")]
    SampleAction {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// `ResetEnv` failed or returned a malformed observation.
    #[error("could not reset environment {id}")]
    Reset {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// `DeleteEnv` failed.
    #[error("could not close environment {id}")]
    Close {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// `Results` failed.
    #[error("could not fetch results of environment {id}")]
    Results {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A video download failed. `path` is the file that was being written; it has been removed
    /// if the download had created it.
    #[error("could not download video of episode {episode_id} to {path:?}")]
    Video {
        episode_id: i32,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// A space variant or shape this client cannot turn into a tensor shape.
    #[error("unsupported space: {0}")]
    UnsupportedSpace(String),

    /// The server reported no finished episode, so there is no average reward.
    #[error("environment {0} has no episode results")]
    NoEpisodes(String),

    /// The operation needs a box observation space.
    #[error("observation space of environment {0} is not a box space")]
    NotABoxSpace(String),

    /// Local file system error while handling videos.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used by the public operations.
pub type Result<T> = std::result::Result<T, Error>;
