//! Environment handles.
//!
//! An [`Env`] is created by [`Server::make`](crate::server::Server::make) and proxies every call
//! to the remote environment instance it identifies. All calls are blocking request/response
//! over the connection shared with the [`Server`](crate::server::Server).
//!
//! # Lifecycle
//!
//! ```text
//! make -> (step | sample_action | reset)* -> results / videos -> close
//! ```
//!
//! The environment id is only valid until [`Env::close`]; what the server does with calls made
//! after that is up to the server.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::Context;
use ndarray::ArrayD;
use tracing::{debug, info, instrument, warn};

use crate::api::{
    EnvDescription, EnvironmentApi, EpisodeResult, ResultsResponse, Tensor, Video, VideoStream,
};
use crate::error::{Error, Result};
use crate::normalizer::Normalizer;
use crate::space::{BoxTensors, Space};

/// Program used by [`Env::play_all`] to open a video.
#[cfg(target_os = "macos")]
pub const VIDEO_OPENER: &str = "open";
#[cfg(not(target_os = "macos"))]
pub const VIDEO_OPENER: &str = "xdg-open";

/// Applied to a freshly created environment by [`Server::make`](crate::server::Server::make).
pub type EnvOption = Box<dyn FnOnce(&mut Env) -> anyhow::Result<()>>;

/// Normalize every observation with `normalizer`, initialised with the environment description.
pub fn with_normalizer<N: Normalizer + 'static>(mut normalizer: N) -> EnvOption {
    Box::new(move |env: &mut Env| {
        normalizer
            .init(&env.description)
            .context("could not initialise normalizer")?;
        env.normalizer = Some(Box::new(normalizer));
        Ok(())
    })
}

/// Outcome of taking an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Observation of the new state, normalized if the environment has a normalizer.
    pub observation: ArrayD<f32>,
    /// Action that was taken.
    pub action: i32,
    pub reward: f32,
    /// Whether the episode is over.
    pub done: bool,
}

/// Results of an environment run.
#[derive(Debug, Clone, PartialEq)]
pub struct Results {
    /// Episode id to result.
    pub episodes: BTreeMap<i32, EpisodeResult>,
    /// Episode id to recorded video.
    pub videos: BTreeMap<i32, Video>,
    /// Mean reward over all episodes.
    pub average_reward: f32,
}

impl Results {
    fn from_response(id: &str, response: ResultsResponse) -> Result<Results> {
        if response.episode_results.is_empty() {
            return Err(Error::NoEpisodes(id.to_string()));
        }
        let cumulative: f32 = response.episode_results.values().map(|r| r.reward).sum();
        let average_reward = cumulative / response.episode_results.len() as f32;
        Ok(Results {
            episodes: response.episode_results,
            videos: response.videos,
            average_reward,
        })
    }
}

fn write_stream(stream: VideoStream<'_>, file: File, path: &Path) -> anyhow::Result<u64> {
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for chunk in stream {
        let chunk = chunk.context("video stream interrupted")?;
        writer
            .write_all(&chunk)
            .with_context(|| format!("could not write {path:?}"))?;
        written += chunk.len() as u64;
    }
    writer
        .flush()
        .with_context(|| format!("could not write {path:?}"))?;
    Ok(written)
}

/// Handle on a remote environment instance.
pub struct Env {
    description: EnvDescription,
    client: Arc<dyn EnvironmentApi>,
    video_paths: Vec<PathBuf>,
    normalizer: Option<Box<dyn Normalizer>>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("description", &self.description)
            .field("video_paths", &self.video_paths)
            .field("normalized", &self.normalizer.is_some())
            .finish()
    }
}

impl Env {
    pub(crate) fn new(description: EnvDescription, client: Arc<dyn EnvironmentApi>) -> Env {
        Env {
            description,
            client,
            video_paths: Vec::new(),
            normalizer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.description.id
    }

    pub fn description(&self) -> &EnvDescription {
        &self.description
    }

    pub fn action_space(&self) -> &Space {
        &self.description.action_space
    }

    pub fn observation_space(&self) -> &Space {
        &self.description.observation_space
    }

    /// Paths of the videos saved by the last successful [`Env::videos`] call.
    pub fn video_paths(&self) -> &[PathBuf] {
        &self.video_paths
    }

    fn observe(&self, tensor: &Tensor) -> anyhow::Result<ArrayD<f32>> {
        let observation = tensor.to_dense().context("malformed observation")?;
        match &self.normalizer {
            Some(normalizer) => normalizer
                .norm(observation)
                .context("could not normalize observation"),
            None => Ok(observation),
        }
    }

    /// Take `action` in the environment.
    #[instrument(level = "trace", skip(self), fields(id = %self.description.id))]
    pub fn step(&self, action: i32) -> Result<Outcome> {
        let call = |env: &Env| -> anyhow::Result<Outcome> {
            let response = env.client.step_env(env.id(), action)?;
            Ok(Outcome {
                observation: env.observe(&response.observation)?,
                action,
                reward: response.reward,
                done: response.done,
            })
        };
        call(self).map_err(|source| Error::Step {
            id: self.id().to_string(),
            source,
        })
    }

    /// A random valid action from the remote action space.
    pub fn sample_action(&self) -> Result<i32> {
        self.client
            .sample_action(self.id())
            .map(|response| response.value)
            .map_err(|source| Error::SampleAction {
                id: self.id().to_string(),
                source,
            })
    }

    /// Start a new episode and return its first observation.
    #[instrument(level = "debug", skip(self), fields(id = %self.description.id))]
    pub fn reset(&self) -> Result<ArrayD<f32>> {
        self.client
            .reset_env(self.id())
            .and_then(|response| self.observe(&response.observation))
            .map_err(|source| Error::Reset {
                id: self.id().to_string(),
                source,
            })
    }

    /// Delete the remote environment instance.
    #[instrument(skip(self), fields(id = %self.description.id))]
    pub fn close(&self) -> Result<()> {
        let response = self
            .client
            .delete_env(self.id())
            .map_err(|source| Error::Close {
                id: self.id().to_string(),
                source,
            })?;
        info!("{}", response.message);
        Ok(())
    }

    fn fetch_results(&self) -> Result<ResultsResponse> {
        self.client
            .results(self.id())
            .map_err(|source| Error::Results {
                id: self.id().to_string(),
                source,
            })
    }

    /// Episode results and recorded videos of the environment.
    ///
    /// # Errors
    /// [`Error::NoEpisodes`] if no episode is finished yet, as the average reward is undefined.
    pub fn results(&self) -> Result<Results> {
        let response = self.fetch_results()?;
        Results::from_response(self.id(), response)
    }

    /// Log the results at info level.
    pub fn log_results(&self) -> Result<Results> {
        let results = self.results()?;
        info!(
            id = %self.description.id,
            episodes = results.episodes.len(),
            average_reward = results.average_reward,
            "results"
        );
        for (episode_id, result) in &results.episodes {
            debug!(episode_id, reward = result.reward, steps = result.steps);
        }
        Ok(results)
    }

    /// Save every recorded video into `path` and return the file paths.
    ///
    /// Defaults to `./results/<env id>`; the directory is created if needed. Files are named
    /// `<env id>-episode<episode id>.mp4`.
    ///
    /// # Errors
    /// [`Error::Video`] if a download fails. Its path is reported in the error; the file is removed
    /// if the download got as far as creating it, an older file of the same name is kept otherwise. Videos saved before the failure are left on disk but are not
    /// recorded in [`Env::video_paths`].
    #[instrument(skip(self), fields(id = %self.description.id))]
    pub fn videos(&mut self, path: Option<&Path>) -> Result<Vec<PathBuf>> {
        let dir = match path {
            Some(path) => path.to_path_buf(),
            None => Path::new("results").join(self.id()),
        };
        fs::create_dir_all(&dir)?;

        let results = self.fetch_results()?;
        let mut paths = Vec::with_capacity(results.videos.len());
        for video in results.videos.values() {
            let file = dir.join(format!("{}-episode{}.mp4", self.id(), video.episode_id));
            match self.download(video.episode_id, &file) {
                Ok(written) => debug!(path = ?file, written, "saved video"),
                Err(source) => {
                    return Err(Error::Video {
                        episode_id: video.episode_id,
                        path: file,
                        source,
                    });
                }
            }
            paths.push(file);
        }
        self.video_paths = paths.clone();
        Ok(paths)
    }

    /// Stream one video into `path`. A file created here is removed again if the stream fails.
    fn download(&self, episode_id: i32, path: &Path) -> anyhow::Result<u64> {
        let stream = self
            .client
            .get_video(self.id(), episode_id)
            .context("could not open video stream")?;
        let file = File::create(path).with_context(|| format!("could not create {path:?}"))?;
        let written = write_stream(stream, file, path);
        if written.is_err() {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove partial video {path:?}: {e}");
                }
            }
        }
        written
    }

    /// Log the results, save the videos in a new temporary directory, then close the environment.
    ///
    /// Returns the paths of the saved videos. Having no finished episode is not an error here.
    pub fn end(&mut self) -> Result<Vec<PathBuf>> {
        match self.log_results() {
            Ok(_) => {}
            Err(Error::NoEpisodes(id)) => warn!("environment {id} has no finished episode"),
            Err(e) => return Err(e),
        }
        let dir = tempfile::Builder::new().prefix("sphere").tempdir()?.keep();
        let paths = self.videos(Some(&dir))?;
        info!(?paths, "saved videos");
        self.close()?;
        Ok(paths)
    }

    /// Open every saved video with the platform viewer, wait for a line on stdin, then remove
    /// the videos (see [`Env::clean`]).
    pub fn play_all(&mut self) -> Result<()> {
        let stdin = io::stdin();
        self.play_all_with(VIDEO_OPENER, stdin.lock())
    }

    /// Like [`Env::play_all`], opening videos with `opener` and waiting on `input`.
    pub fn play_all_with(&mut self, opener: &str, mut input: impl BufRead) -> Result<()> {
        for video in &self.video_paths {
            debug!("playing video: {video:?}");
            let status = Command::new(opener)
                .arg(video)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;
            if !status.success() {
                warn!("'{opener}' could not open {video:?} ({status})");
            }
        }
        println!("\npress enter to remove videos or ctrl+c to exit and keep them");
        let mut line = String::new();
        input.read_line(&mut line)?;
        self.clean()
    }

    /// Remove every video saved locally.
    pub fn clean(&mut self) -> Result<()> {
        while let Some(video) = self.video_paths.last() {
            fs::remove_file(video)?;
            debug!("removed video: {video:?}");
            self.video_paths.pop();
        }
        info!("removed all local videos");
        Ok(())
    }

    /// Shape of the action space.
    pub fn action_space_shape(&self) -> Result<Vec<usize>> {
        self.description.action_space.shape()
    }

    /// Shape of the observation space.
    pub fn observation_space_shape(&self) -> Result<Vec<usize>> {
        self.description.observation_space.shape()
    }

    /// Bounds of the observation box space as tensors.
    pub fn box_space(&self) -> Result<BoxTensors> {
        let space = self
            .description
            .observation_space
            .as_box()
            .ok_or_else(|| Error::NotABoxSpace(self.id().to_string()))?;
        space
            .to_tensors()
            .map_err(|e| Error::UnsupportedSpace(format!("{e:#}")))
    }

    /// Log the environment description.
    pub fn print(&self) {
        info!(environment = ?self.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        CreateEnvResponse, InfoResponse, MessageResponse, ResetResponse, SampleActionResponse,
        StepResponse,
    };
    use crate::space::DiscreteSpace;
    use anyhow::bail;

    /// Reports one recorded episode but cannot open any video stream.
    struct NoVideos;

    impl EnvironmentApi for NoVideos {
        fn info(&self) -> anyhow::Result<InfoResponse> {
            bail!("unsupported")
        }

        fn create_env(&self, _model_name: &str) -> anyhow::Result<CreateEnvResponse> {
            bail!("unsupported")
        }

        fn start_record_env(&self, _id: &str) -> anyhow::Result<MessageResponse> {
            bail!("unsupported")
        }

        fn step_env(&self, _id: &str, _action: i32) -> anyhow::Result<StepResponse> {
            bail!("unsupported")
        }

        fn sample_action(&self, _id: &str) -> anyhow::Result<SampleActionResponse> {
            bail!("unsupported")
        }

        fn reset_env(&self, _id: &str) -> anyhow::Result<ResetResponse> {
            bail!("unsupported")
        }

        fn delete_env(&self, _id: &str) -> anyhow::Result<MessageResponse> {
            bail!("unsupported")
        }

        fn results(&self, _id: &str) -> anyhow::Result<ResultsResponse> {
            let mut response = ResultsResponse::default();
            response.episode_results.insert(
                0,
                EpisodeResult {
                    episode_id: 0,
                    reward: 10.0,
                    steps: 10,
                },
            );
            response.videos.insert(
                0,
                Video {
                    episode_id: 0,
                    length: 3,
                },
            );
            Ok(response)
        }

        fn get_video(&self, _id: &str, _episode_id: i32) -> anyhow::Result<VideoStream<'_>> {
            bail!("connection lost")
        }
    }

    fn env() -> Env {
        let description = EnvDescription {
            id: "env-7".to_string(),
            model_name: "Test-v0".to_string(),
            action_space: Space::Discrete(DiscreteSpace { n: 2 }),
            observation_space: Space::Discrete(DiscreteSpace { n: 4 }),
        };
        Env::new(description, Arc::new(NoVideos))
    }

    #[test]
    fn failed_stream_open_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let previous = dir.path().join("env-7-episode0.mp4");
        fs::write(&previous, b"earlier run").unwrap();

        let mut env = env();
        match env.videos(Some(dir.path())) {
            Err(Error::Video { path, .. }) => assert_eq!(path, previous),
            other => panic!("expected Video error, got {other:?}"),
        }
        assert_eq!(fs::read(&previous).unwrap(), b"earlier run");
        assert!(env.video_paths().is_empty());
    }

    #[test]
    fn average_reward_over_episodes() {
        let results = env().results().unwrap();
        assert_eq!(results.episodes.len(), 1);
        assert_eq!(results.average_reward, 10.0);
    }

    #[test]
    fn box_space_requires_a_box() {
        assert!(matches!(env().box_space(), Err(Error::NotABoxSpace(_))));
    }
}
