use std::collections::BTreeMap;

use anyhow::Context;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::space::Space;

/// Description of a remote environment instance, as returned by `CreateEnv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvDescription {
    /// Opaque identifier, valid until the environment is deleted.
    pub id: String,
    #[serde(default)]
    pub model_name: String,
    pub action_space: Space,
    pub observation_space: Space,
}

/// Flat tensor as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<i32>,
}

impl Tensor {
    /// Rebuild a dense array from the flat data and the declared shape.
    pub fn to_dense(&self) -> anyhow::Result<ArrayD<f32>> {
        let shape = dims(&self.shape)?;
        ArrayD::from_shape_vec(IxDyn(&shape), self.data.clone())
            .with_context(|| format!("{} values do not fit shape {shape:?}", self.data.len()))
    }
}

pub(crate) fn dims(shape: &[i32]) -> anyhow::Result<Vec<usize>> {
    shape
        .iter()
        .map(|&d| usize::try_from(d).with_context(|| format!("negative dimension {d}")))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEnvResponse {
    pub environment: EnvDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub observation: Tensor,
    pub reward: f32,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleActionResponse {
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub observation: Tensor,
}

/// Outcome of one finished episode, as recorded by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeResult {
    pub episode_id: i32,
    pub reward: f32,
    #[serde(default)]
    pub steps: i32,
}

/// Reference to a recorded episode video, downloadable with `GetVideo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub episode_id: i32,
    #[serde(default)]
    pub length: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsResponse {
    #[serde(default)]
    pub episode_results: BTreeMap<i32, EpisodeResult>,
    #[serde(default)]
    pub videos: BTreeMap<i32, Video>,
}

/// One request of the environment API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Info,
    CreateEnv { model_name: String },
    StartRecordEnv { id: String },
    StepEnv { id: String, action: i32 },
    SampleAction { id: String },
    ResetEnv { id: String },
    DeleteEnv { id: String },
    Results { id: String },
    GetVideo { id: String, episode_id: i32 },
}

/// One frame sent back by the server.
///
/// Unary calls are answered by a single `Ok` or `Error`. `GetVideo` is answered by any number of
/// `Chunk` frames closed by `End` (or interrupted by `Error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    Chunk(Vec<u8>),
    End,
    Error(String),
}
