#![allow(dead_code)]

//! In-process environment server speaking the framed JSON protocol over a real `TcpListener`.
//!
//! It serves a single model, `CartPole-v1`: four-value box observations, two discrete actions,
//! a reward of 1 per step and episodes of `episode_len` steps. Every finished episode gets a
//! result and a video. Results stay available after the environment is deleted.

use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use sphere_env::api::{
    read_frame, write_frame, CreateEnvResponse, EnvDescription, EpisodeResult, InfoResponse,
    MessageResponse, Reply, Request, ResetResponse, ResultsResponse, SampleActionResponse,
    StepResponse, Tensor, Video,
};
use sphere_env::space::{BoxSpace, DiscreteSpace, Space};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

pub const MODEL: &str = "CartPole-v1";
pub const SERVER_NAME: &str = "fake-gym";
pub const HIGH: [f32; 4] = [4.8, 10.0, 0.42, 10.0];

pub fn init_test_logger() {
    let _ = Registry::default()
        .with(fmt::layer().with_test_writer().with_ansi(true))
        .try_init();
}

#[derive(Debug, Clone)]
pub struct FakeOptions {
    pub episode_len: i32,
    pub video_len: usize,
    pub chunk_size: usize,
    /// Send an error frame after this many chunks instead of finishing the video.
    pub fail_video_after: Option<usize>,
    /// Answer the first `info_failures` liveness requests with an error.
    pub info_failures: usize,
    /// Hold back the reply to the first step request for this long.
    pub stall_first_step: Option<Duration>,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            episode_len: 3,
            video_len: 1000,
            chunk_size: 256,
            fail_video_after: None,
            info_failures: 0,
            stall_first_step: None,
        }
    }
}

/// Bytes of the video of `episode_id`.
pub fn video_bytes(episode_id: i32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_add(episode_id as u8))
        .collect()
}

/// Observation after `step` steps of an episode.
pub fn observation(step: i32) -> Tensor {
    Tensor {
        data: vec![step as f32 * 0.1, 0.0, 0.0, 0.0],
        shape: vec![4],
    }
}

pub fn cartpole(id: &str) -> EnvDescription {
    EnvDescription {
        id: id.to_string(),
        model_name: MODEL.to_string(),
        action_space: Space::Discrete(DiscreteSpace { n: 2 }),
        observation_space: Space::Box(BoxSpace {
            high: HIGH.to_vec(),
            low: HIGH.iter().map(|h| -h).collect(),
            shape: vec![4],
        }),
    }
}

#[derive(Debug, Default)]
struct Episodes {
    steps: i32,
    reward: f32,
    finished: BTreeMap<i32, EpisodeResult>,
}

impl Episodes {
    fn finish(&mut self) {
        if self.steps == 0 {
            return;
        }
        let episode_id = self.finished.len() as i32;
        self.finished.insert(
            episode_id,
            EpisodeResult {
                episode_id,
                reward: self.reward,
                steps: self.steps,
            },
        );
        self.steps = 0;
        self.reward = 0.0;
    }
}

#[derive(Debug)]
struct State {
    options: FakeOptions,
    envs: HashMap<String, Episodes>,
    deleted: HashMap<String, Episodes>,
    created: usize,
    info_calls: usize,
}

fn ok<T: Serialize>(body: T) -> Result<Reply, String> {
    serde_json::to_value(body)
        .map(Reply::Ok)
        .map_err(|e| e.to_string())
}

impl State {
    fn env(&mut self, id: &str) -> Result<&mut Episodes, String> {
        self.envs
            .get_mut(id)
            .ok_or_else(|| format!("unknown environment {id}"))
    }

    fn take_stall(&mut self, request: &Request) -> Option<Duration> {
        match request {
            Request::StepEnv { .. } => self.options.stall_first_step.take(),
            _ => None,
        }
    }

    fn handle(&mut self, request: Request) -> Vec<Reply> {
        let reply = match request {
            Request::Info => self.info(),
            Request::CreateEnv { model_name } => self.create(&model_name),
            Request::StartRecordEnv { id } => self
                .env(&id)
                .and_then(|_| ok(MessageResponse { message: format!("recording {id}") })),
            Request::StepEnv { id, action } => self.step(&id, action),
            Request::SampleAction { id } => self
                .env(&id)
                .and_then(|episodes| ok(SampleActionResponse { value: episodes.steps % 2 })),
            Request::ResetEnv { id } => self.env(&id).and_then(|episodes| {
                episodes.finish();
                ok(ResetResponse { observation: observation(0) })
            }),
            Request::DeleteEnv { id } => match self.envs.remove(&id) {
                Some(episodes) => {
                    self.deleted.insert(id.clone(), episodes);
                    ok(MessageResponse { message: format!("deleted {id}") })
                }
                None => Err(format!("unknown environment {id}")),
            },
            Request::Results { id } => self.results(&id),
            Request::GetVideo { id, episode_id } => return self.video(&id, episode_id),
        };
        vec![reply.unwrap_or_else(Reply::Error)]
    }

    fn info(&mut self) -> Result<Reply, String> {
        self.info_calls += 1;
        if self.info_calls <= self.options.info_failures {
            return Err("server is starting".to_string());
        }
        ok(InfoResponse {
            server_name: SERVER_NAME.to_string(),
        })
    }

    fn create(&mut self, model_name: &str) -> Result<Reply, String> {
        if model_name != MODEL {
            return Err(format!("unknown model {model_name}"));
        }
        let id = format!("env-{}", self.created);
        self.created += 1;
        self.envs.insert(id.clone(), Episodes::default());
        ok(CreateEnvResponse {
            environment: cartpole(&id),
        })
    }

    fn step(&mut self, id: &str, action: i32) -> Result<Reply, String> {
        if !(0..2).contains(&action) {
            return Err(format!("invalid action {action}"));
        }
        let episode_len = self.options.episode_len;
        let episodes = self.env(id)?;
        episodes.steps += 1;
        episodes.reward += 1.0;
        let step = episodes.steps;
        let done = step >= episode_len;
        if done {
            episodes.finish();
        }
        ok(StepResponse {
            observation: observation(step),
            reward: 1.0,
            done,
        })
    }

    fn results(&self, id: &str) -> Result<Reply, String> {
        let video_len = self.options.video_len as i64;
        let episodes = self
            .envs
            .get(id)
            .or_else(|| self.deleted.get(id))
            .ok_or_else(|| format!("unknown environment {id}"))?;
        let videos = episodes
            .finished
            .keys()
            .map(|&episode_id| {
                (
                    episode_id,
                    Video {
                        episode_id,
                        length: video_len,
                    },
                )
            })
            .collect();
        ok(ResultsResponse {
            episode_results: episodes.finished.clone(),
            videos,
        })
    }

    fn video(&mut self, id: &str, episode_id: i32) -> Vec<Reply> {
        let known = self
            .env(id)
            .map(|episodes| episodes.finished.contains_key(&episode_id));
        match known {
            Ok(true) => {}
            Ok(false) => return vec![Reply::Error(format!("no video for episode {episode_id}"))],
            Err(e) => return vec![Reply::Error(e)],
        }
        let bytes = video_bytes(episode_id, self.options.video_len);
        let mut replies: Vec<Reply> = bytes
            .chunks(self.options.chunk_size)
            .map(|chunk| Reply::Chunk(chunk.to_vec()))
            .collect();
        match self.options.fail_video_after {
            Some(n) => {
                replies.truncate(n);
                replies.push(Reply::Error("recording lost".to_string()));
            }
            None => replies.push(Reply::End),
        }
        replies
    }
}

fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    while let Ok(request) = read_frame::<_, Request>(&mut stream) {
        let (stall, replies) = match state.lock() {
            Ok(mut state) => (state.take_stall(&request), state.handle(request)),
            Err(_) => return,
        };
        if let Some(stall) = stall {
            thread::sleep(stall);
        }
        for reply in replies {
            if write_frame(&mut stream, &reply).is_err() {
                return;
            }
        }
    }
}

/// Handle on a running fake server. The server lives until the test process exits.
pub struct FakeServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn start() -> FakeServer {
        Self::with_options(FakeOptions::default())
    }

    pub fn with_options(options: FakeOptions) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(Mutex::new(State {
            options,
            envs: HashMap::new(),
            deleted: HashMap::new(),
            created: 0,
            info_calls: 0,
        }));

        let accepted = Arc::clone(&connections);
        let shared = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                accepted.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&shared);
                thread::spawn(move || serve(stream, state));
            }
        });

        FakeServer {
            addr,
            connections,
            state,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of environments created and not deleted.
    pub fn live_envs(&self) -> usize {
        self.state.lock().unwrap().envs.len()
    }

    pub fn info_calls(&self) -> usize {
        self.state.lock().unwrap().info_calls
    }
}
