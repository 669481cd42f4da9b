use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{instrument, trace, warn};

use super::{
    Connector, CreateEnvResponse, EnvironmentApi, InfoResponse, MessageResponse, Reply, Request,
    ResetResponse, ResultsResponse, SampleActionResponse, StepResponse, VideoStream,
};
use crate::configuration::Configuration;

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write one frame: payload length as a big-endian `u32`, then the JSON payload.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(value).context("could not encode frame")?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .with_context(|| format!("frame of {} bytes is too large", payload.len()))?;
    writer
        .write_all(&len.to_be_bytes())
        .context("I/O error while sending frame length")?;
    writer
        .write_all(&payload)
        .context("I/O error while sending frame")?;
    writer.flush().context("I/O error while flushing frame")?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> anyhow::Result<T> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .context("error while reading frame length")?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        bail!("announced frame of {len} bytes is too large");
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .context("error while reading frame")?;
    serde_json::from_slice(&payload).context("could not decode frame")
}

/// Blocking client over a single TCP stream.
///
/// Calls are serialized through a mutex, so one client can be shared by several environments and
/// threads. Every call is bounded by the request timeout set on the socket.
///
/// A transport error in the middle of a call (timeout, reset, truncated frame) leaves the stream
/// out of step with the server, so the client is marked broken and every later call fails
/// immediately. Open a new connection to recover.
#[derive(Debug)]
pub struct TcpClient {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    broken: AtomicBool,
}

impl TcpClient {
    /// Connect to `addr`, trying each resolved address in turn.
    pub fn connect(
        addr: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<TcpClient> {
        let mut last_error = None;
        let addrs = addr
            .to_socket_addrs()
            .with_context(|| format!("could not resolve '{addr}'"))?;
        for peer in addrs {
            match TcpStream::connect_timeout(&peer, connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(request_timeout))
                        .context("setting read timeout")?;
                    stream
                        .set_write_timeout(Some(request_timeout))
                        .context("setting write timeout")?;
                    stream.set_nodelay(true).context("setting nodelay")?;
                    trace!(%peer, "connected");
                    return Ok(TcpClient {
                        stream: Mutex::new(stream),
                        peer,
                        broken: AtomicBool::new(false),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e).with_context(|| format!("could not connect to '{addr}'")),
            None => Err(anyhow!("'{addr}' did not resolve to any address")),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether a failed call left the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, TcpStream>> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| anyhow!("connection poisoned by a panicking caller"))?;
        if self.is_broken() {
            bail!("connection to {} lost after a failed call; reconnect", self.peer);
        }
        Ok(stream)
    }

    /// Run a transport step, marking the connection broken if it fails.
    fn guard<T>(&self, step: anyhow::Result<T>) -> anyhow::Result<T> {
        mark_on_error(&self.broken, self.peer, step)
    }

    #[instrument(skip(self), fields(peer = %self.peer))]
    fn call<T: DeserializeOwned>(&self, request: Request) -> anyhow::Result<T> {
        let mut stream = self.lock()?;
        self.guard(write_frame(&mut *stream, &request))?;
        match self.guard(read_frame(&mut *stream))? {
            Reply::Ok(body) => serde_json::from_value(body).context("malformed response body"),
            Reply::Error(message) => Err(anyhow!("server error: {message}")),
            other => Err(anyhow!("unexpected reply to a unary call: {other:?}")),
        }
    }
}

impl EnvironmentApi for TcpClient {
    fn info(&self) -> anyhow::Result<InfoResponse> {
        self.call(Request::Info)
    }

    fn create_env(&self, model_name: &str) -> anyhow::Result<CreateEnvResponse> {
        self.call(Request::CreateEnv {
            model_name: model_name.to_string(),
        })
    }

    fn start_record_env(&self, id: &str) -> anyhow::Result<MessageResponse> {
        self.call(Request::StartRecordEnv { id: id.to_string() })
    }

    fn step_env(&self, id: &str, action: i32) -> anyhow::Result<StepResponse> {
        self.call(Request::StepEnv {
            id: id.to_string(),
            action,
        })
    }

    fn sample_action(&self, id: &str) -> anyhow::Result<SampleActionResponse> {
        self.call(Request::SampleAction { id: id.to_string() })
    }

    fn reset_env(&self, id: &str) -> anyhow::Result<ResetResponse> {
        self.call(Request::ResetEnv { id: id.to_string() })
    }

    fn delete_env(&self, id: &str) -> anyhow::Result<MessageResponse> {
        self.call(Request::DeleteEnv { id: id.to_string() })
    }

    fn results(&self, id: &str) -> anyhow::Result<ResultsResponse> {
        self.call(Request::Results { id: id.to_string() })
    }

    fn get_video(&self, id: &str, episode_id: i32) -> anyhow::Result<VideoStream<'_>> {
        let mut stream = self.lock()?;
        self.guard(write_frame(
            &mut *stream,
            &Request::GetVideo {
                id: id.to_string(),
                episode_id,
            },
        ))?;
        Ok(Box::new(VideoChunks {
            stream,
            broken: &self.broken,
            peer: self.peer,
            finished: false,
        }))
    }
}

fn mark_on_error<T>(
    broken: &AtomicBool,
    peer: SocketAddr,
    step: anyhow::Result<T>,
) -> anyhow::Result<T> {
    if step.is_err() && !broken.swap(true, Ordering::SeqCst) {
        warn!(%peer, "connection is out of sync, later calls will fail");
    }
    step
}

/// Chunk frames of a `GetVideo` reply. Holds the connection until `End` is read.
struct VideoChunks<'a> {
    stream: MutexGuard<'a, TcpStream>,
    broken: &'a AtomicBool,
    peer: SocketAddr,
    finished: bool,
}

impl Iterator for VideoChunks<'_> {
    type Item = anyhow::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let reply = mark_on_error(self.broken, self.peer, read_frame(&mut *self.stream));
        match reply {
            Ok(Reply::Chunk(chunk)) => Some(Ok(chunk)),
            Ok(Reply::End) => {
                self.finished = true;
                None
            }
            Ok(Reply::Error(message)) => {
                self.finished = true;
                Some(Err(anyhow!("server error: {message}")))
            }
            Ok(Reply::Ok(_)) => {
                self.finished = true;
                Some(Err(anyhow!("unexpected unary reply in a video stream")))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoChunks<'_> {
    fn drop(&mut self) {
        // the remaining chunks must be consumed, otherwise the next call reads them
        while !self.finished {
            if let Some(Err(e)) = self.next() {
                warn!("video stream ended with an error while draining: {e:#}");
            }
        }
    }
}

/// Opens [`TcpClient`]s to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, config: &Configuration) -> TcpConnector {
        TcpConnector {
            addr: addr.into(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    type Client = TcpClient;

    fn connect(&self) -> anyhow::Result<TcpClient> {
        TcpClient::connect(&self.addr, self.connect_timeout, self.request_timeout)
    }
}
