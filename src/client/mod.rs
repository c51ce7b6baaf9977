//! Render farm client: drives the UPLOAD → RENDER → DELETE lifecycle
//! against every server in a list, feeding frames to whichever node asks
//! for more and collecting the results on disk.
//!
//! Each listed server gets its own task; the tasks share one [`JobState`]
//! so a frame handed to one server is never handed to another. Servers
//! that fail are logged and dropped while the rest keep rendering.

pub mod error;

pub use error::{ClientError, ClientResult};

use crate::connection::Connection;
use crate::protocol::{
    FrameSet, Reply, RenderRequest, Request, Upstream, UploadRequest,
};
use crate::serverlist::ServerEntry;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, lookup_host};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

/// How long to wait between connection attempts to an unreachable server.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Shared state of one render job across all per-server tasks.
///
/// The pending list is the single source of frames: popping is the only
/// way a frame gets assigned, so no frame is ever sent to two servers.
#[derive(Debug)]
struct JobState {
    pending: Mutex<VecDeque<i64>>,
    total: usize,
    rendered: Mutex<usize>,
    render_end: Mutex<Option<Instant>>,
}

impl JobState {
    fn new(frames: Vec<i64>) -> JobState {
        JobState {
            total: frames.len(),
            pending: Mutex::new(frames.into()),
            rendered: Mutex::new(0),
            render_end: Mutex::new(None),
        }
    }

    fn pop(&self) -> Option<i64> {
        self.pending.lock().unwrap().pop_front()
    }

    fn pending_is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    /// Count a finished frame; the task that lands the last one records
    /// the end-of-render instant.
    fn record_rendered(&self) {
        let mut rendered = self.rendered.lock().unwrap();
        *rendered += 1;
        if *rendered == self.total {
            *self.render_end.lock().unwrap() = Some(Instant::now());
        }
    }

    fn rendered(&self) -> usize {
        *self.rendered.lock().unwrap()
    }
}

/// Summary of a finished render, for the final report.
#[derive(Debug, Clone, Copy)]
pub struct RenderReport {
    pub frames: usize,
    pub elapsed: Duration,
}

/// Upload a scene to every listed server. Per-server failures are logged;
/// the call succeeds if the fan-out itself could run.
pub async fn upload(servers: Vec<ServerEntry>, session: String, scene: Bytes) {
    let mut tasks = JoinSet::new();
    for server in servers {
        let session = session.clone();
        let scene = scene.clone();
        tasks.spawn(async move {
            if let Err(err) = upload_to_server(&server, &session, scene).await {
                warn!(%server, %err, "upload failed");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Delete a session from every listed server.
pub async fn delete(servers: Vec<ServerEntry>, session: String) {
    let mut tasks = JoinSet::new();
    for server in servers {
        let session = session.clone();
        tasks.spawn(async move {
            if let Err(err) = delete_on_server(&server, &session).await {
                warn!(%server, %err, "delete failed");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Render `start..=end` across the listed servers, writing each frame to
/// `output_dir` as `<frame:04>[.<extension>]`.
pub async fn render(
    servers: Vec<ServerEntry>,
    session: String,
    output_dir: PathBuf,
    start_frame: i64,
    end_frame: i64,
    render_format: Option<String>,
) -> ClientResult<RenderReport> {
    let (start, end) = if start_frame > end_frame {
        (end_frame, start_frame)
    } else {
        (start_frame, end_frame)
    };
    let frames: Vec<i64> = (start..=end).collect();

    if !output_dir.is_dir() {
        tokio::fs::create_dir_all(&output_dir).await?;
        info!(dir = %output_dir.display(), "created output directory");
    }

    let started = Instant::now();
    let state = Arc::new(JobState::new(frames));

    let mut tasks = JoinSet::new();
    // More servers than frames would leave some idle from the start.
    for server in servers.into_iter().take(state.total) {
        let state = state.clone();
        let session = session.clone();
        let render_format = render_format.clone();
        let output_dir = output_dir.clone();
        tasks.spawn(async move {
            let rendered =
                render_on_server(&server, state, &session, render_format, &output_dir).await;
            match rendered {
                Ok(rendered) => info!(%server, rendered, "server finished"),
                Err(err) => warn!(%server, %err, "server task ended with error"),
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    let render_end = *state.render_end.lock().unwrap();
    match render_end {
        Some(end) => Ok(RenderReport { frames: state.total, elapsed: end - started }),
        None => Err(ClientError::Incomplete { rendered: state.rendered(), total: state.total }),
    }
}

/// Connect to a server, retrying unreachable hosts every
/// [`RETRY_DELAY`]. A host that fails to resolve is abandoned at once;
/// when `pending` is given and runs dry, retrying is pointless and the
/// server is abandoned too.
async fn connect(server: &ServerEntry, pending: Option<&JobState>) -> ClientResult<TcpStream> {
    loop {
        let addrs: Vec<_> = match lookup_host((server.host.as_str(), server.port)).await {
            Ok(addrs) => addrs.collect(),
            Err(_) => return Err(ClientError::UnknownServer(server.to_string())),
        };
        if addrs.is_empty() {
            return Err(ClientError::UnknownServer(server.to_string()));
        }

        match TcpStream::connect(addrs.as_slice()).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if let Some(state) = pending {
                    if state.pending_is_empty() {
                        info!(%server, "could not connect, but all frames have been handed out; giving up on this server");
                        return Err(err.into());
                    }
                }
                warn!(%server, %err, "could not connect, retrying in {} seconds", RETRY_DELAY.as_secs());
                sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn upload_to_server(
    server: &ServerEntry,
    session: &str,
    scene: Bytes,
) -> ClientResult<()> {
    let stream = connect(server, None).await?;
    let mut connection = Connection::new(stream);
    info!(%server, "connected, uploading scene file");

    let request = Request::Upload(UploadRequest {
        session: session.to_string(),
        size: scene.len() as u64,
    });
    let started = Instant::now();
    connection.write_message(&request, &scene).await?;

    match connection.read_header::<Reply>().await? {
        Some(Reply::Okay) => {
            let elapsed = started.elapsed().as_secs_f64();
            let megabytes = scene.len() as f64 / 1_000_000.0;
            info!(
                %server,
                "uploaded {megabytes:.1} MB in {elapsed:.3} seconds ({:.3} MB/s)",
                megabytes / elapsed.max(f64::EPSILON),
            );
            Ok(())
        }
        Some(Reply::Fail { error }) => Err(ClientError::UploadRejected(error)),
        None => Err(ClientError::ConnectionClosed),
    }
}

async fn delete_on_server(server: &ServerEntry, session: &str) -> ClientResult<()> {
    let stream = connect(server, None).await?;
    let mut connection = Connection::new(stream);
    info!(%server, "requesting deletion of scene file");

    let request = Request::Delete(crate::protocol::DeleteRequest { session: session.to_string() });
    connection.write_header(&request).await?;

    match connection.read_header::<Reply>().await? {
        Some(Reply::Okay) => {
            info!(%server, "scene file deleted");
            Ok(())
        }
        Some(Reply::Fail { error }) => {
            warn!(%server, "server could not delete scene file, reason given: \"{error}\"");
            Ok(())
        }
        None => Err(ClientError::ConnectionClosed),
    }
}

/// Drive one server through a render job. Returns how many frames this
/// server delivered.
async fn render_on_server(
    server: &ServerEntry,
    state: Arc<JobState>,
    session: &str,
    render_format: Option<String>,
    output_dir: &Path,
) -> ClientResult<usize> {
    let stream = connect(server, Some(&state)).await?;
    let (mut reader, writer) = Connection::new(stream).into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    // Frames sent to this server and not yet returned, with the send
    // instant for per-frame timing.
    let awaited: Arc<Mutex<HashMap<i64, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

    let Some(first) = state.pop() else {
        return Ok(0);
    };
    info!(%server, frame = first, "sending request to render frame");
    awaited.lock().unwrap().insert(first, Instant::now());
    {
        let request = render_request(session, &render_format, first);
        writer.lock().await.write_header(&request).await?;
    }

    let mut rendered_here = 0usize;
    loop {
        let Some(message) = reader.read_header::<Upstream>().await? else {
            return Err(ClientError::ConnectionClosed);
        };

        match message {
            Upstream::Request { frame_count } => {
                for _ in 0..frame_count {
                    let Some(frame) = state.pop() else { break };

                    // Mark the frame as awaited before the send task runs:
                    // if the FRAME raced back first it would otherwise find
                    // the set empty and end this loop early.
                    awaited.lock().unwrap().insert(frame, Instant::now());

                    let request = render_request(session, &render_format, frame);
                    let writer = writer.clone();
                    let awaited = awaited.clone();
                    tokio::spawn(async move {
                        if let Err(err) = writer.lock().await.write_header(&request).await {
                            warn!(frame, %err, "could not send render request");
                            awaited.lock().unwrap().remove(&frame);
                        }
                    });
                }
            }
            Upstream::Frame(header) => {
                let image = reader.read_payload(header.frame_size).await?;
                let path = output_dir.join(frame_file_name(&header.frame_number, &header.file_extension));
                tokio::fs::write(&path, &image).await?;

                let sent_at = awaited.lock().unwrap().remove(&header.frame_number);
                match sent_at {
                    Some(sent_at) => info!(
                        %server,
                        frame = header.frame_number,
                        "received frame after {:.3} seconds",
                        sent_at.elapsed().as_secs_f64(),
                    ),
                    None => warn!(
                        %server,
                        frame = header.frame_number,
                        "received a frame that was never requested here",
                    ),
                }

                state.record_rendered();
                rendered_here += 1;
            }
        }

        if awaited.lock().unwrap().is_empty() && state.pending_is_empty() {
            return Ok(rendered_here);
        }
    }
}

fn render_request(session: &str, render_format: &Option<String>, frame: i64) -> Request {
    Request::Render(RenderRequest {
        session: session.to_string(),
        frames: FrameSet::Single(frame),
        render_format: render_format.clone(),
    })
}

/// Frames are written as their zero-padded number; the server-chosen
/// extension is appended only when it is a plain alphanumeric token.
fn frame_file_name(frame_number: &i64, extension: &str) -> String {
    let mut name = format!("{frame_number:04}");
    if !extension.is_empty() && extension.bytes().all(|b| b.is_ascii_alphanumeric()) {
        name.push('.');
        name.push_str(extension);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_file_names_gate_the_extension() {
        assert_eq!(frame_file_name(&7, "png"), "0007.png");
        assert_eq!(frame_file_name(&12345, "exr"), "12345.exr");
        assert_eq!(frame_file_name(&-1, "png"), "-001.png");

        // Anything that is not a clean token is dropped rather than
        // spliced into a path.
        assert_eq!(frame_file_name(&7, ""), "0007");
        assert_eq!(frame_file_name(&7, "p/ng"), "0007");
        assert_eq!(frame_file_name(&7, "png "), "0007");
    }

    #[test]
    fn job_state_hands_each_frame_out_once() {
        let state = JobState::new(vec![1, 2, 3]);
        assert_eq!(state.pop(), Some(1));
        assert_eq!(state.pop(), Some(2));
        assert_eq!(state.pop(), Some(3));
        assert_eq!(state.pop(), None);
        assert!(state.pending_is_empty());
    }

    #[test]
    fn last_frame_records_the_render_end() {
        let state = JobState::new(vec![1, 2]);
        state.record_rendered();
        assert!(state.render_end.lock().unwrap().is_none());
        state.record_rendered();
        assert!(state.render_end.lock().unwrap().is_some());
        assert_eq!(state.rendered(), 2);
    }
}
