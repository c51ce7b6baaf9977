//! Wire message types for the render farm protocol as well as utilities for
//! validating the fields that end up in filesystem paths.
//!
//! Every message on the wire is an 8-byte big-endian length prefix followed
//! by that many bytes of UTF-8 JSON. Scene data and encoded frames travel as
//! raw bytes immediately after the header that names their length
//! (`UploadRequest::size`, `FrameHeader::frame_size`).

use core::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the length prefix that precedes every JSON header.
pub const LENGTH_PREFIX: usize = 8;

/// Upper bound on the JSON header size. Payloads are not limited by this;
/// their length is carried inside the header. A peer announcing a bigger
/// header is not speaking this protocol.
pub const MAX_HEADER_SIZE: u64 = 64 * 1024;

/// Errors raised by the protocol layer itself rather than by the transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header of {0} bytes exceeds the {MAX_HEADER_SIZE}-byte limit")]
    OversizedHeader(u64),

    #[error("invalid session name {0:?}")]
    InvalidSession(String),
}

/// Session names become `<session>.blend` on the server, so anything outside
/// `[A-Za-z0-9]+` is rejected before it can reach a path.
pub fn session_name_is_valid(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// The `frames` field of a RENDER request: a single frame number or a list.
///
/// Clients send lists on the initial request for convenience; every hop
/// below the client dispatches single frames only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameSet {
    Single(i64),
    Many(Vec<i64>),
}

impl FrameSet {
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let frames = match self {
            FrameSet::Single(frame) => std::slice::from_ref(frame),
            FrameSet::Many(frames) => frames.as_slice(),
        };
        frames.iter().copied()
    }

    pub fn len(&self) -> usize {
        match self {
            FrameSet::Single(_) => 1,
            FrameSet::Many(frames) => frames.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<i64> for FrameSet {
    fn from(frame: i64) -> FrameSet {
        FrameSet::Single(frame)
    }
}

impl From<Vec<i64>> for FrameSet {
    fn from(frames: Vec<i64>) -> FrameSet {
        FrameSet::Many(frames)
    }
}

/// `UPLOAD { session, size }`, followed by `size` raw bytes of scene data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub session: String,
    pub size: u64,
}

/// `RENDER { session, frames, render_format? }`.
///
/// `render_format` is an opaque encoder hint handed through to the render
/// subsystem; it is left off the wire entirely when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub session: String,
    pub frames: FrameSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_format: Option<String>,
}

/// `DELETE { session }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub session: String,
}

/// `SERVE { port }` — one-shot registration a child sends to its parent on
/// startup. The child's address is taken from the TCP peer, only the listen
/// port needs announcing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeRequest {
    pub port: u16,
}

/// Requests travelling towards a server, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "UPLOAD")]
    Upload(UploadRequest),
    #[serde(rename = "RENDER")]
    Render(RenderRequest),
    #[serde(rename = "DELETE")]
    Delete(DeleteRequest),
    #[serde(rename = "SERVE")]
    Serve(ServeRequest),
}

impl Request {
    /// The session the request operates on, if it names one.
    pub fn session(&self) -> Option<&str> {
        match self {
            Request::Upload(request) => Some(&request.session),
            Request::Render(request) => Some(&request.session),
            Request::Delete(request) => Some(&request.session),
            Request::Serve(_) => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Request::Upload(request) => {
                write!(fmt, "UPLOAD '{}' ({} bytes)", request.session, request.size)
            }
            Request::Render(request) => {
                write!(fmt, "RENDER '{}' ({} frame(s))", request.session, request.frames.len())
            }
            Request::Delete(request) => write!(fmt, "DELETE '{}'", request.session),
            Request::Serve(request) => write!(fmt, "SERVE port {}", request.port),
        }
    }
}

/// Terminal reply to an UPLOAD or DELETE, discriminated by the `status`
/// field rather than `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Reply {
    #[serde(rename = "OKAY")]
    Okay,
    #[serde(rename = "FAIL")]
    Fail { error: String },
}

/// Header of a FRAME message; `frame_size` raw bytes of encoded image
/// follow it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub frame_size: u64,
    pub frame_number: i64,
    pub file_extension: String,
}

/// Traffic flowing up towards the client: either a request for more work
/// or a finished frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Upstream {
    #[serde(rename = "REQUEST")]
    Request { frame_count: u32 },
    #[serde(rename = "FRAME")]
    Frame(FrameHeader),
}

impl fmt::Display for Upstream {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Upstream::Request { frame_count } => write!(fmt, "REQUEST for {frame_count} frame(s)"),
            Upstream::Frame(header) => {
                write!(fmt, "FRAME {} ({} bytes)", header.frame_number, header.frame_size)
            }
        }
    }
}

/// Per-frame render order on the local worker socket. The worker is the
/// only peer there, so no discriminator is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRender {
    pub session: String,
    pub frame: i64,
}

/// The worker's reply: the name of the image file it wrote, relative to the
/// server's working directory and carrying whatever extension the renderer
/// chose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalResponse {
    pub image_name: String,
}
