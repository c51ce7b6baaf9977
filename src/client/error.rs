// ABOUTME: Client error types covering connection, protocol, and job-level failures
// ABOUTME: Converts transport errors into structured variants for per-server task reporting

use std::io;
use thiserror::Error;

/// Errors a per-server client task (or the whole job) can end with.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while connecting, reading, or writing.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The server's address did not resolve; the server is abandoned
    /// without retries.
    #[error("server '{0}' is unknown")]
    UnknownServer(String),

    /// The peer closed the socket where a reply was expected.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// The server answered an UPLOAD with FAIL.
    #[error("upload rejected: {0}")]
    UploadRejected(String),

    /// The job finished with frames missing, e.g. because every server
    /// went away mid-render.
    #[error("rendered only {rendered} of {total} frame(s)")]
    Incomplete { rendered: usize, total: usize },

    /// Anything the wire layer reported that is not plain I/O.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

impl From<crate::Error> for ClientError {
    fn from(err: crate::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            ClientError::Connection(io::Error::new(io_err.kind(), err.to_string()))
        } else {
            ClientError::Protocol(err.to_string())
        }
    }
}
