pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod serverlist;


// Re-export the transport and message types most callers touch.
pub use connection::Connection;
pub use protocol::{
    FrameHeader, FrameSet, Reply, Request, Upstream, session_name_is_valid,
};
pub use serverlist::{ServerEntry, parse_server_list};

/// Error returned by most functions.
///
/// A boxed `std::error::Error` is enough here: wire-layer errors are
/// terminal for the connection that hit them, so nothing downstream needs
/// to branch on the concrete cause. The client boundary, where callers do
/// branch, narrows into [`client::ClientError`].
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for render farm operations.
pub type Result<T> = std::result::Result<T, Error>;
