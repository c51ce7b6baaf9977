//! Parsing for the server-list file and the comma-separated peer lists the
//! server accepts on its command line.
//!
//! The file format is one `address port` pair per line; lines that are
//! blank, whitespace-only, or start with `#` are skipped so servers can be
//! commented out without being removed.

use core::fmt;
use thiserror::Error;

/// A single `address port` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
}

impl ServerEntry {
    pub fn new(host: impl Into<String>, port: u16) -> ServerEntry {
        ServerEntry { host: host.into(), port }
    }
}

impl fmt::Display for ServerEntry {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerListError {
    #[error("server entry {line} '{entry}' is malformed, must follow pattern 'address port'")]
    Malformed { line: usize, entry: String },

    #[error("port '{port}' of server {line} is not a number")]
    PortNotANumber { line: usize, port: String },

    #[error("port {port} of server {line} is not within the range of 0 to 65535")]
    PortOutOfRange { line: usize, port: i64 },

    #[error("no active servers were found in the server list")]
    Empty,
}

/// Parse the contents of a server-list file.
///
/// Errors carry the 1-based line number so the operator can find the
/// offending entry.
pub fn parse_server_list(contents: &str) -> Result<Vec<ServerEntry>, ServerListError> {
    let mut servers = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') || line.chars().all(char::is_whitespace) {
            continue;
        }
        servers.push(parse_entry(line, index + 1)?);
    }

    if servers.is_empty() {
        return Err(ServerListError::Empty);
    }
    Ok(servers)
}

/// Parse a comma-separated list of `address port` entries, as given to the
/// server's `--parents` and `--children` options. An empty string is an
/// empty list, not an error.
pub fn parse_peer_list(contents: &str) -> Result<Vec<ServerEntry>, ServerListError> {
    contents
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(index, entry)| parse_entry(entry, index + 1))
        .collect()
}

fn parse_entry(entry: &str, line: usize) -> Result<ServerEntry, ServerListError> {
    let mut fields = entry.split_whitespace();
    let (Some(host), Some(port)) = (fields.next(), fields.next()) else {
        return Err(ServerListError::Malformed { line, entry: entry.to_string() });
    };

    // Parse wide first so an out-of-range port reports as such instead of
    // as not-a-number.
    let port: i64 = port
        .parse()
        .map_err(|_| ServerListError::PortNotANumber { line, port: port.to_string() })?;
    let port =
        u16::try_from(port).map_err(|_| ServerListError::PortOutOfRange { line, port })?;

    Ok(ServerEntry::new(host, port))
}
