//! Render farm server: accepts client connections, renders locally through
//! an external worker process, and fans surplus work out to registered
//! child servers.
//!
//! Servers form a tree. A node announces itself to each configured parent
//! with a one-shot SERVE message at startup; parents record children and
//! forward work to them per connection. Cycles are not detected — keeping
//! the configuration acyclic is the operator's job.

pub mod handler;
pub mod render;
pub mod scheduler;

use crate::connection::Connection;
use crate::protocol::{Request, ServeRequest};
use crate::server::handler::Handler;
use crate::server::render::SpawnBackend;
use crate::serverlist::ServerEntry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Children registered on this server, shared by all connections. SERVE
/// registrations append; handlers snapshot the list when they dispatch.
pub type ChildRegistry = Arc<Mutex<Vec<ServerEntry>>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on; `0` picks one, useful in tests.
    pub port: u16,
    /// Where scene files and render output live.
    pub work_dir: PathBuf,
    /// Parents to announce ourselves to at startup.
    pub parents: Vec<ServerEntry>,
    /// Statically configured children, joined by SERVE registrations.
    pub children: Vec<ServerEntry>,
}

/// A bound but not yet running server.
pub struct Server<S> {
    listener: TcpListener,
    config: ServerConfig,
    children: ChildRegistry,
    spawner: Arc<S>,
}

impl<S: SpawnBackend> Server<S> {
    /// Bind the listen socket and prepare the child registry.
    pub async fn bind(config: ServerConfig, spawner: S) -> crate::Result<Server<S>> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await.map_err(|err| {
            format!("could not bind to port {}: {err}", config.port)
        })?;
        let children = Arc::new(Mutex::new(config.children.clone()));
        Ok(Server { listener, config, children, spawner: Arc::new(spawner) })
    }

    /// The port actually bound, which differs from the configured one when
    /// that was `0`.
    pub fn port(&self) -> crate::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Handle to the child registry, for inspection.
    pub fn children(&self) -> ChildRegistry {
        self.children.clone()
    }

    /// Announce ourselves to the parents, then accept connections forever.
    pub async fn run(self) -> crate::Result<()> {
        let port = self.port()?;
        for parent in &self.config.parents {
            if let Err(err) = register_at_parent(parent, port).await {
                warn!(%parent, %err, "could not register at parent");
            }
        }
        info!(port, "listening for incoming requests");

        loop {
            let (socket, peer) = self.listener.accept().await?;
            info!(%peer, "new connection, handling requests");

            let handler = Handler::new(
                socket,
                peer,
                self.config.work_dir.clone(),
                self.children.clone(),
                self.spawner.clone(),
            );
            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(%peer, %err, "connection ended with error");
                }
            });
        }
    }
}

/// One-shot SERVE registration: connect, announce our port, hang up.
async fn register_at_parent(parent: &ServerEntry, port: u16) -> crate::Result<()> {
    let socket = TcpStream::connect((parent.host.as_str(), parent.port)).await?;
    let mut connection = Connection::new(socket);
    connection.write_header(&Request::Serve(ServeRequest { port })).await?;
    info!(%parent, "registered at parent");
    Ok(())
}
