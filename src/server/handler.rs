// ABOUTME: Per-connection request router and session state for the server
// ABOUTME: Owns the send lock, the pending frame queue, and the child socket cache

use crate::connection::{Connection, ReadConnection};
use crate::protocol::{
    DeleteRequest, ProtocolError, Reply, RenderRequest, Request, ServeRequest, Upstream,
    UploadRequest, session_name_is_valid,
};
use crate::server::ChildRegistry;
use crate::server::render::SpawnBackend;
use crate::server::scheduler::{
    self, Assignment, FrameQueue, RenderJob, SharedWriter,
};
use crate::serverlist::ServerEntry;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Lazily dialed outbound socket to one child, private to one client
/// connection. The mutex serializes the upload fan-out against the moment
/// a render dispatcher takes the socket over for good.
type ChildLink = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// State for one accepted client connection.
///
/// The router task reads requests; everything written back to the client
/// goes through the shared writer, which is the send lock: one holder at a
/// time, held across a full header+payload write.
pub struct Handler<S: SpawnBackend> {
    reader: ReadConnection,
    writer: SharedWriter,
    peer: SocketAddr,
    work_dir: PathBuf,
    children: ChildRegistry,
    spawner: Arc<S>,
    queue: Arc<FrameQueue>,
    links: HashMap<ServerEntry, ChildLink>,
    credits: Vec<Arc<Semaphore>>,
    startup: bool,
}

impl<S: SpawnBackend> Handler<S> {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        work_dir: PathBuf,
        children: ChildRegistry,
        spawner: Arc<S>,
    ) -> Handler<S> {
        let (reader, writer) = Connection::new(socket).into_split();
        Handler {
            reader,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            peer,
            work_dir,
            children,
            spawner,
            queue: Arc::new(FrameQueue::new()),
            links: HashMap::new(),
            credits: Vec::new(),
            startup: true,
        }
    }

    /// Serve the connection until the client hangs up or misbehaves.
    pub async fn run(mut self) -> crate::Result<()> {
        let result = self.serve().await;

        // Unpark every worker on this connection so they can exit.
        self.queue.close();
        for credits in &self.credits {
            credits.close();
        }
        result
    }

    async fn serve(&mut self) -> crate::Result<()> {
        loop {
            let Some(request) = self.reader.read_header::<Request>().await? else {
                info!(peer = %self.peer, "client disconnected");
                return Ok(());
            };

            if let Some(session) = request.session() {
                if !session_name_is_valid(session) {
                    warn!(peer = %self.peer, session, "invalid session name, breaking connection");
                    return Err(ProtocolError::InvalidSession(session.to_string()).into());
                }
            }

            match request {
                Request::Serve(request) => self.register_child(request),
                Request::Upload(request) => self.upload(request).await?,
                Request::Render(request) => self.render(request).await?,
                Request::Delete(request) => self.delete(request).await?,
            }
        }
    }

    /// SERVE: record the child under its TCP source address and the port it
    /// announced. Duplicates are kept on purpose; a node registering twice
    /// acts as two workers.
    fn register_child(&mut self, request: ServeRequest) {
        let child = ServerEntry::new(self.peer.ip().to_string(), request.port);
        info!(peer = %self.peer, %child, "registered child server");
        self.children.lock().unwrap().push(child);
    }

    /// UPLOAD: persist the scene, fan it out to the children, acknowledge.
    async fn upload(&mut self, request: UploadRequest) -> crate::Result<()> {
        info!(peer = %self.peer, session = %request.session, "receiving scene file");
        let scene = self.reader.read_payload(request.size).await?;

        let reply = match tokio::fs::write(self.scene_path(&request.session), &scene).await {
            Ok(()) => {
                info!(session = %request.session, bytes = scene.len(), "saved scene file");
                Reply::Okay
            }
            Err(err) => {
                warn!(session = %request.session, %err, "could not save scene file");
                Reply::Fail { error: err.to_string() }
            }
        };

        for child in self.child_snapshot() {
            let link = self.link_for(&child);
            let request = request.clone();
            let scene = scene.clone();
            tokio::spawn(async move {
                if let Err(err) = forward_upload(link, &child, request, scene).await {
                    warn!(%child, %err, "upload fan-out failed");
                }
            });
        }

        self.writer.lock().await.write_header(&reply).await
    }

    /// RENDER: enqueue the frames; on the first RENDER of the connection,
    /// bring up the local worker and the per-child dispatch pairs.
    async fn render(&mut self, request: RenderRequest) -> crate::Result<()> {
        let job = Arc::new(RenderJob {
            session: request.session.clone(),
            render_format: request.render_format.clone(),
        });
        for frame in request.frames.iter() {
            self.queue.push(Assignment { frame, job: job.clone() });
        }

        if self.startup {
            self.startup = false;
            self.start_workers(&job).await?;
        }
        Ok(())
    }

    async fn start_workers(&mut self, job: &Arc<RenderJob>) -> crate::Result<()> {
        let backend = self.spawner.spawn(&job.session, job.render_format.as_deref()).await?;

        let queue = self.queue.clone();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler::run_local_worker(queue, writer.clone(), backend).await {
                // A missing render output is a hard failure; cut the
                // connection rather than silently dropping frames.
                error!(%err, "local render worker failed, aborting connection");
                let _ = writer.lock().await.shutdown().await;
            }
        });

        let children = self.child_snapshot();
        if children.is_empty() {
            return Ok(());
        }

        // Ask upstream for one frame per child before the children have
        // said anything; each starts with exactly one dispatch credit.
        let more = Upstream::Request { frame_count: children.len() as u32 };
        self.writer.lock().await.write_header(&more).await?;

        for child in children {
            let link = self.link_for(&child);
            let connection = match take_connection(&link, &child).await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(%child, %err, "could not reach child, skipping it");
                    continue;
                }
            };
            let (read, write) = connection.into_split();

            let credits = Arc::new(Semaphore::new(1));
            self.credits.push(credits.clone());

            let queue = self.queue.clone();
            let dispatcher_credits = credits.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    scheduler::run_child_dispatcher(queue, write, dispatcher_credits).await
                {
                    warn!(%err, "child dispatcher failed");
                }
            });

            let writer = self.writer.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler::run_child_forwarder(read, writer, credits).await {
                    warn!(%err, "child forwarder failed");
                }
            });
        }
        Ok(())
    }

    /// DELETE: drop the scene file here and on every child.
    async fn delete(&mut self, request: DeleteRequest) -> crate::Result<()> {
        let reply = match tokio::fs::remove_file(self.scene_path(&request.session)).await {
            Ok(()) => {
                info!(session = %request.session, "deleted scene file");
                Reply::Okay
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(session = %request.session, "cannot delete nonexistent scene file");
                Reply::Fail { error: "File does not exist on server.".to_string() }
            }
            Err(err) => Reply::Fail { error: err.to_string() },
        };

        for child in self.child_snapshot() {
            let link = self.link_for(&child);
            let request = request.clone();
            tokio::spawn(async move {
                if let Err(err) = forward_delete(link, &child, request).await {
                    warn!(%child, %err, "delete fan-out failed");
                }
            });
        }

        self.writer.lock().await.write_header(&reply).await
    }

    fn scene_path(&self, session: &str) -> PathBuf {
        self.work_dir.join(format!("{session}.blend"))
    }

    fn child_snapshot(&self) -> Vec<ServerEntry> {
        self.children.lock().unwrap().clone()
    }

    fn link_for(&mut self, child: &ServerEntry) -> ChildLink {
        self.links.entry(child.clone()).or_default().clone()
    }
}

/// Connect the link if it has not been dialed yet and take the connection
/// out for good; the render dispatch pair owns the socket from here on.
async fn take_connection(link: &ChildLink, child: &ServerEntry) -> crate::Result<Connection> {
    let mut guard = link.lock().await;
    match guard.take() {
        Some(connection) => Ok(connection),
        None => dial(child).await,
    }
}

async fn dial(child: &ServerEntry) -> crate::Result<Connection> {
    let socket = TcpStream::connect((child.host.as_str(), child.port)).await?;
    Ok(Connection::new(socket))
}

async fn forward_upload(
    link: ChildLink,
    child: &ServerEntry,
    request: UploadRequest,
    scene: Bytes,
) -> crate::Result<()> {
    let mut guard = link.lock().await;
    let connection = match guard.as_mut() {
        Some(connection) => connection,
        None => guard.insert(dial(child).await?),
    };

    connection.write_message(&Request::Upload(request), &scene).await?;
    // Consume the child's status so it cannot be mistaken for render
    // traffic later on this socket.
    match connection.read_header::<Reply>().await? {
        Some(Reply::Okay) => info!(%child, "scene forwarded to child"),
        Some(Reply::Fail { error }) => warn!(%child, %error, "child rejected forwarded scene"),
        None => warn!(%child, "child closed the connection during upload"),
    }
    Ok(())
}

async fn forward_delete(
    link: ChildLink,
    child: &ServerEntry,
    request: DeleteRequest,
) -> crate::Result<()> {
    let mut guard = link.lock().await;
    let connection = match guard.as_mut() {
        Some(connection) => connection,
        None => guard.insert(dial(child).await?),
    };

    connection.write_header(&Request::Delete(request)).await?;
    match connection.read_header::<Reply>().await? {
        Some(Reply::Okay) => info!(%child, "scene deleted on child"),
        Some(Reply::Fail { error }) => warn!(%child, %error, "child could not delete scene"),
        None => warn!(%child, "child closed the connection during delete"),
    }
    Ok(())
}
