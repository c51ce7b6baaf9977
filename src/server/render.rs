// ABOUTME: Render backend abstraction and the external renderer process implementation
// ABOUTME: Speaks the local render sub-protocol over a loopback socket

use crate::connection::Connection;
use crate::protocol::{LocalRender, LocalResponse};
use bytes::Bytes;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// A single encoded frame produced by a backend.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Bytes,
    pub extension: String,
}

/// Something that can turn `(session, frame)` into an encoded image.
///
/// The production implementation is [`ProcessBackend`]; tests substitute an
/// in-process mock so no renderer binary is needed. Futures are `Send`
/// because backends live inside spawned worker tasks.
pub trait RenderBackend: Send + 'static {
    fn render(
        &mut self,
        session: &str,
        frame: i64,
    ) -> impl Future<Output = crate::Result<RenderedImage>> + Send;
}

/// Creates one backend per client render session.
pub trait SpawnBackend: Send + Sync + 'static {
    type Backend: RenderBackend;

    fn spawn(
        &self,
        session: &str,
        render_format: Option<&str>,
    ) -> impl Future<Output = crate::Result<Self::Backend>> + Send;
}

/// Spawns the external renderer once per client render session and talks
/// the local sub-protocol to it.
///
/// The renderer is handed a loopback port and the session name on its
/// command line; it connects back, opens `<session>.blend` from the working
/// directory, and then services one `{ session, frame }` order at a time,
/// answering each with the name of the image file it wrote.
#[derive(Debug)]
pub struct ProcessSpawner {
    pub renderer: PathBuf,
    pub work_dir: PathBuf,
    /// Worker ports are probed starting just above the server's own port.
    pub base_port: u16,
}

impl SpawnBackend for ProcessSpawner {
    type Backend = ProcessBackend;

    fn spawn(
        &self,
        session: &str,
        render_format: Option<&str>,
    ) -> impl Future<Output = crate::Result<ProcessBackend>> + Send {
        async move {
            let (listener, port) = bind_worker_port(self.base_port).await?;
            info!(port, session, "starting render worker");

            let mut command = Command::new(&self.renderer);
            command.arg(port.to_string()).arg(session).current_dir(&self.work_dir);
            if let Some(format) = render_format {
                command.arg(format);
            }
            let process = command.spawn()?;

            let (socket, _) = listener.accept().await?;
            Ok(ProcessBackend {
                worker: Connection::new(socket),
                work_dir: self.work_dir.clone(),
                _process: process,
            })
        }
    }
}

/// Probe ports starting at `base_port + 1`, wrapping modulo 65536, until a
/// bind succeeds.
async fn bind_worker_port(base_port: u16) -> crate::Result<(TcpListener, u16)> {
    let mut port = base_port.wrapping_add(1);
    for _ in 0..=u16::MAX {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => port = port.wrapping_add(1),
        }
    }
    Err("no free port for the render worker".into())
}

/// A connected external render worker.
#[derive(Debug)]
pub struct ProcessBackend {
    worker: Connection,
    work_dir: PathBuf,
    // Held so the renderer is reaped when the session ends.
    _process: Child,
}

impl RenderBackend for ProcessBackend {
    fn render(
        &mut self,
        session: &str,
        frame: i64,
    ) -> impl Future<Output = crate::Result<RenderedImage>> + Send {
        async move {
            let order = LocalRender { session: session.to_string(), frame };
            self.worker.write_header(&order).await?;

            let Some(reply) = self.worker.read_header::<LocalResponse>().await? else {
                return Err("render worker closed its socket".into());
            };
            debug!(frame, image = %reply.image_name, "worker finished frame");

            let path = self.work_dir.join(&reply.image_name);
            let bytes = tokio::fs::read(&path).await.map_err(|err| {
                format!("rendered image '{}' is missing: {err}", reply.image_name)
            })?;
            tokio::fs::remove_file(&path).await?;

            Ok(RenderedImage {
                bytes: bytes.into(),
                extension: extension_of(&reply.image_name),
            })
        }
    }
}

/// The extension the renderer chose, taken from the last `.`-separated
/// piece of the image name. A name without a dot yields itself, matching
/// what the file on disk is called.
fn extension_of(image_name: &str) -> String {
    image_name.rsplit('.').next().unwrap_or_default().to_string()
}

/// Checks the renderer path points at something this server could actually
/// execute.
pub fn verify_renderer(renderer: &Path) -> crate::Result<()> {
    let metadata = std::fs::metadata(renderer)
        .map_err(|_| format!("'{}' does not exist", renderer.display()))?;
    if !metadata.is_file() {
        return Err(format!("'{}' is not a file", renderer.display()).into());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("no permission to execute '{}'", renderer.display()).into());
        }
    }
    Ok(())
}
