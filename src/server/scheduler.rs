//! Pull-based frame dispatch.
//!
//! Frames enqueued by the router sit in a [`FrameQueue`] until a worker —
//! the local render worker or a per-child dispatcher — pulls them. Workers
//! advertise capacity upward with REQUEST messages instead of the parent
//! guessing how many workers live below, so a node tree balances itself.

use crate::connection::{ReadConnection, WriteConnection};
use crate::protocol::{FrameHeader, FrameSet, RenderRequest, Request, Upstream};
use crate::server::render::RenderBackend;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

/// Write half of the client socket, shared by every worker on a
/// connection. Exactly one holder writes at any moment, and a holder keeps
/// the lock across a full header+payload write.
pub type SharedWriter = Arc<tokio::sync::Mutex<WriteConnection>>;

/// The RENDER parameters a frame was enqueued under. Shared by reference so
/// a thousand-frame job does not copy the session name a thousand times.
#[derive(Debug)]
pub struct RenderJob {
    pub session: String,
    pub render_format: Option<String>,
}

/// One frame waiting to be dispatched.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub frame: i64,
    pub job: Arc<RenderJob>,
}

/// FIFO of pending frames with condition-variable wakeups.
///
/// Append-then-notify on push, pop-under-wait on pull: a frame is handed to
/// exactly one puller, and pullers park when the queue is empty. Closing
/// the queue wakes everyone; pulls return `None` once closed.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Assignment>>,
    notify: Notify,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new() -> FrameQueue {
        FrameQueue::default()
    }

    /// Append one frame and wake a single waiting puller.
    pub fn push(&self, assignment: Assignment) {
        self.frames.lock().unwrap().push_back(assignment);
        self.notify.notify_one();
    }

    /// Wait for the next frame. Returns `None` after [`FrameQueue::close`].
    pub async fn pull(&self) -> Option<Assignment> {
        let mut notified = pin!(self.notify.notified());
        loop {
            if let Some(assignment) = self.frames.lock().unwrap().pop_front() {
                return Some(assignment);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            // Register for a wakeup, then look again: a push that landed
            // between the pop above and here must not be missed.
            notified.as_mut().enable();
            if let Some(assignment) = self.frames.lock().unwrap().pop_front() {
                return Some(assignment);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Close the queue and wake all parked pullers. Frames still queued are
    /// discarded; their client is gone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }
}

/// The local worker loop: pull a frame, render it through the backend,
/// request a replacement frame from upstream, then ship the image.
///
/// The REQUEST goes out before the FRAME so the pipeline refills while the
/// (potentially large) image is in flight.
pub async fn run_local_worker<B: RenderBackend>(
    queue: Arc<FrameQueue>,
    writer: SharedWriter,
    mut backend: B,
) -> crate::Result<()> {
    while let Some(assignment) = queue.pull().await {
        let image = backend.render(&assignment.job.session, assignment.frame).await?;

        {
            let mut writer = writer.lock().await;
            writer.write_header(&Upstream::Request { frame_count: 1 }).await?;
        }

        let header = Upstream::Frame(FrameHeader {
            frame_size: image.bytes.len() as u64,
            frame_number: assignment.frame,
            file_extension: image.extension.clone(),
        });
        let mut writer = writer.lock().await;
        writer.write_message(&header, &image.bytes).await?;
        debug!(frame = assignment.frame, "rendered locally");
    }
    Ok(())
}

/// Dispatcher half of a child pairing: spend one credit per frame sent
/// down. Credits start at one (a freshly registered child takes one frame
/// on faith) and are replenished by the forwarder.
pub async fn run_child_dispatcher(
    queue: Arc<FrameQueue>,
    mut child: WriteConnection,
    credits: Arc<Semaphore>,
) -> crate::Result<()> {
    loop {
        match credits.acquire().await {
            Ok(permit) => permit.forget(),
            // Closed by the forwarder when the child hangs up.
            Err(_) => return Ok(()),
        }
        let Some(assignment) = queue.pull().await else {
            return Ok(());
        };

        let request = Request::Render(RenderRequest {
            session: assignment.job.session.clone(),
            frames: FrameSet::Single(assignment.frame),
            render_format: assignment.job.render_format.clone(),
        });
        child.write_header(&request).await?;
        debug!(frame = assignment.frame, "dispatched to child");
    }
}

/// Forwarder half of a child pairing: relay everything the child sends
/// verbatim towards the client, and bank a dispatch credit for every
/// REQUEST that passes through.
pub async fn run_child_forwarder(
    mut child: ReadConnection,
    writer: SharedWriter,
    credits: Arc<Semaphore>,
) -> crate::Result<()> {
    let result = forward(&mut child, &writer, &credits).await;
    // Stop the paired dispatcher either way; the child is gone.
    credits.close();
    result
}

async fn forward(
    child: &mut ReadConnection,
    writer: &SharedWriter,
    credits: &Arc<Semaphore>,
) -> crate::Result<()> {
    while let Some(message) = child.read_header::<Upstream>().await? {
        match &message {
            Upstream::Frame(header) => {
                let payload = child.read_payload(header.frame_size).await?;
                let mut writer = writer.lock().await;
                writer.write_message(&message, &payload).await?;
            }
            Upstream::Request { frame_count } => {
                {
                    let mut writer = writer.lock().await;
                    writer.write_header(&message).await?;
                }
                credits.add_permits(*frame_count as usize);
            }
        }
    }
    Ok(())
}
