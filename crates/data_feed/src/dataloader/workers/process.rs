//! src/dataloader/workers/process.rs
//!
//! Producer running in a forked worker process.
//!
//! # Architecture
//! ```text
//!   worker process                      consumer process
//!   ┌──────────────┐   pipe (frames)   ┌──────────────┐   put   ┌──────────────┐
//!   │ generator    │ ────────────────> │ relay thread │ ──────> │ BoundedQueue │ ──> DataLoaderIter
//!   │ + PipeSink   │ <──────────────── └──────────────┘         └──────────────┘         │
//!   └──────────────┘   pipe (credits)                                                     │
//!          ▲                                one credit per batch taken                    │
//!          └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The child runs the generator and writes length-prefixed bincode frames
//! (`Batch`, `End`, `Fault`). The relay thread in the consumer process decodes
//! them into the run's queue, so put/get/close/kill keep their meaning across
//! the process boundary:
//! - Each `Batch` frame costs the child one credit. It starts with `capacity`
//!   credits and the consumer hands one back per batch it takes, so the child
//!   blocks exactly where a `put` into a full queue would.
//! - `End` closes the queue, `Fault` kills it with the child's error text.
//! - EOF without `End` means the child died and kills the queue.
//! - EOF on the credit pipe means the consumer is gone; the child stops quietly.
//! - A killed queue (consumer timeout or abandon) stops the relay, and
//!   teardown SIGKILLs the child if it does not exit by itself.
//!
//! The consumer's wait bound lives entirely in the consumer process, so it
//! fires even when the child is asleep or deadlocked.
//!
//! NOTE: `fork` only duplicates the calling thread. The child never logs and
//!       leaves with `_exit`, so it does not touch locks or destructors owned
//!       by other threads of the parent.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{
    drive, spawn_error, BatchSink, GeneratorFactory, WORKER_JOIN_GRACE_MS,
    WORKER_POLL_INTERVAL_MS,
};
use crate::queue::BoundedQueue;

const FRAME_HEADER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 1 << 30;
const READ_CHUNK_LEN: usize = 64 * 1024;
const CREDIT_CHUNK_LEN: usize = 256;

/// Held from `pipe()` until the parent has closed its write end, so no other
/// run can fork a child that inherits that write end and masks the EOF
/// signalling a dead worker.
static FORK_LOCK: Mutex<()> = Mutex::new(());

/// Unit of the worker-to-consumer wire protocol.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Frame<B> {
    Batch(B),
    End,
    Fault(String),
}

/// Encodes a frame as `u32` little-endian length followed by its bincode body.
pub(crate) fn encode_frame<B: Serialize>(frame: &Frame<B>) -> Result<Vec<u8>> {
    let payload = bincode::serialize(frame).context("Failed to serialize frame")?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(anyhow!(
            "Frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        ));
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Default)]
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub(crate) fn next_frame<B: DeserializeOwned>(&mut self) -> Result<Option<Frame<B>>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(anyhow!("Frame header announces {} bytes", len));
        }

        let end = FRAME_HEADER_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let frame = bincode::deserialize(&self.buf[FRAME_HEADER_LEN..end])
            .context("Failed to deserialize frame")?;
        self.buf.drain(..end);
        Ok(Some(frame))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Child-side sink writing frames into the pipe.
struct PipeSink<B> {
    pipe: File,
    credits: File,
    available: usize,
    _batch: PhantomData<fn(B)>,
}

impl<B: Serialize> PipeSink<B> {
    fn write(&mut self, frame: &Frame<B>) -> Result<()> {
        let bytes = encode_frame(frame)?;
        self.pipe.write_all(&bytes)?;
        Ok(())
    }

    /// Takes one credit, blocking until the consumer hands one back.
    fn acquire_credit(&mut self) -> Result<()> {
        let mut buf = [0u8; CREDIT_CHUNK_LEN];
        while self.available == 0 {
            match self.credits.read(&mut buf) {
                Ok(0) => return Err(anyhow!("consumer closed the credit pipe")),
                Ok(n) => self.available += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.available -= 1;
        Ok(())
    }
}

impl<B: Serialize> BatchSink<B> for PipeSink<B> {
    fn push(&mut self, batch: B) -> Result<()> {
        match encode_frame(&Frame::Batch(batch)) {
            Ok(bytes) => {
                self.acquire_credit()?;
                Ok(self.pipe.write_all(&bytes)?)
            }
            Err(e) => {
                // An unserializable batch is a producer fault, not a silent stop.
                self.fail(format!("{:#}", e));
                Err(e)
            }
        }
    }

    fn finish(&mut self) {
        let _ = self.write(&Frame::End);
    }

    fn fail(&mut self, fault: String) {
        let _ = self.write(&Frame::Fault(fault));
    }
}

pub(crate) struct ProcessWorker {
    pid: libc::pid_t,
    relay: Option<JoinHandle<()>>,
    /// Write end of the credit pipe; closing it tells the child to stop.
    credits: Option<File>,
    reaped: bool,
    run_id: usize,
}

impl ProcessWorker {
    pub(crate) fn spawn<B>(
        generator: GeneratorFactory<B>,
        queue: Arc<BoundedQueue<B>>,
        run_id: usize,
    ) -> Result<Self>
    where
        B: Serialize + DeserializeOwned + Send + 'static,
    {
        let fork_guard = FORK_LOCK.lock();
        let (read_end, write_end) =
            pipe().map_err(|e| spawn_error("failed to create worker pipe".into(), e))?;
        let (credit_read, credit_write) =
            pipe().map_err(|e| spawn_error("failed to create credit pipe".into(), e))?;

        // SAFETY: the child only runs the generator, writes to its pipe and
        // leaves through `_exit`; see the module notes on fork.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(spawn_error(
                format!("failed to fork worker process {}", run_id),
                io::Error::last_os_error(),
            ));
        }

        if pid == 0 {
            drop(read_end);
            drop(credit_write);
            let mut sink = PipeSink {
                pipe: File::from(write_end),
                credits: File::from(credit_read),
                available: queue.capacity(),
                _batch: PhantomData,
            };
            drive(&generator, &mut sink);
            drop(sink);
            // SAFETY: terminates the child without unwinding into the parent's stack.
            unsafe { libc::_exit(0) }
        }

        drop(write_end);
        drop(credit_read);
        drop(fork_guard);
        tracing::debug!(run = run_id, pid, "worker process forked");

        let pipe = File::from(read_end);
        let relay = thread::Builder::new()
            .name(format!("data-feed-relay-{}", run_id))
            .spawn(move || relay_frames(pid, pipe, queue));

        let mut worker = Self {
            pid,
            relay: None,
            credits: Some(File::from(credit_write)),
            reaped: false,
            run_id,
        };
        match relay {
            Ok(handle) => {
                worker.relay = Some(handle);
                Ok(worker)
            }
            // Dropping `worker` kills and reaps the orphaned child.
            Err(e) => Err(spawn_error(
                format!("failed to spawn relay thread {}", run_id),
                e,
            )),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid as u32
    }

    pub(crate) fn run_id(&self) -> usize {
        self.run_id
    }

    /// Returns one credit to the child after the consumer took a batch.
    pub(crate) fn grant_credit(&self) {
        if let Some(credits) = &self.credits {
            // A dead child is reported through the data pipe, not here.
            let _ = (&*credits).write_all(&[1]);
        }
    }

    /// Reaps the child if it has exited. Returns true once it is gone.
    fn try_reap(&mut self, flags: libc::c_int) -> bool {
        if self.reaped {
            return true;
        }
        let mut status: libc::c_int = 0;
        // SAFETY: plain waitpid on our own child with a valid status pointer.
        let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
        if rc == self.pid {
            tracing::debug!(run = self.run_id, pid = self.pid, status, "worker process reaped");
            self.reaped = true;
        } else if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            // ECHILD: already reaped elsewhere, nothing left to wait for
            self.reaped = true;
        }
        self.reaped
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // EOF on the credit pipe lets a child waiting for room leave on its own.
        drop(self.credits.take());

        let deadline = Instant::now() + Duration::from_millis(WORKER_JOIN_GRACE_MS);
        while !self.try_reap(libc::WNOHANG) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if !self.reaped {
            tracing::debug!(run = self.run_id, pid = self.pid, "terminating worker process");
            // SAFETY: signalling our own, not yet reaped, child.
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
            }
            while !self.try_reap(0) {}
        }

        // With the child gone the pipe hits EOF, and a dead queue stops the
        // relay at its next poll.
        if let Some(relay) = self.relay.take() {
            let _ = relay.join();
        }
    }
}

/// Moves frames from the worker pipe into the queue until the stream ends,
/// the worker faults or dies, or the queue is killed from the consumer side.
fn relay_frames<B: DeserializeOwned>(pid: libc::pid_t, mut pipe: File, queue: Arc<BoundedQueue<B>>) {
    let mut decoder = FrameDecoder::default();
    let mut chunk = vec![0u8; READ_CHUNK_LEN];
    let poll_interval = Duration::from_millis(WORKER_POLL_INTERVAL_MS);

    loop {
        match decoder.next_frame::<B>() {
            Ok(Some(Frame::Batch(batch))) => {
                if queue.put(batch).is_err() {
                    return;
                }
                continue;
            }
            Ok(Some(Frame::End)) => {
                queue.close();
                return;
            }
            Ok(Some(Frame::Fault(fault))) => {
                tracing::warn!(pid, fault = %fault, "worker process reported a generator fault");
                queue.kill(Some(fault));
                return;
            }
            Ok(None) => {}
            Err(e) => {
                queue.kill(Some(format!("corrupt frame from worker process (pid {}): {:#}", pid, e)));
                return;
            }
        }

        if queue.is_killed() {
            return;
        }

        match wait_readable(&pipe, poll_interval) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                queue.kill(Some(format!("failed to poll worker process (pid {}): {}", pid, e)));
                return;
            }
        }

        match pipe.read(&mut chunk) {
            Ok(0) => {
                tracing::error!(
                    pid,
                    partial_frame = !decoder.is_empty(),
                    "worker process closed its pipe without end-of-stream"
                );
                queue.kill(Some(format!(
                    "DataLoader worker process (pid {}) exited unexpectedly",
                    pid
                )));
                return;
            }
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) => {
                queue.kill(Some(format!("failed to read from worker process (pid {}): {}", pid, e)));
                return;
            }
        }
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and have no other owner.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn wait_readable(pipe: &File, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: pipe.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd for a descriptor we own.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}
