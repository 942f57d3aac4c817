//! Readiness-driven streams over a single file descriptor.
//!
//! A [`Stream`] owns one descriptor and exposes independent readable and
//! writable halves:
//!
//! - **Read side**: when the descriptor becomes readable the stream drains the
//!   bytes the kernel reports (`FIONREAD`) into a reusable buffer and hands a
//!   borrowed slice to the data callback. An empty slice means end of stream;
//!   EOF and read errors both end up there.
//! - **Write side**: writes are appended to a FIFO of [`Bytes`] chunks and
//!   drained by a writer task whenever the descriptor is writable. Partial
//!   writes leave the unwritten remainder at the head of the queue. The queue
//!   lock is held only for queue manipulation, never across `write(2)`.
//!
//! Lifecycle: `Suspended` on creation, `Active` after [`Stream::resume`], and
//! `Canceled` after [`Stream::cancel`] or end of stream. Callbacks are delivered
//! through the stream's [`ExecutionContext`], so they never overlap for a given
//! stream and arrive in read order.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes};
use nix::poll::PollFlags;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::error::StreamError;
use crate::{fdpass, lock, sys};

/// Read size used when the kernel can't tell how much is pending.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Upper bound for a single read, whatever `FIONREAD` reports.
pub const MAX_READ_CHUNK: usize = 1024 * 1024;

/// Data callback. An empty slice signals end of stream.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Suspended,
    Active,
    Canceled,
}

enum Lifecycle {
    Suspended,
    /// Token stops the reader/writer tasks of this activation.
    Active(CancellationToken),
    Canceled,
}

/// Handle to a descriptor-backed stream. Clones share the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    fd: RawFd,
    readable: bool,
    writable: bool,
    context: ExecutionContext,
    io: Mutex<Option<Arc<AsyncFd<File>>>>,
    lifecycle: Mutex<Lifecycle>,
    on_data: Mutex<Option<DataCallback>>,
    /// Held by the active reader; keeps reads ordered across suspend/resume.
    read_buf: tokio::sync::Mutex<Vec<u8>>,
    write_queue: Mutex<VecDeque<Bytes>>,
    /// Shared with the writer task, which only holds the stream weakly while idle.
    write_ready: Arc<Notify>,
    write_drained: Notify,
    /// Held by the active writer.
    write_gate: Arc<tokio::sync::Mutex<()>>,
    eos_delivered: AtomicBool,
    cancel_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Stream {
    /// Wrap `fd` in a suspended stream.
    ///
    /// The descriptor is switched to non-blocking mode and registered with the
    /// reactor of `context`'s runtime. Fails if the descriptor is invalid or can't
    /// be polled (regular files, for instance).
    pub fn new(
        fd: impl Into<OwnedFd>,
        readable: bool,
        writable: bool,
        context: ExecutionContext,
    ) -> Result<Self, StreamError> {
        let fd: OwnedFd = fd.into();
        sys::set_nonblocking(fd.as_fd()).map_err(StreamError::InvalidDescriptor)?;
        let raw = fd.as_raw_fd();

        let interest = match (readable, writable) {
            (false, true) => Interest::WRITABLE,
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        let io = {
            let _runtime = context.handle().enter();
            AsyncFd::with_interest(File::from(fd), interest)
        }
        .map_err(StreamError::Register)?;

        tracing::debug!(
            fd = raw,
            readable,
            writable,
            context = context.label(),
            "Stream created"
        );

        Ok(Self {
            inner: Arc::new(StreamInner {
                fd: raw,
                readable,
                writable,
                context,
                io: Mutex::new(Some(Arc::new(io))),
                lifecycle: Mutex::new(Lifecycle::Suspended),
                on_data: Mutex::new(None),
                read_buf: tokio::sync::Mutex::new(Vec::new()),
                write_queue: Mutex::new(VecDeque::new()),
                write_ready: Arc::new(Notify::new()),
                write_drained: Notify::new(),
                write_gate: Arc::new(tokio::sync::Mutex::new(())),
                eos_delivered: AtomicBool::new(false),
                cancel_hook: Mutex::new(None),
            }),
        })
    }

    /// Read-only stream on its own execution context.
    pub fn read_only(fd: impl Into<OwnedFd>) -> Result<Self, StreamError> {
        Self::with_own_context(fd.into(), true, false)
    }

    /// Write-only stream on its own execution context.
    pub fn write_only(fd: impl Into<OwnedFd>) -> Result<Self, StreamError> {
        Self::with_own_context(fd.into(), false, true)
    }

    /// Readable and writable stream on its own execution context.
    pub fn duplex(fd: impl Into<OwnedFd>) -> Result<Self, StreamError> {
        Self::with_own_context(fd.into(), true, true)
    }

    fn with_own_context(fd: OwnedFd, readable: bool, writable: bool) -> Result<Self, StreamError> {
        let context = ExecutionContext::new(format!("fd-{}", fd.as_raw_fd()));
        Self::new(fd, readable, writable, context)
    }

    /// New stream over `fd` sharing this stream's context and data callback.
    pub fn derive(
        &self,
        fd: impl Into<OwnedFd>,
        readable: bool,
        writable: bool,
    ) -> Result<Stream, StreamError> {
        let derived = Stream::new(fd, readable, writable, self.inner.context.clone())?;
        if let Some(callback) = lock(&self.inner.on_data).clone() {
            derived.set_data_callback(callback);
        }
        Ok(derived)
    }

    /// Register the data callback, replacing any previous one.
    ///
    /// Called with each chunk read; an empty slice signals end of stream. The
    /// slice is only valid for the duration of the call.
    pub fn on_data(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.set_data_callback(Arc::new(callback));
    }

    pub fn set_data_callback(&self, callback: DataCallback) {
        *lock(&self.inner.on_data) = Some(callback);
    }

    /// Start delivering readiness events. No-op unless suspended.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stop delivering readiness events. No-op unless active.
    ///
    /// A callback already running finishes; queued writes stay queued.
    pub fn suspend(&self) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if !matches!(*lifecycle, Lifecycle::Active(_)) {
            return;
        }
        if let Lifecycle::Active(run) = std::mem::replace(&mut *lifecycle, Lifecycle::Suspended) {
            run.cancel();
        }
        tracing::debug!(fd = self.inner.fd, "Stream suspended");
    }

    /// Tear the stream down and close its descriptor. Safe to call repeatedly
    /// and from any thread, including from inside a callback.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn state(&self) -> StreamState {
        match *lock(&self.inner.lifecycle) {
            Lifecycle::Suspended => StreamState::Suspended,
            Lifecycle::Active(_) => StreamState::Active,
            Lifecycle::Canceled => StreamState::Canceled,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == StreamState::Suspended
    }

    pub fn is_readable(&self) -> bool {
        self.inner.readable
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    /// True until the stream is canceled.
    pub fn is_valid(&self) -> bool {
        !self.inner.is_canceled()
    }

    /// The underlying descriptor, or `None` once canceled.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.io().map(|io| io.as_raw_fd())
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    /// Queue a copy of `bytes`. Never blocks.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<(), StreamError> {
        self.write_owned(Bytes::copy_from_slice(bytes))
    }

    pub fn write_str(&self, text: &str) -> Result<(), StreamError> {
        self.write_bytes(text.as_bytes())
    }

    /// Queue a caller-provided chunk without copying it.
    pub fn write_owned(&self, bytes: impl Into<Bytes>) -> Result<(), StreamError> {
        if !self.inner.writable {
            return Err(StreamError::NotWritable);
        }
        let bytes = bytes.into();

        let lifecycle = lock(&self.inner.lifecycle);
        let active = match *lifecycle {
            Lifecycle::Canceled => return Err(StreamError::Canceled),
            Lifecycle::Active(_) => true,
            Lifecycle::Suspended => false,
        };
        if bytes.is_empty() {
            return Ok(());
        }
        lock(&self.inner.write_queue).push_back(bytes);
        drop(lifecycle);

        if active {
            self.inner.write_ready.notify_one();
        }
        Ok(())
    }

    /// Write all of `bytes` directly, bypassing the queue.
    ///
    /// Blocks the calling thread until everything is written. Meant for short
    /// synchronous sends, such as a last message during shutdown.
    pub fn write_unbuffered_bytes(&self, mut bytes: &[u8]) -> Result<(), StreamError> {
        if !self.inner.writable {
            return Err(StreamError::NotWritable);
        }
        let io = self.inner.io().ok_or(StreamError::Canceled)?;
        let mut file = io.get_ref();

        while !bytes.is_empty() {
            match file.write(bytes) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    sys::wait_ready(file.as_fd(), PollFlags::POLLOUT)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Send `fd` tagged with `name` over this stream's unix socket.
    ///
    /// Bypasses the write queue. Fails with
    /// [`crate::DescriptorError::NotUnixSocket`] if the stream's descriptor is
    /// not a unix domain socket.
    pub fn write_descriptor(&self, fd: BorrowedFd<'_>, name: &str) -> Result<(), StreamError> {
        if !self.inner.writable {
            return Err(StreamError::NotWritable);
        }
        let io = self.inner.io().ok_or(StreamError::Canceled)?;
        fdpass::send_descriptor(io.get_ref().as_fd(), fd, name)?;
        Ok(())
    }

    /// Number of chunks waiting in the write queue.
    pub fn pending_writes(&self) -> usize {
        lock(&self.inner.write_queue).len()
    }

    /// Wait until the write queue is empty or the stream is canceled.
    ///
    /// Never completes for a suspended stream with queued writes.
    pub async fn flush(&self) {
        loop {
            let drained = self.inner.write_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.inner.is_canceled() || lock(&self.inner.write_queue).is_empty() {
                return;
            }
            drained.await;
        }
    }

    /// Identity shared by all clones of this stream.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Run `hook` once when the stream is canceled (immediately if it already is).
    pub(crate) fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        if self.inner.is_canceled() {
            hook();
            return;
        }
        *lock(&self.inner.cancel_hook) = Some(Box::new(hook));
        // Lost the race with a concurrent cancel: run it ourselves.
        if self.inner.is_canceled()
            && let Some(hook) = lock(&self.inner.cancel_hook).take()
        {
            hook();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("fd", &self.inner.fd)
            .field("state", &self.state())
            .field("readable", &self.inner.readable)
            .field("writable", &self.inner.writable)
            .finish()
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Lifecycle::Active(run) = lifecycle {
            run.cancel();
        }
    }
}

impl StreamInner {
    fn io(&self) -> Option<Arc<AsyncFd<File>>> {
        lock(&self.io).clone()
    }

    fn is_canceled(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Canceled)
    }

    fn resume(self: &Arc<Self>) {
        let mut lifecycle = lock(&self.lifecycle);
        if !matches!(*lifecycle, Lifecycle::Suspended) {
            return;
        }
        let Some(io) = self.io() else {
            return;
        };

        let run = CancellationToken::new();
        let runtime = self.context.handle();
        if self.readable {
            runtime.spawn(read_loop(Arc::clone(self), Arc::clone(&io), run.clone()));
        }
        if self.writable {
            runtime.spawn(write_loop(
                Arc::downgrade(self),
                Arc::clone(&self.write_ready),
                Arc::clone(&self.write_gate),
                io,
                run.clone(),
            ));
        }
        *lifecycle = Lifecycle::Active(run);
        tracing::debug!(fd = self.fd, "Stream resumed");
    }

    fn cancel(&self) {
        let previous = std::mem::replace(&mut *lock(&self.lifecycle), Lifecycle::Canceled);
        match previous {
            Lifecycle::Canceled => return,
            Lifecycle::Active(run) => run.cancel(),
            Lifecycle::Suspended => {}
        }

        // Tasks still holding a clone release it as they stop; the descriptor
        // closes when the last clone drops.
        drop(lock(&self.io).take());
        // Callbacks often capture a clone of their own stream.
        drop(lock(&self.on_data).take());
        lock(&self.write_queue).clear();
        self.write_drained.notify_waiters();

        let hook = lock(&self.cancel_hook).take();
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!(fd = self.fd, "Stream canceled");
    }

    /// Runs on the execution context.
    fn deliver(&self, bytes: &[u8]) {
        if self.is_canceled() || self.eos_delivered.load(Ordering::Acquire) {
            return;
        }
        if bytes.is_empty() {
            self.eos_delivered.store(true, Ordering::Release);
        }
        let callback = lock(&self.on_data).clone();
        if let Some(callback) = callback {
            callback(bytes);
        }
    }

    async fn end_of_stream(self: &Arc<Self>) {
        if self.readable {
            let inner = Arc::clone(self);
            self.context.run(move || inner.deliver(&[])).await;
        }
        self.cancel();
    }

    /// Write queued chunks until the queue is empty.
    async fn drain(&self, io: &AsyncFd<File>, run: &CancellationToken) -> io::Result<()> {
        loop {
            let Some(chunk) = lock(&self.write_queue).front().cloned() else {
                self.write_drained.notify_waiters();
                return Ok(());
            };

            let mut ready = tokio::select! {
                biased;
                _ = run.cancelled() => return Ok(()),
                ready = io.writable() => ready?,
            };

            match ready.try_io(|io| {
                let mut file = io.get_ref();
                file.write(&chunk)
            }) {
                Err(_would_block) => continue,
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => self.consume(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Drop `written` bytes from the head chunk, popping it once exhausted.
    fn consume(&self, written: usize) {
        let mut queue = lock(&self.write_queue);
        if let Some(front) = queue.front_mut() {
            if written >= front.len() {
                queue.pop_front();
            } else {
                front.advance(written);
            }
        }
    }
}

async fn read_loop(inner: Arc<StreamInner>, io: Arc<AsyncFd<File>>, run: CancellationToken) {
    let mut slot = tokio::select! {
        biased;
        _ = run.cancelled() => return,
        slot = inner.read_buf.lock() => slot,
    };

    loop {
        let mut ready = tokio::select! {
            biased;
            _ = run.cancelled() => return,
            ready = io.readable() => match ready {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::debug!(fd = inner.fd, error = %e, "Readiness failed, ending stream");
                    break;
                }
            },
        };

        let want = match sys::bytes_available(io.get_ref().as_fd()) {
            Some(n) if n > 0 => n.min(MAX_READ_CHUNK),
            _ => DEFAULT_READ_CHUNK,
        };
        if slot.len() < want {
            slot.resize(want, 0);
        }

        let result = ready.try_io(|io| {
            let mut file = io.get_ref();
            file.read(&mut slot[..want])
        });
        drop(ready);

        match result {
            Err(_would_block) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let buf = std::mem::take(&mut *slot);
                let target = Arc::clone(&inner);
                let returned = inner
                    .context
                    .run(move || {
                        target.deliver(&buf[..n]);
                        buf
                    })
                    .await;
                match returned {
                    Some(buf) => *slot = buf,
                    None => {
                        tracing::warn!(fd = inner.fd, "Execution context gone, stopping reader");
                        return;
                    }
                }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                tracing::debug!(fd = inner.fd, error = %e, "Read failed, ending stream");
                break;
            }
        }
    }

    drop(slot);
    tracing::trace!(fd = inner.fd, "End of stream");
    inner.end_of_stream().await;
}

/// Holds the stream strongly only while draining, so an idle writer never
/// keeps a dropped stream (and its descriptor) alive.
async fn write_loop(
    stream: Weak<StreamInner>,
    write_ready: Arc<Notify>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    io: Arc<AsyncFd<File>>,
    run: CancellationToken,
) {
    let _gate = tokio::select! {
        biased;
        _ = run.cancelled() => return,
        gate = write_gate.lock_owned() => gate,
    };

    loop {
        {
            let Some(inner) = stream.upgrade() else {
                return;
            };
            if let Err(e) = inner.drain(&io, &run).await {
                tracing::debug!(fd = inner.fd, error = %e, "Write failed, ending stream");
                inner.end_of_stream().await;
                return;
            }
        }

        tokio::select! {
            biased;
            _ = run.cancelled() => return,
            _ = write_ready.notified() => {}
        }
    }
}
