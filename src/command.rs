//! Typed command channels between orchestration threads.
//!
//! Every cross-thread control path in the daemon is a [`CommandChannel`]:
//! a typed queue paired with a pipe doorbell so the receiving thread can
//! block in `poll` over the channel and a device descriptor together.
//! One doorbell byte is written per queued command and exactly one
//! command is drained per byte, so a worker that wakes up processes
//! exactly one command before returning to its poll loop.
//!
//! Commands that transfer resources (buffer map/unmap) carry a boxed
//! request record; ownership of the received descriptor moves with the
//! box, and the receiver signals the submitter's [`Completion`] after the
//! registry mutation finishes.

use crate::error::{Error, Result};
use crate::sensor::SensorMode;
use crate::stats::StatsKind;
use crate::registry::{StreamId, StreamKind};
use rustix::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex};

/// A command delivered to a worker thread.
#[derive(Debug)]
pub enum Command {
    /// Session-level control (auto-focus, snapshot preparation,
    /// parameter application).
    Session(SessionCmd),
    /// Stream lifecycle control.
    Stream(StreamCmd),
    /// Sensor worker control.
    Sensor(SensorCmd),
    /// CSI receiver worker control.
    Csi(CsiCmd),
    /// Lens actuator worker control.
    Actuator(ActuatorCmd),
    /// Flash worker control.
    Flash(FlashCmd),
    /// Statistics worker control.
    Stats(StatsCmd),
    /// Map a client buffer into the session registry.
    ///
    /// The receiver takes ownership of the request (and the descriptor
    /// inside it) and must complete it after acknowledging.
    MapBuffer(Box<MapRequest>),
    /// Unmap a previously mapped client buffer.
    UnmapBuffer(Box<UnmapRequest>),
    /// A child worker exited abnormally.
    WorkerFault {
        /// Name of the failed worker.
        worker: String,
    },
    /// Cooperative shutdown; the last command a worker observes.
    Shutdown,
}

/// Session-level sub-commands forwarded by the coordinator.
#[derive(Debug)]
pub enum SessionCmd {
    /// Start auto-focus movement.
    AfStart,
    /// Cancel auto-focus and park the lens.
    AfCancel,
    /// Arm the flash and pre-program the sensor for a snapshot.
    PrepareSnapshot,
    /// Walk the client parameter block and apply changed entries.
    ApplyParams,
}

/// Stream lifecycle sub-commands.
#[derive(Debug)]
pub enum StreamCmd {
    /// Allocate a stream slot; the submitter blocks on `done` until the
    /// slot exists.
    New {
        /// Client-chosen stream id.
        id: StreamId,
        /// Stream category.
        kind: StreamKind,
        /// Rendezvous signalled once the slot is allocated.
        done: CompletionGuard,
    },
    /// Free a stream slot; only legal when the stream is not streaming.
    Delete {
        /// Stream to free.
        id: StreamId,
    },
    /// Run the category-specific start sequence.
    Start {
        /// Stream to start.
        id: StreamId,
    },
    /// Run the category-specific stop sequence.
    Stop {
        /// Stream to stop.
        id: StreamId,
    },
}

/// Commands understood by the sensor worker.
#[derive(Debug)]
pub enum SensorCmd {
    /// Power the sensor up. Idempotent: a second power-up while already
    /// powered is a no-op.
    PowerUp,
    /// Change the sensor streaming mode. The submitter may wait on
    /// `done` to serialize ISP stream start with the mode change.
    Mode {
        /// Target mode.
        mode: SensorMode,
        /// Signalled when the mode-change register sequence completed.
        done: CompletionGuard,
    },
    /// Program the exposure gain.
    SetGain(u16),
    /// Antibanding mode (client parameter value).
    Antibanding(i32),
    /// White-balance mode.
    WhiteBalance(i32),
    /// Brightness level.
    Brightness(i32),
    /// Saturation level.
    Saturation(i32),
    /// Contrast level.
    Contrast(i32),
    /// Special effect mode.
    Effect(i32),
    /// Sharpness level.
    Sharpness(i32),
}

/// Commands understood by the CSI receiver worker.
#[derive(Debug)]
pub enum CsiCmd {
    /// Program lane count and settle time for the active sensor.
    Configure {
        /// Number of active data lanes.
        lanes: u8,
        /// Settle count in nanoseconds.
        settle_ns: u32,
    },
}

/// Commands understood by the lens actuator worker.
#[derive(Debug)]
pub enum ActuatorCmd {
    /// Move the lens toward a target position.
    Move {
        /// Target logical position.
        position: i32,
    },
    /// Park the lens at its rest position.
    Park,
}

/// Commands understood by the flash worker.
#[derive(Debug)]
pub enum FlashCmd {
    /// Set the flash mode.
    Set(FlashMode),
}

/// Flash operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    /// Flash off.
    Off,
    /// Continuous torch.
    Torch,
    /// Armed for a snapshot strobe.
    Strobe,
}

/// Commands understood by statistics workers.
#[derive(Debug)]
pub enum StatsCmd {
    /// Run the reduction over the mailbox work buffer and publish the
    /// result.
    Reduce,
}

/// Kind of client buffer carried by a map/unmap request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferKind {
    /// Capability advertisement block, one per session.
    Capability = 1,
    /// Parameter block, one per session.
    Parameter = 2,
    /// Per-stream info region (format, dimensions, buffer count).
    StreamInfo = 3,
    /// One slot of a stream's buffer set.
    StreamBuf = 4,
    /// Per-stream auxiliary metadata region.
    Metadata = 5,
}

impl TryFrom<u8> for BufferKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BufferKind::Capability),
            2 => Ok(BufferKind::Parameter),
            3 => Ok(BufferKind::StreamInfo),
            4 => Ok(BufferKind::StreamBuf),
            5 => Ok(BufferKind::Metadata),
            _ => Err(Error::Protocol(format!("unknown buffer kind: {}", value))),
        }
    }
}

/// A buffer-mapping request submitted to the session manager.
///
/// Owns the descriptor received over the share socket. If the request is
/// dropped without being completed (for example because the session
/// worker is unwinding), the waiting submitter is released with
/// [`Error::WorkerStopped`] and the descriptor is closed with the box.
#[derive(Debug)]
pub struct MapRequest {
    /// What the descriptor backs.
    pub kind: BufferKind,
    /// Stream the buffer belongs to (meaningful for stream kinds).
    pub stream: StreamId,
    /// Slot index within the stream's buffer set (`StreamBuf` only).
    pub slot: u8,
    /// Byte length of the shared region.
    pub len: u32,
    /// The received descriptor; the handler takes it on success.
    pub fd: Option<OwnedFd>,
    done: Completion,
}

impl MapRequest {
    /// Create a request owning `fd`.
    pub fn new(kind: BufferKind, stream: StreamId, slot: u8, len: u32, fd: OwnedFd) -> Self {
        Self {
            kind,
            stream,
            slot,
            len,
            fd: Some(fd),
            done: Completion::new(),
        }
    }

    /// Handle the submitter waits on.
    pub fn completion(&self) -> Completion {
        self.done.clone()
    }

    /// Signal the submitter with the mapping outcome.
    pub fn complete(&self, result: Result<()>) {
        self.done.signal(result);
    }
}

impl Drop for MapRequest {
    fn drop(&mut self) {
        self.done.signal(Err(Error::WorkerStopped));
    }
}

/// A buffer-unmapping request submitted to the session manager.
#[derive(Debug)]
pub struct UnmapRequest {
    /// What is being unmapped.
    pub kind: BufferKind,
    /// Stream the buffer belongs to.
    pub stream: StreamId,
    /// Slot index (`StreamBuf` only).
    pub slot: u8,
    done: Completion,
}

impl UnmapRequest {
    /// Create a request.
    pub fn new(kind: BufferKind, stream: StreamId, slot: u8) -> Self {
        Self {
            kind,
            stream,
            slot,
            done: Completion::new(),
        }
    }

    /// Handle the submitter waits on.
    pub fn completion(&self) -> Completion {
        self.done.clone()
    }

    /// Signal the submitter with the unmapping outcome.
    pub fn complete(&self, result: Result<()>) {
        self.done.signal(result);
    }
}

impl Drop for UnmapRequest {
    fn drop(&mut self) {
        self.done.signal(Err(Error::WorkerStopped));
    }
}

/// One-shot rendezvous between a submitting thread and the thread that
/// executes the operation.
///
/// The submitter clones the handle, sends the original with the request,
/// and calls [`Completion::wait`]; the executor calls
/// [`Completion::signal`] exactly once. Only the first signal is kept.
/// `wait` consumes the stored result, so a completion serves one waiter.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    result: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl Completion {
    /// Create an unsignalled completion.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Store the outcome and wake the waiter. Later signals are ignored.
    pub fn signal(&self, result: Result<()>) {
        let mut guard = self.inner.result.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(result);
            self.inner.cond.notify_all();
        }
    }

    /// Block until signalled and take the outcome.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self.inner.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = self
                .inner
                .cond
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    /// A guard half to embed in a command. If the command is dropped
    /// before the handler signals (for example because the target worker
    /// is unwinding), the waiter is released with
    /// [`Error::WorkerStopped`] instead of blocking forever.
    pub fn guard(&self) -> CompletionGuard {
        CompletionGuard(self.clone())
    }
}

/// Signalling half of a [`Completion`] that releases the waiter on drop.
#[derive(Debug)]
pub struct CompletionGuard(Completion);

impl CompletionGuard {
    /// Store the outcome and wake the waiter.
    pub fn signal(&self, result: Result<()>) {
        self.0.signal(result);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.signal(Err(Error::WorkerStopped));
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion")
    }
}

/// Factory for a connected sender/receiver pair.
pub struct CommandChannel;

impl CommandChannel {
    /// Create a command channel with its pollable doorbell.
    pub fn new() -> Result<(CommandSender, CommandReceiver)> {
        let (tx, rx) = kanal::unbounded();
        let (door_rx, door_tx) = rustix::pipe::pipe()?;
        Ok((
            CommandSender {
                tx,
                doorbell: Arc::new(door_tx),
            },
            CommandReceiver {
                rx,
                doorbell: door_rx,
            },
        ))
    }
}

/// Sending half of a command channel. Cloneable.
#[derive(Clone)]
pub struct CommandSender {
    tx: kanal::Sender<Command>,
    doorbell: Arc<OwnedFd>,
}

impl CommandSender {
    /// Queue a command and ring the doorbell.
    ///
    /// Fails with [`Error::ChannelClosed`] once the receiver is gone.
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::ChannelClosed)?;
        // The doorbell write blocks only if an enormous backlog of
        // unread wakeups has filled the pipe, which bounds the queue the
        // same way the original record pipe did. A write failure means
        // the read end is gone mid-teardown; the queued command is
        // unreachable, so report the channel closed.
        rustix::io::write(&*self.doorbell, &[0u8]).map_err(|_| Error::ChannelClosed)?;
        Ok(())
    }
}

/// Receiving half of a command channel.
pub struct CommandReceiver {
    rx: kanal::Receiver<Command>,
    doorbell: OwnedFd,
}

impl CommandReceiver {
    /// Descriptor to include in the owner's poll set; readable whenever
    /// at least one command is queued.
    pub fn doorbell_fd(&self) -> BorrowedFd<'_> {
        use rustix::fd::AsFd;
        self.doorbell.as_fd()
    }

    /// Drain one doorbell byte and take the matching command.
    ///
    /// Blocks only when called without a prior poll; after the doorbell
    /// polled readable this returns immediately.
    pub fn recv(&self) -> Result<Command> {
        let mut byte = [0u8; 1];
        rustix::io::read(&self.doorbell, &mut byte)?;
        self.rx.recv().map_err(|_| Error::ChannelClosed)
    }

    /// Number of commands queued but not yet received.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drop every queued command without handling it.
    ///
    /// Run by a worker after its loop exits, before teardown: dropping
    /// queued map/mode requests releases any thread still blocked on
    /// their completions, so joining child workers cannot deadlock on
    /// work this worker will never do.
    pub(crate) fn drain(&self) {
        while let Ok(Some(cmd)) = self.rx.try_recv() {
            drop(cmd);
        }
    }
}
