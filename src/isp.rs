//! Kernel device-control boundary.
//!
//! The daemon drives the image pipeline through typed request/response
//! operations; responses are success or failure, never partial. The
//! concrete character-device binding lives outside this crate: the
//! orchestration engine only sees these traits, and the test suite
//! drives it through the in-memory implementations in
//! [`crate::testing`].

use crate::error::Result;
use crate::registry::{HwFormat, StreamId, StreamKind};
use crate::stats::StatsKind;
use rustix::fd::BorrowedFd;

/// Hardware-assigned identifier for a registered buffer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u32);

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

/// ISP configuration operations, issued in category-specific ordered
/// sequences during stream start/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspOp {
    /// Full hardware reset. Issued once per session, before the first
    /// module configuration.
    Reset,
    /// Program the module composition for the session.
    ModuleConfig,
    /// Lens roll-off table.
    RollOff,
    /// Field-of-view crop.
    FieldOfView,
    /// Output scaler.
    Scaler,
    /// Axis and output routing.
    AxisOutput,
    /// Color-correction, sharpness, white-balance and black-level
    /// tables for the selected tuning profile.
    ColorTables,
    /// Input demultiplexer.
    Demux,
    /// Camera interface block.
    Camif,
    /// Frame-skip pattern.
    FrameSkip {
        /// Skip pattern bits.
        pattern: u32,
    },
    /// Stop the ISP output path.
    StopOutput,
}

/// Edge-delivered hardware events observed on the session's event
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspEvent {
    /// A new frame started on the sensor interface.
    StartOfFrame,
    /// The hardware wrote a statistics buffer.
    Stats {
        /// Which statistics pipeline produced it.
        kind: StatsKind,
        /// Hardware slot holding the samples.
        slot: u32,
    },
}

/// Control surface of the image-signal-processor device.
///
/// All operations are synchronous request/response; an `Err` means the
/// operation did not happen and committed no partial state.
pub trait IspOps: Send {
    /// Request a buffer queue for a stream, sized to its buffer count.
    fn request_stream_queue(&mut self, stream: StreamId, count: u32) -> Result<QueueHandle>;

    /// Request a buffer queue for a statistics pipeline.
    fn request_stats_queue(&mut self, kind: StatsKind, count: u32) -> Result<QueueHandle>;

    /// Release a queue handle and its hardware bookkeeping.
    fn release_queue(&mut self, queue: QueueHandle) -> Result<()>;

    /// Hand a buffer slot to the hardware.
    fn enqueue(&mut self, queue: QueueHandle, slot: u32) -> Result<()>;

    /// Take a fresh writable slot from the hardware buffer manager.
    fn acquire_slot(&mut self, queue: QueueHandle) -> Result<u32>;

    /// Return a filled slot to the hardware buffer manager.
    fn buffer_done(&mut self, queue: QueueHandle, slot: u32) -> Result<()>;

    /// Issue one configuration operation.
    fn configure(&mut self, op: IspOp) -> Result<()>;

    /// Announce a stream's output format and geometry.
    fn stream_request(
        &mut self,
        stream: StreamId,
        format: HwFormat,
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// Release a previously requested stream.
    fn stream_release(&mut self, stream: StreamId) -> Result<()>;

    /// Start hardware output on a stream.
    fn stream_start(&mut self, stream: StreamId) -> Result<()>;

    /// Stop hardware output on a stream.
    fn stream_stop(&mut self, stream: StreamId) -> Result<()>;

    /// Enable or disable a statistics pipeline.
    fn stats_configure(&mut self, kind: StatsKind, enable: bool) -> Result<()>;

    /// Copy the samples out of a hardware-written statistics slot.
    fn read_stats_slot(&mut self, kind: StatsKind, slot: u32) -> Result<Vec<u8>>;

    /// Zero a statistics slot before re-queueing it.
    fn clear_stats_slot(&mut self, kind: StatsKind, slot: u32) -> Result<()>;

    /// Pollable descriptor carrying [`IspEvent`]s.
    fn event_fd(&self) -> BorrowedFd<'_>;

    /// Drain one pending event; `None` once the descriptor is drained.
    fn next_event(&mut self) -> Result<Option<IspEvent>>;
}

/// Sub-commands of the session-level `set-parameter` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetParm {
    /// Allocate a stream slot.
    NewStream {
        /// Client-chosen stream id.
        id: StreamId,
        /// Stream category.
        kind: StreamKind,
    },
    /// Free a stream slot.
    DeleteStream {
        /// Stream to free.
        id: StreamId,
    },
    /// Start a stream.
    StreamStart {
        /// Stream to start.
        id: StreamId,
    },
    /// Stop a stream.
    StreamStop {
        /// Stream to stop.
        id: StreamId,
    },
    /// Start auto-focus.
    AfStart,
    /// Cancel auto-focus.
    AfCancel,
    /// Arm the flash for a snapshot.
    PrepareSnapshot,
    /// Apply changed entries of the client parameter block.
    ApplyParams,
}

/// Session-level notifications delivered to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A client opened a capture session.
    NewSession {
        /// Client session id.
        id: u32,
    },
    /// A client closed its capture session.
    DeleteSession {
        /// Client session id.
        id: u32,
    },
    /// A session control sub-command.
    SetParameter(SetParm),
    /// The client reads parameters through the shared block; the
    /// notification only needs an acknowledgment.
    GetParameter {
        /// Parameter id being read.
        id: u32,
    },
    /// A notification code outside the subscribed set.
    Unknown {
        /// Raw notification code.
        code: u32,
    },
}

/// Acknowledgment status reported back for every inbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Command handled.
    Success,
    /// Command failed or was not recognized.
    Failure,
}

/// The coordinator's session-level notification device.
pub trait NotifySource: Send {
    /// Pollable notification descriptor.
    fn fd(&self) -> BorrowedFd<'_>;

    /// Drain one pending notification; `None` once drained.
    fn next(&mut self) -> Result<Option<SessionEvent>>;

    /// Acknowledge a notification. Unknown commands are acknowledged as
    /// failures rather than ignored, so the client never waits forever.
    fn ack(&mut self, event: &SessionEvent, status: AckStatus) -> Result<()>;
}

/// Operations on the small fixed-function subdevices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdevOp {
    /// Program the CSI receiver for the active sensor link.
    CsiConfigure {
        /// Number of active data lanes.
        lanes: u8,
        /// Settle count in nanoseconds.
        settle_ns: u32,
    },
    /// Move the lens actuator.
    ActuatorMove {
        /// Target logical position.
        position: i32,
    },
    /// Park the lens actuator.
    ActuatorPark,
    /// Set the flash mode.
    FlashSet(crate::command::FlashMode),
}

/// Control surface of a fixed-function subdevice (CSI, actuator,
/// flash).
pub trait SubdevControl: Send {
    /// Apply one operation.
    fn apply(&mut self, op: SubdevOp) -> Result<()>;
}
