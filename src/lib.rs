//! # Aperture
//!
//! A userspace camera session-orchestration daemon core.
//!
//! Aperture sits between a camera hardware-abstraction client and the
//! kernel video-capture subdevices (sensor, CSI receiver, ISP, lens
//! actuator, flash). It turns session and stream requests into ordered
//! device-control sequences, tracks every shared buffer and hardware
//! queue handle the client hands over, and feeds autoexposure numbers
//! back into the sensor control loop.
//!
//! ## Architecture
//!
//! - **Workers**: every hardware-facing driver is a [`worker::Worker`]
//!   running a [`worker::Subdev`] capability table on its own thread,
//!   blocked in a poll over a typed, doorbell-backed command channel.
//! - **Sessions**: a [`session::StreamSessionManager`] per capture
//!   session owns the buffer registry and the per-stream lifecycle
//!   state machine, driven by the [`coordinator::SessionCoordinator`].
//! - **Buffer sharing**: the client passes descriptors over a unix
//!   socket ([`share`]); mappings live in the registry until the
//!   matching unmap, which restores the exact pre-map state.
//! - **3A loop**: statistics buffers are reduced off the capture path
//!   by [`stats`] workers; results propagate to the sensor at frame
//!   boundaries and are never waited on.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use aperture::prelude::*;
//!
//! let mut coordinator = SessionCoordinator::new(notify_device, session_factory)?;
//! let exit_code = coordinator.run()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod coordinator;
pub mod error;
pub mod isp;
pub mod params;
pub mod registry;
pub mod sensor;
pub mod session;
pub mod share;
pub mod stats;
pub mod subdev;
pub mod testing;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::command::{Command, CommandChannel, CommandSender, Completion};
    pub use crate::coordinator::{SessionCoordinator, SessionFactory};
    pub use crate::error::{Error, Result};
    pub use crate::isp::{IspOps, NotifySource, SessionEvent, SetParm};
    pub use crate::registry::{StreamId, StreamKind};
    pub use crate::sensor::{SensorModule, SensorRegistry};
    pub use crate::session::{SessionConfig, SessionDevices, StreamSessionManager};
    pub use crate::worker::{Subdev, Worker, WorkerHandle};
}

pub use error::{Error, Result};
