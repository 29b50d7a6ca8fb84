//! Cross-process buffer sharing.
//!
//! The hardware-abstraction client hands memory to the daemon over a
//! unix datagram socket at a per-sensor well-known path: a fixed-layout
//! message identifies the buffer (kind, stream, slot, length) and the
//! descriptor rides along as `SCM_RIGHTS` ancillary data. A sentinel
//! message with no descriptor shuts the protocol down.
//!
//! The daemon side is [`ShareListener`], a worker subdevice: it decodes
//! each datagram into a map/unmap request, submits it to the session
//! manager's command channel, and blocks on the request's completion so
//! that (un)mapping is synchronous from the client's point of view even
//! though the registry mutation happens on the session thread.

pub mod fdpass;
pub mod mapping;

pub use mapping::MappedRegion;

use crate::command::{BufferKind, Command, CommandSender, MapRequest, UnmapRequest};
use crate::error::{Error, Result};
use crate::registry::StreamId;
use crate::worker::{Flow, Subdev};
use rustix::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MSG_FD_MAPPING: u8 = 1;
const MSG_FD_UNMAPPING: u8 = 2;
const MSG_SHUTDOWN: u8 = 255;

/// A decoded share-protocol message.
///
/// Wire layout, little-endian, 8 bytes:
/// `{msg_type: u8, kind: u8, stream: u8, slot: u8, len: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMsg {
    /// Map the attached descriptor.
    Mapping {
        /// What the descriptor backs.
        kind: BufferKind,
        /// Stream the buffer belongs to.
        stream: StreamId,
        /// Slot index within the stream's buffer set.
        slot: u8,
        /// Byte length of the shared region.
        len: u32,
    },
    /// Unmap a previously mapped buffer. No descriptor attached.
    Unmapping {
        /// What is being unmapped.
        kind: BufferKind,
        /// Stream the buffer belongs to.
        stream: StreamId,
        /// Slot index within the stream's buffer set.
        slot: u8,
    },
    /// Protocol shutdown sentinel. No descriptor attached.
    Shutdown,
}

impl ShareMsg {
    /// Encoded message size.
    pub const SIZE: usize = 8;

    /// Encode to the wire layout.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        match self {
            ShareMsg::Mapping {
                kind,
                stream,
                slot,
                len,
            } => {
                buf[0] = MSG_FD_MAPPING;
                buf[1] = kind as u8;
                buf[2] = stream.0;
                buf[3] = slot;
                buf[4..8].copy_from_slice(&len.to_le_bytes());
            }
            ShareMsg::Unmapping { kind, stream, slot } => {
                buf[0] = MSG_FD_UNMAPPING;
                buf[1] = kind as u8;
                buf[2] = stream.0;
                buf[3] = slot;
            }
            ShareMsg::Shutdown => {
                buf[0] = MSG_SHUTDOWN;
            }
        }
        buf
    }

    /// Decode from the wire layout, validating every field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol(format!(
                "share message too short: {} bytes",
                bytes.len()
            )));
        }
        match bytes[0] {
            MSG_FD_MAPPING => Ok(ShareMsg::Mapping {
                kind: BufferKind::try_from(bytes[1])?,
                stream: StreamId(bytes[2]),
                slot: bytes[3],
                len: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            }),
            MSG_FD_UNMAPPING => Ok(ShareMsg::Unmapping {
                kind: BufferKind::try_from(bytes[1])?,
                stream: StreamId(bytes[2]),
                slot: bytes[3],
            }),
            MSG_SHUTDOWN => Ok(ShareMsg::Shutdown),
            other => Err(Error::Protocol(format!(
                "unknown share message type: {}",
                other
            ))),
        }
    }
}

/// Client half of the share protocol.
///
/// This is what the hardware-abstraction process uses to hand buffers
/// to the daemon; the integration tests use it to play the client.
pub struct ShareClient {
    socket: UnixDatagram,
}

impl ShareClient {
    /// Connect to the daemon's share socket.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path.as_ref())?;
        Ok(Self { socket })
    }

    /// Hand a buffer to the daemon.
    pub fn send_mapping(
        &self,
        kind: BufferKind,
        stream: StreamId,
        slot: u8,
        len: u32,
        fd: BorrowedFd<'_>,
    ) -> Result<()> {
        let msg = ShareMsg::Mapping {
            kind,
            stream,
            slot,
            len,
        };
        fdpass::send_message(&self.socket, &msg.to_bytes(), Some(fd))
    }

    /// Ask the daemon to release a previously shared buffer.
    pub fn send_unmapping(&self, kind: BufferKind, stream: StreamId, slot: u8) -> Result<()> {
        let msg = ShareMsg::Unmapping { kind, stream, slot };
        fdpass::send_message(&self.socket, &msg.to_bytes(), None)
    }

    /// Signal protocol shutdown.
    pub fn send_shutdown(&self) -> Result<()> {
        fdpass::send_message(&self.socket, &ShareMsg::Shutdown.to_bytes(), None)
    }
}

/// Share-socket listener subdevice, one per physical sensor.
pub struct ShareListener {
    socket: UnixDatagram,
    path: PathBuf,
    session: CommandSender,
}

impl ShareListener {
    /// Bind the well-known socket path, replacing a stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P, session: CommandSender) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let socket = UnixDatagram::bind(&path)?;
        info!(path = %path.display(), "share socket bound");
        Ok(Self {
            socket,
            path,
            session,
        })
    }

    fn handle_datagram(&mut self) -> Result<Flow> {
        let mut buf = [0u8; ShareMsg::SIZE];
        let (n, fd) = fdpass::recv_message(&self.socket, &mut buf)?;

        let msg = match ShareMsg::from_bytes(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                // Closing the descriptor here is the receiver's duty.
                drop(fd);
                warn!(error = %e, "malformed share message dropped");
                return Ok(Flow::Continue);
            }
        };

        match msg {
            ShareMsg::Shutdown => {
                if fd.is_some() {
                    warn!("shutdown sentinel carried a descriptor, closed");
                }
                info!("share protocol shutdown");
                Ok(Flow::Shutdown)
            }
            ShareMsg::Mapping {
                kind,
                stream,
                slot,
                len,
            } => {
                let Some(fd) = fd else {
                    warn!(?kind, %stream, "mapping message without descriptor");
                    return Ok(Flow::Continue);
                };
                let req = Box::new(MapRequest::new(kind, stream, slot, len, fd));
                let done = req.completion();
                if self.session.send(Command::MapBuffer(req)).is_err() {
                    warn!("session channel closed, stopping listener");
                    return Ok(Flow::Shutdown);
                }
                // Synchronous from the client's point of view: wait for
                // the session thread to finish the registry mutation.
                match done.wait() {
                    Ok(()) => debug!(?kind, %stream, slot, len, "buffer mapped"),
                    Err(e) => warn!(?kind, %stream, slot, error = %e, "mapping failed"),
                }
                Ok(Flow::Continue)
            }
            ShareMsg::Unmapping { kind, stream, slot } => {
                if fd.is_some() {
                    warn!("unmapping message carried a descriptor, closed");
                }
                let req = Box::new(UnmapRequest::new(kind, stream, slot));
                let done = req.completion();
                if self.session.send(Command::UnmapBuffer(req)).is_err() {
                    warn!("session channel closed, stopping listener");
                    return Ok(Flow::Shutdown);
                }
                match done.wait() {
                    Ok(()) => debug!(?kind, %stream, slot, "buffer unmapped"),
                    Err(e) => warn!(?kind, %stream, slot, error = %e, "unmapping failed"),
                }
                Ok(Flow::Continue)
            }
        }
    }
}

impl Subdev for ShareListener {
    fn command(&mut self, cmd: Command) -> Result<Flow> {
        warn!(command = ?cmd, "share listener ignores commands");
        Ok(Flow::Continue)
    }

    fn device_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.socket.as_fd())
    }

    fn device_event(&mut self) -> Result<Flow> {
        self.handle_datagram()
    }

    fn shutdown(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
