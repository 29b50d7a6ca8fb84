//! Buffer registry: the session's bookkeeping of shared memory and
//! hardware queue handles.
//!
//! The registry is owned exclusively by the session-manager thread.
//! Other threads never touch it directly; they submit map/unmap
//! requests over the command channel and wait on the request's
//! completion.
//!
//! Streams live in a bounded arena with index-stable slots. Lookups
//! return `Option<&StreamBufferInfo>`, so an index into a freed slot
//! can never be mistaken for live data.

use crate::error::{Error, Result};
use crate::isp::QueueHandle;
use crate::share::MappedRegion;
use crate::stats::{STATS_KINDS, StatsKind, StatsMailbox};
use crate::worker::WorkerHandle;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Upper bound on concurrently allocated streams per session.
pub const MAX_STREAMS: usize = 5;

/// Client-chosen stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u8);

impl StreamId {
    /// Arena index for this id.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Stream categories; each has its own hardware programming sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Viewfinder output.
    Preview,
    /// Recording output.
    Video,
    /// Still-capture output.
    Snapshot,
    /// Post-capture review output; shares the snapshot pipeline.
    Postview,
    /// Per-frame metadata output.
    Metadata,
    /// Unprocessed sensor output.
    Raw,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamKind::Preview => "preview",
            StreamKind::Video => "video",
            StreamKind::Snapshot => "snapshot",
            StreamKind::Postview => "postview",
            StreamKind::Metadata => "metadata",
            StreamKind::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// Per-stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Slot allocated, no stream-info mapped.
    Unregistered,
    /// Stream-info mapped and hardware queue assigned.
    Registered,
    /// Hardware output running.
    Streaming,
}

/// Hardware output formats known to the translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwFormat {
    /// Planar YUV 4:2:0, V before U.
    Nv21,
    /// Planar YUV 4:2:0, U before V.
    Nv12,
    /// Packed YUV 4:2:2.
    Yuyv,
    /// 10-bit packed Bayer.
    Raw10,
}

/// Abstract format codes the client writes into a stream-info region.
pub mod client_format {
    /// YCrCb 4:2:0 semi-planar.
    pub const NV21: u32 = 0x11;
    /// Packed YUY2.
    pub const YUYV: u32 = 0x14;
    /// YCbCr 4:2:0 semi-planar.
    pub const NV12: u32 = 0x23;
    /// 10-bit raw Bayer.
    pub const RAW10: u32 = 0x25;
}

/// Translate a client format code to the hardware format.
///
/// Unknown codes are a hard error; the stream cannot be registered.
pub fn translate_format(code: u32) -> Result<HwFormat> {
    match code {
        client_format::NV21 => Ok(HwFormat::Nv21),
        client_format::NV12 => Ok(HwFormat::Nv12),
        client_format::YUYV => Ok(HwFormat::Yuyv),
        client_format::RAW10 => Ok(HwFormat::Raw10),
        other => Err(Error::UnknownFormat(other)),
    }
}

/// One bound buffer slot of a stream.
///
/// Dropping a slot closes its descriptor; mapped slots unmap first.
#[derive(Debug)]
pub enum BoundSlot {
    /// Descriptor held for hardware enqueue, not mapped in this
    /// process.
    Raw {
        /// The client's descriptor.
        fd: OwnedFd,
        /// Byte length of the buffer.
        len: u32,
    },
    /// Descriptor mapped into the daemon (metadata slots, which the
    /// session writes on every start-of-frame).
    Mapped(MappedRegion),
}

impl BoundSlot {
    /// Byte length of the slot.
    pub fn len(&self) -> u32 {
        match self {
            BoundSlot::Raw { len, .. } => *len,
            BoundSlot::Mapped(region) => region.len() as u32,
        }
    }

    /// True for zero-length slots (never constructed in practice).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the slot's descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        match self {
            BoundSlot::Raw { fd, .. } => fd.as_fd(),
            BoundSlot::Mapped(region) => region.fd(),
        }
    }
}

/// Registry record for one stream id.
#[derive(Debug)]
pub struct StreamBufferInfo {
    /// Stream id (arena index).
    pub id: StreamId,
    /// Stream category.
    pub kind: StreamKind,
    /// Lifecycle state.
    pub state: StreamState,
    /// Translated output format, set at registration.
    pub format: Option<HwFormat>,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Number of buffer slots the client configured.
    pub buffer_count: u32,
    /// Hardware queue handle, held from registration to unmap.
    pub queue: Option<QueueHandle>,
    /// Bound buffer slots, length `buffer_count` once registered.
    pub slots: Vec<Option<BoundSlot>>,
    /// Mapped stream-info region shared with the client.
    pub info: Option<MappedRegion>,
    /// Mapped per-stream auxiliary metadata region.
    pub meta: Option<MappedRegion>,
}

impl StreamBufferInfo {
    fn new(id: StreamId, kind: StreamKind) -> Self {
        Self {
            id,
            kind,
            state: StreamState::Unregistered,
            format: None,
            width: 0,
            height: 0,
            buffer_count: 0,
            queue: None,
            slots: Vec::new(),
            info: None,
            meta: None,
        }
    }

    /// Number of slots currently bound.
    pub fn bound_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Registry record for one statistics kind.
pub struct StatsBufferInfo {
    /// Statistics kind.
    pub kind: StatsKind,
    /// Hardware queue handle for the kind's buffer set.
    pub queue: QueueHandle,
    /// Mailbox shared with the kind's reduction worker.
    pub mailbox: Arc<StatsMailbox>,
    /// The reduction worker.
    pub worker: WorkerHandle,
}

/// All live shared memory and hardware handles of one session.
pub struct BufferRegistry {
    streams: [Option<StreamBufferInfo>; MAX_STREAMS],
    stats: [Option<StatsBufferInfo>; STATS_KINDS],
    /// Capability advertisement block shared with the client.
    pub capability: Option<MappedRegion>,
    /// Client-visible parameter block.
    pub params: Option<MappedRegion>,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            streams: [const { None }; MAX_STREAMS],
            stats: [const { None }; STATS_KINDS],
            capability: None,
            params: None,
        }
    }

    /// Allocate the slot for `id`.
    ///
    /// Out-of-range ids are a protocol violation; an occupied slot is
    /// resource exhaustion and commits nothing.
    pub fn allocate_stream(
        &mut self,
        id: StreamId,
        kind: StreamKind,
    ) -> Result<&mut StreamBufferInfo> {
        let index = id.index();
        if index >= MAX_STREAMS {
            return Err(Error::Protocol(format!("stream id out of range: {}", id)));
        }
        if self.streams[index].is_some() {
            return Err(Error::SlotsExhausted);
        }
        self.streams[index] = Some(StreamBufferInfo::new(id, kind));
        Ok(self.streams[index].as_mut().unwrap())
    }

    /// Look up a live stream.
    pub fn stream(&self, id: StreamId) -> Option<&StreamBufferInfo> {
        self.streams.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Look up a live stream mutably.
    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut StreamBufferInfo> {
        self.streams.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Free a stream slot, returning the record for teardown.
    pub fn free_stream(&mut self, id: StreamId) -> Result<StreamBufferInfo> {
        self.streams
            .get_mut(id.index())
            .and_then(|s| s.take())
            .ok_or(Error::NoSuchStream(id.0))
    }

    /// Iterate live streams.
    pub fn streams(&self) -> impl Iterator<Item = &StreamBufferInfo> {
        self.streams.iter().filter_map(|s| s.as_ref())
    }

    /// Ids of all live streams.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams().map(|s| s.id).collect()
    }

    /// First live stream of the given category.
    pub fn stream_by_kind(&self, kind: StreamKind) -> Option<&StreamBufferInfo> {
        self.streams().find(|s| s.kind == kind)
    }

    /// Install the statistics record for a kind.
    pub fn set_stats(&mut self, info: StatsBufferInfo) {
        let idx = info.kind.index();
        self.stats[idx] = Some(info);
    }

    /// Look up the statistics record for a kind.
    pub fn stats(&self, kind: StatsKind) -> Option<&StatsBufferInfo> {
        self.stats[kind.index()].as_ref()
    }

    /// Remove and return the statistics record for a kind.
    pub fn take_stats(&mut self, kind: StatsKind) -> Option<StatsBufferInfo> {
        self.stats[kind.index()].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_lookup() {
        let mut registry = BufferRegistry::new();
        registry
            .allocate_stream(StreamId(1), StreamKind::Preview)
            .unwrap();

        let stream = registry.stream(StreamId(1)).unwrap();
        assert_eq!(stream.kind, StreamKind::Preview);
        assert_eq!(stream.state, StreamState::Unregistered);
        assert!(registry.stream(StreamId(0)).is_none());
    }

    #[test]
    fn test_double_allocate_is_exhaustion() {
        let mut registry = BufferRegistry::new();
        registry
            .allocate_stream(StreamId(2), StreamKind::Video)
            .unwrap();
        let err = registry
            .allocate_stream(StreamId(2), StreamKind::Video)
            .unwrap_err();
        assert!(matches!(err, Error::SlotsExhausted));
    }

    #[test]
    fn test_out_of_range_id_rejected() {
        let mut registry = BufferRegistry::new();
        let err = registry
            .allocate_stream(StreamId(MAX_STREAMS as u8), StreamKind::Raw)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_free_returns_record_and_clears_slot() {
        let mut registry = BufferRegistry::new();
        registry
            .allocate_stream(StreamId(0), StreamKind::Snapshot)
            .unwrap();

        let record = registry.free_stream(StreamId(0)).unwrap();
        assert_eq!(record.kind, StreamKind::Snapshot);
        assert!(registry.stream(StreamId(0)).is_none());
        assert!(matches!(
            registry.free_stream(StreamId(0)),
            Err(Error::NoSuchStream(0))
        ));
    }

    #[test]
    fn test_format_translation_table() {
        assert_eq!(
            translate_format(client_format::NV21).unwrap(),
            HwFormat::Nv21
        );
        assert_eq!(
            translate_format(client_format::RAW10).unwrap(),
            HwFormat::Raw10
        );
        assert!(matches!(
            translate_format(0x7f),
            Err(Error::UnknownFormat(0x7f))
        ));
    }

    #[test]
    fn test_stream_by_kind() {
        let mut registry = BufferRegistry::new();
        registry
            .allocate_stream(StreamId(0), StreamKind::Preview)
            .unwrap();
        registry
            .allocate_stream(StreamId(3), StreamKind::Metadata)
            .unwrap();

        assert_eq!(
            registry.stream_by_kind(StreamKind::Metadata).unwrap().id,
            StreamId(3)
        );
        assert!(registry.stream_by_kind(StreamKind::Video).is_none());
    }
}
