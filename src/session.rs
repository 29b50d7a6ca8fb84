//! Per-session stream orchestration.
//!
//! A [`StreamSessionManager`] runs as a worker subdevice: its command
//! channel carries session/stream control and buffer map/unmap
//! requests, and its device descriptor is the ISP event stream. It owns
//! the [`BufferRegistry`], the session's subdevice workers, and the
//! per-stream lifecycle state machine
//! `Unregistered → Registered → Streaming` and back.
//!
//! Ordering rules enforced here, per stream: stream-info mapping
//! precedes buffer binds and stream start; stream stop precedes
//! stream-info unmap; the hardware reset + module configuration runs
//! exactly once per session, when the first stream registers. Across
//! streams no order is imposed; the client may register preview,
//! video and snapshot in any order.

use crate::command::{
    ActuatorCmd, BufferKind, Command, Completion, CsiCmd, FlashCmd, FlashMode, MapRequest,
    SensorCmd, SessionCmd, StatsCmd, StreamCmd, UnmapRequest,
};
use crate::error::{Error, Result};
use crate::isp::{IspEvent, IspOp, IspOps, SubdevControl};
use crate::params::{ParamId, ParamShadow};
use crate::registry::{
    BoundSlot, BufferRegistry, StatsBufferInfo, StreamId, StreamKind, StreamState,
    translate_format,
};
use crate::sensor::{SensorMode, SensorRegistry};
use crate::share::{MappedRegion, ShareListener};
use crate::stats::{StatsEngine, StatsKind, StatsMailbox, StatsResult};
use crate::subdev::{ActuatorSubdev, CsiSubdev, FlashSubdev, SensorSubdev};
use crate::worker::{Flow, Subdev, Worker, WorkerCtx, WorkerHandle};
use rustix::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Buffer slots requested per statistics queue.
const STATS_SLOTS: u32 = 4;

/// Logical actuator position an auto-focus sweep starts from.
const AF_SCAN_START: i32 = 100;

/// Stream-info region header offsets (little-endian u32 fields).
const INFO_FORMAT: usize = 0;
const INFO_WIDTH: usize = 4;
const INFO_HEIGHT: usize = 8;
const INFO_COUNT: usize = 12;

/// Metadata slot layout written on every start-of-frame.
const META_AEC_VALID: usize = 0;
const META_AWB_VALID: usize = 4;
const META_AF_VALID: usize = 8;
const META_GAIN: usize = 12;
const META_PAYLOAD_LEN: usize = 16;
const META_PAYLOAD: usize = 20;

/// Static description of a capture session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client session id.
    pub session: u32,
    /// Sensor model name, resolved through the registry at init.
    pub sensor_name: String,
    /// Whether the statistics pipelines run for this session.
    pub enable_stats: bool,
    /// Share-socket path; `None` disables the listener (tests drive
    /// mapping through the command channel directly).
    pub share_socket: Option<PathBuf>,
}

/// Device handles a session is constructed over.
pub struct SessionDevices {
    /// The image-signal-processor control surface.
    pub isp: Box<dyn IspOps>,
    /// CSI receiver control, when the platform routes through one.
    pub csi: Option<Box<dyn SubdevControl>>,
    /// Lens actuator control, when the sensor advertises autofocus.
    pub actuator: Option<Box<dyn SubdevControl>>,
    /// Flash control, when present.
    pub flash: Option<Box<dyn SubdevControl>>,
}

/// One capture session's orchestration state machine.
pub struct StreamSessionManager {
    config: SessionConfig,
    sensors: Arc<SensorRegistry>,
    isp: Box<dyn IspOps>,
    pending_csi: Option<Box<dyn SubdevControl>>,
    pending_actuator: Option<Box<dyn SubdevControl>>,
    pending_flash: Option<Box<dyn SubdevControl>>,
    registry: BufferRegistry,
    shadow: ParamShadow,
    sensor: Option<WorkerHandle>,
    csi: Option<WorkerHandle>,
    actuator: Option<WorkerHandle>,
    flash: Option<WorkerHandle>,
    listener: Option<WorkerHandle>,
    hw_configured: bool,
}

impl StreamSessionManager {
    /// Build a session over its devices. Workers spawn in `init`, on
    /// the session thread.
    pub fn new(
        config: SessionConfig,
        devices: SessionDevices,
        sensors: Arc<SensorRegistry>,
    ) -> Self {
        Self {
            config,
            sensors,
            isp: devices.isp,
            pending_csi: devices.csi,
            pending_actuator: devices.actuator,
            pending_flash: devices.flash,
            registry: BufferRegistry::new(),
            shadow: ParamShadow::new(),
            sensor: None,
            csi: None,
            actuator: None,
            flash: None,
            listener: None,
            hw_configured: false,
        }
    }

    fn try_init(&mut self, ctx: &WorkerCtx) -> Result<()> {
        let session = self.config.session;

        let module = self.sensors.resolve(&self.config.sensor_name)?;
        let profile = *module.profile();
        let sensor = Worker::spawn_with_parent(
            "sensor",
            SensorSubdev::new(module, session),
            Some(ctx.sender.clone()),
        )?;
        self.sensor = Some(sensor);

        if let Some(dev) = self.pending_csi.take() {
            let csi = Worker::spawn("csi", CsiSubdev::new(dev))?;
            csi.send(Command::Csi(CsiCmd::Configure {
                lanes: profile.csi_lanes,
                settle_ns: profile.csi_settle_ns,
            }))?;
            self.csi = Some(csi);
        }
        if let Some(dev) = self.pending_actuator.take() {
            self.actuator = Some(Worker::spawn("actuator", ActuatorSubdev::new(dev))?);
        }
        if let Some(dev) = self.pending_flash.take() {
            self.flash = Some(Worker::spawn("flash", FlashSubdev::new(dev))?);
        }

        if self.config.enable_stats {
            for kind in StatsKind::ALL {
                let queue = self.isp.request_stats_queue(kind, STATS_SLOTS)?;
                self.isp.stats_configure(kind, true)?;
                for slot in 0..STATS_SLOTS {
                    self.isp.enqueue(queue, slot)?;
                }
                let mailbox = StatsMailbox::new();
                let worker = Worker::spawn(
                    &format!("stats-{}", kind),
                    StatsEngine::new(kind, Arc::clone(&mailbox)),
                )?;
                self.registry.set_stats(StatsBufferInfo {
                    kind,
                    queue,
                    mailbox,
                    worker,
                });
            }
        }

        if let Some(path) = self.config.share_socket.clone() {
            let listener = ShareListener::bind(&path, ctx.sender.clone())?;
            self.listener = Some(Worker::spawn("share", listener)?);
        }

        info!(session, sensor = profile.name, "session ready");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    fn handle_new_stream(&mut self, id: StreamId, kind: StreamKind) -> Result<()> {
        self.registry.allocate_stream(id, kind)?;
        // Idempotent; the sensor worker ignores repeats.
        self.sensor_send(SensorCmd::PowerUp)?;
        debug!(%id, %kind, "stream slot allocated");
        Ok(())
    }

    fn handle_delete_stream(&mut self, id: StreamId) -> Result<()> {
        let stream = self.registry.stream(id).ok_or(Error::NoSuchStream(id.0))?;
        if stream.state == StreamState::Streaming {
            return Err(Error::StreamBusy(id.0, "cannot delete while streaming"));
        }
        self.teardown_stream(id);
        let _ = self.registry.free_stream(id)?;
        debug!(%id, "stream slot freed");
        Ok(())
    }

    fn handle_stream_start(&mut self, id: StreamId) -> Result<()> {
        let stream = self.registry.stream(id).ok_or(Error::NoSuchStream(id.0))?;
        match stream.state {
            StreamState::Streaming => {
                debug!(%id, "stream already running");
                return Ok(());
            }
            StreamState::Unregistered => {
                return Err(Error::Protocol(format!("{} started before register", id)));
            }
            StreamState::Registered => {}
        }
        let kind = stream.kind;
        let format = stream
            .format
            .ok_or_else(|| Error::Protocol(format!("{} has no format", id)))?;
        let (width, height) = (stream.width, stream.height);
        let queue = stream.queue;
        let bound: Vec<u32> = stream
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect();

        // Preview and video wait for the sensor mode change before the
        // ISP starts, so the ISP never sees frames in the wrong format.
        match kind {
            StreamKind::Preview => self.sensor_mode(SensorMode::Preview)?,
            StreamKind::Video => self.sensor_mode(SensorMode::Video)?,
            StreamKind::Snapshot => self.sensor_mode(SensorMode::Snapshot)?,
            StreamKind::Postview | StreamKind::Metadata | StreamKind::Raw => {}
        }

        for op in start_sequence(kind) {
            self.isp.configure(*op)?;
        }
        self.isp.stream_request(id, format, width, height)?;

        if let Some(queue) = queue {
            for slot in &bound {
                self.isp.enqueue(queue, *slot)?;
            }
        }
        if bound.is_empty() {
            debug!(%id, "starting with no bound buffers");
        }

        self.isp.stream_start(id)?;
        if let Some(stream) = self.registry.stream_mut(id) {
            stream.state = StreamState::Streaming;
        }
        info!(%id, %kind, "stream started");
        Ok(())
    }

    fn handle_stream_stop(&mut self, id: StreamId) -> Result<()> {
        let stream = self.registry.stream(id).ok_or(Error::NoSuchStream(id.0))?;
        if stream.state != StreamState::Streaming {
            debug!(%id, "stream not running, stop is a no-op");
            return Ok(());
        }
        let kind = stream.kind;
        self.stop_one(id)?;

        // Snapshot and postview share the hardware pipeline; releasing
        // one releases both.
        if kind == StreamKind::Snapshot {
            let postview = self
                .registry
                .stream_by_kind(StreamKind::Postview)
                .filter(|s| s.state == StreamState::Streaming)
                .map(|s| s.id);
            if let Some(postview) = postview {
                self.stop_one(postview)?;
            }
        }
        Ok(())
    }

    fn stop_one(&mut self, id: StreamId) -> Result<()> {
        self.isp.stream_stop(id)?;
        self.isp.stream_release(id)?;
        self.isp.configure(IspOp::StopOutput)?;
        if let Some(stream) = self.registry.stream_mut(id) {
            stream.state = StreamState::Registered;
        }
        info!(%id, "stream stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffer mapping
    // ------------------------------------------------------------------

    fn handle_map(&mut self, req: &mut MapRequest) -> Result<()> {
        let fd = req
            .fd
            .take()
            .ok_or_else(|| Error::Protocol("mapping request without descriptor".into()))?;
        let len = req.len as usize;

        match req.kind {
            BufferKind::Capability => {
                self.registry.capability = Some(MappedRegion::map(fd, len)?);
                Ok(())
            }
            BufferKind::Parameter => {
                self.registry.params = Some(MappedRegion::map(fd, len)?);
                Ok(())
            }
            BufferKind::StreamInfo => self.map_stream_info(req.stream, fd, len),
            BufferKind::StreamBuf => self.map_stream_buf(req.stream, req.slot, fd, len),
            BufferKind::Metadata => {
                let stream = self
                    .registry
                    .stream_mut(req.stream)
                    .ok_or(Error::NoSuchStream(req.stream.0))?;
                stream.meta = Some(MappedRegion::map(fd, len)?);
                Ok(())
            }
        }
    }

    fn map_stream_info(
        &mut self,
        id: StreamId,
        fd: rustix::fd::OwnedFd,
        len: usize,
    ) -> Result<()> {
        {
            let stream = self.registry.stream(id).ok_or(Error::NoSuchStream(id.0))?;
            if stream.state != StreamState::Unregistered {
                return Err(Error::StreamBusy(id.0, "stream info already mapped"));
            }
        }

        let info = MappedRegion::map(fd, len)?;
        let format = translate_format(info.read_u32(INFO_FORMAT)?)?;
        let width = info.read_u32(INFO_WIDTH)?;
        let height = info.read_u32(INFO_HEIGHT)?;
        let count = info.read_u32(INFO_COUNT)?;

        let queue = self.isp.request_stream_queue(id, count)?;

        if !self.hw_configured {
            if let Err(e) = self
                .isp
                .configure(IspOp::Reset)
                .and_then(|()| self.isp.configure(IspOp::ModuleConfig))
            {
                // Nothing registered yet: give the queue back rather
                // than committing a half-configured stream.
                let _ = self.isp.release_queue(queue);
                return Err(e);
            }
            self.hw_configured = true;
        }

        let stream = self.registry.stream_mut(id).ok_or(Error::NoSuchStream(id.0))?;
        stream.format = Some(format);
        stream.width = width;
        stream.height = height;
        stream.buffer_count = count;
        stream.queue = Some(queue);
        stream.slots = (0..count).map(|_| None).collect();
        stream.info = Some(info);
        stream.state = StreamState::Registered;

        info!(%id, ?format, width, height, count, %queue, "stream registered");
        Ok(())
    }

    fn map_stream_buf(
        &mut self,
        id: StreamId,
        slot: u8,
        fd: rustix::fd::OwnedFd,
        len: usize,
    ) -> Result<()> {
        let kind = {
            let stream = self.registry.stream(id).ok_or(Error::NoSuchStream(id.0))?;
            if stream.state != StreamState::Registered {
                return Err(Error::StreamBusy(id.0, "buffers bind after register, before start"));
            }
            if usize::from(slot) >= stream.slots.len() {
                return Err(Error::Protocol(format!(
                    "{} slot {} out of range",
                    id, slot
                )));
            }
            if stream.slots[usize::from(slot)].is_some() {
                return Err(Error::Protocol(format!("{} slot {} already bound", id, slot)));
            }
            stream.kind
        };

        // Metadata slots are written by the session on every frame, so
        // they get mapped; other streams only need the descriptor held
        // for hardware enqueue.
        let bound = if kind == StreamKind::Metadata {
            BoundSlot::Mapped(MappedRegion::map(fd, len)?)
        } else {
            BoundSlot::Raw {
                fd,
                len: len as u32,
            }
        };

        let stream = self.registry.stream_mut(id).ok_or(Error::NoSuchStream(id.0))?;
        stream.slots[usize::from(slot)] = Some(bound);
        debug!(%id, slot, "buffer bound ({}/{})", stream.bound_slots(), stream.buffer_count);
        Ok(())
    }

    fn handle_unmap(&mut self, req: &UnmapRequest) -> Result<()> {
        match req.kind {
            BufferKind::Capability => self
                .registry
                .capability
                .take()
                .map(|_| ())
                .ok_or_else(|| Error::Protocol("capability buffer not mapped".into())),
            BufferKind::Parameter => self
                .registry
                .params
                .take()
                .map(|_| ())
                .ok_or_else(|| Error::Protocol("parameter buffer not mapped".into())),
            BufferKind::StreamInfo => {
                let stream = self
                    .registry
                    .stream(req.stream)
                    .ok_or(Error::NoSuchStream(req.stream.0))?;
                if stream.state == StreamState::Streaming {
                    return Err(Error::StreamBusy(req.stream.0, "stop precedes unmap"));
                }
                self.teardown_stream(req.stream);
                Ok(())
            }
            BufferKind::StreamBuf => {
                let stream = self
                    .registry
                    .stream_mut(req.stream)
                    .ok_or(Error::NoSuchStream(req.stream.0))?;
                if stream.state == StreamState::Streaming {
                    return Err(Error::StreamBusy(req.stream.0, "stop precedes unmap"));
                }
                stream
                    .slots
                    .get_mut(usize::from(req.slot))
                    .and_then(|s| s.take())
                    .map(|_| ())
                    .ok_or_else(|| {
                        Error::Protocol(format!("{} slot {} not bound", req.stream, req.slot))
                    })
            }
            BufferKind::Metadata => {
                let stream = self
                    .registry
                    .stream_mut(req.stream)
                    .ok_or(Error::NoSuchStream(req.stream.0))?;
                stream
                    .meta
                    .take()
                    .map(|_| ())
                    .ok_or_else(|| Error::Protocol("metadata region not mapped".into()))
            }
        }
    }

    /// Release a stream's hardware queue and every bound region, in
    /// that order, and reset the slot to unregistered. Leaves the slot
    /// allocated.
    fn teardown_stream(&mut self, id: StreamId) {
        let Some(stream) = self.registry.stream_mut(id) else {
            return;
        };
        if let Some(queue) = stream.queue.take() {
            if let Err(e) = self.isp.release_queue(queue) {
                warn!(%id, %queue, error = %e, "queue release failed");
            }
        }
        let Some(stream) = self.registry.stream_mut(id) else {
            return;
        };
        // Dropping the slots closes every bound descriptor, unmapping
        // the mapped ones first; then the info and meta regions unmap.
        stream.slots.clear();
        stream.meta = None;
        stream.info = None;
        stream.format = None;
        stream.width = 0;
        stream.height = 0;
        stream.buffer_count = 0;
        stream.state = StreamState::Unregistered;
        debug!(%id, "stream unregistered");
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    fn apply_params(&mut self) {
        let changes = match self.registry.params.as_ref() {
            Some(region) => self.shadow.apply(region),
            None => {
                warn!("parameter apply without a mapped parameter buffer");
                return;
            }
        };

        for change in changes {
            let value = change.value;
            let result = match change.id {
                ParamId::Antibanding => self.sensor_send(SensorCmd::Antibanding(value)),
                ParamId::WhiteBalance => self.sensor_send(SensorCmd::WhiteBalance(value)),
                ParamId::Effect => self.sensor_send(SensorCmd::Effect(value)),
                ParamId::Brightness => self.sensor_send(SensorCmd::Brightness(value)),
                ParamId::Contrast => self.sensor_send(SensorCmd::Contrast(value)),
                ParamId::Saturation => self.sensor_send(SensorCmd::Saturation(value)),
                ParamId::Sharpness => self.sensor_send(SensorCmd::Sharpness(value)),
                ParamId::FrameRate => self.isp.configure(IspOp::FrameSkip {
                    pattern: value as u32,
                }),
                ParamId::Zoom => self
                    .isp
                    .configure(IspOp::FieldOfView)
                    .and_then(|()| self.isp.configure(IspOp::Scaler)),
            };
            if let Err(e) = result {
                warn!(id = ?change.id, value, error = %e, "parameter apply failed");
            } else {
                debug!(id = ?change.id, value, "parameter applied");
            }
        }
    }

    // ------------------------------------------------------------------
    // Hardware events
    // ------------------------------------------------------------------

    fn handle_sof(&mut self) {
        let results: [Option<StatsResult>; 3] = [
            self.take_stats_result(StatsKind::Aec),
            self.take_stats_result(StatsKind::Awb),
            self.take_stats_result(StatsKind::Af),
        ];

        // Pending gain propagation to the sensor.
        if let Some(gain) = results[0].as_ref().and_then(|r| r.gain) {
            if let Err(e) = self.sensor_send(SensorCmd::SetGain(gain)) {
                warn!(gain, error = %e, "gain propagation failed");
            }
        }

        let target = self
            .registry
            .stream_by_kind(StreamKind::Metadata)
            .filter(|s| s.state == StreamState::Streaming)
            .and_then(|s| s.queue.map(|q| (s.id, q)));
        let Some((meta_id, queue)) = target else {
            return;
        };

        let slot = match self.isp.acquire_slot(queue) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(error = %e, "no metadata slot this frame");
                return;
            }
        };

        let gain = results[0]
            .as_ref()
            .and_then(|r| r.gain)
            .map(u32::from)
            .unwrap_or(0);
        let payload = results[1]
            .as_ref()
            .or(results[0].as_ref())
            .map(|r| r.payload.clone())
            .unwrap_or_default();

        if let Some(stream) = self.registry.stream_mut(meta_id) {
            if let Some(Some(BoundSlot::Mapped(region))) = stream.slots.get_mut(slot as usize) {
                let cap = region.len().saturating_sub(META_PAYLOAD);
                let take = payload.len().min(cap);
                let _ = region.write_u32(META_AEC_VALID, results[0].is_some() as u32);
                let _ = region.write_u32(META_AWB_VALID, results[1].is_some() as u32);
                let _ = region.write_u32(META_AF_VALID, results[2].is_some() as u32);
                let _ = region.write_u32(META_GAIN, gain);
                let _ = region.write_u32(META_PAYLOAD_LEN, take as u32);
                let _ = region.write_bytes(META_PAYLOAD, &payload[..take]);
            }
        }

        // Hand the slot straight back; the consumer reads it from the
        // shared mapping.
        if let Err(e) = self.isp.buffer_done(queue, slot) {
            warn!(slot, error = %e, "metadata buffer-done failed");
        }
    }

    fn take_stats_result(&self, kind: StatsKind) -> Option<StatsResult> {
        self.registry.stats(kind).and_then(|s| s.mailbox.take())
    }

    fn handle_stats(&mut self, kind: StatsKind, slot: u32) {
        let Some(info) = self.registry.stats(kind) else {
            warn!(%kind, "statistics event without a configured pipeline");
            return;
        };
        let queue = info.queue;

        let samples = match self.isp.read_stats_slot(kind, slot) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(%kind, slot, error = %e, "statistics read failed");
                return;
            }
        };

        if let Some(info) = self.registry.stats(kind) {
            info.mailbox.submit(&samples);
            if let Err(e) = info.worker.send(Command::Stats(StatsCmd::Reduce)) {
                warn!(%kind, error = %e, "statistics worker unreachable");
            }
        }
        if let Err(e) = self.isp.clear_stats_slot(kind, slot) {
            warn!(%kind, slot, error = %e, "statistics clear failed");
        }
        // Re-queue without waiting for the reduction: liveness over
        // freshness. A failed re-queue costs one slot, not the session.
        if let Err(e) = self.isp.enqueue(queue, slot) {
            warn!(%kind, slot, error = %e, "statistics re-queue failed");
        }
    }

    // ------------------------------------------------------------------
    // Helpers and teardown
    // ------------------------------------------------------------------

    fn sensor_send(&self, cmd: SensorCmd) -> Result<()> {
        match &self.sensor {
            Some(worker) => worker.send(Command::Sensor(cmd)),
            None => Err(Error::WorkerStopped),
        }
    }

    fn sensor_mode(&self, mode: SensorMode) -> Result<()> {
        let done = Completion::new();
        self.sensor_send(SensorCmd::Mode {
            mode,
            done: done.guard(),
        })?;
        done.wait()
    }

    fn release_all(&mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = listener.close();
        }

        for id in self.registry.stream_ids() {
            self.teardown_stream(id);
            let _ = self.registry.free_stream(id);
        }

        for kind in StatsKind::ALL {
            if let Some(info) = self.registry.take_stats(kind) {
                if let Err(e) = self.isp.stats_configure(kind, false) {
                    warn!(%kind, error = %e, "stats disable failed");
                }
                if let Err(e) = self.isp.release_queue(info.queue) {
                    warn!(%kind, error = %e, "stats queue release failed");
                }
                let _ = info.worker.close();
            }
        }

        for worker in [
            self.csi.take(),
            self.actuator.take(),
            self.flash.take(),
            self.sensor.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = worker.close();
        }

        self.registry.capability = None;
        self.registry.params = None;
    }
}

fn start_sequence(kind: StreamKind) -> &'static [IspOp] {
    match kind {
        StreamKind::Preview | StreamKind::Video => &[
            IspOp::RollOff,
            IspOp::FieldOfView,
            IspOp::Scaler,
            IspOp::AxisOutput,
            IspOp::ColorTables,
            IspOp::Demux,
            IspOp::Camif,
            IspOp::FrameSkip { pattern: 0 },
        ],
        StreamKind::Snapshot => &[
            IspOp::RollOff,
            IspOp::FieldOfView,
            IspOp::Scaler,
            IspOp::AxisOutput,
            IspOp::ColorTables,
            IspOp::Camif,
        ],
        StreamKind::Postview => &[IspOp::AxisOutput, IspOp::Camif],
        StreamKind::Metadata | StreamKind::Raw => &[],
    }
}

impl Subdev for StreamSessionManager {
    fn init(&mut self, ctx: &WorkerCtx) -> Result<()> {
        if let Err(e) = self.try_init(ctx) {
            // A session that fails to open leaves nothing behind.
            self.release_all();
            return Err(e);
        }
        Ok(())
    }

    fn command(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Stream(StreamCmd::New { id, kind, done }) => {
                let result = self.handle_new_stream(id, kind);
                if let Err(e) = &result {
                    warn!(%id, %kind, error = %e, "new stream failed");
                }
                done.signal(result);
                Ok(Flow::Continue)
            }
            Command::Stream(StreamCmd::Delete { id }) => {
                if let Err(e) = self.handle_delete_stream(id) {
                    warn!(%id, error = %e, "delete stream failed");
                }
                Ok(Flow::Continue)
            }
            Command::Stream(StreamCmd::Start { id }) => {
                if let Err(e) = self.handle_stream_start(id) {
                    warn!(%id, error = %e, "stream start failed");
                }
                Ok(Flow::Continue)
            }
            Command::Stream(StreamCmd::Stop { id }) => {
                if let Err(e) = self.handle_stream_stop(id) {
                    warn!(%id, error = %e, "stream stop failed");
                }
                Ok(Flow::Continue)
            }
            Command::Session(SessionCmd::AfStart) => {
                if let Some(actuator) = &self.actuator {
                    let _ = actuator.send(Command::Actuator(ActuatorCmd::Move {
                        position: AF_SCAN_START,
                    }));
                }
                Ok(Flow::Continue)
            }
            Command::Session(SessionCmd::AfCancel) => {
                if let Some(actuator) = &self.actuator {
                    let _ = actuator.send(Command::Actuator(ActuatorCmd::Park));
                }
                Ok(Flow::Continue)
            }
            Command::Session(SessionCmd::PrepareSnapshot) => {
                if let Some(flash) = &self.flash {
                    let _ = flash.send(Command::Flash(FlashCmd::Set(FlashMode::Strobe)));
                }
                Ok(Flow::Continue)
            }
            Command::Session(SessionCmd::ApplyParams) => {
                self.apply_params();
                Ok(Flow::Continue)
            }
            Command::MapBuffer(mut req) => {
                let result = self.handle_map(&mut req);
                if let Err(e) = &result {
                    warn!(kind = ?req.kind, stream = %req.stream, error = %e, "mapping failed");
                }
                req.complete(result);
                Ok(Flow::Continue)
            }
            Command::UnmapBuffer(req) => {
                let result = self.handle_unmap(&req);
                if let Err(e) = &result {
                    warn!(kind = ?req.kind, stream = %req.stream, error = %e, "unmapping failed");
                }
                req.complete(result);
                Ok(Flow::Continue)
            }
            Command::WorkerFault { worker } => {
                eprintln!("DBG session got WorkerFault from {worker}");
                // The sensor worker going down takes the session with
                // it; teardown runs in stop/shutdown.
                Err(Error::Device(format!("{} worker failed", worker)))
            }
            other => {
                warn!(command = ?other, "session ignores command");
                Ok(Flow::Continue)
            }
        }
    }

    fn device_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.isp.event_fd())
    }

    fn device_event(&mut self) -> Result<Flow> {
        while let Some(event) = self.isp.next_event()? {
            match event {
                IspEvent::StartOfFrame => self.handle_sof(),
                IspEvent::Stats { kind, slot } => self.handle_stats(kind, slot),
            }
        }
        Ok(Flow::Continue)
    }

    fn stop(&mut self) {
        let streaming: Vec<StreamId> = self
            .registry
            .streams()
            .filter(|s| s.state == StreamState::Streaming)
            .map(|s| s.id)
            .collect();
        for id in streaming {
            if let Err(e) = self.handle_stream_stop(id) {
                warn!(%id, error = %e, "forced stop failed");
            }
        }
    }

    fn shutdown(&mut self) {
        self.release_all();
        info!(session = self.config.session, "session closed");
    }
}
