//! In-memory fakes for the kernel boundary, used by the test suites.
//!
//! [`ScriptedIsp`] records every control operation in order and lets a
//! test inject hardware events through a pollable doorbell, so the full
//! session state machine runs against it unmodified. [`RecordingNotify`]
//! does the same for the coordinator's notification device.

use crate::error::{Error, Result};
use crate::isp::{
    AckStatus, IspEvent, IspOp, IspOps, NotifySource, QueueHandle, SessionEvent, SubdevControl,
    SubdevOp,
};
use crate::registry::{HwFormat, StreamId};
use crate::sensor::{
    RegisterSequence, SensorCaps, SensorContext, SensorModule, SensorProfile, SensorRegistry,
    StreamAttributes,
};
use crate::stats::StatsKind;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Create a sized memfd, the stand-in for client-allocated buffers.
pub fn memfd(len: u64) -> OwnedFd {
    use rustix::fs::{MemfdFlags, memfd_create};
    let fd = memfd_create("aperture-test", MemfdFlags::CLOEXEC).expect("memfd_create");
    rustix::fs::ftruncate(&fd, len).expect("ftruncate");
    fd
}

/// One recorded ISP control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspCall {
    /// `request_stream_queue`
    RequestStreamQueue(StreamId, u32),
    /// `request_stats_queue`
    RequestStatsQueue(StatsKind, u32),
    /// `release_queue`
    ReleaseQueue(QueueHandle),
    /// `enqueue`
    Enqueue(QueueHandle, u32),
    /// `acquire_slot`
    AcquireSlot(QueueHandle),
    /// `buffer_done`
    BufferDone(QueueHandle, u32),
    /// `configure`
    Configure(IspOp),
    /// `stream_request`
    StreamRequest(StreamId, HwFormat, u32, u32),
    /// `stream_release`
    StreamRelease(StreamId),
    /// `stream_start`
    StreamStart(StreamId),
    /// `stream_stop`
    StreamStop(StreamId),
    /// `stats_configure`
    StatsConfigure(StatsKind, bool),
    /// `read_stats_slot`
    ReadStats(StatsKind, u32),
    /// `clear_stats_slot`
    ClearStats(StatsKind, u32),
}

/// Failure switches a test can flip on a [`ScriptedIsp`].
#[derive(Default)]
pub struct FailFlags {
    /// Next `request_stream_queue` fails.
    pub stream_queue: AtomicBool,
    /// Next `acquire_slot` fails.
    pub acquire_slot: AtomicBool,
}

/// Test-side handle to a [`ScriptedIsp`].
#[derive(Clone)]
pub struct IspProbe {
    log: Arc<Mutex<Vec<IspCall>>>,
    events: Arc<Mutex<VecDeque<IspEvent>>>,
    door_w: Arc<OwnedFd>,
    stats_samples: Arc<Mutex<HashMap<StatsKind, Vec<u8>>>>,
    /// Failure switches.
    pub fail: Arc<FailFlags>,
}

impl IspProbe {
    /// Snapshot of all recorded calls.
    pub fn calls(&self) -> Vec<IspCall> {
        self.log.lock().unwrap().clone()
    }

    /// Number of recorded calls matching a predicate.
    pub fn count(&self, pred: impl Fn(&IspCall) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Inject a hardware event; the session's poll loop wakes on it.
    pub fn push_event(&self, event: IspEvent) {
        self.events.lock().unwrap().push_back(event);
        rustix::io::write(&*self.door_w, &[0u8]).expect("event doorbell");
    }

    /// Set the samples `read_stats_slot` returns for a kind.
    pub fn set_stats_samples(&self, kind: StatsKind, samples: Vec<u8>) {
        self.stats_samples.lock().unwrap().insert(kind, samples);
    }
}

/// An in-memory ISP that records operations and replays injected
/// events.
pub struct ScriptedIsp {
    log: Arc<Mutex<Vec<IspCall>>>,
    events: Arc<Mutex<VecDeque<IspEvent>>>,
    door_r: OwnedFd,
    stats_samples: Arc<Mutex<HashMap<StatsKind, Vec<u8>>>>,
    fail: Arc<FailFlags>,
    next_queue: u32,
    next_meta_slot: u32,
}

impl ScriptedIsp {
    /// Build the fake and its test-side probe.
    pub fn new() -> (ScriptedIsp, IspProbe) {
        let (door_r, door_w) = rustix::pipe::pipe().expect("pipe");
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(VecDeque::new()));
        let stats_samples = Arc::new(Mutex::new(HashMap::new()));
        let fail = Arc::new(FailFlags::default());
        let probe = IspProbe {
            log: Arc::clone(&log),
            events: Arc::clone(&events),
            door_w: Arc::new(door_w),
            stats_samples: Arc::clone(&stats_samples),
            fail: Arc::clone(&fail),
        };
        (
            ScriptedIsp {
                log,
                events,
                door_r,
                stats_samples,
                fail,
                next_queue: 1,
                next_meta_slot: 0,
            },
            probe,
        )
    }

    fn record(&self, call: IspCall) {
        self.log.lock().unwrap().push(call);
    }
}

impl IspOps for ScriptedIsp {
    fn request_stream_queue(&mut self, stream: StreamId, count: u32) -> Result<QueueHandle> {
        if self.fail.stream_queue.swap(false, Ordering::SeqCst) {
            return Err(Error::Device("queue request refused".into()));
        }
        self.record(IspCall::RequestStreamQueue(stream, count));
        let handle = QueueHandle(self.next_queue);
        self.next_queue += 1;
        Ok(handle)
    }

    fn request_stats_queue(&mut self, kind: StatsKind, count: u32) -> Result<QueueHandle> {
        self.record(IspCall::RequestStatsQueue(kind, count));
        let handle = QueueHandle(self.next_queue);
        self.next_queue += 1;
        Ok(handle)
    }

    fn release_queue(&mut self, queue: QueueHandle) -> Result<()> {
        self.record(IspCall::ReleaseQueue(queue));
        Ok(())
    }

    fn enqueue(&mut self, queue: QueueHandle, slot: u32) -> Result<()> {
        self.record(IspCall::Enqueue(queue, slot));
        Ok(())
    }

    fn acquire_slot(&mut self, queue: QueueHandle) -> Result<u32> {
        if self.fail.acquire_slot.swap(false, Ordering::SeqCst) {
            return Err(Error::Device("no free slot".into()));
        }
        self.record(IspCall::AcquireSlot(queue));
        let slot = self.next_meta_slot;
        self.next_meta_slot = (self.next_meta_slot + 1) % 2;
        Ok(slot)
    }

    fn buffer_done(&mut self, queue: QueueHandle, slot: u32) -> Result<()> {
        self.record(IspCall::BufferDone(queue, slot));
        Ok(())
    }

    fn configure(&mut self, op: IspOp) -> Result<()> {
        self.record(IspCall::Configure(op));
        Ok(())
    }

    fn stream_request(
        &mut self,
        stream: StreamId,
        format: HwFormat,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.record(IspCall::StreamRequest(stream, format, width, height));
        Ok(())
    }

    fn stream_release(&mut self, stream: StreamId) -> Result<()> {
        self.record(IspCall::StreamRelease(stream));
        Ok(())
    }

    fn stream_start(&mut self, stream: StreamId) -> Result<()> {
        self.record(IspCall::StreamStart(stream));
        Ok(())
    }

    fn stream_stop(&mut self, stream: StreamId) -> Result<()> {
        self.record(IspCall::StreamStop(stream));
        Ok(())
    }

    fn stats_configure(&mut self, kind: StatsKind, enable: bool) -> Result<()> {
        self.record(IspCall::StatsConfigure(kind, enable));
        Ok(())
    }

    fn read_stats_slot(&mut self, kind: StatsKind, slot: u32) -> Result<Vec<u8>> {
        self.record(IspCall::ReadStats(kind, slot));
        Ok(self
            .stats_samples
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    fn clear_stats_slot(&mut self, kind: StatsKind, slot: u32) -> Result<()> {
        self.record(IspCall::ClearStats(kind, slot));
        Ok(())
    }

    fn event_fd(&self) -> BorrowedFd<'_> {
        self.door_r.as_fd()
    }

    fn next_event(&mut self) -> Result<Option<IspEvent>> {
        let event = self.events.lock().unwrap().pop_front();
        if event.is_some() {
            let mut byte = [0u8; 1];
            rustix::io::read(&self.door_r, &mut byte)?;
        }
        Ok(event)
    }
}

/// Test-side driver for a [`RecordingNotify`].
#[derive(Clone)]
pub struct NotifyDriver {
    events: Arc<Mutex<VecDeque<SessionEvent>>>,
    door_w: Arc<OwnedFd>,
    acks: Arc<Mutex<Vec<(SessionEvent, AckStatus)>>>,
}

impl NotifyDriver {
    /// Deliver a notification; the coordinator's poll loop wakes on it.
    pub fn push(&self, event: SessionEvent) {
        self.events.lock().unwrap().push_back(event);
        rustix::io::write(&*self.door_w, &[0u8]).expect("notify doorbell");
    }

    /// Acknowledgments recorded so far.
    pub fn acks(&self) -> Vec<(SessionEvent, AckStatus)> {
        self.acks.lock().unwrap().clone()
    }

    /// Block until `n` acknowledgments arrived or the timeout passes.
    pub fn wait_for_acks(&self, n: usize, timeout: std::time::Duration) -> Vec<(SessionEvent, AckStatus)> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let acks = self.acks();
            if acks.len() >= n || std::time::Instant::now() >= deadline {
                return acks;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }
}

/// An in-memory notification device that records acknowledgments.
pub struct RecordingNotify {
    events: Arc<Mutex<VecDeque<SessionEvent>>>,
    door_r: OwnedFd,
    acks: Arc<Mutex<Vec<(SessionEvent, AckStatus)>>>,
}

impl RecordingNotify {
    /// Build the fake and its test-side driver.
    pub fn new() -> (RecordingNotify, NotifyDriver) {
        let (door_r, door_w) = rustix::pipe::pipe().expect("pipe");
        let events = Arc::new(Mutex::new(VecDeque::new()));
        let acks = Arc::new(Mutex::new(Vec::new()));
        let driver = NotifyDriver {
            events: Arc::clone(&events),
            door_w: Arc::new(door_w),
            acks: Arc::clone(&acks),
        };
        (
            RecordingNotify {
                events,
                door_r,
                acks,
            },
            driver,
        )
    }
}

impl NotifySource for RecordingNotify {
    fn fd(&self) -> BorrowedFd<'_> {
        self.door_r.as_fd()
    }

    fn next(&mut self) -> Result<Option<SessionEvent>> {
        let event = self.events.lock().unwrap().pop_front();
        if event.is_some() {
            let mut byte = [0u8; 1];
            rustix::io::read(&self.door_r, &mut byte)?;
        }
        Ok(event)
    }

    fn ack(&mut self, event: &SessionEvent, status: AckStatus) -> Result<()> {
        self.acks.lock().unwrap().push((*event, status));
        Ok(())
    }
}

/// A subdevice control that records every applied operation.
pub struct RecordingSubdev {
    ops: Arc<Mutex<Vec<SubdevOp>>>,
}

impl RecordingSubdev {
    /// Build the fake and the shared op log.
    pub fn new() -> (Box<dyn SubdevControl>, Arc<Mutex<Vec<SubdevOp>>>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(RecordingSubdev {
                ops: Arc::clone(&ops),
            }),
            ops,
        )
    }
}

impl SubdevControl for RecordingSubdev {
    fn apply(&mut self, op: SubdevOp) -> Result<()> {
        self.ops.lock().unwrap().push(op);
        Ok(())
    }
}

/// Profile of the synthetic test sensor.
pub const TEST_SENSOR: SensorProfile = SensorProfile {
    name: "testcam",
    attributes: StreamAttributes {
        max_width: 1280,
        max_height: 960,
        preview_fps: 30,
        snapshot_fps: 15,
    },
    tuning: 0,
    caps: SensorCaps {
        autofocus: true,
        flash: true,
        video: true,
    },
    csi_lanes: 2,
    csi_settle_ns: 14_000,
    stop_seq: RegisterSequence::EMPTY,
    init_seq: RegisterSequence::EMPTY,
    preview_seq: RegisterSequence::EMPTY,
    snapshot_seq: RegisterSequence::EMPTY,
};

struct TestSensor;

impl SensorModule for TestSensor {
    fn profile(&self) -> &SensorProfile {
        &TEST_SENSOR
    }

    fn init(&mut self, _ctx: &mut SensorContext) -> Result<()> {
        Ok(())
    }

    fn preview(&mut self, _ctx: &mut SensorContext) -> Result<()> {
        Ok(())
    }

    fn snapshot(&mut self, _ctx: &mut SensorContext) -> Result<()> {
        Ok(())
    }
}

fn test_sensor_factory() -> Box<dyn SensorModule> {
    Box::new(TestSensor)
}

/// A registry with the synthetic `testcam` model registered.
pub fn test_sensor_registry() -> Arc<SensorRegistry> {
    let mut registry = SensorRegistry::new();
    registry.register("testcam", test_sensor_factory);
    Arc::new(registry)
}
