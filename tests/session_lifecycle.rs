//! Session lifecycle scenarios driven end to end.
//!
//! These tests run the real session state machine on its own worker
//! thread against the in-memory ISP, exercising stream registration,
//! buffer binding, start/stop ordering, and teardown accounting.

use aperture::command::{
    BufferKind, Command, Completion, FlashMode, MapRequest, SessionCmd, StreamCmd, UnmapRequest,
};
use aperture::error::Error;
use aperture::isp::{IspEvent, IspOp, QueueHandle, SubdevOp};
use aperture::params::{PARAM_TERMINATOR, write_entry, write_head};
use aperture::registry::{StreamId, StreamKind, client_format};
use aperture::session::{SessionConfig, SessionDevices, StreamSessionManager};
use aperture::share::MappedRegion;
use aperture::stats::{GAIN_DEFAULT, StatsKind};
use aperture::testing::{
    IspCall, IspProbe, RecordingSubdev, ScriptedIsp, memfd, test_sensor_registry,
};
use aperture::worker::{Worker, WorkerHandle};
use rustix::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

fn spawn_session(enable_stats: bool) -> (WorkerHandle, IspProbe) {
    let (isp, probe) = ScriptedIsp::new();
    let config = SessionConfig {
        session: 1,
        sensor_name: "testcam".to_string(),
        enable_stats,
        share_socket: None,
    };
    let devices = SessionDevices {
        isp: Box::new(isp),
        csi: None,
        actuator: None,
        flash: None,
    };
    let manager = StreamSessionManager::new(config, devices, test_sensor_registry());
    let handle = Worker::spawn("session", manager).expect("session open");
    (handle, probe)
}

fn new_stream(session: &WorkerHandle, id: u8, kind: StreamKind) -> aperture::Result<()> {
    let done = Completion::new();
    session
        .send(Command::Stream(StreamCmd::New {
            id: StreamId(id),
            kind,
            done: done.guard(),
        }))
        .unwrap();
    done.wait()
}

fn map(
    session: &WorkerHandle,
    kind: BufferKind,
    stream: u8,
    slot: u8,
    fd: OwnedFd,
    len: u32,
) -> aperture::Result<()> {
    let req = Box::new(MapRequest::new(kind, StreamId(stream), slot, len, fd));
    let done = req.completion();
    session.send(Command::MapBuffer(req)).unwrap();
    done.wait()
}

fn unmap(session: &WorkerHandle, kind: BufferKind, stream: u8, slot: u8) -> aperture::Result<()> {
    let req = Box::new(UnmapRequest::new(kind, StreamId(stream), slot));
    let done = req.completion();
    session.send(Command::UnmapBuffer(req)).unwrap();
    done.wait()
}

/// Stream-info memfd with the client header filled in.
fn stream_info_fd(format: u32, width: u32, height: u32, count: u32) -> OwnedFd {
    let fd = memfd(4096);
    let mut region = MappedRegion::map(fd.try_clone().unwrap(), 4096).unwrap();
    region.write_u32(0, format).unwrap();
    region.write_u32(4, width).unwrap();
    region.write_u32(8, height).unwrap();
    region.write_u32(12, count).unwrap();
    fd
}

fn register_preview(session: &WorkerHandle, id: u8, buffers: u32) {
    new_stream(session, id, StreamKind::Preview).unwrap();
    map(
        session,
        BufferKind::StreamInfo,
        id,
        0,
        stream_info_fd(client_format::NV21, 640, 480, buffers),
        4096,
    )
    .unwrap();
}

fn wait_until(probe: &IspProbe, pred: impl Fn(&IspCall) -> bool, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while probe.count(&pred) < n {
        assert!(
            Instant::now() < deadline,
            "expected call never recorded; log: {:?}",
            probe.calls()
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A synchronous command acts as a barrier for prior asynchronous ones.
fn barrier(session: &WorkerHandle) {
    map(session, BufferKind::Capability, 0, 0, memfd(4096), 4096).unwrap();
}

// ============================================================================
// Stream lifecycle scenarios
// ============================================================================

#[test]
fn test_preview_start_scenario() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    map(&session, BufferKind::StreamBuf, 1, 0, memfd(8192), 8192).unwrap();
    map(&session, BufferKind::StreamBuf, 1, 1, memfd(8192), 8192).unwrap();

    session
        .send(Command::Stream(StreamCmd::Start { id: StreamId(1) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(StreamId(1))), 1);

    let calls = probe.calls();
    // Hardware queue assigned exactly once, start issued exactly once.
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::RequestStreamQueue(StreamId(1), 2))),
        1
    );
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::StreamStart(StreamId(1)))),
        1
    );
    // Both bound buffers were enqueued before start.
    let start_at = calls
        .iter()
        .position(|c| matches!(c, IspCall::StreamStart(_)))
        .unwrap();
    let enqueued = calls[..start_at]
        .iter()
        .filter(|c| matches!(c, IspCall::Enqueue(_, _)))
        .count();
    assert_eq!(enqueued, 2);

    session.close().unwrap();
}

#[test]
fn test_reset_and_module_config_once_per_session() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 0, 2);
    new_stream(&session, 1, StreamKind::Video).unwrap();
    map(
        &session,
        BufferKind::StreamInfo,
        1,
        0,
        stream_info_fd(client_format::NV12, 1280, 720, 2),
        4096,
    )
    .unwrap();

    // The reset + module configuration ran once, on first registration.
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::Configure(aperture::isp::IspOp::Reset))),
        1
    );
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::Configure(aperture::isp::IspOp::ModuleConfig))),
        1
    );

    session.close().unwrap();
}

#[test]
fn test_stream_buf_requires_stream_info_first() {
    let (session, _probe) = spawn_session(false);

    new_stream(&session, 2, StreamKind::Preview).unwrap();
    let err = map(&session, BufferKind::StreamBuf, 2, 0, memfd(8192), 8192).unwrap_err();
    assert!(matches!(err, Error::StreamBusy(2, _)));

    session.close().unwrap();
}

#[test]
fn test_bound_slots_cannot_exceed_configured_count() {
    let (session, _probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    map(&session, BufferKind::StreamBuf, 1, 0, memfd(8192), 8192).unwrap();
    map(&session, BufferKind::StreamBuf, 1, 1, memfd(8192), 8192).unwrap();

    // Slot index beyond the configured count is rejected.
    let err = map(&session, BufferKind::StreamBuf, 1, 2, memfd(8192), 8192).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    // Rebinding an occupied slot is rejected too.
    let err = map(&session, BufferKind::StreamBuf, 1, 0, memfd(8192), 8192).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    session.close().unwrap();
}

#[test]
fn test_start_with_zero_bound_slots_configures_but_enqueues_nothing() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    session
        .send(Command::Stream(StreamCmd::Start { id: StreamId(1) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(StreamId(1))), 1);

    assert_eq!(probe.count(|c| matches!(c, IspCall::Enqueue(_, _))), 0);
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::StreamRequest(StreamId(1), _, _, _))),
        1
    );

    session.close().unwrap();
}

#[test]
fn test_stop_on_never_started_stream_is_hardware_noop() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    session
        .send(Command::Stream(StreamCmd::Stop { id: StreamId(1) }))
        .unwrap();
    barrier(&session);

    assert_eq!(probe.count(|c| matches!(c, IspCall::StreamStop(_))), 0);
    assert_eq!(probe.count(|c| matches!(c, IspCall::StreamRelease(_))), 0);

    session.close().unwrap();
}

#[test]
fn test_unmap_while_streaming_rejected() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    session
        .send(Command::Stream(StreamCmd::Start { id: StreamId(1) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(StreamId(1))), 1);

    let err = unmap(&session, BufferKind::StreamInfo, 1, 0).unwrap_err();
    assert!(matches!(err, Error::StreamBusy(1, _)));

    session.close().unwrap();
}

#[test]
fn test_map_unmap_round_trip_restores_slot() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    map(&session, BufferKind::StreamBuf, 1, 0, memfd(8192), 8192).unwrap();

    unmap(&session, BufferKind::StreamInfo, 1, 0).unwrap();
    // The hardware queue went back with the unmap.
    assert_eq!(probe.count(|c| matches!(c, IspCall::ReleaseQueue(_))), 1);

    // The slot is back in its pre-map state: registering again works.
    map(
        &session,
        BufferKind::StreamInfo,
        1,
        0,
        stream_info_fd(client_format::NV21, 640, 480, 2),
        4096,
    )
    .unwrap();

    session.close().unwrap();
}

#[test]
fn test_unknown_format_is_hard_error() {
    let (session, _probe) = spawn_session(false);

    new_stream(&session, 1, StreamKind::Preview).unwrap();
    let err = map(
        &session,
        BufferKind::StreamInfo,
        1,
        0,
        stream_info_fd(0x7777, 640, 480, 2),
        4096,
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnknownFormat(0x7777)));

    session.close().unwrap();
}

#[test]
fn test_delete_stream_refused_while_streaming() {
    let (session, probe) = spawn_session(false);

    register_preview(&session, 1, 2);
    session
        .send(Command::Stream(StreamCmd::Start { id: StreamId(1) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(StreamId(1))), 1);

    session
        .send(Command::Stream(StreamCmd::Delete { id: StreamId(1) }))
        .unwrap();
    barrier(&session);

    // Still there: a fresh new-stream on the same id reports exhaustion.
    let err = new_stream(&session, 1, StreamKind::Preview).unwrap_err();
    assert!(matches!(err, Error::SlotsExhausted));

    session.close().unwrap();
}

#[test]
fn test_snapshot_stop_releases_postview_too() {
    let (session, probe) = spawn_session(false);

    new_stream(&session, 1, StreamKind::Snapshot).unwrap();
    map(
        &session,
        BufferKind::StreamInfo,
        1,
        0,
        stream_info_fd(client_format::NV21, 2048, 1536, 1),
        4096,
    )
    .unwrap();
    new_stream(&session, 2, StreamKind::Postview).unwrap();
    map(
        &session,
        BufferKind::StreamInfo,
        2,
        0,
        stream_info_fd(client_format::NV21, 640, 480, 1),
        4096,
    )
    .unwrap();

    for id in [1u8, 2u8] {
        session
            .send(Command::Stream(StreamCmd::Start { id: StreamId(id) }))
            .unwrap();
    }
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(_)), 2);

    session
        .send(Command::Stream(StreamCmd::Stop { id: StreamId(1) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStop(_)), 2);

    assert_eq!(
        probe.count(|c| matches!(c, IspCall::StreamStop(StreamId(2)))),
        1
    );

    session.close().unwrap();
}

// ============================================================================
// Concurrency and teardown
// ============================================================================

#[test]
fn test_concurrent_capability_and_parameter_maps() {
    let (session, _probe) = spawn_session(false);

    let sender_a = session.sender();
    let sender_b = session.sender();

    let a = std::thread::spawn(move || {
        let req = Box::new(MapRequest::new(
            BufferKind::Capability,
            StreamId(0),
            0,
            4096,
            memfd(4096),
        ));
        let done = req.completion();
        sender_a.send(Command::MapBuffer(req)).unwrap();
        done.wait()
    });
    let b = std::thread::spawn(move || {
        let req = Box::new(MapRequest::new(
            BufferKind::Parameter,
            StreamId(0),
            0,
            4096,
            memfd(4096),
        ));
        let done = req.completion();
        sender_b.send(Command::MapBuffer(req)).unwrap();
        done.wait()
    });

    // Both complete, sequentially on the session thread, no deadlock.
    a.join().unwrap().unwrap();
    b.join().unwrap().unwrap();

    session.close().unwrap();
}

#[test]
fn test_delete_session_mid_stream_releases_everything() {
    let (session, probe) = spawn_session(true);

    register_preview(&session, 1, 2);
    map(&session, BufferKind::StreamBuf, 1, 0, memfd(8192), 8192).unwrap();
    session
        .send(Command::Stream(StreamCmd::Start { id: StreamId(1) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(StreamId(1))), 1);

    // Tear the whole session down while the stream is live.
    session.close().unwrap();

    let calls = probe.calls();
    // The forced stop ran before teardown.
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::StreamStop(StreamId(1)))),
        1
    );
    // Every requested queue handle was released: stream + 3 stats.
    // The fake hands queue ids out sequentially, so reconstruct them
    // from the request order.
    let mut requested = Vec::new();
    let mut released = Vec::new();
    let mut queue_counter = 0u32;
    for call in &calls {
        match call {
            IspCall::RequestStreamQueue(_, _) | IspCall::RequestStatsQueue(_, _) => {
                queue_counter += 1;
                requested.push(QueueHandle(queue_counter));
            }
            IspCall::ReleaseQueue(handle) => released.push(*handle),
            _ => {}
        }
    }
    requested.sort_by_key(|q| q.0);
    released.sort_by_key(|q| q.0);
    assert_eq!(requested, released, "a queue handle leaked");

    // Statistics pipelines were disabled on the way out.
    for kind in StatsKind::ALL {
        assert_eq!(
            probe.count(|c| matches!(c, IspCall::StatsConfigure(k, false) if *k == kind)),
            1
        );
    }
}

// ============================================================================
// Fixed-function subdevices and parameters
// ============================================================================

fn wait_for_op(ops: &Arc<Mutex<Vec<SubdevOp>>>, pred: impl Fn(&SubdevOp) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !ops.lock().unwrap().iter().any(&pred) {
        assert!(
            Instant::now() < deadline,
            "expected subdevice op never recorded; log: {:?}",
            ops.lock().unwrap()
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_fixed_function_subdevices_driven() {
    let (isp, _probe) = ScriptedIsp::new();
    let (csi, csi_ops) = RecordingSubdev::new();
    let (actuator, actuator_ops) = RecordingSubdev::new();
    let (flash, flash_ops) = RecordingSubdev::new();
    let config = SessionConfig {
        session: 1,
        sensor_name: "testcam".to_string(),
        enable_stats: false,
        share_socket: None,
    };
    let devices = SessionDevices {
        isp: Box::new(isp),
        csi: Some(csi),
        actuator: Some(actuator),
        flash: Some(flash),
    };
    let session = Worker::spawn(
        "session",
        StreamSessionManager::new(config, devices, test_sensor_registry()),
    )
    .unwrap();

    // The CSI link was programmed from the sensor profile at open.
    wait_for_op(&csi_ops, |op| {
        matches!(op, SubdevOp::CsiConfigure { lanes: 2, .. })
    });

    session.send(Command::Session(SessionCmd::AfStart)).unwrap();
    wait_for_op(&actuator_ops, |op| {
        matches!(op, SubdevOp::ActuatorMove { .. })
    });

    session
        .send(Command::Session(SessionCmd::PrepareSnapshot))
        .unwrap();
    wait_for_op(&flash_ops, |op| {
        matches!(op, SubdevOp::FlashSet(FlashMode::Strobe))
    });

    session.send(Command::Session(SessionCmd::AfCancel)).unwrap();
    wait_for_op(&actuator_ops, |op| matches!(op, SubdevOp::ActuatorPark));

    session.close().unwrap();
    // Quiesce on teardown: flash off, lens parked.
    assert!(
        flash_ops
            .lock()
            .unwrap()
            .iter()
            .any(|op| matches!(op, SubdevOp::FlashSet(FlashMode::Off)))
    );
}

#[test]
fn test_parameter_apply_drives_isp_frame_skip() {
    let (session, probe) = spawn_session(false);

    // Client fills the parameter block: a one-entry chain setting the
    // frame rate.
    let param_fd = memfd(4096);
    {
        let mut region = MappedRegion::map(param_fd.try_clone().unwrap(), 4096).unwrap();
        write_head(&mut region, 7);
        write_entry(&mut region, 7, 7, PARAM_TERMINATOR, 15);
    }
    map(&session, BufferKind::Parameter, 0, 0, param_fd, 4096).unwrap();

    session
        .send(Command::Session(SessionCmd::ApplyParams))
        .unwrap();
    wait_until(
        &probe,
        |c| matches!(c, IspCall::Configure(IspOp::FrameSkip { pattern: 15 })),
        1,
    );

    // Re-applying the same block changes nothing.
    session
        .send(Command::Session(SessionCmd::ApplyParams))
        .unwrap();
    barrier(&session);
    assert_eq!(
        probe.count(|c| matches!(c, IspCall::Configure(IspOp::FrameSkip { .. }))),
        1
    );

    session.close().unwrap();
}

// ============================================================================
// Statistics and metadata flow
// ============================================================================

#[test]
fn test_stats_event_requeues_without_waiting() {
    let (session, probe) = spawn_session(true);

    probe.set_stats_samples(StatsKind::Aec, vec![60u8; 16]);
    probe.push_event(IspEvent::Stats {
        kind: StatsKind::Aec,
        slot: 2,
    });

    wait_until(&probe, |c| matches!(c, IspCall::ReadStats(StatsKind::Aec, 2)), 1);
    wait_until(&probe, |c| matches!(c, IspCall::ClearStats(StatsKind::Aec, 2)), 1);
    // The slot went straight back to the hardware (init enqueued 4
    // slots per kind; this is the one extra).
    wait_until(&probe, |c| matches!(c, IspCall::Enqueue(QueueHandle(1), 2)), 2);

    session.close().unwrap();
}

#[test]
fn test_sof_populates_metadata_and_propagates_gain() {
    let (session, probe) = spawn_session(true);

    // Metadata stream with two mapped slots the test can also see.
    new_stream(&session, 3, StreamKind::Metadata).unwrap();
    map(
        &session,
        BufferKind::StreamInfo,
        3,
        0,
        stream_info_fd(client_format::NV21, 64, 64, 2),
        4096,
    )
    .unwrap();
    let meta_fds: Vec<OwnedFd> = (0..2).map(|_| memfd(1024)).collect();
    let views: Vec<MappedRegion> = meta_fds
        .iter()
        .map(|fd| MappedRegion::map(fd.try_clone().unwrap(), 1024).unwrap())
        .collect();
    for (slot, fd) in meta_fds.into_iter().enumerate() {
        map(&session, BufferKind::StreamBuf, 3, slot as u8, fd, 1024).unwrap();
    }
    session
        .send(Command::Stream(StreamCmd::Start { id: StreamId(3) }))
        .unwrap();
    wait_until(&probe, |c| matches!(c, IspCall::StreamStart(StreamId(3))), 1);

    // Feed one exposure buffer through the reduction.
    probe.set_stats_samples(StatsKind::Aec, vec![60u8; 16]);
    probe.push_event(IspEvent::Stats {
        kind: StatsKind::Aec,
        slot: 0,
    });
    wait_until(&probe, |c| matches!(c, IspCall::ReadStats(StatsKind::Aec, 0)), 1);

    // Keep announcing frames until one picks the result up; the
    // reduction runs on its own thread and staleness is tolerated.
    let deadline = Instant::now() + Duration::from_secs(3);
    let expected_gain = u32::from(GAIN_DEFAULT) + 1;
    loop {
        probe.push_event(IspEvent::StartOfFrame);
        std::thread::sleep(Duration::from_millis(10));
        let published = views.iter().any(|v| {
            v.read_u32(0).unwrap() == 1 && v.read_u32(12).unwrap() == expected_gain
        });
        if published {
            break;
        }
        assert!(Instant::now() < deadline, "metadata never published");
    }

    // Every acquired metadata slot was returned immediately.
    let acquires = probe.count(|c| matches!(c, IspCall::AcquireSlot(_)));
    let dones = probe.count(|c| matches!(c, IspCall::BufferDone(_, _)));
    assert_eq!(acquires, dones);

    session.close().unwrap();
}
