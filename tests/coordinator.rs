//! Coordinator event-pump scenarios.
//!
//! The coordinator runs on its own thread against the recording
//! notification fake; the tests play the kernel side, pushing
//! notifications and asserting on the acknowledgment stream.

use aperture::command::Command;
use aperture::coordinator::{SessionCoordinator, SessionFactory};
use aperture::isp::{AckStatus, SessionEvent, SetParm};
use aperture::registry::{StreamId, StreamKind};
use aperture::session::{SessionConfig, SessionDevices, StreamSessionManager};
use aperture::testing::{IspProbe, NotifyDriver, RecordingNotify, ScriptedIsp, test_sensor_registry};
use std::thread::JoinHandle;
use std::time::Duration;

fn test_factory() -> Box<dyn SessionFactory> {
    // Retain each session's ISP probe for the coordinator's lifetime; the
    // probe owns the fake ISP event-pipe write end, and dropping it would
    // HUP the session worker's poll and tear the session down early.
    let mut probes: Vec<IspProbe> = Vec::new();
    Box::new(move |session: u32| -> aperture::Result<StreamSessionManager> {
        let (isp, probe) = ScriptedIsp::new();
        probes.push(probe);
        let config = SessionConfig {
            session,
            sensor_name: "testcam".to_string(),
            enable_stats: false,
            share_socket: None,
        };
        let devices = SessionDevices {
            isp: Box::new(isp),
            csi: None,
            actuator: None,
            flash: None,
        };
        Ok(StreamSessionManager::new(
            config,
            devices,
            test_sensor_registry(),
        ))
    })
}

fn failing_factory() -> Box<dyn SessionFactory> {
    Box::new(|session: u32| -> aperture::Result<StreamSessionManager> {
        let (isp, _probe) = ScriptedIsp::new();
        let config = SessionConfig {
            session,
            // Resolution fails in session init, so the open fails.
            sensor_name: "missing-model".to_string(),
            enable_stats: false,
            share_socket: None,
        };
        let devices = SessionDevices {
            isp: Box::new(isp),
            csi: None,
            actuator: None,
            flash: None,
        };
        Ok(StreamSessionManager::new(
            config,
            devices,
            test_sensor_registry(),
        ))
    })
}

fn run_coordinator(
    factory: Box<dyn SessionFactory>,
) -> (NotifyDriver, aperture::command::CommandSender, JoinHandle<i32>) {
    let (notify, driver) = RecordingNotify::new();
    let mut coordinator = SessionCoordinator::new(Box::new(notify), factory).unwrap();
    let sender = coordinator.sender();
    let thread = std::thread::spawn(move || coordinator.run().unwrap());
    (driver, sender, thread)
}

#[test]
fn test_session_open_stream_and_delete() {
    let (driver, sender, thread) = run_coordinator(test_factory());

    driver.push(SessionEvent::NewSession { id: 7 });
    driver.push(SessionEvent::SetParameter(SetParm::NewStream {
        id: StreamId(1),
        kind: StreamKind::Preview,
    }));
    driver.push(SessionEvent::DeleteSession { id: 7 });

    let acks = driver.wait_for_acks(3, Duration::from_secs(5));
    assert_eq!(acks.len(), 3);
    assert_eq!(acks[0].1, AckStatus::Success);
    assert_eq!(acks[1].1, AckStatus::Success);
    assert_eq!(acks[2].1, AckStatus::Success);

    sender.send(Command::Shutdown).unwrap();
    assert_eq!(thread.join().unwrap(), 0);
}

#[test]
fn test_unknown_notification_acked_as_failure() {
    let (driver, sender, thread) = run_coordinator(test_factory());

    driver.push(SessionEvent::Unknown { code: 0x99 });
    let acks = driver.wait_for_acks(1, Duration::from_secs(5));
    assert_eq!(acks[0].1, AckStatus::Failure);

    sender.send(Command::Shutdown).unwrap();
    assert_eq!(thread.join().unwrap(), 0);
}

#[test]
fn test_commands_without_session_fail_closed() {
    let (driver, sender, thread) = run_coordinator(test_factory());

    driver.push(SessionEvent::SetParameter(SetParm::StreamStart {
        id: StreamId(0),
    }));
    driver.push(SessionEvent::DeleteSession { id: 3 });

    let acks = driver.wait_for_acks(2, Duration::from_secs(5));
    assert_eq!(acks[0].1, AckStatus::Failure);
    assert_eq!(acks[1].1, AckStatus::Failure);

    sender.send(Command::Shutdown).unwrap();
    assert_eq!(thread.join().unwrap(), 0);
}

#[test]
fn test_failed_open_leaves_commands_failing_closed() {
    let (driver, sender, thread) = run_coordinator(failing_factory());

    driver.push(SessionEvent::NewSession { id: 1 });
    driver.push(SessionEvent::SetParameter(SetParm::NewStream {
        id: StreamId(0),
        kind: StreamKind::Preview,
    }));

    let acks = driver.wait_for_acks(2, Duration::from_secs(5));
    assert_eq!(acks[0].1, AckStatus::Failure);
    assert_eq!(acks[1].1, AckStatus::Failure);

    sender.send(Command::Shutdown).unwrap();
    assert_eq!(thread.join().unwrap(), 0);
}

#[test]
fn test_second_session_refused_while_first_active() {
    let (driver, sender, thread) = run_coordinator(test_factory());

    driver.push(SessionEvent::NewSession { id: 1 });
    driver.push(SessionEvent::NewSession { id: 2 });
    driver.push(SessionEvent::DeleteSession { id: 1 });

    let acks = driver.wait_for_acks(3, Duration::from_secs(5));
    assert_eq!(acks[0].1, AckStatus::Success);
    assert_eq!(acks[1].1, AckStatus::Failure);
    assert_eq!(acks[2].1, AckStatus::Success);

    sender.send(Command::Shutdown).unwrap();
    assert_eq!(thread.join().unwrap(), 0);
}

#[test]
fn test_get_parameter_acknowledged() {
    let (driver, sender, thread) = run_coordinator(test_factory());

    driver.push(SessionEvent::GetParameter { id: 5 });
    let acks = driver.wait_for_acks(1, Duration::from_secs(5));
    assert_eq!(acks[0].1, AckStatus::Success);

    sender.send(Command::Shutdown).unwrap();
    assert_eq!(thread.join().unwrap(), 0);
}
