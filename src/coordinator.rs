//! Top-level session coordinator.
//!
//! One coordinator runs per camera device. It pumps the session-level
//! notification device and its own command channel together, spawns or
//! joins the session worker on new/delete-session, and forwards
//! set-parameter sub-commands into the session's channel. Every inbound
//! notification is acknowledged with success or failure; unknown
//! commands are acknowledged as failures rather than dropped, so the
//! external client never waits on a command the daemon discarded.

use crate::command::{Command, CommandChannel, CommandReceiver, CommandSender, Completion,
    SessionCmd, StreamCmd};
use crate::error::Result;
use crate::isp::{AckStatus, NotifySource, SessionEvent, SetParm};
use crate::session::StreamSessionManager;
use crate::worker::{Worker, WorkerHandle};
use rustix::event::{PollFd, PollFlags, poll};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds a session manager when the client opens a session.
pub trait SessionFactory: Send {
    /// Create the manager for a new client session.
    fn create(&mut self, session: u32) -> Result<StreamSessionManager>;
}

impl<F> SessionFactory for F
where
    F: FnMut(u32) -> Result<StreamSessionManager> + Send,
{
    fn create(&mut self, session: u32) -> Result<StreamSessionManager> {
        self(session)
    }
}

struct ActiveSession {
    id: u32,
    handle: WorkerHandle,
}

/// The per-device event pump.
pub struct SessionCoordinator {
    notify: Box<dyn NotifySource>,
    factory: Box<dyn SessionFactory>,
    tx: CommandSender,
    rx: CommandReceiver,
    active: Option<ActiveSession>,
}

impl SessionCoordinator {
    /// Build a coordinator over a notification device and a session
    /// factory.
    pub fn new(notify: Box<dyn NotifySource>, factory: Box<dyn SessionFactory>) -> Result<Self> {
        let (tx, rx) = CommandChannel::new()?;
        Ok(Self {
            notify,
            factory,
            tx,
            rx,
            active: None,
        })
    }

    /// Sender addressing the coordinator's own channel; sending
    /// [`Command::Shutdown`] ends [`Self::run`].
    pub fn sender(&self) -> CommandSender {
        self.tx.clone()
    }

    /// Pump events until shutdown. Returns the process exit code.
    pub fn run(&mut self) -> Result<i32> {
        info!("coordinator running");
        loop {
            let mut notify_ready = false;
            let mut cmd_ready = false;
            {
                let mut fds = [
                    PollFd::from_borrowed_fd(self.notify.fd(), PollFlags::IN),
                    PollFd::from_borrowed_fd(self.rx.doorbell_fd(), PollFlags::IN),
                ];
                match poll(&mut fds, None) {
                    Ok(_) => {
                        notify_ready = fds[0].revents().intersects(PollFlags::IN);
                        cmd_ready = fds[1].revents().intersects(PollFlags::IN);
                    }
                    Err(rustix::io::Errno::INTR) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if notify_ready {
                while let Some(event) = self.notify.next()? {
                    let status = self.handle_event(&event);
                    self.notify.ack(&event, status)?;
                }
            }

            if cmd_ready {
                match self.rx.recv()? {
                    Command::Shutdown => {
                        self.close_session();
                        info!("coordinator shut down");
                        return Ok(0);
                    }
                    Command::WorkerFault { worker } => {
                        warn!(worker, "session worker failed, closing session");
                        self.close_session();
                    }
                    other => warn!(command = ?other, "coordinator ignores command"),
                }
            }

            if !notify_ready && !cmd_ready {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn handle_event(&mut self, event: &SessionEvent) -> AckStatus {
        match event {
            SessionEvent::NewSession { id } => self.open_session(*id),
            SessionEvent::DeleteSession { id } => self.delete_session(*id),
            SessionEvent::SetParameter(sub) => self.forward(sub),
            SessionEvent::GetParameter { id } => {
                // Values are read from the shared parameter block; the
                // notification only needs an acknowledgment.
                debug!(param = id, "get-parameter acknowledged");
                AckStatus::Success
            }
            SessionEvent::Unknown { code } => {
                warn!(code, "unknown notification acknowledged as failure");
                AckStatus::Failure
            }
        }
    }

    fn open_session(&mut self, id: u32) -> AckStatus {
        if self.active.is_some() {
            warn!(session = id, "session already active");
            return AckStatus::Failure;
        }
        let manager = match self.factory.create(id) {
            Ok(manager) => manager,
            Err(e) => {
                warn!(session = id, error = %e, "session construction failed");
                return AckStatus::Failure;
            }
        };
        // Blocks until the session signals readiness; a failed open
        // leaves no session, so later commands fail closed.
        match Worker::spawn_with_parent("session", manager, Some(self.tx.clone())) {
            Ok(handle) => {
                info!(session = id, "session opened");
                self.active = Some(ActiveSession { id, handle });
                AckStatus::Success
            }
            Err(e) => {
                warn!(session = id, error = %e, "session open failed");
                AckStatus::Failure
            }
        }
    }

    fn delete_session(&mut self, id: u32) -> AckStatus {
        match &self.active {
            Some(active) if active.id == id => {
                self.close_session();
                info!(session = id, "session deleted");
                AckStatus::Success
            }
            _ => {
                warn!(session = id, "delete for unknown session");
                AckStatus::Failure
            }
        }
    }

    fn close_session(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.handle.close() {
                warn!(session = active.id, error = %e, "session close failed");
            }
        }
    }

    fn forward(&mut self, sub: &SetParm) -> AckStatus {
        let Some(active) = &self.active else {
            warn!(?sub, "set-parameter with no active session");
            return AckStatus::Failure;
        };

        let result = match *sub {
            SetParm::NewStream { id, kind } => {
                // Block until the stream slot exists, so the client's
                // next buffer mapping cannot outrun the allocation.
                let done = Completion::new();
                let sent = active.handle.send(Command::Stream(StreamCmd::New {
                    id,
                    kind,
                    done: done.guard(),
                }));
                match sent {
                    Ok(()) => done.wait(),
                    Err(e) => Err(e),
                }
            }
            SetParm::DeleteStream { id } => {
                active.handle.send(Command::Stream(StreamCmd::Delete { id }))
            }
            SetParm::StreamStart { id } => {
                active.handle.send(Command::Stream(StreamCmd::Start { id }))
            }
            SetParm::StreamStop { id } => {
                active.handle.send(Command::Stream(StreamCmd::Stop { id }))
            }
            SetParm::AfStart => active.handle.send(Command::Session(SessionCmd::AfStart)),
            SetParm::AfCancel => active.handle.send(Command::Session(SessionCmd::AfCancel)),
            SetParm::PrepareSnapshot => active
                .handle
                .send(Command::Session(SessionCmd::PrepareSnapshot)),
            SetParm::ApplyParams => active
                .handle
                .send(Command::Session(SessionCmd::ApplyParams)),
        };

        match result {
            Ok(()) => AckStatus::Success,
            Err(e) => {
                eprintln!("DBG set-parameter failed: {sub:?} err={e:?}");
                warn!(?sub, error = %e, "set-parameter failed");
                AckStatus::Failure
            }
        }
    }
}
