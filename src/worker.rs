//! Generic worker thread over a subdevice capability table.
//!
//! Every hardware-facing driver in the daemon (sensor, CSI receiver,
//! lens actuator, flash, statistics engines, the share-socket listener,
//! and the session manager itself) is a [`Worker`] running some
//! [`Subdev`] implementation. The worker owns one OS thread that blocks
//! in a level-triggered poll over its command doorbell and, when the
//! subdevice exposes one, a device event descriptor.
//!
//! Lifecycle: `Init → Polling → (Busy ↔ Polling) → Stopped`, with
//! `Locked` marking registry-mutation windows (buffer map/unmap). State
//! only moves forward; once `Stopped` no further transitions succeed and
//! the thread never touches shared state again. Shutdown is cooperative:
//! [`WorkerHandle::close`] sends [`Command::Shutdown`], joins the
//! thread, and only then releases the worker's resources.

use crate::command::{Command, CommandChannel, CommandReceiver, CommandSender};
use crate::error::{Error, Result};
use rustix::event::{PollFd, PollFlags, poll};
use rustix::fd::BorrowedFd;
use smallvec::SmallVec;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Thread spawned, `init` not yet complete.
    Init,
    /// Blocked in poll, waiting for work.
    Polling,
    /// Executing a command or device event.
    Busy,
    /// Executing a registry mutation (buffer map/unmap).
    Locked,
    /// Loop exited; the subdevice has been shut down.
    Stopped,
}

/// What the worker loop does after a subdevice hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep polling.
    Continue,
    /// Exit the loop cleanly and shut the subdevice down.
    Shutdown,
}

/// Context handed to [`Subdev::init`] on the worker's own thread.
pub struct WorkerCtx {
    /// Worker name, used for logging and fault reports.
    pub name: String,
    /// Sender addressing this worker's own channel. Subdevices that
    /// spawn children pass a clone so the children can report faults.
    pub sender: CommandSender,
}

/// Capability table implemented by every subdevice driver.
///
/// `command` and `device_event` absorb transient device failures
/// themselves (log, return `Ok(Flow::Continue)`); returning `Err` means
/// an unrecoverable failure and terminates the worker loop, after which
/// `stop` and `shutdown` run exactly once on the worker thread.
pub trait Subdev: Send + 'static {
    /// One-time initialization, run on the worker thread before the
    /// poll loop starts. The spawning caller blocks until this returns;
    /// an error fails the spawn.
    fn init(&mut self, _ctx: &WorkerCtx) -> Result<()> {
        Ok(())
    }

    /// Handle one command.
    fn command(&mut self, cmd: Command) -> Result<Flow>;

    /// Device event descriptor to include in the poll set, if this
    /// subdevice owns a kernel event stream.
    fn device_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Handle readable device events. Called only when [`Self::device_fd`]
    /// polled readable.
    fn device_event(&mut self) -> Result<Flow> {
        Ok(Flow::Continue)
    }

    /// Quiesce the device before release (stop streaming, park motors).
    fn stop(&mut self) {}

    /// Release the device handle and any owned memory. Runs exactly
    /// once, after the loop exits and `stop` has run.
    fn shutdown(&mut self) {}
}

struct WorkerShared {
    name: String,
    state: Mutex<WorkerState>,
}

impl WorkerShared {
    /// Move to `new` unless the worker has already stopped.
    ///
    /// Every write to the shared state goes through here so no caller
    /// can race a thread that is unwinding.
    fn try_set_state(&self, new: WorkerState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == WorkerState::Stopped {
            return Err(Error::WorkerStopped);
        }
        *state = new;
        Ok(())
    }

    fn force_stopped(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = WorkerState::Stopped;
    }

    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Namespace for spawning workers.
pub struct Worker;

impl Worker {
    /// Spawn a worker with no fault parent.
    pub fn spawn<S: Subdev>(name: &str, subdev: S) -> Result<WorkerHandle> {
        Self::spawn_with_parent(name, subdev, None)
    }

    /// Spawn a worker thread running `subdev`.
    ///
    /// Blocks until the subdevice's `init` completes on the new thread,
    /// so on success the returned handle addresses a fully usable
    /// worker; on init failure the thread has already exited and the
    /// init error is returned.
    ///
    /// If `parent` is given, an abnormal loop exit (unrecoverable
    /// subdevice failure, not a clean shutdown) sends
    /// [`Command::WorkerFault`] there after the subdevice is shut down.
    pub fn spawn_with_parent<S: Subdev>(
        name: &str,
        mut subdev: S,
        parent: Option<CommandSender>,
    ) -> Result<WorkerHandle> {
        let (tx, rx) = CommandChannel::new()?;
        let shared = Arc::new(WorkerShared {
            name: name.to_string(),
            state: Mutex::new(WorkerState::Init),
        });
        let ctx = WorkerCtx {
            name: name.to_string(),
            sender: tx.clone(),
        };

        let thread_shared = Arc::clone(&shared);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let thread = thread::Builder::new()
            .name(format!("aperture-{}", name))
            .spawn(move || {
                match subdev.init(&ctx) {
                    Ok(()) => {
                        let _ = thread_shared.try_set_state(WorkerState::Polling);
                        let _ = ready_tx.send(Ok(()));
                    }
                    Err(e) => {
                        thread_shared.force_stopped();
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                }

                let fatal = run_loop(&thread_shared, &rx, &mut subdev);
                // Unprocessed commands are dropped before teardown so
                // their completions release any blocked submitter, and
                // late sends fail instead of queueing forever.
                rx.drain();
                drop(rx);
                subdev.stop();
                subdev.shutdown();
                thread_shared.force_stopped();
                debug!(worker = %thread_shared.name, "worker stopped");

                if fatal {
                    if let Some(parent) = &parent {
                        let _ = parent.send(Command::WorkerFault {
                            worker: thread_shared.name.clone(),
                        });
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(WorkerHandle {
                shared,
                tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::InitFailed(format!(
                    "worker {} exited during init",
                    name
                )))
            }
        }
    }
}

/// Returns true when the loop exited on an unrecoverable failure.
fn run_loop<S: Subdev>(shared: &WorkerShared, rx: &CommandReceiver, subdev: &mut S) -> bool {
    loop {
        let mut cmd_ready = false;
        let mut dev_ready = false;
        let mut dev_gone = false;
        {
            let mut fds: SmallVec<[PollFd<'_>; 2]> = SmallVec::new();
            fds.push(PollFd::from_borrowed_fd(rx.doorbell_fd(), PollFlags::IN));
            if let Some(dev) = subdev.device_fd() {
                fds.push(PollFd::from_borrowed_fd(dev, PollFlags::IN));
            }

            match poll(&mut fds, None) {
                Ok(_) => {
                    cmd_ready = fds[0].revents().intersects(PollFlags::IN);
                    if let Some(dev) = fds.get(1) {
                        dev_ready = dev.revents().intersects(PollFlags::IN);
                        dev_gone = !dev_ready
                            && dev
                                .revents()
                                .intersects(PollFlags::HUP | PollFlags::ERR);
                    }
                }
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => {
                    error!(worker = %shared.name, error = %e, "poll failed");
                    return true;
                }
            }
        }

        if dev_gone {
            error!(worker = %shared.name, "device descriptor hung up");
            return true;
        }

        if cmd_ready {
            if shared.try_set_state(WorkerState::Busy).is_err() {
                return false;
            }
            match rx.recv() {
                Ok(Command::Shutdown) => {
                    debug!(worker = %shared.name, "shutdown command");
                    return false;
                }
                Ok(cmd) => {
                    if matches!(cmd, Command::MapBuffer(_) | Command::UnmapBuffer(_))
                        && shared.try_set_state(WorkerState::Locked).is_err()
                    {
                        return false;
                    }
                    match subdev.command(cmd) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Shutdown) => return false,
                        Err(e) => {
                            error!(worker = %shared.name, error = %e, "command failed");
                            return true;
                        }
                    }
                }
                Err(e) => {
                    warn!(worker = %shared.name, error = %e, "command channel closed");
                    return false;
                }
            }
            if shared.try_set_state(WorkerState::Polling).is_err() {
                return false;
            }
        }

        if dev_ready {
            if shared.try_set_state(WorkerState::Busy).is_err() {
                return false;
            }
            match subdev.device_event() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => return false,
                Err(e) => {
                    error!(worker = %shared.name, error = %e, "device event failed");
                    return true;
                }
            }
            if shared.try_set_state(WorkerState::Polling).is_err() {
                return false;
            }
        }

        if !cmd_ready && !dev_ready {
            // Spurious wake: yield briefly instead of spinning.
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Owning handle to a spawned worker.
///
/// Dropping the handle closes the worker (shutdown command + join) as a
/// last resort, so teardown can never race a live thread.
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    tx: CommandSender,
    thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Worker name given at spawn.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Clone a sender addressing this worker.
    pub fn sender(&self) -> CommandSender {
        self.tx.clone()
    }

    /// Send a command, refusing once the worker has stopped.
    pub fn send(&self, cmd: Command) -> Result<()> {
        if self.shared.state() == WorkerState::Stopped {
            return Err(Error::WorkerStopped);
        }
        self.tx.send(cmd)
    }

    /// Send a shutdown command, join the thread, and release the
    /// worker's resources.
    pub fn close(mut self) -> Result<()> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // The send fails if the loop already exited; join regardless.
        let _ = self.tx.send(Command::Shutdown);
        thread
            .join()
            .map_err(|_| Error::Device(format!("worker {} panicked", self.shared.name)))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_and_join() {
            warn!(worker = %self.shared.name, error = %e, "worker close on drop failed");
        }
    }
}
