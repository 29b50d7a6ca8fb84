//! Concrete subdevice drivers run as workers.
//!
//! Each driver translates its slice of the command vocabulary into
//! typed operations on its device. Transient device failures are logged
//! and absorbed here; only unrecoverable failures (a failed sensor mode
//! change) propagate out of the command hook and terminate the worker.

use crate::command::{ActuatorCmd, Command, CsiCmd, FlashCmd, FlashMode, SensorCmd};
use crate::error::{Error, Result};
use crate::isp::{SubdevControl, SubdevOp};
use crate::sensor::{SensorContext, SensorMode, SensorModule};
use crate::worker::{Flow, Subdev, WorkerCtx};
use tracing::{debug, info, warn};

/// Sensor power states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorPower {
    /// Rails down.
    Off,
    /// Rails up, registers programmable.
    On,
}

/// The sensor worker: wraps the resolved [`SensorModule`] and owns the
/// per-session sensor context and power state.
pub struct SensorSubdev {
    module: Box<dyn SensorModule>,
    ctx: SensorContext,
    power: SensorPower,
}

impl SensorSubdev {
    /// Wrap a resolved module for a session.
    pub fn new(module: Box<dyn SensorModule>, session: u32) -> Self {
        Self {
            module,
            ctx: SensorContext::new(session),
            power: SensorPower::On,
        }
    }

    /// Current power state.
    pub fn power(&self) -> SensorPower {
        self.power
    }

    fn handle(&mut self, cmd: SensorCmd) -> Result<Flow> {
        match cmd {
            SensorCmd::PowerUp => {
                if self.power == SensorPower::On {
                    debug!("sensor already powered");
                } else {
                    self.power = SensorPower::On;
                    info!(sensor = self.module.profile().name, "sensor powered up");
                }
                Ok(Flow::Continue)
            }
            SensorCmd::Mode { mode, done } => {
                let result = match mode {
                    SensorMode::Preview => self.module.preview(&mut self.ctx),
                    SensorMode::Video => self.module.video(&mut self.ctx),
                    SensorMode::Snapshot => self.module.snapshot(&mut self.ctx),
                };
                match result {
                    Ok(()) => {
                        debug!(?mode, "sensor mode changed");
                        done.signal(Ok(()));
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        // A failed mode change leaves the sensor in an
                        // unknown state; this is the fatal case that
                        // makes the owning session shut down.
                        done.signal(Err(Error::Device(e.to_string())));
                        Err(e)
                    }
                }
            }
            SensorCmd::SetGain(gain) => {
                if let Err(e) = self.module.exposure_gain(&mut self.ctx, gain) {
                    warn!(gain, error = %e, "exposure gain rejected");
                }
                Ok(Flow::Continue)
            }
            SensorCmd::Antibanding(mode) => self.transient(|m, ctx| m.antibanding(ctx, mode)),
            SensorCmd::WhiteBalance(mode) => self.transient(|m, ctx| m.white_balance(ctx, mode)),
            SensorCmd::Brightness(level) => self.transient(|m, ctx| m.brightness(ctx, level)),
            SensorCmd::Saturation(level) => self.transient(|m, ctx| m.saturation(ctx, level)),
            SensorCmd::Contrast(level) => self.transient(|m, ctx| m.contrast(ctx, level)),
            SensorCmd::Effect(mode) => self.transient(|m, ctx| m.effect(ctx, mode)),
            SensorCmd::Sharpness(level) => self.transient(|m, ctx| m.sharpness(ctx, level)),
        }
    }

    fn transient(
        &mut self,
        op: impl FnOnce(&mut dyn SensorModule, &mut SensorContext) -> Result<()>,
    ) -> Result<Flow> {
        if let Err(e) = op(self.module.as_mut(), &mut self.ctx) {
            warn!(error = %e, "sensor parameter rejected");
        }
        Ok(Flow::Continue)
    }
}

impl Subdev for SensorSubdev {
    fn init(&mut self, _ctx: &WorkerCtx) -> Result<()> {
        self.module.init(&mut self.ctx)
    }

    fn command(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Sensor(cmd) => self.handle(cmd),
            other => {
                warn!(command = ?other, "sensor worker ignores command");
                Ok(Flow::Continue)
            }
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.module.deinit(&mut self.ctx) {
            warn!(error = %e, "sensor deinit failed");
        }
        self.power = SensorPower::Off;
    }
}

/// The CSI receiver worker.
pub struct CsiSubdev {
    dev: Box<dyn SubdevControl>,
}

impl CsiSubdev {
    /// Wrap the receiver's control device.
    pub fn new(dev: Box<dyn SubdevControl>) -> Self {
        Self { dev }
    }
}

impl Subdev for CsiSubdev {
    fn command(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Csi(CsiCmd::Configure { lanes, settle_ns }) => {
                if let Err(e) = self.dev.apply(SubdevOp::CsiConfigure { lanes, settle_ns }) {
                    warn!(lanes, settle_ns, error = %e, "csi configure failed");
                }
                Ok(Flow::Continue)
            }
            other => {
                warn!(command = ?other, "csi worker ignores command");
                Ok(Flow::Continue)
            }
        }
    }
}

/// The lens actuator worker.
pub struct ActuatorSubdev {
    dev: Box<dyn SubdevControl>,
}

impl ActuatorSubdev {
    /// Wrap the actuator's control device.
    pub fn new(dev: Box<dyn SubdevControl>) -> Self {
        Self { dev }
    }
}

impl Subdev for ActuatorSubdev {
    fn command(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Actuator(ActuatorCmd::Move { position }) => {
                if let Err(e) = self.dev.apply(SubdevOp::ActuatorMove { position }) {
                    warn!(position, error = %e, "actuator move failed");
                }
                Ok(Flow::Continue)
            }
            Command::Actuator(ActuatorCmd::Park) => {
                if let Err(e) = self.dev.apply(SubdevOp::ActuatorPark) {
                    warn!(error = %e, "actuator park failed");
                }
                Ok(Flow::Continue)
            }
            other => {
                warn!(command = ?other, "actuator worker ignores command");
                Ok(Flow::Continue)
            }
        }
    }

    fn stop(&mut self) {
        // Park the lens before the device handle goes away.
        if let Err(e) = self.dev.apply(SubdevOp::ActuatorPark) {
            warn!(error = %e, "actuator park on stop failed");
        }
    }
}

/// The flash worker.
pub struct FlashSubdev {
    dev: Box<dyn SubdevControl>,
}

impl FlashSubdev {
    /// Wrap the flash control device.
    pub fn new(dev: Box<dyn SubdevControl>) -> Self {
        Self { dev }
    }
}

impl Subdev for FlashSubdev {
    fn command(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Flash(FlashCmd::Set(mode)) => {
                if let Err(e) = self.dev.apply(SubdevOp::FlashSet(mode)) {
                    warn!(?mode, error = %e, "flash mode failed");
                }
                Ok(Flow::Continue)
            }
            other => {
                warn!(command = ?other, "flash worker ignores command");
                Ok(Flow::Continue)
            }
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.dev.apply(SubdevOp::FlashSet(FlashMode::Off)) {
            warn!(error = %e, "flash off on stop failed");
        }
    }
}
