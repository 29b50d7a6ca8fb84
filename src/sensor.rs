//! Sensor capability plugins.
//!
//! A sensor model plugs in as a [`SensorModule`]: a fixed method set
//! over per-session [`SensorContext`] state, plus a [`SensorProfile`]
//! data record carrying stream attributes, the ISP tuning selection,
//! capability advertisement, and the model's register sequences as
//! opaque data. Optional methods are default-implemented, mirroring
//! drivers that leave a capability unimplemented.
//!
//! Modules are resolved by sensor name through a [`SensorRegistry`] at
//! session start; there is no runtime library loading. All mutable
//! per-sensor state lives in the context object, so concurrent sessions
//! on different sensors never alias each other.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Sensor streaming modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMode {
    /// Viewfinder-rate streaming.
    Preview,
    /// Recording-rate streaming.
    Video,
    /// Full-resolution still capture.
    Snapshot,
}

/// One register programming step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Register address.
    pub addr: u16,
    /// Value to program.
    pub value: u16,
}

/// An opaque register table compiled into a sensor module.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSequence(pub &'static [RegisterWrite]);

impl RegisterSequence {
    /// Empty sequence for models without a given table.
    pub const EMPTY: RegisterSequence = RegisterSequence(&[]);

    /// Number of programming steps.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the model has no table for this purpose.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Geometry and rate attributes of a sensor model.
#[derive(Debug, Clone, Copy)]
pub struct StreamAttributes {
    /// Active array width in pixels.
    pub max_width: u32,
    /// Active array height in pixels.
    pub max_height: u32,
    /// Maximum preview frame rate.
    pub preview_fps: u32,
    /// Maximum snapshot frame rate.
    pub snapshot_fps: u32,
}

/// Capability advertisement for the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorCaps {
    /// Lens actuator present.
    pub autofocus: bool,
    /// Flash unit present.
    pub flash: bool,
    /// Dedicated video mode supported.
    pub video: bool,
}

/// Fixed-shape descriptor record of a sensor model.
#[derive(Debug, Clone, Copy)]
pub struct SensorProfile {
    /// Model name as reported by the kernel driver.
    pub name: &'static str,
    /// Stream attributes.
    pub attributes: StreamAttributes,
    /// ISP tuning profile selector, opaque to the orchestration core.
    pub tuning: u32,
    /// Capability advertisement.
    pub caps: SensorCaps,
    /// Active CSI data lanes for this model.
    pub csi_lanes: u8,
    /// CSI settle count in nanoseconds.
    pub csi_settle_ns: u32,
    /// Stop-stream register table.
    pub stop_seq: RegisterSequence,
    /// Power-on init register table.
    pub init_seq: RegisterSequence,
    /// Preview-mode register table.
    pub preview_seq: RegisterSequence,
    /// Snapshot-mode register table.
    pub snapshot_seq: RegisterSequence,
}

/// Per-session mutable sensor state, passed explicitly on every call.
#[derive(Debug, Clone)]
pub struct SensorContext {
    /// Owning session id.
    pub session: u32,
    /// Previously applied effect mode, if any.
    pub last_effect: Option<i32>,
    /// Last programmed analog gain.
    pub gain: u16,
}

impl SensorContext {
    /// Fresh context for a session.
    pub fn new(session: u32) -> Self {
        Self {
            session,
            last_effect: None,
            gain: 0,
        }
    }
}

/// The fixed capability interface every sensor model implements.
pub trait SensorModule: Send {
    /// The model's descriptor record.
    fn profile(&self) -> &SensorProfile;

    /// Program the init register table.
    fn init(&mut self, ctx: &mut SensorContext) -> Result<()>;

    /// Release the device; program the stop table.
    fn deinit(&mut self, _ctx: &mut SensorContext) -> Result<()> {
        Ok(())
    }

    /// Switch to preview mode.
    fn preview(&mut self, ctx: &mut SensorContext) -> Result<()>;

    /// Switch to video mode. Models without a dedicated video mode
    /// stream their preview configuration.
    fn video(&mut self, ctx: &mut SensorContext) -> Result<()> {
        self.preview(ctx)
    }

    /// Switch to snapshot mode.
    fn snapshot(&mut self, ctx: &mut SensorContext) -> Result<()>;

    /// Program the antibanding mode.
    fn antibanding(&mut self, _ctx: &mut SensorContext, _mode: i32) -> Result<()> {
        Ok(())
    }

    /// Program the white-balance mode.
    fn white_balance(&mut self, _ctx: &mut SensorContext, _mode: i32) -> Result<()> {
        Ok(())
    }

    /// Program the brightness level.
    fn brightness(&mut self, _ctx: &mut SensorContext, _level: i32) -> Result<()> {
        Ok(())
    }

    /// Program the saturation level.
    fn saturation(&mut self, _ctx: &mut SensorContext, _level: i32) -> Result<()> {
        Ok(())
    }

    /// Program the contrast level.
    fn contrast(&mut self, _ctx: &mut SensorContext, _level: i32) -> Result<()> {
        Ok(())
    }

    /// Program an effect mode. The previously applied mode is session
    /// state, not module state.
    fn effect(&mut self, ctx: &mut SensorContext, mode: i32) -> Result<()> {
        ctx.last_effect = Some(mode);
        Ok(())
    }

    /// Program the sharpness level.
    fn sharpness(&mut self, _ctx: &mut SensorContext, _level: i32) -> Result<()> {
        Ok(())
    }

    /// Program the exposure gain; the integration line count is a
    /// model-internal derivation.
    fn exposure_gain(&mut self, ctx: &mut SensorContext, gain: u16) -> Result<()> {
        ctx.gain = gain;
        Ok(())
    }
}

/// Factory producing a fresh module instance per session.
pub type SensorFactory = fn() -> Box<dyn SensorModule>;

/// Name-keyed registry of sensor model factories.
#[derive(Default)]
pub struct SensorRegistry {
    factories: HashMap<String, SensorFactory>,
}

impl SensorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model under the name the kernel driver reports.
    pub fn register(&mut self, name: &str, factory: SensorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate the module for a sensor name.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn SensorModule>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::Device(format!("no sensor module for '{}'", name)))
    }

    /// Registered model names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
