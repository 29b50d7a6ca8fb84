//! Client parameter block: layout, walk, and shadow diffing.
//!
//! The client publishes parameters in a shared region laid out as a
//! head index followed by a fixed table of self-chaining entries,
//! little-endian:
//!
//! ```text
//! offset 0: head entry index (u32)
//! offset 4: entries[PARAM_COUNT], each {id: u32, next: u32, value: i32}
//! ```
//!
//! On every apply the daemon walks the chain starting at `head`,
//! comparing each recognized entry against its shadow copy. The walk
//! stops at the terminator, a repeated entry, or an out-of-range index
//! without error, since the client may legitimately submit a partial
//! set.
//! Unrecognized parameter ids end the walk and are logged, never
//! retried. Every accepted value is copied into the shadow, so the
//! daemon never silently drops a parameter it acknowledged.

use crate::share::MappedRegion;
use tracing::{debug, warn};

/// Number of entries in the parameter table.
pub const PARAM_COUNT: usize = 9;

/// Chain terminator index.
pub const PARAM_TERMINATOR: u32 = u32::MAX;

/// Minimum region length holding head plus the full table.
pub const PARAM_REGION_LEN: usize = 4 + PARAM_COUNT * ENTRY_SIZE;

const ENTRY_SIZE: usize = 12;

/// Parameter identifiers, doubling as table indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ParamId {
    /// Flicker-avoidance mode.
    Antibanding = 0,
    /// White-balance mode.
    WhiteBalance = 1,
    /// Special effect mode.
    Effect = 2,
    /// Brightness level.
    Brightness = 3,
    /// Contrast level.
    Contrast = 4,
    /// Saturation level.
    Saturation = 5,
    /// Sharpness level.
    Sharpness = 6,
    /// Target frame rate; drives the ISP frame-skip pattern.
    FrameRate = 7,
    /// Digital zoom step; drives the ISP crop and scaler.
    Zoom = 8,
}

impl ParamId {
    /// Decode a raw id.
    pub fn from_u32(raw: u32) -> Option<ParamId> {
        match raw {
            0 => Some(ParamId::Antibanding),
            1 => Some(ParamId::WhiteBalance),
            2 => Some(ParamId::Effect),
            3 => Some(ParamId::Brightness),
            4 => Some(ParamId::Contrast),
            5 => Some(ParamId::Saturation),
            6 => Some(ParamId::Sharpness),
            7 => Some(ParamId::FrameRate),
            8 => Some(ParamId::Zoom),
            _ => None,
        }
    }

    /// Table index of this parameter.
    pub fn index(self) -> usize {
        self as u32 as usize
    }

    /// True for parameters the active sensor module programs itself;
    /// changes to these are forwarded to the sensor worker.
    pub fn is_sensor_owned(self) -> bool {
        matches!(
            self,
            ParamId::Antibanding
                | ParamId::WhiteBalance
                | ParamId::Effect
                | ParamId::Brightness
                | ParamId::Contrast
                | ParamId::Saturation
                | ParamId::Sharpness
        )
    }
}

/// A parameter whose client value changed since the last apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamChange {
    /// Which parameter.
    pub id: ParamId,
    /// The newly accepted value.
    pub value: i32,
}

fn entry_offset(index: usize) -> usize {
    4 + index * ENTRY_SIZE
}

/// Write the head index into a parameter region. Client-side helper.
pub fn write_head(region: &mut MappedRegion, head: u32) {
    let _ = region.write_u32(0, head);
}

/// Write one table entry. Client-side helper.
pub fn write_entry(region: &mut MappedRegion, index: usize, id: u32, next: u32, value: i32) {
    let base = entry_offset(index);
    let _ = region.write_u32(base, id);
    let _ = region.write_u32(base + 4, next);
    let _ = region.write_u32(base + 8, value as u32);
}

/// The daemon's shadow copy of the parameter table.
#[derive(Debug, Default)]
pub struct ParamShadow {
    values: [i32; PARAM_COUNT],
}

impl ParamShadow {
    /// Fresh shadow with all values zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last accepted value of a parameter.
    pub fn get(&self, id: ParamId) -> i32 {
        self.values[id.index()]
    }

    /// Walk the client chain, accept changed values into the shadow,
    /// and return the changes in chain order.
    pub fn apply(&mut self, region: &MappedRegion) -> Vec<ParamChange> {
        let mut changes = Vec::new();

        if region.len() < PARAM_REGION_LEN {
            warn!(len = region.len(), "parameter region too small, walk skipped");
            return changes;
        }

        let mut seen = [false; PARAM_COUNT];
        let mut index = match region.read_u32(0) {
            Ok(head) => head,
            Err(_) => return changes,
        };

        loop {
            if index == PARAM_TERMINATOR {
                break;
            }
            let Ok(slot) = usize::try_from(index) else {
                break;
            };
            if slot >= PARAM_COUNT {
                debug!(index, "parameter chain left the table, walk ends");
                break;
            }
            if seen[slot] {
                debug!(index, "parameter chain repeats, walk ends");
                break;
            }
            seen[slot] = true;

            let base = entry_offset(slot);
            let (raw_id, next, value) = match (
                region.read_u32(base),
                region.read_u32(base + 4),
                region.read_i32(base + 8),
            ) {
                (Ok(id), Ok(next), Ok(value)) => (id, next, value),
                _ => break,
            };

            let Some(id) = ParamId::from_u32(raw_id) else {
                warn!(raw_id, "unrecognized parameter id, walk ends");
                break;
            };

            if self.values[id.index()] != value {
                self.values[id.index()] = value;
                changes.push(ParamChange { id, value });
            }

            index = next;
        }

        changes
    }
}
