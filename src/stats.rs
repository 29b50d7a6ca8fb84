//! Statistics feedback workers: the 3A reduction loop.
//!
//! The ISP delivers raw statistics buffers per kind (exposure, white
//! balance, focus). The session thread copies each hardware slot into
//! the kind's [`StatsMailbox`] and signals the kind's worker, then
//! immediately re-queues the hardware slot: the reduction result is
//! never required for the capture pipeline to make progress. A slow
//! worker only delays the next metadata update.
//!
//! Results are consume-once: [`StatsMailbox::take`] returns `Some` at
//! most once per published reduction, and consumers treat `None` as
//! "no new data" rather than waiting.

use crate::command::{Command, StatsCmd};
use crate::error::Result;
use crate::worker::{Flow, Subdev};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Statistics kinds, one hardware queue and one worker each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsKind {
    /// Autoexposure.
    Aec,
    /// Auto white balance.
    Awb,
    /// Autofocus.
    Af,
}

/// Number of statistics kinds.
pub const STATS_KINDS: usize = 3;

impl StatsKind {
    /// All kinds, in registry index order.
    pub const ALL: [StatsKind; STATS_KINDS] = [StatsKind::Aec, StatsKind::Awb, StatsKind::Af];

    /// Registry index for this kind.
    pub fn index(self) -> usize {
        match self {
            StatsKind::Aec => 0,
            StatsKind::Awb => 1,
            StatsKind::Af => 2,
        }
    }
}

impl std::fmt::Display for StatsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsKind::Aec => f.write_str("aec"),
            StatsKind::Awb => f.write_str("awb"),
            StatsKind::Af => f.write_str("af"),
        }
    }
}

/// Target frame brightness for the exposure loop, out of 255.
pub const TARGET_LUMA: u8 = 80;

/// Lowest legal sensor gain.
pub const GAIN_MIN: u16 = 1;

/// Highest legal sensor gain.
pub const GAIN_MAX: u16 = 512;

/// Gain a session starts from before the first reduction.
pub const GAIN_DEFAULT: u16 = 64;

/// A published reduction result.
#[derive(Debug, Clone)]
pub struct StatsResult {
    /// New sensor gain (exposure kind only).
    pub gain: Option<u16>,
    /// Average sample value the reduction saw.
    pub average: u8,
    /// Raw sample payload, republished for the metadata stream.
    pub payload: Vec<u8>,
}

/// Work-in / result-out mailbox between the session thread and one
/// statistics worker.
#[derive(Default)]
pub struct StatsMailbox {
    inner: Mutex<MailboxInner>,
}

#[derive(Default)]
struct MailboxInner {
    work: Vec<u8>,
    result: Option<StatsResult>,
}

impl StatsMailbox {
    /// Create an empty mailbox.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the work buffer with a fresh hardware sample copy.
    pub fn submit(&self, samples: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.work.clear();
        inner.work.extend_from_slice(samples);
    }

    /// Consume the latest result, if a reduction finished since the
    /// last take.
    pub fn take(&self) -> Option<StatsResult> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.result.take()
    }

    fn work_copy(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.work.clone()
    }

    fn publish(&self, result: StatsResult) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.result = Some(result);
    }
}

/// Signed gain adjustment for an observed average brightness.
///
/// Dead-zone control law around [`TARGET_LUMA`]: small errors are
/// ignored, larger errors step the gain progressively harder.
pub fn exposure_adjustment(average: u8) -> i16 {
    let error = i16::from(TARGET_LUMA) - i16::from(average);
    let magnitude = error.abs();
    let step = if magnitude < 20 {
        0
    } else if magnitude < 30 {
        1
    } else if magnitude < 40 {
        5
    } else {
        10
    };
    step * error.signum()
}

/// Mean of nonzero samples; falls back to the full-buffer mean when
/// every sample is zero. Empty buffers average to zero.
pub fn exposure_average(samples: &[u8]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let mut sum: u64 = 0;
    let mut nonzero: u64 = 0;
    for &s in samples {
        if s != 0 {
            sum += u64::from(s);
            nonzero += 1;
        }
    }
    if nonzero > 0 {
        (sum / nonzero) as u8
    } else {
        0
    }
}

/// Unconditional full-buffer mean.
pub fn plain_average(samples: &[u8]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u64 = samples.iter().map(|&s| u64::from(s)).sum();
    (sum / samples.len() as u64) as u8
}

/// The reduction engine run as a worker subdevice, one per kind.
pub struct StatsEngine {
    kind: StatsKind,
    mailbox: Arc<StatsMailbox>,
    gain: u16,
}

impl StatsEngine {
    /// Create an engine over `mailbox`.
    pub fn new(kind: StatsKind, mailbox: Arc<StatsMailbox>) -> Self {
        Self {
            kind,
            mailbox,
            gain: GAIN_DEFAULT,
        }
    }

    fn reduce(&mut self) {
        let work = self.mailbox.work_copy();
        let result = match self.kind {
            StatsKind::Aec => {
                let average = exposure_average(&work);
                let adjustment = exposure_adjustment(average);
                self.gain = (i32::from(self.gain) + i32::from(adjustment))
                    .clamp(i32::from(GAIN_MIN), i32::from(GAIN_MAX))
                    as u16;
                debug!(
                    kind = %self.kind,
                    average,
                    adjustment,
                    gain = self.gain,
                    "exposure reduction"
                );
                StatsResult {
                    gain: Some(self.gain),
                    average,
                    payload: work,
                }
            }
            StatsKind::Awb | StatsKind::Af => {
                let average = plain_average(&work);
                StatsResult {
                    gain: None,
                    average,
                    payload: work,
                }
            }
        };
        self.mailbox.publish(result);
    }
}

impl Subdev for StatsEngine {
    fn command(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Stats(StatsCmd::Reduce) => {
                self.reduce();
                Ok(Flow::Continue)
            }
            other => {
                warn!(kind = %self.kind, command = ?other, "unexpected command");
                Ok(Flow::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use std::time::{Duration, Instant};

    #[test]
    fn test_adjustment_dead_zone() {
        // error +20 -> smallest step toward brighter
        assert_eq!(exposure_adjustment(60), 1);
        // error +40 -> hardest step
        assert_eq!(exposure_adjustment(40), 10);
        // error -15 -> inside the dead zone
        assert_eq!(exposure_adjustment(95), 0);
        // error -35 -> medium step darker
        assert_eq!(exposure_adjustment(115), -5);
        assert_eq!(exposure_adjustment(TARGET_LUMA), 0);
    }

    #[test]
    fn test_gain_clamped_to_range() {
        let mailbox = StatsMailbox::new();
        let mut engine = StatsEngine::new(StatsKind::Aec, Arc::clone(&mailbox));

        // Dark frames push the gain up; it must saturate at GAIN_MAX.
        for _ in 0..100 {
            mailbox.submit(&[10u8; 64]);
            engine.reduce();
        }
        assert_eq!(mailbox.take().unwrap().gain, Some(GAIN_MAX));

        // Bright frames push it down; it must saturate at GAIN_MIN.
        for _ in 0..100 {
            mailbox.submit(&[250u8; 64]);
            engine.reduce();
        }
        assert_eq!(mailbox.take().unwrap().gain, Some(GAIN_MIN));
    }

    #[test]
    fn test_exposure_average_skips_zeros() {
        assert_eq!(exposure_average(&[0, 0, 90, 30]), 60);
        // All-zero buffer falls back to the full average.
        assert_eq!(exposure_average(&[0, 0, 0, 0]), 0);
        assert_eq!(exposure_average(&[]), 0);
    }

    #[test]
    fn test_awb_republishes_payload_without_gain() {
        let mailbox = StatsMailbox::new();
        let mut engine = StatsEngine::new(StatsKind::Awb, Arc::clone(&mailbox));

        mailbox.submit(&[1, 2, 3, 4]);
        engine.reduce();

        let result = mailbox.take().unwrap();
        assert_eq!(result.gain, None);
        assert_eq!(result.average, 2);
        assert_eq!(result.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_result_consumed_exactly_once() {
        let mailbox = StatsMailbox::new();
        let mut engine = StatsEngine::new(StatsKind::Aec, Arc::clone(&mailbox));

        mailbox.submit(&[60u8; 16]);
        engine.reduce();

        assert!(mailbox.take().is_some());
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn test_engine_runs_as_worker() {
        let mailbox = StatsMailbox::new();
        let engine = StatsEngine::new(StatsKind::Aec, Arc::clone(&mailbox));
        let worker = Worker::spawn("stats-aec", engine).unwrap();

        mailbox.submit(&[60u8; 16]);
        worker.send(Command::Stats(StatsCmd::Reduce)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let result = loop {
            if let Some(result) = mailbox.take() {
                break result;
            }
            assert!(Instant::now() < deadline, "reduction never published");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(result.gain, Some(GAIN_DEFAULT + 1));
        worker.close().unwrap();
    }
}
