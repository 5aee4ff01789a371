//! Smoothing of calibration discontinuities at range switches.
//!
//! When the analog front-end changes gain stage the first readings on the new
//! range carry a settling transient. Two exponential averages run over every
//! calibrated value; for a few samples after a switch the filter emits one of
//! them instead of the raw value.

use serde::Deserialize;

use crate::calibration::HIGHEST_GAIN_RANGE;

/// Samples on the highest-gain range during which the accumulators are frozen.
const FROZEN_SAMPLES: u32 = 2;

/// Tuning of the range-transition filter.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpikeFilter {
    /// Weight of the fast average, used for ranges 0..=3.
    pub alpha: f64,
    /// Weight of the slow average, used for the highest-gain range.
    pub alpha5: f64,
    /// Length of the guard window after a switch, in samples.
    pub samples: u32,
}

impl Default for SpikeFilter {
    fn default() -> Self {
        Self {
            alpha: 0.18,
            alpha5: 0.06,
            samples: 3,
        }
    }
}

/// Partial update for [`SpikeFilter`]; unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpikeFilterUpdate {
    pub alpha: Option<f64>,
    pub alpha5: Option<f64>,
    pub samples: Option<u32>,
}

impl SpikeFilter {
    pub fn merged(self, update: SpikeFilterUpdate) -> Self {
        Self {
            alpha: update.alpha.unwrap_or(self.alpha),
            alpha5: update.alpha5.unwrap_or(self.alpha5),
            samples: update.samples.unwrap_or(self.samples),
        }
    }
}

/// Dual-rate rolling average with a spike guard around range changes.
#[derive(Debug, Clone, Default)]
pub struct RangeTransitionFilter {
    config: SpikeFilter,
    fast: Option<f64>,
    slow: Option<f64>,
    prev_range: Option<usize>,
    consecutive_range_samples: u32,
    guard_remaining: u32,
}

impl RangeTransitionFilter {
    pub fn new(config: SpikeFilter) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> SpikeFilter {
        self.config
    }

    /// Swap the tuning; accumulators and guard state are kept.
    pub fn set_config(&mut self, config: SpikeFilter) {
        self.config = config;
    }

    /// Back to the uninitialized state; the next value seeds both averages.
    pub fn reset(&mut self) {
        self.fast = None;
        self.slow = None;
        self.prev_range = None;
        self.consecutive_range_samples = 0;
        self.guard_remaining = 0;
    }

    pub fn is_guarding(&self) -> bool {
        self.guard_remaining > 0
    }

    /// Feed one calibrated value measured on `range`; returns the value to emit.
    pub fn apply(&mut self, range: usize, value: f64) -> f64 {
        let prev_fast = self.fast;
        let prev_slow = self.slow;

        let fast = match self.fast {
            Some(avg) => self.config.alpha * value + (1.0 - self.config.alpha) * avg,
            None => value,
        };
        let slow = match self.slow {
            Some(avg) => self.config.alpha5 * value + (1.0 - self.config.alpha5) * avg,
            None => value,
        };
        self.fast = Some(fast);
        self.slow = Some(slow);

        let prev_range = *self.prev_range.get_or_insert(range);
        let range_changed = prev_range != range;
        let mut out = value;

        if range_changed || self.guard_remaining > 0 {
            if range_changed {
                self.consecutive_range_samples = 0;
                self.guard_remaining = self.config.samples;
            } else {
                self.consecutive_range_samples += 1;
            }

            if range == HIGHEST_GAIN_RANGE {
                if self.consecutive_range_samples < FROZEN_SAMPLES {
                    self.fast = prev_fast.or(self.fast);
                    self.slow = prev_slow.or(self.slow);
                }
                out = self.slow.unwrap_or(value);
            } else {
                out = self.fast.unwrap_or(value);
            }
            self.guard_remaining = self.guard_remaining.saturating_sub(1);
        }

        self.prev_range = Some(range);
        out
    }
}
