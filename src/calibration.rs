//! Per-range calibration of raw ADC counts into amperes.
//!
//! The instrument switches between five gain stages ("ranges"). Each range has
//! its own sense resistor `r`, a second-order gain correction (`gs`, `gi`),
//! an ADC offset `o`, a supply-dependent correction (`s`, `i`) and a
//! user-tunable gain `ug`:
//!
//! ```text
//! x      = (adc - o) * (adc_scale / r)
//! amps   = ug * (x * (gs * x + gi) + (s * vdd_volts + i))
//! ```

use log::debug;

use crate::errors::{DriverError, Result};
use crate::metadata::Metadata;

/// Number of measurement ranges the table covers.
pub const RANGE_COUNT: usize = 5;

/// Index of the most sensitive range.
pub const HIGHEST_GAIN_RANGE: usize = RANGE_COUNT - 1;

/// Volts per scaled ADC count before the sense resistor is applied.
pub const DEFAULT_ADC_SCALE: f64 = 1.8 / 163_840.0;

const DEFAULT_RESISTORS: [f64; RANGE_COUNT] = [1031.64, 101.65, 10.15, 0.94, 0.043];

/// Coefficient tables, one entry per range.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    pub r: [f64; RANGE_COUNT],
    pub gs: [f64; RANGE_COUNT],
    pub gi: [f64; RANGE_COUNT],
    pub o: [f64; RANGE_COUNT],
    pub s: [f64; RANGE_COUNT],
    pub i: [f64; RANGE_COUNT],
    pub ug: [f64; RANGE_COUNT],
    adc_scale: f64,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self {
            r: DEFAULT_RESISTORS,
            gs: [1.0; RANGE_COUNT],
            gi: [1.0; RANGE_COUNT],
            o: [0.0; RANGE_COUNT],
            s: [0.0; RANGE_COUNT],
            i: [0.0; RANGE_COUNT],
            ug: [1.0; RANGE_COUNT],
            adc_scale: DEFAULT_ADC_SCALE,
        }
    }
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ADC scale constant.
    pub fn with_adc_scale(mut self, adc_scale: f64) -> Self {
        self.adc_scale = adc_scale;
        self
    }

    pub fn adc_scale(&self) -> f64 {
        self.adc_scale
    }

    /// Overwrite coefficients that the metadata carries as numbers; keep the rest.
    ///
    /// Returns how many coefficients were taken from the metadata.
    pub fn load_from_metadata(&mut self, metadata: &Metadata) -> usize {
        let mut loaded = 0;
        for (name, table) in [
            ("r", &mut self.r),
            ("gs", &mut self.gs),
            ("gi", &mut self.gi),
            ("o", &mut self.o),
            ("s", &mut self.s),
            ("i", &mut self.i),
            ("ug", &mut self.ug),
        ] {
            for (idx, slot) in table.iter_mut().enumerate() {
                if let Some(value) = metadata.get(&format!("{name}{idx}")) {
                    if value.is_finite() {
                        *slot = value;
                        loaded += 1;
                    }
                }
            }
        }
        debug!("calibration: {} coefficients loaded from metadata", loaded);
        loaded
    }

    /// Calibrated current in amperes for a scaled ADC reading.
    ///
    /// Ranges past the table are clamped to the last entry.
    pub fn calibrate(&self, range: usize, scaled_adc: u32, vdd_mv: u16) -> f64 {
        let idx = clamp_range(range);
        let x = (f64::from(scaled_adc) - self.o[idx]) * (self.adc_scale / self.r[idx]);
        let supply = self.s[idx] * (f64::from(vdd_mv) / 1000.0) + self.i[idx];
        self.ug[idx] * (x * (self.gs[idx] * x + self.gi[idx]) + supply)
    }

    pub fn set_user_gain(&mut self, range: usize, gain: f64) -> Result<()> {
        check_range(range)?;
        if !gain.is_finite() {
            return Err(DriverError::InvalidArgument(format!(
                "user gain must be finite, got {gain}"
            )));
        }
        self.ug[range] = gain;
        debug!("user gain for range {} set to {}", range, gain);
        Ok(())
    }

    pub fn set_resistor(&mut self, range: usize, ohms: f64) -> Result<()> {
        check_range(range)?;
        if !ohms.is_finite() || ohms <= 0.0 {
            return Err(DriverError::InvalidArgument(format!(
                "resistor value must be positive, got {ohms}"
            )));
        }
        self.r[range] = ohms;
        Ok(())
    }

    /// Override every sense resistor at once. Nothing changes if any value is rejected.
    pub fn set_resistors(&mut self, ohms: [f64; RANGE_COUNT]) -> Result<()> {
        let mut next = self.r;
        for (range, value) in ohms.into_iter().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(DriverError::InvalidArgument(format!(
                    "resistor value for range {range} must be positive, got {value}"
                )));
            }
            next[range] = value;
        }
        self.r = next;
        debug!("sense resistors overridden: {:?}", self.r);
        Ok(())
    }
}

/// Map a reported range onto a table index.
#[inline]
pub fn clamp_range(range: usize) -> usize {
    range.min(HIGHEST_GAIN_RANGE)
}

fn check_range(range: usize) -> Result<()> {
    if range >= RANGE_COUNT {
        return Err(DriverError::InvalidArgument(format!(
            "range {range} out of table (0..{RANGE_COUNT})"
        )));
    }
    Ok(())
}
