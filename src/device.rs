//! Serial driver for the power profiler.
//!
//! The driver owns the link and one [`Decoder`]. It issues the few commands
//! the decoder depends on and pumps link reads into it.
//!
//! # Link lifecycle
//!
//! 1. `start()` sends `GetMetadata` and reads until the text block ends with
//!    `END`. From then on the link only carries sample words.
//! 2. `average_start()` resets loss and smoothing state, then starts streaming.
//! 3. `pump()` is called in a loop; each call performs one bounded read.
//! 4. `average_stop()` / `stop()` end the stream. A new metadata exchange
//!    requires a new connection.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::calibration::RANGE_COUNT;
use crate::decoder::{Decoder, DecoderConfig, DecoderEvent, SampleSink};
use crate::errors::{DriverError, Result};
use crate::filter::SpikeFilterUpdate;
use crate::metadata::Metadata;

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate. The link is USB CDC, so the value is nominal.
const BAUD_RATE: u32 = 115_200;

/// Read timeout on the serial port; keeps `pump()` bounded.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum time to wait for the metadata block.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of a single link read.
const READ_CHUNK: usize = 4096;

/// Regulator limits in millivolts.
pub const VDD_MIN_MV: u16 = 800;
pub const VDD_MAX_MV: u16 = 5000;

/// Command bytes understood by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    AverageStart = 0x06,
    AverageStop = 0x07,
    RegulatorSet = 0x0D,
    SetPowerMode = 0x11,
    GetMetadata = 0x19,
    SetUserGains = 0x25,
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Anything the driver can talk through: a serial port, or a scripted stream in tests.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

// ============================================================================
// Driver
// ============================================================================

pub struct PpkDevice {
    transport: Box<dyn Transport>,
    decoder: Decoder,
    sampling: bool,
    closed: bool,
    read_buf: Vec<u8>,
}

impl PpkDevice {
    /// Open the instrument's serial port (e.g. `/dev/ttyACM0`).
    pub fn connect_serial(path: &str, config: DecoderConfig) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()?;
        info!("serial port opened: {}", path);
        Ok(Self::from_transport(port, config))
    }

    pub fn from_transport<T: Transport + 'static>(transport: T, config: DecoderConfig) -> Self {
        Self {
            transport: Box::new(transport),
            decoder: Decoder::new(config),
            sampling: false,
            closed: false,
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    // ------------------------------------------------------------------------
    // Link protocol
    // ------------------------------------------------------------------------

    /// Request the metadata block and wait until the decoder switches to binary.
    pub fn start<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> Result<Metadata> {
        if self.decoder.is_streaming() {
            return Err(DriverError::Protocol(
                "metadata already received on this connection, reconnect to restart".into(),
            ));
        }
        self.send(&[Command::GetMetadata as u8])?;

        let deadline = Instant::now() + METADATA_TIMEOUT;
        while !self.decoder.is_streaming() {
            if Instant::now() > deadline {
                return Err(DriverError::Timeout("waiting for metadata".into()));
            }
            self.pump(sink)?;
        }

        let metadata = self.decoder.metadata().cloned().unwrap_or_default();
        info!(
            "instrument started: hw={:?}, mode={:?}, calibrated={:?}",
            metadata.hardware(),
            metadata.mode(),
            metadata.calibrated()
        );
        Ok(metadata)
    }

    /// Reset loss and smoothing state, then start streaming samples.
    pub fn average_start(&mut self) -> Result<()> {
        self.ensure_streaming("average_start")?;
        self.decoder.reset_sampling();
        self.send(&[Command::AverageStart as u8])?;
        self.sampling = true;
        debug!("averaging started");
        Ok(())
    }

    pub fn average_stop(&mut self) -> Result<()> {
        self.send(&[Command::AverageStop as u8])?;
        self.sampling = false;
        debug!("averaging stopped");
        Ok(())
    }

    /// Perform one read and feed it to the decoder.
    ///
    /// Returns the number of bytes consumed; 0 on a read timeout. A closed or
    /// failing link raises [`DecoderEvent::LinkClosed`] and stops the device.
    pub fn pump<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        if self.closed {
            return Err(DriverError::LinkClosed("device stopped".into()));
        }
        match self.transport.read(&mut self.read_buf) {
            Ok(0) => self.fail_link("end of stream".into(), sink),
            Ok(n) => {
                self.decoder.feed(&self.read_buf[..n], sink);
                Ok(n)
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => self.fail_link(e.to_string(), sink),
        }
    }

    fn fail_link<S: SampleSink + ?Sized>(&mut self, reason: String, sink: &mut S) -> Result<usize> {
        warn!("link failure: {}", reason);
        sink.on_event(DecoderEvent::LinkClosed(reason.clone()));
        self.stop();
        Err(DriverError::LinkClosed(reason))
    }

    /// Halt the stream and release the link. Further pumps fail.
    pub fn stop(&mut self) {
        if self.closed {
            return;
        }
        if self.sampling {
            // Best effort, the link may already be gone.
            if let Err(e) = self.send(&[Command::AverageStop as u8]) {
                debug!("stop: average stop not delivered: {}", e);
            }
        }
        self.sampling = false;
        self.closed = true;
        info!("device stopped");
    }

    // ------------------------------------------------------------------------
    // Calibration commands
    // ------------------------------------------------------------------------

    /// Set the user gain of `range` locally and on the instrument.
    pub fn set_user_gain(&mut self, range: usize, gain: f32) -> Result<()> {
        self.decoder.set_user_gain(range, f64::from(gain))?;
        let mut cmd = vec![Command::SetUserGains as u8, range as u8];
        cmd.extend_from_slice(&gain.to_le_bytes());
        self.send(&cmd)
    }

    /// Override the sense resistors used for calibration.
    pub fn set_resistors(&mut self, ohms: [f64; RANGE_COUNT]) -> Result<()> {
        self.decoder.set_resistors(ohms)
    }

    pub fn set_spike_filter(&mut self, update: SpikeFilterUpdate) {
        self.decoder.set_spike_filter(update);
    }

    /// Set the regulator output; the decoder's VDD correction follows.
    pub fn update_regulator(&mut self, vdd_mv: u16) -> Result<()> {
        if !(VDD_MIN_MV..=VDD_MAX_MV).contains(&vdd_mv) {
            return Err(DriverError::InvalidArgument(format!(
                "vdd {vdd_mv} mV outside {VDD_MIN_MV}..={VDD_MAX_MV}"
            )));
        }
        let [hi, lo] = vdd_mv.to_be_bytes();
        self.send(&[Command::RegulatorSet as u8, hi, lo])?;
        self.decoder.set_vdd(vdd_mv);
        debug!("regulator set to {} mV", vdd_mv);
        Ok(())
    }

    /// Switch between ampere-meter (`false`) and source-meter (`true`) mode.
    pub fn set_power_mode(&mut self, source_meter: bool) -> Result<()> {
        let mode = if source_meter { 2 } else { 1 };
        self.send(&[Command::SetPowerMode as u8, mode])
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn ensure_streaming(&self, what: &str) -> Result<()> {
        if !self.decoder.is_streaming() {
            return Err(DriverError::Command(format!(
                "{what}: metadata not received yet, call start() first"
            )));
        }
        Ok(())
    }

    fn send(&mut self, cmd: &[u8]) -> Result<()> {
        if self.closed {
            return Err(DriverError::LinkClosed("device stopped".into()));
        }
        self.transport.write_all(cmd)?;
        self.transport.flush()?;
        Ok(())
    }
}

impl Drop for PpkDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
