//! Streaming decoder for power-profiler current measurements.
//!
//! The instrument streams one 32-bit word per sample (10 µs period) over a
//! USB-serial link. This crate turns that byte stream into calibrated current
//! samples in µA, together with the eight digital-channel levels.
//!
//! # Timing and Loss
//!
//! Words carry no timestamps. The timeline is the emission order: the decoder
//! emits exactly one [`Sample`] per slot, using placeholder samples (no value)
//! where the 6-bit sequence counter shows that words were lost. Consumers
//! reconstruct time as `start_time + index * 10 µs`.
//!
//! # Layers
//!
//! - [`bitfield`], [`calibration`], [`filter`], [`sequence`], [`reassembly`]
//!   and [`metadata`] are independent building blocks.
//! - [`Decoder`] wires them into a single `feed(bytes)` entry point.
//! - [`PpkDevice`] drives a serial link and feeds its decoder.

pub mod bitfield;
pub mod calibration;
pub mod decoder;
pub mod device;
pub mod errors;
pub mod filter;
pub mod logging;
pub mod metadata;
pub mod reassembly;
pub mod sequence;

pub use calibration::CalibrationTable;
pub use decoder::{
    Decoder, DecoderConfig, DecoderEvent, DecoderStats, Sample, SampleCollector, SampleSink,
};
pub use device::{Command, PpkDevice, Transport};
pub use errors::*;
pub use filter::{RangeTransitionFilter, SpikeFilter, SpikeFilterUpdate};
pub use metadata::{Metadata, MetadataProtocol};
pub use reassembly::StreamReassembler;
pub use sequence::{SequenceTracker, TrackOutcome};
