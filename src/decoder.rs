//! The per-connection decode pipeline.
//!
//! ```text
//! bytes ─▶ MetadataProtocol ──(END)──▶ StreamReassembler ─▶ bitfield::decode
//!                                        ─▶ CalibrationTable ─▶ RangeTransitionFilter
//!                                        ─▶ SequenceTracker ─▶ SampleSink
//! ```
//!
//! A [`Decoder`] is owned by whoever reads the link. `feed` never blocks and
//! does work proportional to the chunk length. All state changes go through
//! `&mut self`, so a reset can never land in the middle of a chunk.

use log::{debug, info, trace};
use serde::Deserialize;

use crate::bitfield;
use crate::calibration::{clamp_range, CalibrationTable, DEFAULT_ADC_SCALE, RANGE_COUNT};
use crate::errors::Result;
use crate::filter::{RangeTransitionFilter, SpikeFilter, SpikeFilterUpdate};
use crate::metadata::{LineEnd, Metadata, MetadataProtocol};
use crate::reassembly::StreamReassembler;
use crate::sequence::{SequenceTracker, DATA_LOSS_THRESHOLD, PENDING_CAPACITY};

/// Amperes to microamperes.
const MICRO: f64 = 1e6;

/// VDD assumed until the metadata or the host says otherwise.
pub const DEFAULT_VDD_MV: u16 = 3700;

/// One emitted slot of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    /// Calibrated current in µA; `None` for a lost slot.
    pub current_ua: Option<f64>,
    /// Logic-port levels; `None` for a lost slot.
    pub digital_bits: Option<u8>,
}

impl Sample {
    pub fn new(current_ua: f64, digital_bits: u8) -> Self {
        Self {
            current_ua: Some(current_ua),
            digital_bits: Some(digital_bits),
        }
    }

    /// Stand-in for a slot that could not be recovered.
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.current_ua.is_none()
    }
}

/// Out-of-band notifications for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    /// The metadata block was received and calibration loaded.
    Metadata(Metadata),
    /// Cumulative loss crossed the reporting threshold since the last reset.
    DataLoss { lost_samples: u64 },
    /// The byte source failed; no further samples will arrive.
    LinkClosed(String),
}

/// Receiver of decoded samples.
pub trait SampleSink {
    fn on_sample(&mut self, sample: Sample);

    fn on_event(&mut self, event: DecoderEvent) {
        let _ = event;
    }
}

impl<T: SampleSink + ?Sized> SampleSink for &mut T {
    fn on_sample(&mut self, sample: Sample) {
        (**self).on_sample(sample);
    }

    fn on_event(&mut self, event: DecoderEvent) {
        (**self).on_event(event);
    }
}

/// Sink that keeps everything it receives.
#[derive(Debug, Default, Clone)]
pub struct SampleCollector {
    pub samples: Vec<Sample>,
    pub events: Vec<DecoderEvent>,
}

impl SampleSink for SampleCollector {
    fn on_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    fn on_event(&mut self, event: DecoderEvent) {
        self.events.push(event);
    }
}

/// Decoder tuning. Deserializable so a host can keep it in its own config file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub spike_filter: SpikeFilter,
    /// Lost slots before the data-loss diagnostic fires.
    pub loss_threshold: u64,
    /// Size of the reorder window.
    pub pending_capacity: usize,
    /// Volts per scaled ADC count.
    pub adc_scale: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            spike_filter: SpikeFilter::default(),
            loss_threshold: DATA_LOSS_THRESHOLD,
            pending_capacity: PENDING_CAPACITY,
            adc_scale: DEFAULT_ADC_SCALE,
        }
    }
}

/// Running counters since the decoder was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub words_decoded: u64,
    pub samples_emitted: u64,
    pub placeholders_emitted: u64,
    /// Words whose calibrated value was not a finite number.
    pub invalid_words: u64,
}

enum Phase {
    AwaitingMetadata(MetadataProtocol),
    Streaming,
}

pub struct Decoder {
    phase: Phase,
    line_end: LineEnd,
    reassembler: StreamReassembler,
    calibration: CalibrationTable,
    filter: RangeTransitionFilter,
    tracker: SequenceTracker,
    metadata: Option<Metadata>,
    vdd_mv: u16,
    stats: DecoderStats,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            phase: Phase::AwaitingMetadata(MetadataProtocol::new()),
            line_end: LineEnd::Done,
            reassembler: StreamReassembler::new(),
            calibration: CalibrationTable::new().with_adc_scale(config.adc_scale),
            filter: RangeTransitionFilter::new(config.spike_filter),
            tracker: SequenceTracker::new(config.pending_capacity, config.loss_threshold),
            metadata: None,
            vdd_mv: DEFAULT_VDD_MV,
            stats: DecoderStats::default(),
        }
    }

    /// A decoder that skips the metadata phase and decodes binary right away.
    pub fn streaming(config: DecoderConfig, calibration: CalibrationTable) -> Self {
        let mut decoder = Self::new(config);
        decoder.calibration = calibration;
        decoder.phase = Phase::Streaming;
        decoder
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn loss_count(&self) -> u64 {
        self.tracker.loss_count()
    }

    pub fn vdd_mv(&self) -> u16 {
        self.vdd_mv
    }

    pub fn set_vdd(&mut self, vdd_mv: u16) {
        self.vdd_mv = vdd_mv;
    }

    pub fn set_user_gain(&mut self, range: usize, gain: f64) -> Result<()> {
        self.calibration.set_user_gain(range, gain)
    }

    pub fn set_resistors(&mut self, ohms: [f64; RANGE_COUNT]) -> Result<()> {
        self.calibration.set_resistors(ohms)
    }

    pub fn set_spike_filter(&mut self, update: SpikeFilterUpdate) {
        let merged = self.filter.config().merged(update);
        debug!("spike filter set to {:?}", merged);
        self.filter.set_config(merged);
    }

    /// Sampling (re)started: clear smoothing and loss state.
    pub fn reset_sampling(&mut self) {
        self.filter.reset();
        self.tracker.reset();
    }

    /// Hand a chunk of link bytes to the pipeline.
    pub fn feed<S: SampleSink + ?Sized>(&mut self, chunk: &[u8], sink: &mut S) {
        let leftover = match &mut self.phase {
            Phase::Streaming => {
                self.decode_chunk(chunk, sink);
                return;
            }
            Phase::AwaitingMetadata(protocol) => match protocol.feed_text(chunk) {
                Some(metadata) => {
                    let leftover = protocol.take_leftover();
                    self.enter_streaming(metadata, sink);
                    leftover
                }
                None => return,
            },
        };
        if !leftover.is_empty() {
            self.decode_chunk(&leftover, sink);
        }
    }

    fn enter_streaming<S: SampleSink + ?Sized>(&mut self, metadata: Metadata, sink: &mut S) {
        self.calibration.load_from_metadata(&metadata);
        if let Some(vdd) = metadata.vdd() {
            self.vdd_mv = vdd;
        }
        info!(
            "metadata received ({} keys, hw={:?}, vdd={}mV), switching to sample stream",
            metadata.len(),
            metadata.hardware(),
            self.vdd_mv
        );
        self.metadata = Some(metadata.clone());
        self.phase = Phase::Streaming;
        self.line_end = LineEnd::Pending;
        sink.on_event(DecoderEvent::Metadata(metadata));
    }

    fn decode_chunk<S: SampleSink + ?Sized>(&mut self, chunk: &[u8], sink: &mut S) {
        let chunk = self.line_end.strip(chunk);
        let Self {
            reassembler,
            calibration,
            filter,
            tracker,
            vdd_mv,
            stats,
            ..
        } = self;
        let mut counting = CountingSink { inner: sink, stats };
        reassembler.feed(chunk, |word| {
            counting.stats.words_decoded += 1;
            let raw = bitfield::decode(word);
            let range = clamp_range(usize::from(raw.range));
            if range != usize::from(raw.range) {
                trace!("range {} clamped to {}", raw.range, range);
            }
            let amps = calibration.calibrate(range, raw.scaled_adc(), *vdd_mv);
            let sample = if amps.is_finite() {
                Sample::new(filter.apply(range, amps) * MICRO, raw.digital_bits)
            } else {
                counting.stats.invalid_words += 1;
                debug!("non-finite calibrated value for word {:#010x}", word);
                Sample::placeholder()
            };
            tracker.track(raw.counter, sample, &mut counting);
        });
    }
}

/// Tallies what reaches the consumer.
struct CountingSink<'a, S: ?Sized> {
    inner: &'a mut S,
    stats: &'a mut DecoderStats,
}

impl<S: SampleSink + ?Sized> SampleSink for CountingSink<'_, S> {
    fn on_sample(&mut self, sample: Sample) {
        self.stats.samples_emitted += 1;
        if sample.is_placeholder() {
            self.stats.placeholders_emitted += 1;
        }
        self.inner.on_sample(sample);
    }

    fn on_event(&mut self, event: DecoderEvent) {
        self.inner.on_event(event);
    }
}
