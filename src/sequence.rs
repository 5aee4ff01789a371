//! Counter-based loss detection with a short reorder window.
//!
//! Every sample word carries a 6-bit counter. A mismatch against the expected
//! counter is first treated as reordering or a corrupted word: the sample is
//! parked in a small pending buffer. If the expected counter shows up again
//! the parked samples are released in counter order. If the buffer fills up
//! instead, the gap is confirmed as loss: the parked samples are released,
//! followed by placeholders for the slots that never arrived, so the
//! timeline length stays intact.

use log::{debug, error, warn};

use crate::bitfield::COUNTER_MODULUS;
use crate::decoder::{DecoderEvent, Sample, SampleSink};

/// Default size of the reorder window.
pub const PENDING_CAPACITY: usize = 5;

/// Lost slots (10 µs each) after which the loss diagnostic fires: 5 ms.
pub const DATA_LOSS_THRESHOLD: u64 = 500;

const COUNTER_MASK: u8 = COUNTER_MODULUS - 1;

#[inline]
fn next_counter(counter: u8) -> u8 {
    counter.wrapping_add(1) & COUNTER_MASK
}

/// Slots between `from` and `to`, modulo the counter width.
#[inline]
pub fn counter_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & COUNTER_MASK
}

/// What a single call to [`SequenceTracker::track`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// First sample after a reset; its counter became the reference.
    Synced,
    /// Counter matched and nothing was pending.
    InOrder,
    /// Counter matched and `released` parked samples were emitted before it.
    Recovered { released: usize },
    /// Counter mismatched; the sample was parked.
    Deferred,
    /// Reorder window overflowed; `released` parked samples were emitted,
    /// then `missing` placeholders, then the sample itself.
    Lost { missing: u8, released: usize },
}

#[derive(Debug, Clone)]
pub struct SequenceTracker {
    expected: Option<u8>,
    pending: Vec<(u8, Sample)>,
    window_start: u8,
    loss_count: u64,
    capacity: usize,
    threshold: u64,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new(PENDING_CAPACITY, DATA_LOSS_THRESHOLD)
    }
}

impl SequenceTracker {
    pub fn new(capacity: usize, threshold: u64) -> Self {
        Self {
            expected: None,
            pending: Vec::with_capacity(capacity),
            window_start: 0,
            loss_count: 0,
            capacity,
            threshold,
        }
    }

    /// Forget the reference counter, the loss total and anything parked.
    pub fn reset(&mut self) {
        self.expected = None;
        self.pending.clear();
        self.window_start = 0;
        self.loss_count = 0;
    }

    pub fn expected_counter(&self) -> Option<u8> {
        self.expected
    }

    pub fn loss_count(&self) -> u64 {
        self.loss_count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Route one decoded sample through the tracker, emitting into `sink`.
    pub fn track<S: SampleSink + ?Sized>(
        &mut self,
        counter: u8,
        sample: Sample,
        sink: &mut S,
    ) -> TrackOutcome {
        let counter = counter & COUNTER_MASK;

        let Some(expected) = self.expected else {
            debug!("sequence synced at counter {}", counter);
            self.expected = Some(next_counter(counter));
            sink.on_sample(sample);
            return TrackOutcome::Synced;
        };

        if counter == expected {
            let released = self.release_pending(sink);
            sink.on_sample(sample);
            self.expected = Some(next_counter(expected));
            return if released > 0 {
                debug!("released {} reordered samples at counter {}", released, counter);
                TrackOutcome::Recovered { released }
            } else {
                TrackOutcome::InOrder
            };
        }

        if self.pending.len() < self.capacity {
            if self.pending.is_empty() {
                self.window_start = expected;
            }
            self.pending.push((counter, sample));
            self.expected = Some(next_counter(expected));
            return TrackOutcome::Deferred;
        }

        let missing = counter_distance(expected, counter);
        let released = self.release_pending(sink);
        warn!(
            "sample loss: expected counter {}, got {} ({} missing, {} parked released)",
            expected, counter, missing, released
        );
        self.account_loss(u64::from(missing), sink);
        for _ in 0..missing {
            sink.on_sample(Sample::placeholder());
        }
        sink.on_sample(sample);
        self.expected = Some(next_counter(counter));
        TrackOutcome::Lost { missing, released }
    }

    fn release_pending<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let start = self.window_start;
        self.pending
            .sort_by_key(|(counter, _)| counter_distance(start, *counter));
        let released = self.pending.len();
        for (_, sample) in self.pending.drain(..) {
            sink.on_sample(sample);
        }
        released
    }

    fn account_loss<S: SampleSink + ?Sized>(&mut self, missing: u64, sink: &mut S) {
        let before = self.loss_count;
        self.loss_count = self.loss_count.saturating_add(missing);
        if before < self.threshold && self.loss_count >= self.threshold {
            error!(
                "data loss detected: {} samples lost since sampling started",
                self.loss_count
            );
            sink.on_event(DecoderEvent::DataLoss {
                lost_samples: self.loss_count,
            });
        }
    }
}
