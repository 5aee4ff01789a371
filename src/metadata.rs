//! Calibration metadata exchanged before binary streaming begins.
//!
//! After a `GetMetadata` command the instrument answers with a plain-text
//! block of `key value` lines closed by an `END` sentinel:
//!
//! ```text
//! Calibrated: 0
//! R0: 1003.3506
//! GS1: 112.7890
//! VDD: 3741
//! HW: 9173
//! I0: -nan
//! END
//! ```
//!
//! Keys are case-insensitive. A `nan` value is kept as an absent coefficient;
//! lines that do not parse are skipped.

use std::collections::BTreeMap;

use log::{debug, warn};

/// Sentinel closing the metadata block.
pub const METADATA_SENTINEL: &[u8] = b"END";

/// Upper bound on buffered metadata text before the sentinel.
const MAX_METADATA_LEN: usize = 16 * 1024;

/// Parsed metadata block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    values: BTreeMap<String, Option<f64>>,
}

impl Metadata {
    /// Parse the text preceding the sentinel. Never fails; bad lines are dropped.
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some((key, value)) => {
                    values.insert(key, value);
                }
                None => debug!("skipping malformed metadata line: {:?}", line),
            }
        }
        Self { values }
    }

    /// Numeric value of `key` (case-insensitive). `None` when missing or not-a-number.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(&key.to_ascii_lowercase()).copied().flatten()
    }

    /// Whether the key appeared at all, even with a not-a-number value.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterate keys and values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Regulator voltage reported by the instrument, in millivolts.
    pub fn vdd(&self) -> Option<u16> {
        self.get("vdd")
            .filter(|v| *v >= 0.0 && *v <= f64::from(u16::MAX))
            .map(|v| v.round() as u16)
    }

    /// Hardware identifier.
    pub fn hardware(&self) -> Option<u32> {
        self.get("hw")
            .filter(|v| *v >= 0.0 && *v <= f64::from(u32::MAX))
            .map(|v| v as u32)
    }

    /// Power mode the instrument is currently in (1 = ampere meter, 2 = source meter).
    pub fn mode(&self) -> Option<u8> {
        self.get("mode")
            .filter(|v| *v >= 0.0 && *v <= f64::from(u8::MAX))
            .map(|v| v as u8)
    }

    /// Whether the instrument reports a factory calibration.
    pub fn calibrated(&self) -> Option<bool> {
        self.get("calibrated").map(|v| v != 0.0)
    }
}

fn parse_line(line: &str) -> Option<(String, Option<f64>)> {
    let (key, value) = match line.split_once(':') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => {
            let mut parts = line.split_whitespace();
            let k = parts.next()?;
            (k, parts.next().unwrap_or(""))
        }
    };
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let value = parse_value(value)?;
    Some((key.to_ascii_lowercase(), value))
}

/// `Some(None)` for a not-a-number token, `None` for garbage.
fn parse_value(raw: &str) -> Option<Option<f64>> {
    let lowered = raw.to_ascii_lowercase();
    match lowered.as_str() {
        "nan" | "-nan" | "+nan" | "null" => return Some(None),
        "" => return None,
        _ => {}
    }
    match lowered.parse::<f64>() {
        Ok(v) if v.is_nan() => Some(None),
        Ok(v) => Some(Some(v)),
        Err(_) => None,
    }
}

/// Phase 1 of the link protocol: collect text until the sentinel shows up.
///
/// Once [`MetadataProtocol::feed_text`] has returned the parsed block the
/// protocol is finished and ignores further input; the binary stream takes
/// over the link from there.
#[derive(Debug, Default)]
pub struct MetadataProtocol {
    buffer: Vec<u8>,
    leftover: Vec<u8>,
    finished: bool,
}

impl MetadataProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; returns the parsed metadata the first time the sentinel is seen.
    pub fn feed_text(&mut self, chunk: &[u8]) -> Option<Metadata> {
        if self.finished {
            return None;
        }
        // Start the sentinel search a few bytes back so a split "E|ND" is found.
        let search_from = self.buffer.len().saturating_sub(METADATA_SENTINEL.len() - 1);
        self.buffer.extend_from_slice(chunk);

        let pos = match find(&self.buffer[search_from..], METADATA_SENTINEL) {
            Some(p) => search_from + p,
            None => {
                if self.buffer.len() > MAX_METADATA_LEN {
                    warn!(
                        "metadata exceeds {} bytes without sentinel, discarding buffered text",
                        MAX_METADATA_LEN
                    );
                    self.buffer.clear();
                }
                return None;
            }
        };

        let text = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        self.leftover = self.buffer[pos + METADATA_SENTINEL.len()..].to_vec();
        self.buffer.clear();
        self.finished = true;

        let metadata = Metadata::parse(&text);
        debug!(
            "metadata complete: {} keys, {} trailing bytes",
            metadata.len(),
            self.leftover.len()
        );
        Some(metadata)
    }

    /// Bytes that followed the sentinel in the final chunk, line break included.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.leftover)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// The line break that closes the sentinel line.
///
/// The instrument sends `END\n`, but a read may end right after `END`. At most
/// one `\r` and then one `\n` are dropped, wherever the chunk boundaries fall;
/// the first other byte starts the binary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnd {
    /// Sentinel just seen.
    Pending,
    /// `\r` dropped, a `\n` may still follow.
    AfterCr,
    /// Nothing left to drop.
    Done,
}

impl LineEnd {
    /// Returns `chunk` without the part of the line break it carries.
    pub fn strip<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let mut rest = chunk;
        while *self != LineEnd::Done {
            let Some((&first, tail)) = rest.split_first() else {
                break;
            };
            *self = match (*self, first) {
                (LineEnd::Pending, b'\r') => LineEnd::AfterCr,
                (_, b'\n') => LineEnd::Done,
                _ => {
                    *self = LineEnd::Done;
                    break;
                }
            };
            rest = tail;
        }
        rest
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
