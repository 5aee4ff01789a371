//! Bit-field layout of a single sample word.
//!
//! Every sample leaves the instrument as a 32-bit little-endian word:
//!
//! ```text
//!  31      24 23    18 17 16  14 13            0
//! +----------+--------+--+-----+---------------+
//! | digital  | counter|  |range|    raw ADC    |
//! +----------+--------+--+-----+---------------+
//! ```
//!
//! Bit 17 is unused. All extraction is masking and shifting, so any `u32`
//! decodes to a valid [`RawSample`].

/// Offset and width of one field inside a sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u32,
    pub width: u32,
}

impl Field {
    const fn new(width: u32, offset: u32) -> Self {
        Self { offset, width }
    }

    /// Mask of the field, already shifted into position.
    pub const fn mask(self) -> u32 {
        ((1u64 << self.width) as u32).wrapping_sub(1) << self.offset
    }

    /// Extract the field value from `word`.
    #[inline]
    pub const fn extract(self, word: u32) -> u32 {
        (word & self.mask()) >> self.offset
    }
}

pub const ADC: Field = Field::new(14, 0);
pub const RANGE: Field = Field::new(3, 14);
pub const COUNTER: Field = Field::new(6, 18);
pub const DIGITAL: Field = Field::new(8, 24);

/// Size of one sample word on the wire.
pub const WORD_SIZE: usize = 4;

/// Counter values wrap at this modulus.
pub const COUNTER_MODULUS: u8 = 64;

/// Multiplier bringing the 14-bit ADC reading to the calibration scale.
pub const ADC_SCALE_FACTOR: u32 = 4;

/// Decoded fields of one sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Measurement range (gain stage), 0..=7 on the wire, 0..=4 in practice.
    pub range: u8,
    /// 6-bit sequence counter.
    pub counter: u8,
    /// 14-bit ADC reading, unscaled.
    pub raw_adc: u16,
    /// Logic-port levels, one bit per digital channel.
    pub digital_bits: u8,
}

impl RawSample {
    /// ADC reading multiplied to the fixed-point scale calibration expects.
    #[inline]
    pub fn scaled_adc(&self) -> u32 {
        u32::from(self.raw_adc) * ADC_SCALE_FACTOR
    }
}

/// Split a sample word into its fields.
#[inline]
pub fn decode(word: u32) -> RawSample {
    RawSample {
        range: RANGE.extract(word) as u8,
        counter: COUNTER.extract(word) as u8,
        raw_adc: ADC.extract(word) as u16,
        digital_bits: DIGITAL.extract(word) as u8,
    }
}

/// Decode a word straight from its little-endian wire bytes.
#[inline]
pub fn decode_bytes(bytes: [u8; WORD_SIZE]) -> RawSample {
    decode(u32::from_le_bytes(bytes))
}

/// Build a sample word from its fields. Values wider than their field are truncated.
pub fn encode(sample: RawSample) -> u32 {
    ((u32::from(sample.raw_adc) << ADC.offset) & ADC.mask())
        | ((u32::from(sample.range) << RANGE.offset) & RANGE.mask())
        | ((u32::from(sample.counter) << COUNTER.offset) & COUNTER.mask())
        | ((u32::from(sample.digital_bits) << DIGITAL.offset) & DIGITAL.mask())
}
