//! Reassembly of sample words from arbitrarily chunked link reads.

use crate::bitfield::WORD_SIZE;

/// Carries up to three trailing bytes from one chunk into the next.
#[derive(Debug, Clone, Default)]
pub struct StreamReassembler {
    remainder: [u8; WORD_SIZE],
    remainder_len: usize,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back from the previous chunk (always < 4).
    pub fn pending_len(&self) -> usize {
        self.remainder_len
    }

    /// Drop a partial word. Only meaningful on a fresh link.
    pub fn clear(&mut self) {
        self.remainder_len = 0;
    }

    /// Push `chunk` through, calling `on_word` for every complete word in order.
    ///
    /// Returns the number of words produced.
    pub fn feed<F: FnMut(u32)>(&mut self, chunk: &[u8], mut on_word: F) -> usize {
        let mut produced = 0;
        let mut rest = chunk;

        if self.remainder_len > 0 {
            let need = WORD_SIZE - self.remainder_len;
            let take = need.min(rest.len());
            self.remainder[self.remainder_len..self.remainder_len + take]
                .copy_from_slice(&rest[..take]);
            self.remainder_len += take;
            rest = &rest[take..];
            if self.remainder_len < WORD_SIZE {
                return 0;
            }
            on_word(u32::from_le_bytes(self.remainder));
            self.remainder_len = 0;
            produced += 1;
        }

        let mut words = rest.chunks_exact(WORD_SIZE);
        for bytes in &mut words {
            let mut word = [0u8; WORD_SIZE];
            word.copy_from_slice(bytes);
            on_word(u32::from_le_bytes(word));
            produced += 1;
        }

        let tail = words.remainder();
        self.remainder[..tail.len()].copy_from_slice(tail);
        self.remainder_len = tail.len();
        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(n: u32) -> (Vec<u32>, Vec<u8>) {
        let words: Vec<u32> = (0..n).map(|i| i.wrapping_mul(0x0101_0101) ^ 0xDEAD_BEEF).collect();
        let bytes = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        (words, bytes)
    }

    fn split_feed(bytes: &[u8], sizes: &[usize]) -> Vec<u32> {
        let mut r = StreamReassembler::new();
        let mut out = Vec::new();
        let mut pos = 0;
        let mut i = 0;
        while pos < bytes.len() {
            let size = sizes[i % sizes.len()].min(bytes.len() - pos);
            r.feed(&bytes[pos..pos + size], |w| out.push(w));
            pos += size;
            i += 1;
        }
        assert_eq!(r.pending_len(), 0);
        out
    }

    #[test]
    fn any_chunking_yields_original_words() {
        let (words, bytes) = stream(64);
        for sizes in [
            vec![1],
            vec![2],
            vec![3],
            vec![4],
            vec![5],
            vec![7, 1, 0, 13],
            vec![256],
            vec![3, 3, 2, 9, 1],
        ] {
            assert_eq!(split_feed(&bytes, &sizes), words, "chunk sizes {sizes:?}");
        }
    }

    #[test]
    fn short_chunks_accumulate_in_remainder() {
        let mut r = StreamReassembler::new();
        let mut out = Vec::new();
        assert_eq!(r.feed(&[], |w| out.push(w)), 0);
        assert_eq!(r.feed(&[0x01], |w| out.push(w)), 0);
        assert_eq!(r.pending_len(), 1);
        assert_eq!(r.feed(&[0x02, 0x03], |w| out.push(w)), 0);
        assert_eq!(r.pending_len(), 3);
        assert_eq!(r.feed(&[0x04, 0xAA], |w| out.push(w)), 1);
        assert_eq!(out, vec![0x0403_0201]);
        assert_eq!(r.pending_len(), 1);
        r.clear();
        assert_eq!(r.pending_len(), 0);
    }
}
