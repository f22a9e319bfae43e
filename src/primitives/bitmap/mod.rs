#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u64 = 64;

fn words_for(len: u64) -> usize {
    len.div_ceil(WORD_BITS) as usize
}

/// Fixed-length bitmap. Reads past the end return `false`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: u64,
}

impl Bitmap {
    /// All-zero bitmap of `len` bits.
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; words_for(len)],
            len,
        }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when the bitmap addresses no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns bit `idx`.
    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.len {
            return false;
        }
        let word = self.words[(idx / WORD_BITS) as usize];
        word & (1 << (idx % WORD_BITS)) != 0
    }

    /// Sets bit `idx`; out-of-range indexes are ignored. Returns true when the
    /// bit was previously unset.
    pub fn set(&mut self, idx: u64) -> bool {
        if idx >= self.len {
            return false;
        }
        let mask = 1 << (idx % WORD_BITS);
        let word = &mut self.words[(idx / WORD_BITS) as usize];
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Iterates the indexes of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| {
                let base = word_idx as u64 * WORD_BITS;
                let mut rest = word;
                std::iter::from_fn(move || {
                    if rest == 0 {
                        return None;
                    }
                    let bit = u64::from(rest.trailing_zeros());
                    rest &= rest - 1;
                    Some(base + bit)
                })
            })
    }
}

/// Bitmap with lock-free concurrent `set`. Bits are never cleared; a fresh
/// bitmap replaces it instead.
#[derive(Debug, Default)]
pub struct AtomicBitmap {
    words: Vec<AtomicU64>,
    len: u64,
    ones: AtomicU64,
}

impl AtomicBitmap {
    /// All-zero bitmap of `len` bits.
    pub fn new(len: u64) -> Self {
        Self {
            words: (0..words_for(len)).map(|_| AtomicU64::new(0)).collect(),
            len,
            ones: AtomicU64::new(0),
        }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when the bitmap addresses no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns bit `idx`.
    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.len {
            return false;
        }
        let word = self.words[(idx / WORD_BITS) as usize].load(Ordering::Acquire);
        word & (1 << (idx % WORD_BITS)) != 0
    }

    /// Sets bit `idx`. Returns true only for the caller that flipped it.
    pub fn set(&self, idx: u64) -> bool {
        if idx >= self.len {
            return false;
        }
        let mask = 1 << (idx % WORD_BITS);
        let prev = self.words[(idx / WORD_BITS) as usize].fetch_or(mask, Ordering::AcqRel);
        let fresh = prev & mask == 0;
        if fresh {
            self.ones.fetch_add(1, Ordering::AcqRel);
        }
        fresh
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.ones.load(Ordering::Acquire)
    }

    /// Point-in-time copy.
    pub fn to_bitmap(&self) -> Bitmap {
        Bitmap {
            words: self
                .words
                .iter()
                .map(|w| w.load(Ordering::Acquire))
                .collect(),
            len: self.len,
        }
    }
}
