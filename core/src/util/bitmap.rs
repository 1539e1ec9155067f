use crate::prelude::*;

use bittle::{BigEndian, Bits, BitsMut};
use serde::{Deserialize, Serialize};

/// A compact array of bits, one per table slot.
///
/// The bitmap is backed by `Vec<u64>`, and its default endianness is _BigEndian_.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BitMap {
    bits: Vec<u64>,
    len: usize,
}

impl BitMap {
    /// Creates a new `BitMap` with all `len` bits cleared, reporting
    /// allocation failures instead of aborting.
    pub fn try_zeroed(len: usize) -> Result<Self> {
        let vec_len = (len + 64 - 1) / 64;
        let mut bits = Vec::new();
        bits.try_reserve_exact(vec_len)
            .map_err(|_| Error::with_msg(OutOfMemory, "bitmap allocation failed"))?;
        bits.resize(vec_len, 0u64);
        Ok(Self { bits, len })
    }

    /// Returns the total number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn check_index(&self, index: usize) {
        if index >= self.len() {
            panic!(
                "bitmap index {} is out of range, total bits {}",
                index, self.len,
            );
        }
    }

    pub fn test_bit(&self, index: usize) -> bool {
        self.check_index(index);
        self.bits.test_bit_in::<BigEndian>(index as _)
    }

    pub fn set_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.set_bit_in::<BigEndian>(index as _);
    }

    pub fn clear_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.clear_bit_in::<BigEndian>(index as _)
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones() as _
    }
}
