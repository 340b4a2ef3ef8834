// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-width allocation bitmap.
//!
//! One bit per address in a block.  Serializes sparsely as the ordered list
//! of set offsets, which keeps snapshots readable and small for the common
//! mostly-empty case.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as _;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bitmap {
    nbits: u32,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(nbits: u32) -> Bitmap {
        let nwords = (nbits as usize + 63) / 64;
        Bitmap { nbits, words: vec![0; nwords] }
    }

    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    pub fn get(&self, bit: u32) -> bool {
        assert!(bit < self.nbits, "bit {} out of range", bit);
        self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }

    /// Sets a bit, returning its previous value.
    pub fn set(&mut self, bit: u32) -> bool {
        assert!(bit < self.nbits, "bit {} out of range", bit);
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1u64 << (bit % 64);
        let prev = *word & mask != 0;
        *word |= mask;
        prev
    }

    /// Clears a bit, returning its previous value.
    pub fn clear(&mut self, bit: u32) -> bool {
        assert!(bit < self.nbits, "bit {} out of range", bit);
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1u64 << (bit % 64);
        let prev = *word & mask != 0;
        *word &= !mask;
        prev
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterates the set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.nbits).filter(|bit| self.get(*bit))
    }
}

// The sparse wire form.  Offsets are validated on the way in so a corrupt
// snapshot fails at parse time rather than panicking later.
#[derive(Deserialize, Serialize)]
struct SparseBits {
    bits: u32,
    set: Vec<u32>,
}

impl Serialize for Bitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SparseBits { bits: self.nbits, set: self.iter_set().collect() }
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bitmap {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Bitmap, D::Error> {
        let sparse = SparseBits::deserialize(deserializer)?;
        let mut bitmap = Bitmap::new(sparse.bits);
        for bit in sparse.set {
            if bit >= sparse.bits {
                return Err(D::Error::custom(format!(
                    "bit {} out of range for a {}-bit bitmap",
                    bit, sparse.bits
                )));
            }
            bitmap.set(bit);
        }
        Ok(bitmap)
    }
}
