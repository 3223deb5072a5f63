use bitvec::{boxed::BitBox, order::Msb0, vec::BitVec};

/// A fixed-size bit-set over piece indices with an "all set" short-circuit.
///
/// The Complete variant stores no bits at all. Most files in a running
/// archive are fully present, so their membership checks and merges never
/// touch a bit buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiniteBitSet {
    Partial {
        bits: BitBox<u8, Msb0>,
        set_count: u32,
    },
    Complete {
        size: u32,
    },
}

impl FiniteBitSet {
    /// An all-zero set. A zero-sized domain is trivially complete.
    pub fn empty(size: u32) -> Self {
        if size == 0 {
            return FiniteBitSet::Complete { size: 0 };
        }
        FiniteBitSet::Partial {
            bits: BitVec::repeat(false, size as usize).into_boxed_bitslice(),
            set_count: 0,
        }
    }

    pub fn complete(size: u32) -> Self {
        FiniteBitSet::Complete { size }
    }

    pub fn size(&self) -> u32 {
        match self {
            FiniteBitSet::Partial { bits, .. } => bits.len() as u32,
            FiniteBitSet::Complete { size } => *size,
        }
    }

    pub fn is_set(&self, index: u32) -> bool {
        match self {
            FiniteBitSet::Partial { bits, .. } => {
                bits.get(index as usize).map(|b| *b).unwrap_or(false)
            }
            FiniteBitSet::Complete { size } => index < *size,
        }
    }

    /// Sets one bit. Returns true iff the bit was newly set.
    /// Saturation promotes Partial to Complete.
    pub fn set(&mut self, index: u32) -> bool {
        let size = self.size();
        assert!(index < size, "bit index {index} out of range 0..{size}");
        let saturated = match self {
            FiniteBitSet::Complete { .. } => return false,
            FiniteBitSet::Partial { bits, set_count } => {
                if bits[index as usize] {
                    return false;
                }
                if *set_count + 1 == size {
                    true
                } else {
                    bits.set(index as usize, true);
                    *set_count += 1;
                    false
                }
            }
        };
        if saturated {
            *self = FiniteBitSet::Complete { size };
        }
        true
    }

    pub fn set_all(&mut self) {
        *self = FiniteBitSet::Complete { size: self.size() };
    }

    /// Clears one bit. Returns true iff the bit was previously set.
    /// Clearing demotes Complete back to Partial.
    pub fn clear(&mut self, index: u32) -> bool {
        let size = self.size();
        assert!(index < size, "bit index {index} out of range 0..{size}");
        if let FiniteBitSet::Partial { bits, set_count } = self {
            if !bits[index as usize] {
                return false;
            }
            bits.set(index as usize, false);
            *set_count -= 1;
            return true;
        }
        let mut bits: BitBox<u8, Msb0> = BitVec::repeat(true, size as usize).into_boxed_bitslice();
        bits.set(index as usize, false);
        *self = FiniteBitSet::Partial {
            bits,
            set_count: size - 1,
        };
        true
    }

    pub fn next_set_bit(&self, from: u32) -> Option<u32> {
        if from >= self.size() {
            return None;
        }
        match self {
            FiniteBitSet::Complete { .. } => Some(from),
            FiniteBitSet::Partial { bits, .. } => bits[from as usize..]
                .first_one()
                .map(|offset| from + offset as u32),
        }
    }

    pub fn set_count(&self) -> u32 {
        match self {
            FiniteBitSet::Partial { set_count, .. } => *set_count,
            FiniteBitSet::Complete { size } => *size,
        }
    }

    pub fn all_set(&self) -> bool {
        matches!(self, FiniteBitSet::Complete { .. })
    }

    pub fn is_empty(&self) -> bool {
        self.set_count() == 0
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.size()).filter(move |i| self.is_set(*i))
    }

    /// Bitwise OR of two sets of the same size.
    pub fn merge(&mut self, other: &FiniteBitSet) -> anyhow::Result<()> {
        if self.size() != other.size() {
            anyhow::bail!(
                "cannot merge bit-sets of different sizes: {} != {}",
                self.size(),
                other.size()
            );
        }
        if self.all_set() {
            return Ok(());
        }
        if other.all_set() {
            self.set_all();
            return Ok(());
        }
        let mut saturated = false;
        if let (
            FiniteBitSet::Partial { bits, set_count },
            FiniteBitSet::Partial {
                bits: other_bits, ..
            },
        ) = (&mut *self, other)
        {
            for one in other_bits.iter_ones() {
                bits.set(one, true);
            }
            *set_count = bits.count_ones() as u32;
            saturated = *set_count == bits.len() as u32;
        }
        if saturated {
            self.set_all();
        }
        Ok(())
    }

    /// Raw byte view for the wire and the on-disk sidecar.
    /// Complete sets have no byte payload.
    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            FiniteBitSet::Partial { bits, .. } => bits.as_raw_slice(),
            FiniteBitSet::Complete { .. } => &[],
        }
    }

    /// Rebuilds a Partial set from raw bytes. Normalizes a saturated
    /// payload to Complete so the Partial invariant (set_count < size)
    /// always holds.
    pub fn from_raw_bytes(size: u32, bytes: &[u8]) -> anyhow::Result<Self> {
        let expected = (size as usize).div_ceil(8);
        if bytes.len() != expected {
            anyhow::bail!(
                "bit-set of size {size} needs {expected} bytes, got {}",
                bytes.len()
            );
        }
        if size == 0 {
            return Ok(FiniteBitSet::Complete { size: 0 });
        }
        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        bits.truncate(size as usize);
        let set_count = bits.count_ones() as u32;
        if set_count == size {
            return Ok(FiniteBitSet::Complete { size });
        }
        Ok(FiniteBitSet::Partial {
            bits: bits.into_boxed_bitslice(),
            set_count,
        })
    }
}
