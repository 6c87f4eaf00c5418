//! # Coded Block
//!
//! One generation's worth of coding state: `N` data rows plus one scratch row,
//! each laid out as
//!
//! ```text
//! +--------------------------+-------------+---------------------------+
//! | coefficients (N packed)  | len (u16 LE)| payload (max_payload)     |
//! +--------------------------+-------------+---------------------------+
//! ```
//!
//! Source packets are inserted at their pivot with a unit coefficient. Coded
//! packets are either the next systematic row or a random linear combination
//! of every occupied row. Decoding keeps the stored rows in reduced row-echelon
//! form (Gauss-Jordan), so a row is readable as soon as its coefficient vector
//! is the unit vector for its pivot.
//!
//! Rows live in one flat buffer and are addressed through a slot table, so
//! moving the scratch row into place is an index swap.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::BlockError;
use crate::field::Field;

/// Largest supported block capacity.
pub const MAX_CAPACITY: usize = 256;

/// Bytes of the in-row payload length prefix.
pub const LENGTH_PREFIX: usize = 2;

/// Coefficient/payload matrix for one generation.
#[derive(Debug)]
pub struct CodedBlock {
    field: Field,
    capacity: usize,
    coefficient_len: usize,
    max_payload: usize,
    row_len: usize,

    buffer: Vec<u8>,
    /// Logical row to physical slot. Index `capacity` is the scratch row.
    slots: Vec<usize>,
    /// Pivot columns in elimination order.
    pivots: Vec<usize>,

    encode_rank: usize,
    decode_rank: usize,
    /// Longest coded row seen so far.
    coded_len: usize,

    sent: usize,
    encode_start: Option<usize>,

    rng: StdRng,
}

impl CodedBlock {
    /// Allocate a block for `capacity` packets of at most `max_payload` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::InvalidCapacity`] unless `capacity` is even and
    /// within `2..=256`, and [`BlockError::InvalidPayloadLimit`] if
    /// `max_payload` does not fit the 16-bit length prefix.
    pub fn new(field: Field, capacity: usize, max_payload: usize) -> Result<Self, BlockError> {
        Self::with_rng(field, capacity, max_payload, StdRng::from_entropy())
    }

    /// Like [`CodedBlock::new`] with a deterministic coefficient generator.
    pub fn with_seed(
        field: Field,
        capacity: usize,
        max_payload: usize,
        seed: u64,
    ) -> Result<Self, BlockError> {
        Self::with_rng(field, capacity, max_payload, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        field: Field,
        capacity: usize,
        max_payload: usize,
        rng: StdRng,
    ) -> Result<Self, BlockError> {
        if capacity < 2 || capacity % 2 != 0 || capacity > MAX_CAPACITY {
            return Err(BlockError::InvalidCapacity(capacity));
        }
        if max_payload == 0 || max_payload > u16::MAX as usize {
            return Err(BlockError::InvalidPayloadLimit(max_payload));
        }

        let coefficient_len = field.coefficient_bytes(capacity);
        let row_len = coefficient_len + LENGTH_PREFIX + max_payload;

        Ok(Self {
            field,
            capacity,
            coefficient_len,
            max_payload,
            row_len,
            buffer: vec![0u8; row_len * (capacity + 1)],
            slots: (0..=capacity).collect(),
            pivots: Vec::with_capacity(capacity),
            encode_rank: 0,
            decode_rank: 0,
            coded_len: 0,
            sent: 0,
            encode_start: None,
            rng,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn field(&self) -> Field {
        self.field
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Full row size, the upper bound for any coded frame.
    #[inline]
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    #[inline]
    pub fn coefficient_len(&self) -> usize {
        self.coefficient_len
    }

    #[inline]
    pub fn encode_rank(&self) -> usize {
        self.encode_rank
    }

    #[inline]
    pub fn decode_rank(&self) -> usize {
        self.decode_rank
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.encode_rank + self.decode_rank
    }

    /// Length of the coded frames this block currently produces.
    #[inline]
    pub fn coded_len(&self) -> usize {
        self.coded_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coded_len == 0
    }

    // =========================================================================
    // Row storage
    // =========================================================================

    fn row(&self, logical: usize) -> &[u8] {
        let start = self.slots[logical] * self.row_len;
        &self.buffer[start..start + self.row_len]
    }

    fn row_mut(&mut self, logical: usize) -> &mut [u8] {
        let start = self.slots[logical] * self.row_len;
        &mut self.buffer[start..start + self.row_len]
    }

    /// Borrow logical row `dst` mutably and `src` shared at the same time.
    fn pair_mut(&mut self, dst: usize, src: usize) -> (&mut [u8], &[u8]) {
        let len = self.row_len;
        let (d, s) = (self.slots[dst], self.slots[src]);
        debug_assert_ne!(d, s);

        if d < s {
            let (lo, hi) = self.buffer.split_at_mut(s * len);
            (&mut lo[d * len..(d + 1) * len], &hi[..len])
        } else {
            let (lo, hi) = self.buffer.split_at_mut(d * len);
            (&mut hi[..len], &lo[s * len..(s + 1) * len])
        }
    }

    /// `row(dst) += row(src) * c` over the first `coded_len` bytes.
    fn muladd(&mut self, dst: usize, src: usize, c: u8) {
        let field = self.field;
        let n = self.coded_len;
        let (d, s) = self.pair_mut(dst, src);
        field.muladd_row(&mut d[..n], &s[..n], c);
    }

    fn pivot_position(&self, logical: usize) -> Option<usize> {
        let row = self.row(logical);
        (0..self.capacity).find(|&col| self.field.coefficient(row, col) != 0)
    }

    // =========================================================================
    // Coding operations
    // =========================================================================

    /// Insert a source packet at `pivot`.
    ///
    /// # Errors
    ///
    /// Fails when the payload exceeds the packet limit, the block is at full
    /// rank, or the pivot is out of range or already occupied.
    pub fn insert(&mut self, pivot: usize, payload: &[u8]) -> Result<(), BlockError> {
        if payload.len() > self.max_payload {
            return Err(BlockError::FrameTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        if self.rank() == self.capacity {
            return Err(BlockError::RankExceeded);
        }
        if pivot >= self.capacity {
            return Err(BlockError::PivotOutOfRange {
                pivot,
                capacity: self.capacity,
            });
        }
        if self.pivots.contains(&pivot) {
            return Err(BlockError::PivotExists(pivot));
        }

        let field = self.field;
        let offset = self.coefficient_len;
        let row = self.row_mut(pivot);
        row.fill(0);
        field.set_coefficient(row, pivot, 1);
        row[offset..offset + LENGTH_PREFIX].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        row[offset + LENGTH_PREFIX..offset + LENGTH_PREFIX + payload.len()].copy_from_slice(payload);

        self.pivots.push(pivot);
        self.coded_len = self
            .coded_len
            .max(offset + LENGTH_PREFIX + payload.len());
        self.encode_rank += 1;
        self.encode_start.get_or_insert(pivot);

        Ok(())
    }

    /// Produce one coded frame into `out`, returning its length.
    ///
    /// With `structured` set, source rows not yet sent go out unscaled and in
    /// insertion order first. Otherwise every occupied row is mixed in with a
    /// uniformly drawn coefficient.
    ///
    /// # Errors
    ///
    /// [`BlockError::Empty`] if nothing was inserted or decoded yet,
    /// [`BlockError::BufferTooSmall`] if `out` is shorter than
    /// [`coded_len`](Self::coded_len).
    pub fn encode(&mut self, out: &mut [u8], structured: bool) -> Result<usize, BlockError> {
        let n = self.coded_len;
        if n == 0 {
            return Err(BlockError::Empty);
        }
        if out.len() < n {
            return Err(BlockError::BufferTooSmall {
                have: out.len(),
                need: n,
            });
        }

        let out = &mut out[..n];
        match self.encode_start {
            Some(start) if structured && self.sent < self.encode_rank => {
                let pivot = start + self.sent;
                out.copy_from_slice(&self.row(pivot)[..n]);
                self.sent += 1;
            }
            _ => {
                out.fill(0);
                let mask = self.field.mask();
                for i in 0..self.pivots.len() {
                    let c = self.rng.gen::<u8>() & mask;
                    let start = self.slots[self.pivots[i]] * self.row_len;
                    self.field
                        .muladd_row(out, &self.buffer[start..start + n], c);
                }
            }
        }

        Ok(n)
    }

    /// Absorb a coded frame. Returns `true` if it raised the decode rank.
    ///
    /// Linearly dependent frames and frames arriving at full rank are
    /// accepted without effect.
    ///
    /// # Errors
    ///
    /// [`BlockError::FrameTooLarge`] if the frame is longer than a row.
    pub fn decode(&mut self, frame: &[u8]) -> Result<bool, BlockError> {
        if frame.len() > self.row_len {
            return Err(BlockError::FrameTooLarge {
                len: frame.len(),
                max: self.row_len,
            });
        }
        if self.rank() == self.capacity {
            return Ok(false);
        }

        let scratch = self.capacity;
        {
            let row = self.row_mut(scratch);
            row.fill(0);
            row[..frame.len()].copy_from_slice(frame);
        }
        self.coded_len = self.coded_len.max(frame.len());

        // Forward elimination against every stored pivot.
        for i in 0..self.pivots.len() {
            let pivot = self.pivots[i];
            let c = self.field.coefficient(self.row(scratch), pivot);
            if c != 0 {
                self.muladd(scratch, pivot, c);
            }
        }

        let Some(column) = self.pivot_position(scratch) else {
            return Ok(false);
        };

        let c = self.field.coefficient(self.row(scratch), column);
        let inv = self.field.inv(c);
        let n = self.coded_len;
        let field = self.field;
        field.scale_row(&mut self.row_mut(scratch)[..n], inv);

        // Back substitution keeps the stored rows reduced.
        for i in 0..self.pivots.len() {
            let pivot = self.pivots[i];
            let c = self.field.coefficient(self.row(pivot), column);
            if c != 0 {
                self.muladd(pivot, scratch, c);
            }
        }

        self.pivots.push(column);
        self.decode_rank += 1;
        self.slots.swap(column, scratch);

        Ok(true)
    }

    /// Whether row `pivot` holds exactly the unit vector for its column.
    pub fn is_resolved(&self, pivot: usize) -> bool {
        if pivot >= self.capacity {
            return false;
        }
        let row = self.row(pivot);
        (0..self.capacity).all(|col| {
            let c = self.field.coefficient(row, col);
            if col == pivot {
                c != 0
            } else {
                c == 0
            }
        })
    }

    /// Payload of row `pivot`, if it is resolved.
    pub fn get(&self, pivot: usize) -> Option<&[u8]> {
        if !self.is_resolved(pivot) {
            return None;
        }
        let row = self.row(pivot);
        let offset = self.coefficient_len;
        let len = u16::from_le_bytes([row[offset], row[offset + 1]]) as usize;
        let len = len.min(self.max_payload);
        Some(&row[offset + LENGTH_PREFIX..offset + LENGTH_PREFIX + len])
    }

    /// Zero all rows and counters, keeping the allocation.
    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.pivots.clear();
        self.encode_rank = 0;
        self.decode_rank = 0;
        self.coded_len = 0;
        self.sent = 0;
        self.encode_start = None;
    }
}
