//! Double-buffered staging region
//!
//! Two equally sized scalar halves with a write index. The worker stages
//! fetched data into the write half; the consumer swaps on accepting a
//! ready tile, so readers always see the half not currently being written.

use crate::{Scalar, SCALAR_BYTES};

/// Two-half staging buffer with an observable swap
#[derive(Debug, Clone)]
pub struct DoubleBuffer {
    halves: [Vec<Scalar>; 2],
    write_index: usize,
}

impl DoubleBuffer {
    /// Create a buffer whose halves each hold `half_bytes` worth of scalars.
    ///
    /// Zero bytes is legal: both halves are empty but `swap` still works.
    pub fn new(half_bytes: usize) -> Self {
        let elements = half_bytes / SCALAR_BYTES;
        Self {
            halves: [vec![0.0; elements], vec![0.0; elements]],
            write_index: 0,
        }
    }

    /// Resize both halves to `half_bytes` each
    pub fn resize(&mut self, half_bytes: usize) {
        let elements = half_bytes / SCALAR_BYTES;
        self.halves[0] = vec![0.0; elements];
        self.halves[1] = vec![0.0; elements];
    }

    /// The half currently written by the worker
    #[inline]
    pub fn write_half(&mut self) -> &mut [Scalar] {
        &mut self.halves[self.write_index]
    }

    /// The stable half visible to readers
    #[inline]
    pub fn read_half(&self) -> &[Scalar] {
        &self.halves[1 - self.write_index]
    }

    /// Toggle the write index; the previous write half becomes readable
    #[inline]
    pub fn swap(&mut self) {
        self.write_index = 1 - self.write_index;
    }

    /// Element capacity of one half
    #[inline]
    pub fn half_elements(&self) -> usize {
        self.halves[0].len()
    }
}
