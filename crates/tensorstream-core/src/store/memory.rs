//! In-memory chunked store
//!
//! Allocation-on-write container with the same observable contract as an
//! on-disk chunked dataset: chunk-aligned hyperslab access, zero fill value
//! for unwritten chunks, and edge chunks clipped to the global extent.
//! Serves tests and embedders that have no external container.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{CoreError, Result};
use crate::Scalar;

use super::ChunkStore;

/// Chunked in-memory container for a single dataset
pub struct MemoryChunkStore {
    global_dims: Vec<usize>,
    chunk_dims: Vec<usize>,
    /// Allocated chunks keyed by physical offset
    chunks: RwLock<HashMap<Vec<usize>, Vec<Scalar>>>,
}

impl MemoryChunkStore {
    /// Create a store covering `global_dims` with `chunk_dims`-sized chunks
    pub fn new(global_dims: &[usize], chunk_dims: &[usize]) -> Result<Self> {
        if global_dims.is_empty() || global_dims.len() != chunk_dims.len() {
            return Err(CoreError::InvalidConfig(
                "global and chunk dimensions must share a non-zero rank".to_string(),
            ));
        }
        if global_dims.iter().any(|&g| g == 0) || chunk_dims.iter().any(|&c| c == 0) {
            return Err(CoreError::InvalidConfig(
                "dimensions must be non-zero".to_string(),
            ));
        }
        if chunk_dims.iter().zip(global_dims).any(|(&c, &g)| c > g) {
            return Err(CoreError::InvalidConfig(
                "chunk extent exceeds global extent".to_string(),
            ));
        }

        Ok(Self {
            global_dims: global_dims.to_vec(),
            chunk_dims: chunk_dims.to_vec(),
            chunks: RwLock::new(HashMap::new()),
        })
    }

    /// Element count of the chunk at `phys_offset`, clipped to the global
    /// extent on edge chunks
    pub fn chunk_elements(&self, phys_offset: &[usize]) -> Result<usize> {
        self.validate_offset(phys_offset)?;
        Ok(phys_offset
            .iter()
            .zip(self.chunk_dims.iter().zip(&self.global_dims))
            .map(|(&off, (&chunk, &global))| chunk.min(global - off))
            .product())
    }

    /// Number of allocated chunks
    pub fn allocated_count(&self) -> usize {
        self.chunks.read().len()
    }

    fn validate_offset(&self, phys_offset: &[usize]) -> Result<()> {
        if phys_offset.len() != self.global_dims.len() {
            return Err(CoreError::InvalidArgument(format!(
                "offset rank {} does not match dataset rank {}",
                phys_offset.len(),
                self.global_dims.len()
            )));
        }
        for (d, (&off, (&chunk, &global))) in phys_offset
            .iter()
            .zip(self.chunk_dims.iter().zip(&self.global_dims))
            .enumerate()
        {
            if off % chunk != 0 {
                return Err(CoreError::InvalidArgument(format!(
                    "offset {} on axis {} is not chunk-aligned (chunk {})",
                    off, d, chunk
                )));
            }
            if off >= global {
                return Err(CoreError::InvalidArgument(format!(
                    "offset {} on axis {} outside global extent {}",
                    off, d, global
                )));
            }
        }
        Ok(())
    }
}

impl ChunkStore for MemoryChunkStore {
    fn allocated_chunks(&self) -> Result<Vec<Vec<usize>>> {
        let mut offsets: Vec<Vec<usize>> = self.chunks.read().keys().cloned().collect();
        offsets.sort();
        Ok(offsets)
    }

    fn read_chunk(&self, phys_offset: &[usize], out: &mut [Scalar]) -> Result<()> {
        let elements = self.chunk_elements(phys_offset)?;
        if out.len() != elements {
            return Err(CoreError::InvalidArgument(format!(
                "read buffer holds {} elements, chunk has {}",
                out.len(),
                elements
            )));
        }

        match self.chunks.read().get(phys_offset) {
            Some(data) => out.copy_from_slice(data),
            None => out.fill(0.0),
        }
        Ok(())
    }

    fn write_chunk(&self, phys_offset: &[usize], data: &[Scalar]) -> Result<()> {
        let elements = self.chunk_elements(phys_offset)?;
        if data.len() != elements {
            return Err(CoreError::InvalidArgument(format!(
                "write buffer holds {} elements, chunk has {}",
                data.len(),
                elements
            )));
        }

        self.chunks
            .write()
            .insert(phys_offset.to_vec(), data.to_vec());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChunkStore")
            .field("global_dims", &self.global_dims)
            .field("chunk_dims", &self.chunk_dims)
            .field("allocated", &self.allocated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_chunk_reads_zero() {
        let store = MemoryChunkStore::new(&[8, 8], &[4, 4]).unwrap();
        let mut out = vec![1.0; 16];
        store.read_chunk(&[4, 4], &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(store.allocated_count(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let store = MemoryChunkStore::new(&[8, 8], &[4, 4]).unwrap();
        let data: Vec<Scalar> = (0..16).map(|i| i as Scalar).collect();
        store.write_chunk(&[0, 4], &data).unwrap();

        let mut out = vec![0.0; 16];
        store.read_chunk(&[0, 4], &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(store.allocated_count(), 1);
    }

    #[test]
    fn test_allocated_chunks_sorted() {
        let store = MemoryChunkStore::new(&[8, 8], &[4, 4]).unwrap();
        store.write_chunk(&[4, 4], &vec![0.0; 16]).unwrap();
        store.write_chunk(&[0, 0], &vec![0.0; 16]).unwrap();
        assert_eq!(
            store.allocated_chunks().unwrap(),
            vec![vec![0, 0], vec![4, 4]]
        );
    }

    #[test]
    fn test_edge_chunk_clipping() {
        // 10 = 2 * 4 + 2: the last chunk on each axis is 2 wide
        let store = MemoryChunkStore::new(&[10, 10], &[4, 4]).unwrap();
        assert_eq!(store.chunk_elements(&[0, 0]).unwrap(), 16);
        assert_eq!(store.chunk_elements(&[8, 0]).unwrap(), 8);
        assert_eq!(store.chunk_elements(&[8, 8]).unwrap(), 4);

        store.write_chunk(&[8, 8], &vec![7.0; 4]).unwrap();
        let mut out = vec![0.0; 4];
        store.read_chunk(&[8, 8], &mut out).unwrap();
        assert_eq!(out, vec![7.0; 4]);
    }

    #[test]
    fn test_offset_validation() {
        let store = MemoryChunkStore::new(&[8, 8], &[4, 4]).unwrap();
        assert!(store.write_chunk(&[3, 0], &vec![0.0; 16]).is_err()); // misaligned
        assert!(store.write_chunk(&[8, 0], &vec![0.0; 16]).is_err()); // out of range
        assert!(store.write_chunk(&[0], &vec![0.0; 16]).is_err()); // rank
        assert!(store.write_chunk(&[0, 0], &vec![0.0; 15]).is_err()); // size
    }
}
