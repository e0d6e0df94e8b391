//! Block descriptors
//!
//! A block descriptor carries the geometry a fetch needs: the logical tile
//! shape, the chunk shape it maps onto in storage (tile rounded up to the
//! container's alignment), and the payload byte size.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Geometry of one tile and its storage chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Logical tile extent per axis
    pub tile_shape: Vec<usize>,
    /// Storage chunk extent per axis; the smallest per-axis multiple of the
    /// container alignment not less than the tile extent
    pub chunk_shape: Vec<usize>,
    /// Payload size in bytes: `Π tile_shape * element_bytes`
    pub bytes: usize,
}

impl BlockDescriptor {
    /// Build a descriptor by aligning a tile shape to the container's
    /// per-axis chunk alignment.
    ///
    /// An alignment of zero on an axis is treated as 1. Rank mismatch
    /// between shape and alignment is caller error.
    pub fn aligned(
        tile_shape: &[usize],
        chunk_alignment: &[usize],
        element_bytes: usize,
    ) -> Result<Self> {
        if tile_shape.len() != chunk_alignment.len() {
            return Err(CoreError::InvalidArgument(format!(
                "tile rank {} does not match alignment rank {}",
                tile_shape.len(),
                chunk_alignment.len()
            )));
        }

        let mut chunk_shape = Vec::with_capacity(tile_shape.len());
        let mut elements = 1usize;
        for (&tile, &align) in tile_shape.iter().zip(chunk_alignment) {
            let align = align.max(1);
            chunk_shape.push(tile.div_ceil(align) * align);
            elements *= tile;
        }

        Ok(Self {
            tile_shape: tile_shape.to_vec(),
            chunk_shape,
            bytes: elements * element_bytes,
        })
    }

    /// Number of elements in the tile payload
    #[inline]
    pub fn tile_elements(&self) -> usize {
        self.tile_shape.iter().product()
    }
}

/// Caller-registered metadata for a named block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Virtual all-zero block: prefetch is short-circuited, no I/O happens
    pub is_zero: bool,
    /// Path of the block's dataset inside the external container
    pub dataset_path: String,
    /// Tile/chunk geometry
    pub descriptor: BlockDescriptor,
}
