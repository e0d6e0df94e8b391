//! # Tensorstream Core
//!
//! Out-of-core tensor tile engine. Lets a compute loop operate on tensors
//! whose footprint exceeds main memory by streaming fixed-size rectangular
//! tiles between a chunked storage container and a bounded in-memory
//! working set.
//!
//! ## Components
//!
//! - **[`memory::PagePool`]**: preallocated contiguous slab partitioned into
//!   equal-sized pages, handed out by integer id with LIFO reuse
//! - **[`registry::TileRegistry`]**: dense rank-N grid of per-tile metadata
//!   with coord/offset/index arithmetic and residency tracking
//! - **[`cache::TileCache`]**: byte-budgeted LRU cache of materialized tiles
//! - **[`prefetch::PrefetchPipeline`]**: single background worker overlapping
//!   storage reads with consumption through a double-buffered staging region
//! - **[`engine::Engine`]**: facade composing the four subsystems
//!
//! Storage itself is an external collaborator reached through the narrow
//! [`store::ChunkStore`] trait; the core never opens or closes files.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod cache;
pub mod engine;
pub mod error;
pub mod memory;
pub mod prefetch;
pub mod registry;
pub mod store;

// Re-exports
pub use block::{BlockDescriptor, BlockMetadata};
pub use cache::{CacheStats, TileCache};
pub use engine::{Engine, EngineConfig, EngineStats};
pub use error::{CoreError, Result};
pub use memory::{PageId, PagePool};
pub use prefetch::{DoubleBuffer, FetchFn, PrefetchPipeline, PrefetchRequest, ReadyTile, WaitOutcome};
pub use registry::{chunk_dims_for_target, ScanReport, TileMetadata, TileRegistry, TileStatus};
pub use store::{ChunkStore, MemoryChunkStore};

/// Element type of every tile payload, pool page, and stored chunk.
pub type Scalar = f64;

/// Size in bytes of one [`Scalar`] element.
pub const SCALAR_BYTES: usize = std::mem::size_of::<Scalar>();
