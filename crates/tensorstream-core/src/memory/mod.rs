//! Paged scratch memory
//!
//! This module implements the engine's fixed working-set memory: one
//! contiguous slab allocated up front and partitioned into equal-sized
//! pages, so tile data never touches the heap during steady-state
//! operation.
//!
//! - **Single arena**: one allocation for all pages, acquired by id
//! - **LIFO reuse**: the most recently released page is handed out next,
//!   keeping recently touched memory warm
//! - **Exact accounting**: `free_count + in_use == num_pages` at all times
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                        PAGE POOL SLAB                         |
//! +---------------------------------------------------------------+
//! |  Page 0   |  Page 1   |  Page 2   |   ...    |  Page N-1      |
//! |  in use   |  free     |  in use   |          |  free          |
//! +---------------------------------------------------------------+
//!                    free stack: [1, ..., N-1]
//! ```

pub mod page;
pub mod pool;

pub use page::PageId;
pub use pool::PagePool;
