//! Per-tile metadata
//!
//! Each tile slot carries immutable grid coordinates and physical offsets
//! plus atomic state words, so readers can hold `&TileMetadata` borrows
//! without a registry-wide lock. Callers serialize their own transitions on
//! any one tile.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::memory::PageId;

/// Sentinel stored in the page-id word whenever a tile is not resident
pub const PAGE_ID_SENTINEL: u32 = u32::MAX;

/// Residency status of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TileStatus {
    /// Does not exist anywhere; reads see the fill value
    Absent = 0,
    /// Data exists in the chunked store
    OnDisk = 1,
    /// Currently materialized in a pool page
    Resident = 2,
}

impl TileStatus {
    /// Convert from raw u8 value
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TileStatus::Absent),
            1 => Some(TileStatus::OnDisk),
            2 => Some(TileStatus::Resident),
            _ => None,
        }
    }
}

impl From<TileStatus> for u8 {
    fn from(status: TileStatus) -> Self {
        status as u8
    }
}

impl std::fmt::Display for TileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileStatus::Absent => write!(f, "Absent"),
            TileStatus::OnDisk => write!(f, "OnDisk"),
            TileStatus::Resident => write!(f, "Resident"),
        }
    }
}

/// Metadata for a single tile in the grid
///
/// The slot lives for the registry's lifetime; only the status, page id,
/// and zero flag mutate.
pub struct TileMetadata {
    /// Logical grid coordinates, one per axis
    coords: Vec<usize>,
    /// Physical element offset per axis (`coords[d] * chunk_dims[d]`)
    phys_offset: Vec<usize>,
    /// Residency status word
    status: AtomicU8,
    /// Pool page backing this tile; `PAGE_ID_SENTINEL` unless resident
    page_id: AtomicU32,
    /// Virtual-zero tile: reads are all zeros and prefetch is skipped
    is_zero: AtomicBool,
    /// Set once the store has reported this tile allocated; unbinding a
    /// disk-backed tile returns it to `OnDisk` rather than `Absent`
    disk_backed: AtomicBool,
}

impl TileMetadata {
    /// Create a fresh slot in the `Absent` state
    pub(crate) fn new(coords: Vec<usize>, phys_offset: Vec<usize>) -> Self {
        Self {
            coords,
            phys_offset,
            status: AtomicU8::new(TileStatus::Absent as u8),
            page_id: AtomicU32::new(PAGE_ID_SENTINEL),
            is_zero: AtomicBool::new(false),
            disk_backed: AtomicBool::new(false),
        }
    }

    /// Logical grid coordinates
    #[inline]
    pub fn coords(&self) -> &[usize] {
        &self.coords
    }

    /// Physical element offset per axis
    #[inline]
    pub fn phys_offset(&self) -> &[usize] {
        &self.phys_offset
    }

    /// Current residency status
    #[inline]
    pub fn status(&self) -> TileStatus {
        TileStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(TileStatus::Absent)
    }

    /// Backing pool page, if the tile is resident
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        match self.page_id.load(Ordering::Acquire) {
            PAGE_ID_SENTINEL => None,
            raw => Some(PageId::new(raw)),
        }
    }

    /// Whether this tile is a virtual all-zero tile
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.is_zero.load(Ordering::Acquire)
    }

    /// Mark or clear the virtual-zero flag
    #[inline]
    pub fn set_zero(&self, zero: bool) {
        self.is_zero.store(zero, Ordering::Release);
    }

    /// Whether the store has reported this tile allocated
    #[inline]
    pub fn is_disk_backed(&self) -> bool {
        self.disk_backed.load(Ordering::Acquire)
    }

    /// Record that the store holds data for this tile
    pub(crate) fn mark_on_disk(&self) {
        self.disk_backed.store(true, Ordering::Release);
        // A resident tile stays resident; the disk flag alone remembers
        // the backing for the eventual unbind.
        if self.status() != TileStatus::Resident {
            self.status.store(TileStatus::OnDisk as u8, Ordering::Release);
        }
    }

    /// Transition into `Resident`, recording the backing page
    pub(crate) fn bind(&self, page: PageId) {
        self.page_id.store(page.raw(), Ordering::Release);
        self.status
            .store(TileStatus::Resident as u8, Ordering::Release);
    }

    /// Transition out of `Resident`, restoring the sentinel and the
    /// disk-backed or absent status
    pub(crate) fn unbind(&self) {
        self.page_id.store(PAGE_ID_SENTINEL, Ordering::Release);
        let next = if self.is_disk_backed() {
            TileStatus::OnDisk
        } else {
            TileStatus::Absent
        };
        self.status.store(next as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for TileMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileMetadata")
            .field("coords", &self.coords)
            .field("phys_offset", &self.phys_offset)
            .field("status", &self.status())
            .field("page_id", &self.page_id())
            .field("is_zero", &self.is_zero())
            .finish()
    }
}
