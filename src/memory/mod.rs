//! Guest memory-region registry and address translation.
//!
//! The control layer never treats a guest pointer value as directly usable.
//! Every guest virtual address crosses an explicit translation step through the
//! [`MemoryMap`] before any host access happens, so the rest of the core only
//! ever operates on validated host addresses.
//!
//! The registry itself is append-only: regions are registered once, duplicates
//! are rejected rather than merged, overlapping registrations fail without
//! modifying the table, and no remapping or resizing operation is defined.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Error, Result};

/// A registered guest-virtual to host-physical mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Guest virtual base address.
    pub virtual_base: u64,
    /// Host address backing the region.
    pub physical_base: u64,
    /// Region size in bytes; always greater than zero.
    pub size: u64,
}

impl MemoryRegion {
    /// One past the last guest virtual address covered by this region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.virtual_base.saturating_add(self.size)
    }

    /// Whether `address` falls inside this region.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.virtual_base && address < self.end()
    }
}

/// Ordered, non-overlapping registry of guest memory regions.
///
/// Mutations are serialized through an internal lock; lookups take a shared
/// lock and are safe to call concurrently with running execution threads.
///
/// # Invariants
///
/// - No two regions overlap in virtual-address space
/// - At most one region per distinct virtual base
/// - Every region has a non-zero size
///
/// # Examples
///
/// ```rust
/// use guestcore::MemoryMap;
///
/// let map = MemoryMap::new();
/// map.map(0x1000, 0x7f00_0000_0000, 0x2000)?;
///
/// let host = map.translate(0x1800)?;
/// assert_eq!(host, 0x7f00_0000_0800);
/// # Ok::<(), guestcore::Error>(())
/// ```
#[derive(Default)]
pub struct MemoryMap {
    regions: RwLock<BTreeMap<u64, MemoryRegion>>,
}

impl MemoryMap {
    /// Creates an empty region table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a guest-virtual to host-physical mapping.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyRegion`] if `size` is zero
    /// - [`Error::DuplicateRegion`] if a region is already registered at
    ///   `virtual_base`
    /// - [`Error::RegionOverlap`] if the new region would overlap a neighbor
    ///
    /// On any failure the table is left unchanged.
    pub fn map(&self, virtual_base: u64, physical_base: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::EmptyRegion { virtual_base });
        }

        let region = MemoryRegion {
            virtual_base,
            physical_base,
            size,
        };

        let mut regions = self.regions.write().map_err(|_| Error::LockError)?;

        if regions.contains_key(&virtual_base) {
            return Err(Error::DuplicateRegion { virtual_base });
        }

        if let Some((_, below)) = regions.range(..virtual_base).next_back() {
            if below.end() > virtual_base {
                return Err(Error::RegionOverlap { virtual_base });
            }
        }
        if let Some((&above_base, _)) = regions.range(virtual_base..).next() {
            if above_base < region.end() {
                return Err(Error::RegionOverlap { virtual_base });
            }
        }

        regions.insert(virtual_base, region);
        Ok(())
    }

    /// Translates a guest virtual address to its backing host address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedAddress`] if no registered region covers
    /// `address`.
    pub fn translate(&self, address: u64) -> Result<u64> {
        self.translate_range(address, 1)
    }

    /// Translates a guest virtual range to its backing host address.
    ///
    /// The entire `len`-byte range must fall within a single registered
    /// region; host accesses derived from the returned address must not cross
    /// region boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedAddress`] if the range is not fully covered by
    /// one region.
    pub fn translate_range(&self, address: u64, len: u64) -> Result<u64> {
        let regions = self.regions.read().map_err(|_| Error::LockError)?;

        let (_, region) = regions
            .range(..=address)
            .next_back()
            .ok_or(Error::UnmappedAddress { address })?;

        let end = address
            .checked_add(len)
            .ok_or(Error::UnmappedAddress { address })?;
        if !region.contains(address) || end > region.end() {
            return Err(Error::UnmappedAddress { address });
        }

        Ok(region.physical_base + (address - region.virtual_base))
    }

    /// Number of registered regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns a snapshot of all registered regions in virtual-address order.
    #[must_use]
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.regions
            .read()
            .map(|r| r.values().copied().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMap")
            .field("region_count", &self.region_count())
            .finish()
    }
}
