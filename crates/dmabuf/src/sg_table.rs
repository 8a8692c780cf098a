//! Scatter/gather tables describing a buffer to a device.
//!
//! A table holds one entry per buffer page, in page order, each spanning a
//! whole page at offset zero. Physically adjacent pages are never coalesced,
//! so the entry count always equals the page count of the buffer.
//!
//! Device mapping is all-or-nothing: [`SgTable::map`] either assigns a
//! device address to every entry or leaves the table exactly as unmapped as
//! it found it.

use alloc::{borrow::ToOwned as _, vec::Vec};

use snafu::ResultExt as _;

use crate::{
    device::{DmaAddr, DmaDevice, DmaDirection},
    error::{AllocTableSnafu, DmaBufError, DmaMapSnafu},
    mm::{PAGE_SIZE, Page, PhysPageNum},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgEntry {
    page: PhysPageNum,
    offset: usize,
    length: usize,
    dma_address: Option<DmaAddr>,
}

impl SgEntry {
    #[must_use]
    pub fn page(&self) -> PhysPageNum {
        self.page
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the device address, if the table is mapped.
    #[must_use]
    pub fn dma_address(&self) -> Option<DmaAddr> {
        self.dma_address
    }
}

#[derive(Debug)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    /// Builds an unmapped table with one full-page entry per page.
    pub fn from_pages(pages: &[Page]) -> Result<Self, DmaBufError> {
        let nents = pages.len();
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(nents)
            .context(AllocTableSnafu { nents })?;

        entries.extend(pages.iter().map(|page| SgEntry {
            page: page.pfn(),
            offset: 0,
            length: PAGE_SIZE,
            dma_address: None,
        }));

        Ok(Self { entries })
    }

    #[must_use]
    pub fn nents(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.entries
            .first()
            .is_some_and(|entry| entry.dma_address.is_some())
    }

    /// Maps every entry for `device`.
    ///
    /// On failure at entry `k`, entries `0..k` are unmapped again in reverse
    /// order before the error is returned.
    ///
    /// # Panics
    ///
    /// Panics if the table is already mapped.
    pub fn map(&mut self, device: &dyn DmaDevice, dir: DmaDirection) -> Result<(), DmaBufError> {
        assert!(!self.is_mapped(), "scatter/gather table mapped twice");

        for index in 0..self.entries.len() {
            let entry = &self.entries[index];
            match device.map_page(entry.page, entry.offset, entry.length, dir) {
                Ok(addr) => self.entries[index].dma_address = Some(addr),
                Err(source) => {
                    warn!(
                        "dma mapping of entry {index}/{} for `{}` failed: {source}",
                        self.entries.len(),
                        device.name(),
                    );
                    self.unmap_prefix(device, index, dir);
                    return Err(source).context(DmaMapSnafu {
                        device: device.name().to_owned(),
                        index,
                    });
                }
            }
        }

        for entry in &self.entries {
            trace!(
                "offset {:#x} length {:#x} dma addr {:#x}",
                entry.offset,
                entry.length,
                entry.dma_address.map_or(0, DmaAddr::value),
            );
        }

        Ok(())
    }

    /// Reverses the device mapping of every entry.
    pub fn unmap(&mut self, device: &dyn DmaDevice, dir: DmaDirection) {
        self.unmap_prefix(device, self.entries.len(), dir);
    }

    fn unmap_prefix(&mut self, device: &dyn DmaDevice, count: usize, dir: DmaDirection) {
        for entry in self.entries[..count].iter_mut().rev() {
            if let Some(addr) = entry.dma_address.take() {
                device.unmap_page(addr, entry.length, dir);
            }
        }
    }

    pub fn sync_for_cpu(&self, device: &dyn DmaDevice, dir: DmaDirection) {
        for (addr, len) in self.mapped_spans() {
            device.sync_for_cpu(addr, len, dir);
        }
    }

    pub fn sync_for_device(&self, device: &dyn DmaDevice, dir: DmaDirection) {
        for (addr, len) in self.mapped_spans() {
            device.sync_for_device(addr, len, dir);
        }
    }

    fn mapped_spans(&self) -> impl Iterator<Item = (DmaAddr, usize)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.dma_address.map(|addr| (addr, entry.length)))
    }
}
