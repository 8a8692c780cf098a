//! Projection of buffer pages into a process address space.

use bitflags::bitflags;
use snafu::{ResultExt as _, Snafu};

use crate::{
    error::{DmaBufError, ErrorKind, RemapSnafu},
    mm::{PAGE_SIZE, Page, PhysPageNum},
};

bitflags! {
    /// Access flags of a virtual memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// The process can read the region.
        const READ = 1 << 0;

        /// The process can write the region.
        const WRITE = 1 << 1;

        /// Writes are visible to every other mapping of the same pages.
        const SHARED = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const SHARED_RW = Self::RW.bits() | Self::SHARED.bits();
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum RemapError {
    #[snafu(display("address {vaddr:#x} is outside the region"))]
    OutOfRange { vaddr: usize },
    #[snafu(display("address {vaddr:#x} is already mapped"))]
    AlreadyMapped { vaddr: usize },
    #[snafu(display("out of page table memory while mapping {vaddr:#x}"))]
    NoPageTableMemory { vaddr: usize },
}

impl RemapError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoPageTableMemory { .. } => ErrorKind::OutOfMemory,
            Self::OutOfRange { .. } | Self::AlreadyMapped { .. } => ErrorKind::Io,
        }
    }
}

/// A virtual memory region of a process, about to be backed by buffer pages.
pub trait VmArea {
    /// Returns the first virtual address of the region.
    fn start(&self) -> usize;

    /// Returns the length of the region in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flags(&self) -> VmFlags;

    /// Maps the frames starting at `pfn` at `vaddr..vaddr + size`.
    fn remap_pfn_range(
        &mut self,
        vaddr: usize,
        pfn: PhysPageNum,
        size: usize,
        flags: VmFlags,
    ) -> Result<(), RemapError>;

    /// Removes every mapping in `vaddr..vaddr + size`.
    fn zap_range(&mut self, vaddr: usize, size: usize);
}

/// A mapped region whose bytes the CPU can address directly.
pub trait VmAccess: VmArea {
    /// Copies region bytes starting `offset` bytes in into `buf`.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]);

    /// Copies `data` into the region starting `offset` bytes in.
    fn write_bytes(&self, offset: usize, data: &[u8]);
}

/// Maps `pages[i]` at `vma.start() + i * PAGE_SIZE`, in order.
///
/// If any page fails to map, the pages mapped so far are removed again
/// before the error is returned, so the region is never left half populated.
pub fn remap_pages(vma: &mut dyn VmArea, pages: &[Page]) -> Result<(), DmaBufError> {
    let start = vma.start();
    let flags = vma.flags();

    for (index, page) in pages.iter().enumerate() {
        let vaddr = start + index * PAGE_SIZE;
        if let Err(source) = vma.remap_pfn_range(vaddr, page.pfn(), PAGE_SIZE, flags) {
            warn!("remap of page {index} at {vaddr:#x} failed: {source}");
            vma.zap_range(start, index * PAGE_SIZE);
            return Err(source).context(RemapSnafu { index });
        }
    }

    Ok(())
}
