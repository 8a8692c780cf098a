use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    mm::{PAGE_SIZE, PhysPageNum},
    testing::MockPagePool,
    vma::{RemapError, VmAccess, VmArea, VmFlags},
};

/// A process address-space region backed by a [`MockPagePool`].
#[derive(Debug)]
pub struct MockVmArea {
    pool: Arc<MockPagePool>,
    start: usize,
    len: usize,
    flags: VmFlags,
    pages: BTreeMap<usize, PhysPageNum>,
    fail_at_page: Option<usize>,
}

impl MockVmArea {
    /// Creates a shared, readable and writable region.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not page aligned.
    #[must_use]
    pub fn new(pool: &Arc<MockPagePool>, start: usize, len: usize) -> Self {
        assert!(start.is_multiple_of(PAGE_SIZE), "unaligned region start {start:#x}");
        Self {
            pool: Arc::clone(pool),
            start,
            len,
            flags: VmFlags::SHARED_RW,
            pages: BTreeMap::new(),
            fail_at_page: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: VmFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Makes the mapping of the `index`-th page of the region fail.
    pub fn fail_at_page(&mut self, index: usize) {
        self.fail_at_page = Some(index);
    }

    /// Returns every mapped page as `(virtual address, frame)`, lowest first.
    #[must_use]
    pub fn mappings(&self) -> Vec<(usize, PhysPageNum)> {
        self.pages.iter().map(|(&vaddr, &pfn)| (vaddr, pfn)).collect()
    }

    /// Reads region bytes starting `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if any touched page is not mapped.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let (pfn, page_offset) = self.resolve(offset + done);
            let n = (PAGE_SIZE - page_offset).min(buf.len() - done);
            self.pool.read(pfn, page_offset, &mut buf[done..done + n]);
            done += n;
        }
    }

    /// Writes `data` starting `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if any touched page is not mapped, or if the region is not
    /// writable.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(self.flags.contains(VmFlags::WRITE), "write to read-only region");
        let mut done = 0;
        while done < data.len() {
            let (pfn, page_offset) = self.resolve(offset + done);
            let n = (PAGE_SIZE - page_offset).min(data.len() - done);
            self.pool.write(pfn, page_offset, &data[done..done + n]);
            done += n;
        }
    }

    fn resolve(&self, offset: usize) -> (PhysPageNum, usize) {
        let vaddr = self.start + offset;
        let page_vaddr = vaddr - vaddr % PAGE_SIZE;
        let pfn = self
            .pages
            .get(&page_vaddr)
            .copied()
            .unwrap_or_else(|| panic!("page fault at {vaddr:#x}"));
        (pfn, vaddr - page_vaddr)
    }
}

impl VmAccess for MockVmArea {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        self.read(offset, buf);
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.write(offset, data);
    }
}

impl VmArea for MockVmArea {
    fn start(&self) -> usize {
        self.start
    }

    fn len(&self) -> usize {
        self.len
    }

    fn flags(&self) -> VmFlags {
        self.flags
    }

    fn remap_pfn_range(
        &mut self,
        vaddr: usize,
        pfn: PhysPageNum,
        size: usize,
        _flags: VmFlags,
    ) -> Result<(), RemapError> {
        if vaddr < self.start || vaddr + size > self.start + self.len {
            return Err(RemapError::OutOfRange { vaddr });
        }
        let first = (vaddr - self.start) / PAGE_SIZE;
        let count = size.div_ceil(PAGE_SIZE);
        if self.fail_at_page.is_some_and(|i| (first..first + count).contains(&i)) {
            return Err(RemapError::NoPageTableMemory { vaddr });
        }
        for i in 0..count {
            let page_vaddr = vaddr + i * PAGE_SIZE;
            if self.pages.contains_key(&page_vaddr) {
                return Err(RemapError::AlreadyMapped { vaddr: page_vaddr });
            }
        }
        for i in 0..count {
            let frame = pfn
                .checked_add(i)
                .ok_or(RemapError::OutOfRange { vaddr })?;
            self.pages.insert(vaddr + i * PAGE_SIZE, frame);
        }
        Ok(())
    }

    fn zap_range(&mut self, vaddr: usize, size: usize) {
        self.pages.retain(|&page_vaddr, _| !(vaddr..vaddr + size).contains(&page_vaddr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PagePool as _;

    #[test]
    fn test_read_write_through_mapping() {
        let pool = Arc::new(MockPagePool::new(2));
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        let mut vma = MockVmArea::new(&pool, 0x1000_0000, 2 * PAGE_SIZE);
        vma.remap_pfn_range(0x1000_0000, a.pfn(), PAGE_SIZE, VmFlags::SHARED_RW)
            .unwrap();
        vma.remap_pfn_range(0x1000_1000, b.pfn(), PAGE_SIZE, VmFlags::SHARED_RW)
            .unwrap();

        vma.write(PAGE_SIZE - 2, b"span");
        let mut buf = [0; 2];
        pool.read(b.pfn(), 0, &mut buf);
        assert_eq!(&buf, b"an");

        let mut buf = [0; 4];
        vma.read(PAGE_SIZE - 2, &mut buf);
        assert_eq!(&buf, b"span");

        vma.zap_range(0x1000_0000, 2 * PAGE_SIZE);
        assert!(vma.mappings().is_empty());
        pool.free_page(a);
        pool.free_page(b);
    }

    #[test]
    fn test_remap_outside_region_fails() {
        let pool = Arc::new(MockPagePool::new(1));
        let mut vma = MockVmArea::new(&pool, 0x1000_0000, PAGE_SIZE);
        let err = vma
            .remap_pfn_range(0x1000_1000, PhysPageNum::new(1), PAGE_SIZE, VmFlags::READ)
            .unwrap_err();
        assert!(matches!(err, RemapError::OutOfRange { .. }));
        assert!(err.kind().is_io());
    }

    #[test]
    #[should_panic = "read-only region"]
    fn test_read_only_region_rejects_writes() {
        let pool = Arc::new(MockPagePool::new(1));
        let page = pool.alloc_page().unwrap();
        let mut vma = MockVmArea::new(&pool, 0x1000_0000, PAGE_SIZE).with_flags(VmFlags::READ);
        vma.remap_pfn_range(0x1000_0000, page.pfn(), PAGE_SIZE, vma.flags())
            .unwrap();
        vma.write(0, b"x");
    }
}
