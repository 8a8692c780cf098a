//! The page-backed buffer object and its sharing capabilities.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use dmabuf::{
    Attachment, DmaBuf, DmaBufError, DmaBufHandle, DmaBufOps, DmaDirection, ExportInfo,
    PAGE_SIZE, Page, PagePool, SgTable, VmArea, debug, info, mm, trace, vma::remap_pages,
};

pub(crate) const EXPORTER_NAME: &str = "ion";

/// Backing store of one exported buffer: an ordered list of pages.
///
/// Page `i` holds bytes `i * PAGE_SIZE..(i + 1) * PAGE_SIZE` of the buffer.
/// The pages are returned to their pool when the buffer is released.
#[derive(custom_debug_derive::Debug)]
pub struct IonBuffer {
    #[debug(skip)]
    pool: Arc<dyn PagePool>,
    pages: Vec<Page>,
}

impl IonBuffer {
    /// Allocates a buffer of at least `requested` bytes and exports it.
    ///
    /// The size is rounded up to the page boundary. Either every page is
    /// acquired or none stays allocated.
    pub fn allocate(
        pool: &Arc<dyn PagePool>,
        requested: u64,
    ) -> Result<DmaBufHandle, DmaBufError> {
        let count = mm::page_count(requested)?;
        let size = count * PAGE_SIZE;
        let pages = mm::alloc_pages(&**pool, count)?;
        debug!("{EXPORTER_NAME}: allocated {count} pages for {requested:#x} bytes");

        let buffer = Self {
            pool: Arc::clone(pool),
            pages,
        };
        Ok(DmaBuf::export(ExportInfo {
            exporter: EXPORTER_NAME,
            size,
            ops: Box::new(buffer),
        }))
    }

    #[must_use]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }
}

impl DmaBufOps for IonBuffer {
    fn attach(&self, dmabuf: &DmaBuf, attachment: &Attachment) -> Result<(), DmaBufError> {
        info!(
            "dmabuf {} attach device: {}",
            dmabuf.id(),
            attachment.device().name()
        );
        Ok(())
    }

    fn detach(&self, dmabuf: &DmaBuf, attachment: &Attachment) {
        info!(
            "dmabuf {} detach device: {}",
            dmabuf.id(),
            attachment.device().name()
        );
    }

    fn pin(&self, attachment: &Attachment) -> Result<(), DmaBufError> {
        trace!("pin attachment {}", attachment.id());
        Ok(())
    }

    fn unpin(&self, attachment: &Attachment) {
        trace!("unpin attachment {}", attachment.id());
    }

    fn map_dma_buf(
        &self,
        attachment: &Attachment,
        dir: DmaDirection,
    ) -> Result<SgTable, DmaBufError> {
        let mut table = SgTable::from_pages(&self.pages)?;
        table.map(attachment.device(), dir)?;
        Ok(table)
    }

    fn unmap_dma_buf(&self, attachment: &Attachment, mut table: SgTable, dir: DmaDirection) {
        table.unmap(attachment.device(), dir);
    }

    fn mmap(&self, dmabuf: &DmaBuf, vma: &mut dyn VmArea) -> Result<(), DmaBufError> {
        debug!(
            "dmabuf {} mmap at {:#x} ({} pages)",
            dmabuf.id(),
            vma.start(),
            self.pages.len()
        );
        remap_pages(vma, &self.pages)
    }

    fn begin_cpu_access(&self, dmabuf: &DmaBuf, dir: DmaDirection) -> Result<(), DmaBufError> {
        let mut synced = 0_usize;
        dmabuf.for_each_attachment(|attachment| {
            if attachment.sync_for_cpu(dir) {
                synced += 1;
            }
        });
        trace!(
            "dmabuf {} begin cpu access ({dir}): {synced} attachments synced",
            dmabuf.id()
        );
        Ok(())
    }

    fn end_cpu_access(&self, dmabuf: &DmaBuf, dir: DmaDirection) -> Result<(), DmaBufError> {
        let mut synced = 0_usize;
        dmabuf.for_each_attachment(|attachment| {
            if attachment.sync_for_device(dir) {
                synced += 1;
            }
        });
        trace!(
            "dmabuf {} end cpu access ({dir}): {synced} attachments synced",
            dmabuf.id()
        );
        Ok(())
    }

    fn release(self: Box<Self>, dmabuf: &DmaBuf) {
        let Self { pool, pages } = *self;
        info!("dmabuf {} release ({} pages)", dmabuf.id(), pages.len());
        mm::free_pages(&*pool, pages);
    }
}

#[cfg(test)]
mod tests {
    use dmabuf::testing::{MockDevice, MockPagePool, MockVmArea};

    use super::*;

    fn pool(frames: usize) -> (Arc<MockPagePool>, Arc<dyn PagePool>) {
        let mock = Arc::new(MockPagePool::new(frames));
        let pool = Arc::clone(&mock) as Arc<dyn PagePool>;
        (mock, pool)
    }

    #[test]
    fn test_allocate_rounds_up() {
        let (mock, pool) = pool(8);
        let handle = IonBuffer::allocate(&pool, 10000).unwrap();
        assert_eq!(handle.size(), 12288);
        assert_eq!(mock.allocated_count(), 3);
        drop(handle);
        assert_eq!(mock.allocated_count(), 0);
    }

    #[test]
    fn test_allocate_zero_fails() {
        let (mock, pool) = pool(8);
        let err = IonBuffer::allocate(&pool, 0).unwrap_err();
        assert!(err.kind().is_invalid_argument());
        assert_eq!(mock.allocated_count(), 0);
    }

    #[test]
    fn test_allocate_rolls_back_partial_pages() {
        let (mock, pool) = pool(8);
        mock.fail_after(2);
        let err = IonBuffer::allocate(&pool, 4 * PAGE_SIZE as u64).unwrap_err();
        assert!(err.kind().is_out_of_memory());
        assert_eq!(mock.free_count(), 8);
        assert_eq!(mock.free_calls(), 2);
    }

    #[test]
    fn test_map_uses_attachment_device() {
        let (mock, pool) = pool(8);
        let gpu = Arc::new(MockDevice::new("gpu0", &mock));
        let nic = Arc::new(MockDevice::new("nic0", &mock));
        let handle = IonBuffer::allocate(&pool, 2 * PAGE_SIZE as u64).unwrap();

        let a = handle.attach(Arc::clone(&gpu) as _).unwrap();
        let b = handle.attach(Arc::clone(&nic) as _).unwrap();
        a.map(DmaDirection::DeviceRead).unwrap();
        assert_eq!(gpu.live_mappings(), 2);
        assert_eq!(nic.live_mappings(), 0);

        b.map(DmaDirection::DeviceWrite).unwrap();
        assert_eq!(nic.live_mappings(), 2);

        handle.detach(&a).unwrap();
        handle.detach(&b).unwrap();
        assert_eq!(gpu.live_mappings() + nic.live_mappings(), 0);
    }

    #[test]
    fn test_failed_mmap_leaves_region_empty() {
        let (mock, pool) = pool(8);
        let handle = IonBuffer::allocate(&pool, 3 * PAGE_SIZE as u64).unwrap();
        let mut vma = MockVmArea::new(&mock, 0x7000_0000, 3 * PAGE_SIZE);
        vma.fail_at_page(1);

        let err = handle.mmap(&mut vma).unwrap_err();
        assert!(matches!(err, DmaBufError::Remap { index: 1, .. }));
        assert!(vma.mappings().is_empty());
    }

    #[test]
    fn test_cpu_access_skips_unmapped_attachments() {
        let (mock, pool) = pool(8);
        let mapped = Arc::new(MockDevice::new("gpu0", &mock));
        let idle = Arc::new(MockDevice::new("gpu1", &mock));
        let handle = IonBuffer::allocate(&pool, 2 * PAGE_SIZE as u64).unwrap();

        let a = handle.attach(Arc::clone(&mapped) as _).unwrap();
        let b = handle.attach(Arc::clone(&idle) as _).unwrap();
        a.map(DmaDirection::Bidirectional).unwrap();

        handle.begin_cpu_access(DmaDirection::Bidirectional).unwrap();
        handle.end_cpu_access(DmaDirection::Bidirectional).unwrap();
        assert_eq!(mapped.syncs().len(), 4);
        assert!(idle.syncs().is_empty());

        handle.detach(&a).unwrap();
        handle.detach(&b).unwrap();
    }

    #[test]
    fn test_pin_requires_attachment() {
        let (mock, pool) = pool(4);
        let gpu = Arc::new(MockDevice::new("gpu0", &mock));
        let handle = IonBuffer::allocate(&pool, PAGE_SIZE as u64).unwrap();
        assert_eq!(handle.dmabuf().exporter(), EXPORTER_NAME);

        let attachment = handle.attach(gpu).unwrap();
        attachment.pin().unwrap();
        attachment.unpin().unwrap();
        handle.detach(&attachment).unwrap();

        let err = attachment.pin().unwrap_err();
        assert!(matches!(err, DmaBufError::NotAttached { .. }));
    }

    #[test]
    fn test_pages_follow_allocation_order() {
        let (mock, _pool) = pool(4);
        let pages = mm::alloc_pages(&*mock, 2).unwrap();
        let buffer = IonBuffer {
            pool: Arc::clone(&mock) as _,
            pages,
        };
        assert_eq!(buffer.size(), 2 * PAGE_SIZE);
        assert_eq!(
            buffer.pages()[1].pfn(),
            buffer.pages()[0].pfn().checked_add(1).unwrap()
        );
        let IonBuffer { pool, pages } = buffer;
        mm::free_pages(&*pool, pages);
    }
}
