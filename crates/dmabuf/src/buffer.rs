//! Reference-counted, shareable buffer objects.
//!
//! A [`DmaBuf`] is created by an exporter through [`DmaBuf::export`] and
//! reached by everyone else through [`DmaBufHandle`]s. The buffer carries a
//! reference count that starts at one for the exporting handle. Every handle
//! clone and every attachment adds one; closing a handle or detaching drops
//! one. When the count reaches zero the exporter's
//! [`release`](DmaBufOps::release) runs, exactly once.

use alloc::{boxed::Box, sync::Arc};
use core::{
    fmt,
    sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use snafu::{OptionExt as _, ensure};
use spin::RwLock;

use crate::{
    attachment::{Attachment, AttachmentRegistry, MappedTable},
    device::{DmaDevice, DmaDirection},
    error::{DmaBufError, ReleasedSnafu, VmaSizeSnafu},
    handle::DmaBufHandle,
    mm::PAGE_SIZE,
    ops::DmaBufOps,
    vma::VmArea,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaBufId(u64);

impl fmt::Display for DmaBufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl DmaBufId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(id)
    }
}

/// Everything an exporter supplies when exporting a buffer.
#[derive(custom_debug_derive::Debug)]
pub struct ExportInfo {
    /// Name of the exporting driver, used in log records.
    pub exporter: &'static str,
    /// Size of the buffer in bytes. Must be a whole number of pages.
    pub size: usize,
    #[debug(skip)]
    pub ops: Box<dyn DmaBufOps>,
}

#[derive(custom_debug_derive::Debug)]
pub struct DmaBuf {
    id: DmaBufId,
    exporter: &'static str,
    size: usize,
    refcount: AtomicUsize,
    released: AtomicBool,
    #[debug(skip)]
    attachments: AttachmentRegistry,
    #[debug(skip)]
    ops: RwLock<Option<Box<dyn DmaBufOps>>>,
}

impl DmaBuf {
    /// Publishes a new buffer and returns the first handle to it.
    ///
    /// # Panics
    ///
    /// Panics if `info.size` is zero or not a multiple of the page size.
    #[must_use]
    pub fn export(info: ExportInfo) -> DmaBufHandle {
        let ExportInfo {
            exporter,
            size,
            ops,
        } = info;
        assert!(
            size != 0 && size.is_multiple_of(PAGE_SIZE),
            "exported buffer size {size:#x} is not a whole number of pages",
        );

        let dmabuf = Arc::new(Self {
            id: DmaBufId::new(),
            exporter,
            size,
            refcount: AtomicUsize::new(1),
            released: AtomicBool::new(false),
            attachments: AttachmentRegistry::new(),
            ops: RwLock::new(Some(ops)),
        });
        debug!("{exporter}: exported dmabuf {} ({size:#x} bytes)", dmabuf.id);
        DmaBufHandle::from_exported(dmabuf)
    }

    #[must_use]
    pub fn id(&self) -> DmaBufId {
        self.id
    }

    #[must_use]
    pub fn exporter(&self) -> &'static str {
        self.exporter
    }

    /// Returns the buffer size in bytes. Always a whole number of pages.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Calls `f` for every current attachment, with the registry locked.
    pub fn for_each_attachment(&self, f: impl FnMut(&Attachment)) {
        self.attachments.for_each(f);
    }

    pub(crate) fn get(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(old != 0, "reference taken on released dmabuf {}", self.id);
    }

    /// Takes a reference unless the count has already dropped to zero.
    fn try_get(&self) -> bool {
        let mut count = self.refcount.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    pub(crate) fn put(&self) {
        if self.refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        self.release();
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            warn!("dmabuf {} released twice", self.id);
            return;
        }
        debug_assert_eq!(self.attachments.len(), 0);

        let Some(ops) = self.ops.write().take() else {
            return;
        };
        debug!("{}: releasing dmabuf {}", self.exporter, self.id);
        ops.release(self);
    }

    pub(crate) fn with_ops<R>(
        &self,
        f: impl FnOnce(&dyn DmaBufOps) -> Result<R, DmaBufError>,
    ) -> Result<R, DmaBufError> {
        let ops = self.ops.read();
        let ops = ops.as_deref().context(ReleasedSnafu)?;
        f(ops)
    }

    /// Attaches `device` to this buffer.
    ///
    /// The attachment keeps the buffer alive until it is detached.
    pub fn attach(
        self: &Arc<Self>,
        device: Arc<dyn DmaDevice>,
    ) -> Result<Arc<Attachment>, DmaBufError> {
        ensure!(self.try_get(), ReleasedSnafu);

        let attachment = Arc::new(Attachment::new(Arc::clone(self), device));
        if let Err(err) = self.with_ops(|ops| ops.attach(self, &attachment)) {
            warn!(
                "{}: attach of `{}` to dmabuf {} refused: {err}",
                self.exporter,
                attachment.device().name(),
                self.id,
            );
            attachment.detach_table();
            drop(attachment);
            self.put();
            return Err(err);
        }

        self.attachments.add(Arc::clone(&attachment));
        debug!(
            "{}: `{}` attached to dmabuf {} as {}",
            self.exporter,
            attachment.device().name(),
            self.id,
            attachment.id(),
        );
        Ok(attachment)
    }

    /// Removes `attachment` from this buffer and drops its reference.
    ///
    /// A still-mapped attachment is unmapped first. May release the buffer if
    /// this was the last reference.
    pub fn detach(&self, attachment: &Attachment) -> Result<(), DmaBufError> {
        let removed = self.attachments.remove(attachment)?;
        let stale = removed.detach_table();

        match self.ops.read().as_deref() {
            Some(ops) => {
                if let Some(MappedTable { table, dir }) = stale {
                    warn!(
                        "{}: `{}` detached from dmabuf {} while still mapped",
                        self.exporter,
                        removed.device().name(),
                        self.id,
                    );
                    ops.unmap_dma_buf(&removed, table, dir);
                }
                ops.detach(self, &removed);
            }
            None => warn!(
                "{}: `{}` detached from released dmabuf {}",
                self.exporter,
                removed.device().name(),
                self.id,
            ),
        }
        debug!(
            "{}: `{}` detached from dmabuf {}",
            self.exporter,
            removed.device().name(),
            self.id,
        );

        drop(removed);
        self.put();
        Ok(())
    }

    /// Maps the whole buffer into `vma`.
    ///
    /// The region must be exactly as long as the buffer.
    pub fn mmap(&self, vma: &mut dyn VmArea) -> Result<(), DmaBufError> {
        ensure!(
            vma.len() == self.size,
            VmaSizeSnafu {
                expected: self.size,
                actual: vma.len(),
            }
        );
        self.with_ops(|ops| ops.mmap(self, vma))
    }

    /// Prepares the buffer for CPU access in direction `dir`.
    pub fn begin_cpu_access(&self, dir: DmaDirection) -> Result<(), DmaBufError> {
        self.with_ops(|ops| ops.begin_cpu_access(self, dir))
    }

    /// Hands the buffer back to its devices after CPU access.
    pub fn end_cpu_access(&self, dir: DmaDirection) -> Result<(), DmaBufError> {
        self.with_ops(|ops| ops.end_cpu_access(self, dir))
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};

    use super::*;
    use crate::{
        error::NotAttachedSnafu,
        mm::{Page, PagePool as _, alloc_pages, free_pages},
        sg_table::SgTable,
        testing::{MockDevice, MockPagePool, MockVmArea},
        vma::remap_pages,
    };

    struct TestOps {
        pool: Arc<MockPagePool>,
        pages: Vec<Page>,
        releases: Arc<AtomicUsize>,
        refuse_attach: bool,
    }

    impl DmaBufOps for TestOps {
        fn attach(&self, _dmabuf: &DmaBuf, _attachment: &Attachment) -> Result<(), DmaBufError> {
            if self.refuse_attach {
                return NotAttachedSnafu.fail();
            }
            Ok(())
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

        fn mmap(&self, _dmabuf: &DmaBuf, vma: &mut dyn VmArea) -> Result<(), DmaBufError> {
            remap_pages(vma, &self.pages)
        }

        fn release(self: Box<Self>, _dmabuf: &DmaBuf) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            let Self { pool, pages, .. } = *self;
            free_pages(&*pool, pages);
        }
    }

    fn export(pool: &Arc<MockPagePool>, count: usize) -> (DmaBufHandle, Arc<AtomicUsize>) {
        export_with(pool, count, false)
    }

    fn export_with(
        pool: &Arc<MockPagePool>,
        count: usize,
        refuse_attach: bool,
    ) -> (DmaBufHandle, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let ops = TestOps {
            pool: Arc::clone(pool),
            pages: alloc_pages(&**pool, count).unwrap(),
            releases: Arc::clone(&releases),
            refuse_attach,
        };
        let handle = DmaBuf::export(ExportInfo {
            exporter: "test",
            size: count * PAGE_SIZE,
            ops: Box::new(ops),
        });
        (handle, releases)
    }

    #[test]
    fn test_export_starts_with_one_reference() {
        let pool = Arc::new(MockPagePool::new(4));
        let (handle, releases) = export(&pool, 2);
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.size(), 2 * PAGE_SIZE);
        assert_eq!(handle.dmabuf().page_count(), 2);

        drop(handle);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_attachment_keeps_buffer_alive() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, releases) = export(&pool, 2);

        let attachment = handle.attach(device).unwrap();
        assert_eq!(handle.ref_count(), 2);
        let dmabuf = Arc::clone(handle.dmabuf());

        handle.close();
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert_eq!(dmabuf.ref_count(), 1);

        dmabuf.detach(&attachment).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(dmabuf.is_released());
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_refused_attach_drops_reference() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, _releases) = export_with(&pool, 1, true);

        let err = handle.attach(device).unwrap_err();
        assert!(matches!(err, DmaBufError::NotAttached { .. }));
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.dmabuf().attachment_count(), 0);
    }

    #[test]
    fn test_detach_twice_fails() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, _releases) = export(&pool, 1);

        let attachment = handle.attach(device).unwrap();
        handle.detach(&attachment).unwrap();
        let err = handle.detach(&attachment).unwrap_err();
        assert!(err.kind().is_invalid_state());
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_detach_unmaps_live_table() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, _releases) = export(&pool, 3);

        let attachment = handle.attach(Arc::clone(&device) as _).unwrap();
        attachment.map(DmaDirection::Bidirectional).unwrap();
        assert_eq!(device.live_mappings(), 3);

        handle.detach(&attachment).unwrap();
        assert_eq!(device.live_mappings(), 0);
        assert!(!attachment.is_mapped());
        assert!(!attachment.is_attached());
    }

    #[test]
    fn test_map_twice_fails() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, _releases) = export(&pool, 2);

        let attachment = handle.attach(device).unwrap();
        attachment.map(DmaDirection::DeviceRead).unwrap();
        let err = attachment.map(DmaDirection::DeviceRead).unwrap_err();
        assert!(matches!(err, DmaBufError::AlreadyMapped { .. }));

        attachment.unmap().unwrap();
        let err = attachment.unmap().unwrap_err();
        assert!(matches!(err, DmaBufError::NotMapped { .. }));
        handle.detach(&attachment).unwrap();
    }

    #[test]
    fn test_mmap_requires_exact_length() {
        let pool = Arc::new(MockPagePool::new(4));
        let (handle, _releases) = export(&pool, 2);

        let mut short = MockVmArea::new(&pool, 0x4000_0000, PAGE_SIZE);
        let err = handle.mmap(&mut short).unwrap_err();
        assert!(matches!(err, DmaBufError::VmaSize { .. }));
        assert!(err.kind().is_invalid_argument());
        assert!(short.mappings().is_empty());

        let mut exact = MockVmArea::new(&pool, 0x4000_0000, 2 * PAGE_SIZE);
        handle.mmap(&mut exact).unwrap();
        assert_eq!(exact.mappings().len(), 2);
    }

    #[test]
    fn test_operations_after_release_fail() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, releases) = export(&pool, 1);
        let dmabuf = Arc::clone(handle.dmabuf());
        drop(handle);
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let err = dmabuf.attach(device).unwrap_err();
        assert!(matches!(err, DmaBufError::Released { .. }));
        let err = dmabuf.begin_cpu_access(DmaDirection::DeviceRead).unwrap_err();
        assert!(matches!(err, DmaBufError::Released { .. }));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_page_is_reused_after_release() {
        let pool = Arc::new(MockPagePool::new(1));
        let (handle, _releases) = export(&pool, 1);
        assert!(pool.alloc_page().is_none());
        drop(handle);
        let page = pool.alloc_page().unwrap();
        pool.free_page(page);
    }

    #[test]
    fn test_map_after_detach_fails() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, _releases) = export(&pool, 2);

        let attachment = handle.attach(Arc::clone(&device) as _).unwrap();
        handle.detach(&attachment).unwrap();
        let err = attachment.map(DmaDirection::DeviceRead).unwrap_err();
        assert!(matches!(err, DmaBufError::NotAttached { .. }));
        assert!(!attachment.is_mapped());
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn test_map_racing_detach_leaves_no_mapping() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));
        let (handle, releases) = export(&pool, 2);

        for _ in 0..200 {
            let attachment = handle.attach(Arc::clone(&device) as _).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    let result = attachment.map(DmaDirection::Bidirectional);
                    assert!(matches!(result, Ok(()) | Err(DmaBufError::NotAttached { .. })));
                });
                s.spawn(|| handle.detach(&attachment).unwrap());
            });
            assert!(!attachment.is_attached());
            assert!(!attachment.is_mapped());
            assert_eq!(device.live_mappings(), 0);
        }
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attach_racing_last_detach_reports_released() {
        let pool = Arc::new(MockPagePool::new(4));
        let device = Arc::new(MockDevice::new("gpu0", &pool));

        for _ in 0..200 {
            let (handle, releases) = export(&pool, 1);
            let dmabuf = Arc::clone(handle.dmabuf());
            let first = handle.attach(Arc::clone(&device) as _).unwrap();
            handle.close();

            std::thread::scope(|s| {
                s.spawn(|| dmabuf.detach(&first).unwrap());
                s.spawn(|| match dmabuf.attach(Arc::clone(&device) as _) {
                    Ok(second) => dmabuf.detach(&second).unwrap(),
                    Err(err) => assert!(matches!(err, DmaBufError::Released { .. })),
                });
            });

            assert_eq!(releases.load(Ordering::SeqCst), 1);
            assert_eq!(dmabuf.ref_count(), 0);
        }
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_debug_skips_exporter_state() {
        let pool = Arc::new(MockPagePool::new(1));
        let (handle, _releases) = export(&pool, 1);
        let text = alloc::format!("{:?}", handle.dmabuf());
        assert!(text.contains("exporter: \"test\""));
        assert!(text.contains("refcount: 1"));
        assert!(!text.contains("attachments"));
    }
}
