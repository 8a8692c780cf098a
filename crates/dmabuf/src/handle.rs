use alloc::sync::Arc;
use core::fmt;

use snafu::ensure;

use crate::{
    attachment::Attachment,
    buffer::{DmaBuf, DmaBufId},
    device::{DmaDevice, DmaDirection},
    error::{DmaBufError, NotAttachedSnafu},
    vma::VmArea,
};

/// A counted reference to a [`DmaBuf`].
///
/// This is what consumers hold: cloning takes another reference, dropping or
/// [`close`](Self::close)-ing gives one back. The last reference to go
/// releases the buffer.
pub struct DmaBufHandle {
    dmabuf: Arc<DmaBuf>,
}

impl fmt::Debug for DmaBufHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DmaBufHandle").field(&self.dmabuf).finish()
    }
}

impl Clone for DmaBufHandle {
    fn clone(&self) -> Self {
        self.dmabuf.get();
        Self {
            dmabuf: Arc::clone(&self.dmabuf),
        }
    }
}

impl Drop for DmaBufHandle {
    fn drop(&mut self) {
        self.dmabuf.put();
    }
}

impl DmaBufHandle {
    /// Wraps the reference created by [`DmaBuf::export`].
    pub(crate) fn from_exported(dmabuf: Arc<DmaBuf>) -> Self {
        Self { dmabuf }
    }

    /// Gives this reference back.
    pub fn close(self) {
        drop(self);
    }

    #[must_use]
    pub fn dmabuf(&self) -> &Arc<DmaBuf> {
        &self.dmabuf
    }

    #[must_use]
    pub fn id(&self) -> DmaBufId {
        self.dmabuf.id()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.dmabuf.size()
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.dmabuf.ref_count()
    }

    /// Returns `true` if both handles refer to the same buffer.
    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.dmabuf, &other.dmabuf)
    }

    pub fn attach(&self, device: Arc<dyn DmaDevice>) -> Result<Arc<Attachment>, DmaBufError> {
        self.dmabuf.attach(device)
    }

    pub fn detach(&self, attachment: &Attachment) -> Result<(), DmaBufError> {
        self.dmabuf.detach(attachment)
    }

    /// Maps `attachment`, which must belong to this buffer.
    pub fn map_attachment(
        &self,
        attachment: &Attachment,
        dir: DmaDirection,
    ) -> Result<(), DmaBufError> {
        ensure!(attachment.belongs_to(&self.dmabuf), NotAttachedSnafu);
        attachment.map(dir)
    }

    /// Unmaps `attachment`, which must belong to this buffer.
    pub fn unmap_attachment(&self, attachment: &Attachment) -> Result<(), DmaBufError> {
        ensure!(attachment.belongs_to(&self.dmabuf), NotAttachedSnafu);
        attachment.unmap()
    }

    pub fn mmap(&self, vma: &mut dyn VmArea) -> Result<(), DmaBufError> {
        self.dmabuf.mmap(vma)
    }

    pub fn begin_cpu_access(&self, dir: DmaDirection) -> Result<(), DmaBufError> {
        self.dmabuf.begin_cpu_access(dir)
    }

    pub fn end_cpu_access(&self, dir: DmaDirection) -> Result<(), DmaBufError> {
        self.dmabuf.end_cpu_access(dir)
    }
}
