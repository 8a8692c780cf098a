use alloc::boxed::Box;

use crate::{
    attachment::Attachment, buffer::DmaBuf, device::DmaDirection, error::DmaBufError,
    sg_table::SgTable, vma::VmArea,
};

/// Capabilities an exporter provides for the buffers it exports.
///
/// [`DmaBuf`] calls into this interface; consumers never see the exporter's
/// concrete type. Every method except [`release`](Self::release) may be
/// called concurrently from several contexts.
pub trait DmaBufOps: Send + Sync {
    /// Called when a device attaches. Returning an error refuses the
    /// attachment.
    fn attach(&self, _dmabuf: &DmaBuf, _attachment: &Attachment) -> Result<(), DmaBufError> {
        Ok(())
    }

    /// Called after an attachment has been removed from the buffer.
    fn detach(&self, _dmabuf: &DmaBuf, _attachment: &Attachment) {}

    fn pin(&self, _attachment: &Attachment) -> Result<(), DmaBufError> {
        Ok(())
    }

    fn unpin(&self, _attachment: &Attachment) {}

    /// Builds and device-maps a scatter/gather table for `attachment`.
    ///
    /// Must not leave any device mapping behind when it fails.
    fn map_dma_buf(
        &self,
        attachment: &Attachment,
        dir: DmaDirection,
    ) -> Result<SgTable, DmaBufError>;

    /// Reverses a table previously returned by
    /// [`map_dma_buf`](Self::map_dma_buf) for the same attachment.
    fn unmap_dma_buf(&self, attachment: &Attachment, table: SgTable, dir: DmaDirection);

    /// Maps every page of the buffer into `vma`, whose length equals the
    /// buffer size.
    fn mmap(&self, dmabuf: &DmaBuf, vma: &mut dyn VmArea) -> Result<(), DmaBufError>;

    fn begin_cpu_access(&self, _dmabuf: &DmaBuf, _dir: DmaDirection) -> Result<(), DmaBufError> {
        Ok(())
    }

    fn end_cpu_access(&self, _dmabuf: &DmaBuf, _dir: DmaDirection) -> Result<(), DmaBufError> {
        Ok(())
    }

    /// Frees the backing store. Called exactly once, after the last reference
    /// to the buffer is gone.
    fn release(self: Box<Self>, dmabuf: &DmaBuf);
}
