//! Device attachments and the per-buffer registry that tracks them.

use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    buffer::DmaBuf,
    device::{DmaAddr, DmaDevice, DmaDirection},
    error::{AlreadyMappedSnafu, DmaBufError, NotAttachedSnafu, NotMappedSnafu},
    sg_table::SgTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttachmentId(u64);

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl AttachmentId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(id)
    }
}

#[derive(Debug)]
pub(crate) struct MappedTable {
    pub(crate) table: SgTable,
    pub(crate) dir: DmaDirection,
}

/// Association between a buffer and one consuming device.
///
/// An attachment holds one reference on its buffer from
/// [`DmaBuf::attach`] until [`DmaBuf::detach`], so a buffer can never be
/// released while it still has attachments. Mapping is lazy: no table
/// exists until [`map`](Self::map) is called, and at most one table is live
/// at a time.
pub struct Attachment {
    id: AttachmentId,
    device: Arc<dyn DmaDevice>,
    dmabuf: Arc<DmaBuf>,
    attached: AtomicBool,
    table: Mutex<Option<MappedTable>>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("dmabuf", &self.dmabuf.id())
            .field("attached", &self.attached.load(Ordering::Relaxed))
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl Attachment {
    pub(crate) fn new(dmabuf: Arc<DmaBuf>, device: Arc<dyn DmaDevice>) -> Self {
        Self {
            id: AttachmentId::new(),
            device,
            dmabuf,
            attached: AtomicBool::new(true),
            table: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> AttachmentId {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &dyn DmaDevice {
        &*self.device
    }

    #[must_use]
    pub fn dmabuf(&self) -> &DmaBuf {
        &self.dmabuf
    }

    pub(crate) fn belongs_to(&self, dmabuf: &Arc<DmaBuf>) -> bool {
        Arc::ptr_eq(&self.dmabuf, dmabuf)
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Marks the attachment detached and takes its live table, if any.
    ///
    /// Both happen under the table lock, so a concurrent [`map`](Self::map)
    /// either completes first and its table is taken here, or observes the
    /// detached state and fails.
    pub(crate) fn detach_table(&self) -> Option<MappedTable> {
        let mut slot = self.table.lock();
        self.attached.store(false, Ordering::Release);
        slot.take()
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.table.lock().is_some()
    }

    /// Builds and device-maps the scatter/gather table for this attachment.
    pub fn map(&self, dir: DmaDirection) -> Result<(), DmaBufError> {
        let mut slot = self.table.lock();
        ensure!(self.is_attached(), NotAttachedSnafu);
        ensure!(slot.is_none(), AlreadyMappedSnafu);

        let table = self.dmabuf.with_ops(|ops| ops.map_dma_buf(self, dir))?;
        assert_eq!(table.nents(), self.dmabuf.page_count());
        debug!(
            "dmabuf {} mapped for `{}` ({dir}, {} entries)",
            self.dmabuf.id(),
            self.device.name(),
            table.nents(),
        );
        *slot = Some(MappedTable { table, dir });
        Ok(())
    }

    /// Reverses [`map`](Self::map) and frees the table.
    pub fn unmap(&self) -> Result<(), DmaBufError> {
        self.dmabuf
            .with_ops(|ops| {
                let MappedTable { table, dir } =
                    self.table.lock().take().context(NotMappedSnafu)?;
                ops.unmap_dma_buf(self, table, dir);
                Ok(())
            })
            .inspect_err(|err| error!("unmap of attachment {} failed: {err}", self.id))?;
        debug!(
            "dmabuf {} unmapped for `{}`",
            self.dmabuf.id(),
            self.device.name()
        );
        Ok(())
    }

    /// Calls `f` with the live table, if any.
    pub fn with_sg_table<R>(&self, f: impl FnOnce(&SgTable) -> R) -> Option<R> {
        self.table.lock().as_ref().map(|mapped| f(&mapped.table))
    }

    /// Returns the device addresses of the live table, in page order.
    #[must_use]
    pub fn dma_addresses(&self) -> Vec<DmaAddr> {
        self.with_sg_table(|table| {
            table
                .entries()
                .iter()
                .filter_map(|entry| entry.dma_address())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Makes device writes visible to the CPU. Returns `false` if there was no
    /// live table to synchronize.
    pub fn sync_for_cpu(&self, dir: DmaDirection) -> bool {
        let slot = self.table.lock();
        let Some(mapped) = slot.as_ref() else {
            return false;
        };
        mapped.table.sync_for_cpu(&*self.device, dir);
        true
    }

    /// Makes CPU writes visible to the device. Returns `false` if there was no
    /// live table to synchronize.
    pub fn sync_for_device(&self, dir: DmaDirection) -> bool {
        let slot = self.table.lock();
        let Some(mapped) = slot.as_ref() else {
            return false;
        };
        mapped.table.sync_for_device(&*self.device, dir);
        true
    }

    pub fn pin(&self) -> Result<(), DmaBufError> {
        ensure!(self.is_attached(), NotAttachedSnafu);
        self.dmabuf.with_ops(|ops| ops.pin(self))
    }

    pub fn unpin(&self) -> Result<(), DmaBufError> {
        self.dmabuf.with_ops(|ops| {
            ops.unpin(self);
            Ok(())
        })
    }
}

/// The set of attachments of one buffer.
///
/// Every add, remove, and scan happens with the registry lock held.
#[derive(Debug, Default)]
pub(crate) struct AttachmentRegistry {
    attachments: Mutex<Vec<Arc<Attachment>>>,
}

impl AttachmentRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, attachment: Arc<Attachment>) {
        self.attachments.lock().push(attachment);
    }

    pub(crate) fn remove(&self, attachment: &Attachment) -> Result<Arc<Attachment>, DmaBufError> {
        let mut attachments = self.attachments.lock();
        let index = attachments
            .iter()
            .position(|a| a.id == attachment.id)
            .context(NotAttachedSnafu)?;
        Ok(attachments.remove(index))
    }

    pub(crate) fn len(&self) -> usize {
        self.attachments.lock().len()
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&Attachment)) {
        for attachment in self.attachments.lock().iter() {
            f(attachment);
        }
    }
}
