//! Exporter-independent core of DMA-BUF style buffer sharing.
//!
//! An exporter owns the memory behind a buffer and implements [`DmaBufOps`].
//! Everyone else holds a [`DmaBufHandle`]: devices attach to the buffer and
//! map it to get a scatter/gather table of device addresses, processes map it
//! into their address space, and CPU access is bracketed by
//! [`begin_cpu_access`](DmaBufHandle::begin_cpu_access) and
//! [`end_cpu_access`](DmaBufHandle::end_cpu_access).
//!
//! Host services are abstracted behind [`PagePool`], [`DmaDevice`] and
//! [`VmArea`]. The `testing` feature provides in-memory implementations of
//! all three.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod attachment;
pub mod buffer;
pub mod device;
pub mod error;
pub mod handle;
pub mod mm;
pub mod ops;
pub mod sg_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vma;

pub use self::{
    attachment::{Attachment, AttachmentId},
    buffer::{DmaBuf, DmaBufId, ExportInfo},
    device::{DmaAddr, DmaDevice, DmaDirection},
    error::{DmaBufError, ErrorKind},
    handle::DmaBufHandle,
    mm::{PAGE_SIZE, Page, PagePool, PhysPageNum},
    ops::DmaBufOps,
    sg_table::{SgEntry, SgTable},
    vma::{VmAccess, VmArea, VmFlags},
};
