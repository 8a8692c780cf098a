//! A page-backed buffer exporter in the style of the Android ION allocator.
//!
//! [`IonDevice`] is the control plane: it allocates page-backed buffers on
//! request and hands them out as [`DmaBufHandle`](dmabuf::DmaBufHandle)s
//! installed in a caller's [`FdTable`]. The buffers themselves are
//! [`IonBuffer`]s, which implement the sharing capabilities (attachment,
//! scatter/gather mapping, CPU access synchronization, and user mapping) on
//! top of the [`dmabuf`] core.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    buffer::IonBuffer,
    client::{AllocatedBuffer, IonMemory},
    config::IonConfig,
    device::{AllocationData, ION_IOC_ALLOC, IonDevice},
    error::IonError,
    fd_table::{Fd, FdTable},
};

pub mod buffer;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod fd_table;
