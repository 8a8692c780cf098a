//! The allocation control plane.

use alloc::sync::Arc;
use core::mem;

use dataview::{DataView, Pod, PodMethods as _};
use dmabuf::{DmaBufHandle, PagePool, error, info, log};
use platform_cast::CastFrom as _;
use snafu::{ResultExt as _, ensure};

use crate::{
    buffer::IonBuffer,
    config::IonConfig,
    error::{AllocateSnafu, IonError, ShortPayloadSnafu, UnsupportedCommandSnafu},
    fd_table::FdTable,
};

/// Request and response of [`ION_IOC_ALLOC`].
///
/// The caller fills in `len`; on success the device rewrites `len` with the
/// page-rounded size and `fd` with the descriptor of the new buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct AllocationData {
    pub len: u64,
    /// Ignored: there is a single page pool.
    pub heap_id_mask: u32,
    /// Ignored.
    pub flags: u32,
    pub fd: u32,
    pub unused: u32,
}

const ALLOCATION_DATA_SIZE: u32 = 24;
const _: () = assert!(mem::size_of::<AllocationData>() == ALLOCATION_DATA_SIZE as usize);

const ION_IOC_MAGIC: u32 = 0x49; // 'I'

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn iowr(ty: u32, nr: u32, size: u32) -> u32 {
    ((IOC_READ | IOC_WRITE) << IOC_DIRSHIFT)
        | (size << IOC_SIZESHIFT)
        | (ty << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

/// Allocates a buffer; the payload is an [`AllocationData`].
pub const ION_IOC_ALLOC: u32 = iowr(ION_IOC_MAGIC, 0, ALLOCATION_DATA_SIZE);

/// The allocator device: turns allocation requests into exported buffers.
#[derive(custom_debug_derive::Debug)]
pub struct IonDevice {
    config: IonConfig,
    #[debug(skip)]
    pool: Arc<dyn PagePool>,
}

impl IonDevice {
    /// Brings the device up, allocating from `pool`.
    #[must_use]
    pub fn new(config: IonConfig, pool: Arc<dyn PagePool>) -> Self {
        log::set_max_level(config.log_level);
        info!(
            "{}: device registered (class `{}`)",
            config.device_name, config.class_name
        );
        Self { config, pool }
    }

    #[must_use]
    pub fn config(&self) -> &IonConfig {
        &self.config
    }

    /// Allocates a buffer of at least `len` bytes.
    ///
    /// The returned handle holds the only reference to the new buffer.
    pub fn allocate(&self, len: u64) -> Result<DmaBufHandle, IonError> {
        IonBuffer::allocate(&self.pool, len)
            .inspect_err(|err| {
                error!("{}: memory allocation failed: {err}", self.config.device_name);
            })
            .context(AllocateSnafu { requested: len })
    }

    /// Handles a control request from a client whose descriptors live in
    /// `files`.
    ///
    /// `arg` is the request payload; it is updated in place with the
    /// response.
    pub fn ioctl(&self, files: &FdTable, cmd: u32, arg: &mut [u8]) -> Result<(), IonError> {
        if cmd != ION_IOC_ALLOC {
            error!("{}: ioctl {cmd} is not supported!", self.config.device_name);
            return UnsupportedCommandSnafu { cmd }.fail();
        }

        let needed = mem::size_of::<AllocationData>();
        ensure!(
            arg.len() >= needed,
            ShortPayloadSnafu {
                len: arg.len(),
                needed,
            }
        );
        let mut data = DataView::from(&arg[..needed]).read::<AllocationData>(0);

        let handle = self.allocate(data.len)?;
        let size = handle.size();
        let fd = files.install(handle)?;
        info!(
            "{}: allocated {size:#x} bytes as descriptor {fd}",
            self.config.device_name
        );

        data.len = u64::cast_from(size);
        data.fd = fd.value();
        arg[..needed].copy_from_slice(data.as_bytes());
        Ok(())
    }
}

impl Drop for IonDevice {
    fn drop(&mut self) {
        info!("{}: device unregistered", self.config.device_name);
    }
}
