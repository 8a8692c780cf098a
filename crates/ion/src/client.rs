//! Client side of the allocator: open, allocate, map, and free.

use dataview::PodMethods as _;
use dmabuf::{DmaBufHandle, DmaDirection, VmAccess, VmArea, debug, info, mm::Align as _};
use platform_cast::CastFrom as _;
use snafu::{IntoError as _, ResultExt as _};

use crate::{
    IonDevice,
    device::{AllocationData, ION_IOC_ALLOC},
    error::{CpuAccessSnafu, IonError, MmapSnafu},
    fd_table::{Fd, FdTable},
};

/// Allocation granularity of the accelerator the buffers are shared with.
pub const ACCEL_PAGE_SIZE: usize = 4 * 1024;

/// A buffer allocated through [`IonMemory`] and mapped into `region`.
#[derive(Debug)]
pub struct AllocatedBuffer<V> {
    fd: Fd,
    offset: u64,
    len: usize,
    region: V,
}

impl<V> AllocatedBuffer<V> {
    #[must_use]
    pub fn fd(&self) -> Fd {
        self.fd
    }

    /// Returns the offset of the data within the buffer. Always zero.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn region(&self) -> &V {
        &self.region
    }
}

/// An open session with an [`IonDevice`].
///
/// Descriptors of buffers allocated through the session live in its own
/// [`FdTable`] and are closed when the session is dropped.
#[derive(Debug)]
pub struct IonMemory<'dev> {
    device: &'dev IonDevice,
    files: FdTable,
}

impl<'dev> IonMemory<'dev> {
    #[must_use]
    pub fn open(device: &'dev IonDevice) -> Self {
        debug!("{}: opened", device.config().device_name);
        Self {
            device,
            files: FdTable::new(),
        }
    }

    #[must_use]
    pub fn files(&self) -> &FdTable {
        &self.files
    }

    /// Returns a new reference to the buffer behind `fd`.
    pub fn handle(&self, fd: Fd) -> Result<DmaBufHandle, IonError> {
        self.files.get(fd)
    }

    /// Allocates a buffer of at least `size` bytes and maps it.
    ///
    /// `size` is rounded up to [`ACCEL_PAGE_SIZE`]. `make_region` is called
    /// with the final length and must return a region of exactly that length.
    pub fn allocate_buffer<V, F>(
        &self,
        size: u64,
        make_region: F,
    ) -> Result<AllocatedBuffer<V>, IonError>
    where
        V: VmArea,
        F: FnOnce(usize) -> V,
    {
        let mut data = AllocationData::zeroed();
        data.len = size.checked_align_up(ACCEL_PAGE_SIZE).unwrap_or(size);
        self.device
            .ioctl(&self.files, ION_IOC_ALLOC, data.as_bytes_mut())?;

        let fd = Fd::new(data.fd);
        info!("ion alloc success: size = {}, dmabuf_fd = {fd}", data.len);

        let len = usize::cast_from(data.len);
        let mut region = make_region(len);
        let handle = self.files.get(fd)?;
        if let Err(source) = handle.mmap(&mut region) {
            drop(handle);
            let _ = self.files.close(fd);
            return Err(MmapSnafu { fd }.into_error(source));
        }

        Ok(AllocatedBuffer {
            fd,
            offset: 0,
            len,
            region,
        })
    }

    /// Unmaps `buffer` and closes its descriptor.
    pub fn free_buffer<V: VmArea>(&self, buffer: AllocatedBuffer<V>) -> Result<(), IonError> {
        let AllocatedBuffer {
            fd, mut region, ..
        } = buffer;
        region.zap_range(region.start(), region.len());
        self.files.close(fd)
    }

    /// Copies `data` into the buffer at `offset`, bracketed by CPU access.
    pub fn copy_to_buffer<V: VmAccess>(
        &self,
        buffer: &AllocatedBuffer<V>,
        offset: usize,
        data: &[u8],
    ) -> Result<(), IonError> {
        self.with_cpu_access(buffer, |region| region.write_bytes(offset, data))
    }

    /// Copies buffer bytes at `offset` into `buf`, bracketed by CPU access.
    pub fn copy_from_buffer<V: VmAccess>(
        &self,
        buffer: &AllocatedBuffer<V>,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), IonError> {
        self.with_cpu_access(buffer, |region| region.read_bytes(offset, buf))
    }

    fn with_cpu_access<V: VmAccess>(
        &self,
        buffer: &AllocatedBuffer<V>,
        f: impl FnOnce(&V),
    ) -> Result<(), IonError> {
        let fd = buffer.fd;
        let handle = self.files.get(fd)?;
        let dir = DmaDirection::Bidirectional;
        handle
            .begin_cpu_access(dir)
            .context(CpuAccessSnafu { fd })?;
        f(&buffer.region);
        handle.end_cpu_access(dir).context(CpuAccessSnafu { fd })
    }
}
