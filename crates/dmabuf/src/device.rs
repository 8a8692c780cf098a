//! Devices that consume buffers through DMA.

use core::fmt;

use snafu::Snafu;

use crate::{error::ErrorKind, mm::PhysPageNum};

/// Direction of a DMA transfer, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::IsVariant)]
pub enum DmaDirection {
    /// The device reads buffer memory (memory to device).
    #[display("device-read")]
    DeviceRead,
    /// The device writes buffer memory (device to memory).
    #[display("device-write")]
    DeviceWrite,
    #[display("bidirectional")]
    Bidirectional,
}

impl DmaDirection {
    #[must_use]
    pub fn device_reads(self) -> bool {
        matches!(self, Self::DeviceRead | Self::Bidirectional)
    }

    #[must_use]
    pub fn device_writes(self) -> bool {
        matches!(self, Self::DeviceWrite | Self::Bidirectional)
    }
}

/// Device-visible bus address of a mapped span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DmaAddr(u64);

impl fmt::LowerHex for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl DmaAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum DmaMapError {
    #[snafu(display("page {pfn:#x} is not addressable under DMA mask {mask:#x}"))]
    OutsideMask { pfn: PhysPageNum, mask: u64 },
    #[snafu(display("device address space exhausted"))]
    AddressSpaceExhausted,
    #[snafu(display("device rejected the mapping: {reason}"))]
    DeviceFault { reason: &'static str },
}

impl DmaMapError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AddressSpaceExhausted => ErrorKind::OutOfMemory,
            Self::OutsideMask { .. } | Self::DeviceFault { .. } => ErrorKind::Io,
        }
    }
}

/// A device context that buffers can be attached to.
///
/// Implementations translate page frames into device-visible addresses and
/// perform the cache maintenance needed around CPU access. Every mapping made
/// with [`map_page`](Self::map_page) is undone by exactly one
/// [`unmap_page`](Self::unmap_page) with the same address, length, and
/// direction.
pub trait DmaDevice: Send + Sync {
    fn name(&self) -> &str;

    fn map_page(
        &self,
        pfn: PhysPageNum,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> Result<DmaAddr, DmaMapError>;

    fn unmap_page(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Makes device writes to `addr..addr + len` visible to the CPU.
    fn sync_for_cpu(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Makes CPU writes to `addr..addr + len` visible to the device.
    fn sync_for_device(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
}
