use dmabuf::{
    DmaBufError, ErrorKind,
    error::Location,
};
use snafu::Snafu;

use crate::fd_table::Fd;

/// Errors reported by the allocation control plane and its clients.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum IonError {
    #[snafu(display("failed to allocate a buffer of {requested:#x} bytes"))]
    Allocate {
        requested: u64,
        #[snafu(source)]
        source: DmaBufError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to map buffer {fd} into the address space"))]
    Mmap {
        fd: Fd,
        #[snafu(source)]
        source: DmaBufError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to synchronize buffer {fd} for CPU access"))]
    CpuAccess {
        fd: Fd,
        #[snafu(source)]
        source: DmaBufError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("ioctl {cmd:#x} is not supported"))]
    UnsupportedCommand {
        cmd: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("ioctl payload of {len} bytes is shorter than {needed} bytes"))]
    ShortPayload {
        len: usize,
        needed: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("descriptor {fd} is not open"))]
    BadDescriptor {
        fd: Fd,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free descriptor"))]
    DescriptorsExhausted {
        #[snafu(implicit)]
        location: Location,
    },
}

impl IonError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocate { source, .. }
            | Self::Mmap { source, .. }
            | Self::CpuAccess { source, .. } => source.kind(),
            Self::UnsupportedCommand { .. } => ErrorKind::UnsupportedOperation,
            Self::ShortPayload { .. } => ErrorKind::BadAddress,
            Self::BadDescriptor { .. } => ErrorKind::InvalidState,
            Self::DescriptorsExhausted { .. } => ErrorKind::OutOfMemory,
        }
    }

    /// Returns the positive errno value the control plane reports.
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.kind().errno()
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Allocate { location, .. }
            | Self::Mmap { location, .. }
            | Self::CpuAccess { location, .. }
            | Self::UnsupportedCommand { location, .. }
            | Self::ShortPayload { location, .. }
            | Self::BadDescriptor { location, .. }
            | Self::DescriptorsExhausted { location } => *location,
        }
    }
}
