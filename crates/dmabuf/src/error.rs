//! Errors reported by buffer objects, attachments, and their exporters.

use alloc::{collections::TryReserveError, string::String};
use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::{device::DmaMapError, vma::RemapError};

/// Source location captured when an error is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Coarse classification of every error the exporter can report.
///
/// Callers that only need to decide between retrying with a smaller request
/// and giving up should match on this rather than on the concrete error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::IsVariant)]
pub enum ErrorKind {
    #[display("invalid argument")]
    InvalidArgument,
    #[display("out of memory")]
    OutOfMemory,
    #[display("unsupported operation")]
    UnsupportedOperation,
    #[display("I/O error")]
    Io,
    #[display("bad address")]
    BadAddress,
    #[display("invalid object state")]
    InvalidState,
}

impl ErrorKind {
    /// Returns the positive errno value reported for this kind.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => 22,      // EINVAL
            Self::OutOfMemory => 12,          // ENOMEM
            Self::UnsupportedOperation => 25, // ENOTTY
            Self::Io => 5,                    // EIO
            Self::BadAddress => 14,           // EFAULT
            Self::InvalidState => 9,          // EBADF
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DmaBufError {
    #[snafu(display("buffer size is zero after rounding up to the page boundary"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("requested size {requested:#x} cannot be rounded up to a page boundary"))]
    SizeOverflow {
        requested: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate page metadata for {count} pages"))]
    AllocMetadata {
        count: usize,
        #[snafu(source)]
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate physical page {index} of {count}"))]
    AllocPage {
        index: usize,
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate scatter/gather table with {nents} entries"))]
    AllocTable {
        nents: usize,
        #[snafu(source)]
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to map scatter/gather entry {index} for device `{device}`"))]
    DmaMap {
        device: String,
        index: usize,
        #[snafu(source)]
        source: DmaMapError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region of {actual:#x} bytes does not cover buffer of {expected:#x} bytes"))]
    VmaSize {
        expected: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to map page {index} into the address space"))]
    Remap {
        index: usize,
        #[snafu(source)]
        source: RemapError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("attachment already has a live scatter/gather table"))]
    AlreadyMapped {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("attachment has no live scatter/gather table"))]
    NotMapped {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("attachment is not registered with this buffer"))]
    NotAttached {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer has already been released"))]
    Released {
        #[snafu(implicit)]
        location: Location,
    },
}

impl DmaBufError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ZeroSize { .. } | Self::SizeOverflow { .. } | Self::VmaSize { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::AllocMetadata { .. } | Self::AllocPage { .. } | Self::AllocTable { .. } => {
                ErrorKind::OutOfMemory
            }
            Self::DmaMap { source, .. } => source.kind(),
            Self::Remap { source, .. } => source.kind(),
            Self::AlreadyMapped { .. }
            | Self::NotMapped { .. }
            | Self::NotAttached { .. }
            | Self::Released { .. } => ErrorKind::InvalidState,
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::ZeroSize { location }
            | Self::SizeOverflow { location, .. }
            | Self::AllocMetadata { location, .. }
            | Self::AllocPage { location, .. }
            | Self::AllocTable { location, .. }
            | Self::DmaMap { location, .. }
            | Self::VmaSize { location, .. }
            | Self::Remap { location, .. }
            | Self::AlreadyMapped { location }
            | Self::NotMapped { location }
            | Self::NotAttached { location }
            | Self::Released { location } => *location,
        }
    }
}
