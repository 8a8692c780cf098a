//! Per-client table of open buffer descriptors.

use alloc::{collections::BTreeMap, vec::Vec};

use dmabuf::DmaBufHandle;
use snafu::OptionExt as _;
use spin::Mutex;

use crate::error::{BadDescriptorSnafu, DescriptorsExhaustedSnafu, IonError};

/// An opaque buffer descriptor, as returned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{_0}")]
pub struct Fd(u32);

impl Fd {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// Maps descriptors to buffer references.
///
/// Every open descriptor owns one reference on its buffer. New descriptors
/// take the lowest free number. Dropping the table closes everything still
/// open.
#[derive(Debug, Default)]
pub struct FdTable {
    files: Mutex<BTreeMap<Fd, DmaBufHandle>>,
}

impl FdTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `handle` and returns its new descriptor.
    pub fn install(&self, handle: DmaBufHandle) -> Result<Fd, IonError> {
        let mut files = self.files.lock();
        let fd = Self::lowest_free(&files).context(DescriptorsExhaustedSnafu)?;
        files.insert(fd, handle);
        Ok(fd)
    }

    /// Returns a new reference to the buffer behind `fd`.
    pub fn get(&self, fd: Fd) -> Result<DmaBufHandle, IonError> {
        self.files
            .lock()
            .get(&fd)
            .cloned()
            .context(BadDescriptorSnafu { fd })
    }

    /// Opens a second descriptor for the buffer behind `fd`.
    pub fn dup(&self, fd: Fd) -> Result<Fd, IonError> {
        let handle = self.get(fd)?;
        self.install(handle)
    }

    pub fn close(&self, fd: Fd) -> Result<(), IonError> {
        let handle = self
            .files
            .lock()
            .remove(&fd)
            .context(BadDescriptorSnafu { fd })?;
        handle.close();
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, fd: Fd) -> bool {
        self.files.lock().contains_key(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    fn lowest_free(files: &BTreeMap<Fd, DmaBufHandle>) -> Option<Fd> {
        let mut candidate = 0_u32;
        for fd in files.keys() {
            if fd.0 != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        Some(Fd(candidate))
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        let files = core::mem::take(self.files.get_mut());
        let handles: Vec<_> = files.into_values().collect();
        for handle in handles.into_iter().rev() {
            handle.close();
        }
    }
}
