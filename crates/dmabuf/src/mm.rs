//! Page frames and the physical page pool they come from.

use alloc::vec::Vec;
use core::fmt;

use platform_cast::CastFrom as _;
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::error::{
    AllocMetadataSnafu, AllocPageSnafu, DmaBufError, SizeOverflowSnafu, ZeroSizeSnafu,
};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

pub trait Align: Sized {
    fn checked_align_up(&self, align: usize) -> Option<Self>;
    fn is_aligned(&self, align: usize) -> bool;

    fn checked_page_align_up(&self) -> Option<Self> {
        self.checked_align_up(PAGE_SIZE)
    }

    fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }
}

impl Align for usize {
    fn checked_align_up(&self, align: usize) -> Option<Self> {
        self.checked_next_multiple_of(align)
    }

    fn is_aligned(&self, align: usize) -> bool {
        self.is_multiple_of(align)
    }
}

impl Align for u64 {
    fn checked_align_up(&self, align: usize) -> Option<Self> {
        self.checked_next_multiple_of(Self::cast_from(align))
    }

    fn is_aligned(&self, align: usize) -> bool {
        self.is_multiple_of(Self::cast_from(align))
    }
}

/// Physical page frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysPageNum(u64);

impl fmt::LowerHex for PhysPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl PhysPageNum {
    #[must_use]
    pub const fn new(page_num: u64) -> Self {
        Self(page_num)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the physical address of the first byte of this page.
    #[must_use]
    pub fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    #[must_use]
    pub fn checked_add(self, pages: usize) -> Option<Self> {
        self.0.checked_add(u64::cast_from(pages)).map(Self)
    }
}

/// Ownership token for one physical page frame.
///
/// A `Page` is not `Clone`: whoever holds it owns the frame, and handing it
/// back to [`PagePool::free_page`] consumes it. Exactly one owner therefore
/// frees each frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Page {
    pfn: PhysPageNum,
}

impl Page {
    /// Wraps a raw frame number into an ownership token.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the frame `pfn`, and no other `Page`
    /// for the same frame may exist.
    #[must_use]
    pub unsafe fn from_raw(pfn: PhysPageNum) -> Self {
        Self { pfn }
    }

    #[must_use]
    pub fn pfn(&self) -> PhysPageNum {
        self.pfn
    }

    /// Gives up ownership of the frame, returning its number.
    #[must_use]
    pub fn into_raw(self) -> PhysPageNum {
        self.pfn
    }
}

/// Host allocator of page-sized physical frames.
///
/// Frame contents are not guaranteed to be zeroed.
pub trait PagePool: Send + Sync {
    /// Allocates one frame, or returns `None` if the pool is exhausted.
    fn alloc_page(&self) -> Option<Page>;

    /// Returns a frame to the pool.
    fn free_page(&self, page: Page);
}

/// Rounds `requested` up to the page boundary.
///
/// The result is non-zero and addressable as a `usize`.
pub fn page_align_size(requested: u64) -> Result<usize, DmaBufError> {
    let rounded = requested
        .checked_page_align_up()
        .and_then(|rounded| usize::try_from(rounded).ok())
        .context(SizeOverflowSnafu { requested })?;
    ensure!(rounded != 0, ZeroSizeSnafu);
    Ok(rounded)
}

/// Returns the number of pages needed to back `requested` bytes.
pub fn page_count(requested: u64) -> Result<usize, DmaBufError> {
    Ok(page_align_size(requested)? >> PAGE_SHIFT)
}

/// Allocates `count` frames from `pool`.
///
/// Either every frame is allocated or none is: on failure, the frames
/// acquired so far are returned to the pool before the error is reported.
pub fn alloc_pages(pool: &dyn PagePool, count: usize) -> Result<Vec<Page>, DmaBufError> {
    let mut pages = Vec::new();
    pages
        .try_reserve_exact(count)
        .context(AllocMetadataSnafu { count })?;

    for index in 0..count {
        let Some(page) = pool.alloc_page() else {
            debug!("page allocation failed at {index}/{count}, rolling back");
            free_pages(pool, pages);
            return AllocPageSnafu { index, count }.fail();
        };
        pages.push(page);
    }

    Ok(pages)
}

/// Returns every frame in `pages` to `pool`, last allocated first.
pub fn free_pages(pool: &dyn PagePool, pages: Vec<Page>) {
    for page in pages.into_iter().rev() {
        pool.free_page(page);
    }
}
