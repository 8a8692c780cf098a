use alloc::{collections::BTreeSet, vec, vec::Vec};

use platform_cast::CastInto;
use spin::Mutex;

use crate::mm::{PAGE_SIZE, Page, PagePool, PhysPageNum};

const DEFAULT_BASE: PhysPageNum = PhysPageNum::new(0x8_0000);

/// A fixed-size pool of frames backed by heap memory.
///
/// Frames are handed out lowest-first, so a fresh pool returns physically
/// adjacent pages in ascending order.
#[derive(Debug)]
pub struct MockPagePool {
    base: PhysPageNum,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    frames: Vec<Vec<u8>>,
    free: BTreeSet<usize>,
    remaining_allocs: Option<usize>,
    free_calls: usize,
}

impl MockPagePool {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self::with_base(frames, DEFAULT_BASE)
    }

    #[must_use]
    pub fn with_base(frames: usize, base: PhysPageNum) -> Self {
        Self {
            base,
            state: Mutex::new(PoolState {
                frames: (0..frames).map(|_| vec![0; PAGE_SIZE]).collect(),
                free: (0..frames).collect(),
                remaining_allocs: None,
                free_calls: 0,
            }),
        }
    }

    /// Lets the next `count` allocations succeed and fails every one after.
    pub fn fail_after(&self, count: usize) {
        self.state.lock().remaining_allocs = Some(count);
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        let state = self.state.lock();
        state.frames.len() - state.free.len()
    }

    /// Returns how many times [`PagePool::free_page`] has been called.
    #[must_use]
    pub fn free_calls(&self) -> usize {
        self.state.lock().free_calls
    }

    #[must_use]
    pub fn is_allocated(&self, pfn: PhysPageNum) -> bool {
        let state = self.state.lock();
        self.index_of(pfn)
            .is_some_and(|index| index < state.frames.len() && !state.free.contains(&index))
    }

    /// Copies frame bytes starting at `offset` into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the frame or the frame is not in the pool.
    pub fn read(&self, pfn: PhysPageNum, offset: usize, buf: &mut [u8]) {
        let state = self.state.lock();
        let frame = &state.frames[self.frame_index(pfn)];
        buf.copy_from_slice(&frame[offset..offset + buf.len()]);
    }

    /// Copies `data` into the frame starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the frame or the frame is not in the pool.
    pub fn write(&self, pfn: PhysPageNum, offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        let index = self.frame_index(pfn);
        state.frames[index][offset..offset + data.len()].copy_from_slice(data);
    }

    fn index_of(&self, pfn: PhysPageNum) -> Option<usize> {
        pfn.value()
            .checked_sub(self.base.value())
            .map(CastInto::cast_into)
    }

    fn frame_index(&self, pfn: PhysPageNum) -> usize {
        self.index_of(pfn)
            .unwrap_or_else(|| panic!("frame {pfn:#x} is not part of the pool"))
    }
}

impl PagePool for MockPagePool {
    fn alloc_page(&self) -> Option<Page> {
        let mut state = self.state.lock();
        if let Some(remaining) = &mut state.remaining_allocs {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let index = state.free.pop_first()?;
        let pfn = self.base.checked_add(index)?;
        // SAFETY: `index` was just removed from the free set, so no other
        // `Page` for this frame exists.
        Some(unsafe { Page::from_raw(pfn) })
    }

    fn free_page(&self, page: Page) {
        let pfn = page.into_raw();
        let index = self.frame_index(pfn);
        let mut state = self.state.lock();
        assert!(index < state.frames.len(), "frame {pfn:#x} is not part of the pool");
        assert!(state.free.insert(index), "frame {pfn:#x} freed twice");
        state.free_calls += 1;
    }
}
