use alloc::{
    borrow::ToOwned as _,
    collections::BTreeMap,
    string::String,
    sync::Arc,
    vec,
    vec::Vec,
};

use platform_cast::{CastFrom as _, CastInto as _};
use spin::Mutex;

use crate::{
    device::{DmaAddr, DmaDevice, DmaDirection, DmaMapError},
    mm::{Align as _, PAGE_SIZE, PhysPageNum},
    testing::MockPagePool,
};

const IOVA_BASE: u64 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum SyncKind {
    ForCpu,
    ForDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRecord {
    pub kind: SyncKind,
    pub addr: DmaAddr,
    pub len: usize,
    pub dir: DmaDirection,
}

#[derive(Debug)]
struct Mapping {
    pfn: PhysPageNum,
    offset: usize,
    dir: DmaDirection,
    shadow: Vec<u8>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_iova: u64,
    mappings: BTreeMap<DmaAddr, Mapping>,
    maps_before_fault: Option<usize>,
    mapping_limit: Option<usize>,
    syncs: Vec<SyncRecord>,
}

/// A DMA-capable device with a private, non-coherent view of memory.
///
/// Mapping a span snapshots its bytes into a device-side copy. The device
/// reads and writes only that copy; the sync calls move data between it and
/// the pool according to the transfer direction. Only spans the device has
/// written are copied back to the pool.
#[derive(Debug)]
pub struct MockDevice {
    name: String,
    pool: Arc<MockPagePool>,
    dma_mask: u64,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    #[must_use]
    pub fn new(name: &str, pool: &Arc<MockPagePool>) -> Self {
        Self {
            name: name.to_owned(),
            pool: Arc::clone(pool),
            dma_mask: u64::MAX,
            state: Mutex::new(DeviceState {
                next_iova: IOVA_BASE,
                ..DeviceState::default()
            }),
        }
    }

    /// Restricts the physical addresses the device can reach.
    #[must_use]
    pub fn with_dma_mask(mut self, mask: u64) -> Self {
        self.dma_mask = mask;
        self
    }

    /// Lets the next `count` page mappings succeed and faults every one after.
    pub fn fail_map_after(&self, count: usize) {
        self.state.lock().maps_before_fault = Some(count);
    }

    /// Caps the number of simultaneously live mappings.
    pub fn limit_mappings(&self, limit: usize) {
        self.state.lock().mapping_limit = Some(limit);
    }

    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    #[must_use]
    pub fn syncs(&self) -> Vec<SyncRecord> {
        self.state.lock().syncs.clone()
    }

    pub fn clear_syncs(&self) {
        self.state.lock().syncs.clear();
    }

    /// Returns the addresses of the live mappings, lowest first.
    #[must_use]
    pub fn mapped_addresses(&self) -> Vec<DmaAddr> {
        self.state.lock().mappings.keys().copied().collect()
    }

    /// Returns the frame mapped at `addr`, if any.
    #[must_use]
    pub fn mapped_frame(&self, addr: DmaAddr) -> Option<PhysPageNum> {
        self.state.lock().mappings.get(&addr).map(|m| m.pfn)
    }

    /// Returns the number of bytes of address space handed out so far.
    #[must_use]
    pub fn iova_used(&self) -> usize {
        (self.state.lock().next_iova - IOVA_BASE).cast_into()
    }

    /// Reads from the device's copy of the span mapped at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if nothing is mapped at `addr`.
    pub fn device_read(&self, addr: DmaAddr, offset: usize, buf: &mut [u8]) {
        let state = self.state.lock();
        let mapping = Self::mapping(&state, addr);
        buf.copy_from_slice(&mapping.shadow[offset..offset + buf.len()]);
    }

    /// Writes to the device's copy of the span mapped at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if nothing is mapped at `addr`, or if the span was mapped
    /// device-read only.
    pub fn device_write(&self, addr: DmaAddr, offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        let mapping = Self::mapping_mut(&mut state, addr);
        assert!(
            mapping.dir.device_writes(),
            "device write to {addr:#x} mapped {}",
            mapping.dir,
        );
        mapping.shadow[offset..offset + data.len()].copy_from_slice(data);
        mapping.dirty = true;
    }

    fn mapping(state: &DeviceState, addr: DmaAddr) -> &Mapping {
        state
            .mappings
            .get(&addr)
            .unwrap_or_else(|| panic!("no mapping at {addr:#x}"))
    }

    fn mapping_mut(state: &mut DeviceState, addr: DmaAddr) -> &mut Mapping {
        state
            .mappings
            .get_mut(&addr)
            .unwrap_or_else(|| panic!("no mapping at {addr:#x}"))
    }

    fn write_back(&self, mapping: &mut Mapping) {
        if mapping.dirty {
            self.pool.write(mapping.pfn, mapping.offset, &mapping.shadow);
            mapping.dirty = false;
        }
    }

    fn refresh(&self, mapping: &mut Mapping) {
        self.pool
            .read(mapping.pfn, mapping.offset, &mut mapping.shadow);
    }
}

impl DmaDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn map_page(
        &self,
        pfn: PhysPageNum,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> Result<DmaAddr, DmaMapError> {
        let mut state = self.state.lock();
        if let Some(remaining) = &mut state.maps_before_fault {
            if *remaining == 0 {
                return Err(DmaMapError::DeviceFault {
                    reason: "injected mapping fault",
                });
            }
            *remaining -= 1;
        }
        if state
            .mapping_limit
            .is_some_and(|limit| state.mappings.len() >= limit)
        {
            return Err(DmaMapError::AddressSpaceExhausted);
        }
        let last = pfn.phys_addr() + u64::cast_from(offset + len) - 1;
        if last > self.dma_mask {
            return Err(DmaMapError::OutsideMask {
                pfn,
                mask: self.dma_mask,
            });
        }

        let addr = DmaAddr::new(state.next_iova);
        let span = len.checked_page_align_up().unwrap_or(PAGE_SIZE);
        state.next_iova += u64::cast_from(span);

        let mut mapping = Mapping {
            pfn,
            offset,
            dir,
            shadow: vec![0; len],
            dirty: false,
        };
        self.refresh(&mut mapping);
        state.mappings.insert(addr, mapping);
        Ok(addr)
    }

    fn unmap_page(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        let mut state = self.state.lock();
        let mut mapping = state
            .mappings
            .remove(&addr)
            .unwrap_or_else(|| panic!("unmap of unknown address {addr:#x}"));
        assert_eq!(mapping.shadow.len(), len, "unmap length mismatch at {addr:#x}");
        assert_eq!(mapping.dir, dir, "unmap direction mismatch at {addr:#x}");
        if dir.device_writes() {
            self.write_back(&mut mapping);
        }
    }

    fn sync_for_cpu(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        let mut state = self.state.lock();
        state.syncs.push(SyncRecord {
            kind: SyncKind::ForCpu,
            addr,
            len,
            dir,
        });
        let mapping = Self::mapping_mut(&mut state, addr);
        if dir.device_writes() {
            self.write_back(mapping);
        }
    }

    fn sync_for_device(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        let mut state = self.state.lock();
        state.syncs.push(SyncRecord {
            kind: SyncKind::ForDevice,
            addr,
            len,
            dir,
        });
        let mapping = Self::mapping_mut(&mut state, addr);
        if dir.device_reads() {
            self.refresh(mapping);
        }
    }
}
