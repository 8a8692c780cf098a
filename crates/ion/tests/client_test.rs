#![cfg(test)]

use std::sync::Arc;

use dmabuf::{
    DmaDirection, PagePool,
    testing::{MockDevice, MockPagePool, MockVmArea},
};
use ion::{
    FdTable, ION_IOC_ALLOC, IonConfig, IonDevice, IonError, IonMemory, client::ACCEL_PAGE_SIZE,
};

fn setup(frames: usize) -> (Arc<MockPagePool>, IonDevice) {
    let pool = Arc::new(MockPagePool::new(frames));
    let config = IonConfig::default().with_device_name("ion0");
    let device = IonDevice::new(config, Arc::clone(&pool) as Arc<dyn PagePool>);
    (pool, device)
}

#[test]
fn test_allocate_map_and_free() {
    let (pool, device) = setup(8);
    let memory = IonMemory::open(&device);

    let buffer = memory
        .allocate_buffer(10000, |len| MockVmArea::new(&pool, 0x4000_0000, len))
        .unwrap();
    assert_eq!(buffer.len(), 12288);
    assert_eq!(buffer.offset(), 0);
    assert_eq!(buffer.region().mappings().len(), 3);
    assert!(memory.files().contains(buffer.fd()));
    assert_eq!(pool.allocated_count(), 3);

    memory.free_buffer(buffer).unwrap();
    assert!(memory.files().is_empty());
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn test_size_is_rounded_to_accelerator_pages() {
    let (pool, device) = setup(8);
    let memory = IonMemory::open(&device);

    let buffer = memory
        .allocate_buffer(1, |len| MockVmArea::new(&pool, 0x4000_0000, len))
        .unwrap();
    assert_eq!(buffer.len(), ACCEL_PAGE_SIZE);
    memory.free_buffer(buffer).unwrap();
}

#[test]
fn test_copy_round_trip() {
    let (pool, device) = setup(8);
    let memory = IonMemory::open(&device);
    let buffer = memory
        .allocate_buffer(2 * 4096, |len| MockVmArea::new(&pool, 0x4000_0000, len))
        .unwrap();

    memory.copy_to_buffer(&buffer, 4000, b"host data").unwrap();
    let mut out = [0; 9];
    memory.copy_from_buffer(&buffer, 4000, &mut out).unwrap();
    assert_eq!(&out, b"host data");
    memory.free_buffer(buffer).unwrap();
}

#[test]
fn test_copies_reach_attached_devices() {
    let (pool, device) = setup(8);
    let memory = IonMemory::open(&device);
    let buffer = memory
        .allocate_buffer(4096, |len| MockVmArea::new(&pool, 0x4000_0000, len))
        .unwrap();

    let nic = Arc::new(MockDevice::new("nic0", &pool));
    let handle = memory.handle(buffer.fd()).unwrap();
    let attachment = handle.attach(Arc::clone(&nic) as _).unwrap();
    attachment.map(DmaDirection::Bidirectional).unwrap();
    let addr = nic.mapped_addresses()[0];
    nic.clear_syncs();

    memory.copy_to_buffer(&buffer, 0, b"payload").unwrap();
    let mut seen = [0; 7];
    nic.device_read(addr, 0, &mut seen);
    assert_eq!(&seen, b"payload");

    nic.device_write(addr, 0, b"reply");
    let mut reply = [0; 5];
    memory.copy_from_buffer(&buffer, 0, &mut reply).unwrap();
    assert_eq!(&reply, b"reply");
    assert_eq!(nic.syncs().len(), 4);

    handle.detach(&attachment).unwrap();
    drop(handle);
    memory.free_buffer(buffer).unwrap();
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn test_failed_mmap_closes_descriptor() {
    let (pool, device) = setup(8);
    let memory = IonMemory::open(&device);

    let err = memory
        .allocate_buffer(3 * 4096, |len| {
            let mut vma = MockVmArea::new(&pool, 0x4000_0000, len);
            vma.fail_at_page(2);
            vma
        })
        .unwrap_err();
    assert!(matches!(err, IonError::Mmap { .. }));
    assert!(err.kind().is_out_of_memory());
    assert!(memory.files().is_empty());
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn test_closing_session_releases_buffers() {
    let (pool, device) = setup(8);
    {
        let memory = IonMemory::open(&device);
        let a = memory
            .allocate_buffer(4096, |len| MockVmArea::new(&pool, 0x4000_0000, len))
            .unwrap();
        let _b = memory
            .allocate_buffer(4096, |len| MockVmArea::new(&pool, 0x5000_0000, len))
            .unwrap();
        memory.files().dup(a.fd()).unwrap();
        assert_eq!(memory.files().len(), 3);
        assert_eq!(pool.allocated_count(), 2);
    }
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn test_descriptor_outlives_its_dup() {
    let (pool, device) = setup(4);
    let files = FdTable::new();
    let mut payload = [0_u8; 24];
    payload[..8].copy_from_slice(&4096_u64.to_ne_bytes());

    device.ioctl(&files, ION_IOC_ALLOC, &mut payload).unwrap();
    let fd = ion::Fd::new(u32::from_ne_bytes(payload[16..20].try_into().unwrap()));
    let dup = files.dup(fd).unwrap();

    files.close(fd).unwrap();
    assert_eq!(pool.allocated_count(), 1);
    let handle = files.get(dup).unwrap();
    assert_eq!(handle.size(), 4096);
    drop(handle);

    files.close(dup).unwrap();
    assert_eq!(pool.allocated_count(), 0);
    let err = files.close(dup).unwrap_err();
    assert!(err.kind().is_invalid_state());
}
