use std::sync::{Arc, Mutex as StdMutex};
use std::vec::Vec;

use super::*;
use crate::error::HvErrorNum;
use crate::memory::addr::phys_to_pfn;
use crate::test_utils::{init_frame_pool, leak_pages};

#[derive(Default)]
struct RecordingIdmap {
    calls: StdMutex<Vec<(PhysAddr, PhysAddr, MemFlags)>>,
}

impl HostIdmap for RecordingIdmap {
    fn host_stage2_idmap(&self, start: PhysAddr, end: PhysAddr, prot: MemFlags) {
        self.calls.lock().unwrap().push((start, end, prot));
    }
}

fn host_with_ram(nr: usize) -> (HostMmu, PhysAddr) {
    let ram = leak_pages(nr);
    (HostMmu::new(&[ram..ram + nr * PAGE_SIZE]), ram)
}

#[test]
fn test_frame_alloc() {
    init_frame_pool();
    let mut frame = Frame::new_zero().unwrap();
    assert!(addr::is_aligned(frame.start_paddr()));
    assert!(frame.as_slice().iter().all(|&b| b == 0));
    frame.fill(0xa5);
    assert_eq!(frame.as_slice()[PAGE_SIZE - 1], 0xa5);

    let big = Frame::new_contiguous(8, 3).unwrap();
    assert_eq!(big.start_paddr() % (8 * PAGE_SIZE), 0);
    assert_eq!(big.size(), 8 * PAGE_SIZE);

    let (paddr, nr) = big.into_raw();
    unsafe { Frame::dealloc_raw(paddr, nr) };
}

#[test]
fn test_frame_bad_requests() {
    init_frame_pool();
    assert_eq!(
        Frame::new_contiguous(0, 0).unwrap_err().num(),
        HvErrorNum::ENOMEM
    );
    assert!(Frame::new_contiguous(1, frame::MAX_ALIGN_LOG2 + 1).is_err());

    // Frees outside the pool are dropped instead of touching the bitmap.
    unsafe { Frame::dealloc_raw(PAGE_SIZE, 1) };
    unsafe { Frame::dealloc_raw(usize::MAX & !(PAGE_SIZE - 1), 4) };

    let frame = Frame::new().unwrap();
    assert!(frame::free_frames() > 0);
    drop(frame);
}

#[test]
fn test_memcache_topup_and_drain() {
    let (host, ram) = host_with_ram(8);
    let mut host_mc = HypMemcache::new();
    for i in 0..4 {
        unsafe { host_mc.push(ram + i * PAGE_SIZE) };
    }

    let mut mc = HypMemcache::new();
    mc.topup(3, &mut host_mc, &host).unwrap();
    assert_eq!(mc.nr_pages(), 3);
    assert_eq!(host_mc.nr_pages(), 1);
    for i in 1..4 {
        assert_eq!(host.owner(ram + i * PAGE_SIZE), OwnerId::Hyp);
    }

    // Not enough left in the host cache.
    let err = mc.topup(5, &mut host_mc, &host).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::ENOMEM);
    assert_eq!(mc.nr_pages(), 4);

    let mut back = HypMemcache::new();
    mc.drain_to_host(&mut back, &host);
    assert!(mc.is_empty());
    assert_eq!(back.nr_pages(), 4);
    for i in 0..4 {
        assert_eq!(host.owner(ram + i * PAGE_SIZE), OwnerId::Host);
    }
    // LIFO order is kept across the list.
    assert_eq!(back.pop(), Some(ram + 3 * PAGE_SIZE));
}

#[test]
fn test_donation_roundtrip_clears() {
    let (host, ram) = host_with_ram(4);
    let page = ram + PAGE_SIZE;
    unsafe { (page as *mut u64).write(0x1234) };

    host.donate_host_to_hyp(phys_to_pfn(page), 1, false).unwrap();
    assert_eq!(host.owner(page), OwnerId::Hyp);
    assert_eq!(host.host_state(page), PageState::NOPAGE);
    let err = host.donate_host_to_hyp(phys_to_pfn(page), 1, false).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);

    host.donate_hyp_to_host(phys_to_pfn(page), 1).unwrap();
    assert_eq!(host.owner(page), OwnerId::Host);
    assert_eq!(unsafe { (page as *const u64).read() }, 0);
    let err = host.donate_hyp_to_host(phys_to_pfn(page), 1).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);

    unsafe { (page as *mut u64).write(0x1234) };
    host.donate_host_to_hyp(phys_to_pfn(page), 1, false).unwrap();
    host.donate_hyp_to_host_noclear(phys_to_pfn(page), 1).unwrap();
    assert_eq!(unsafe { (page as *const u64).read() }, 0x1234);
}

#[test]
fn test_donation_refuses_mmio_and_dma() {
    let (host, ram) = host_with_ram(4);
    let mmio = ram + 0x1000_0000;

    let err = host.donate_host_to_hyp(phys_to_pfn(mmio), 1, false).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);
    host.donate_host_to_hyp(phys_to_pfn(mmio), 1, true).unwrap();
    assert_eq!(host.owner(mmio), OwnerId::Hyp);

    host.use_dma(ram, 2 * PAGE_SIZE).unwrap();
    let err = host.donate_host_to_hyp(phys_to_pfn(ram), 1, false).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    host.unuse_dma(ram, 2 * PAGE_SIZE).unwrap();
    host.donate_host_to_hyp(phys_to_pfn(ram), 1, false).unwrap();

    // Hypervisor memory can't become a DMA target.
    let err = host.use_dma(ram, PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);
    let err = host.use_dma(ram + 1, PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
}

#[test]
fn test_use_dma_rolls_back() {
    let (host, ram) = host_with_ram(4);
    host.donate_host_to_hyp(phys_to_pfn(ram + 2 * PAGE_SIZE), 1, false)
        .unwrap();

    let err = host.use_dma(ram, 4 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);
    // The first two pages were released again.
    host.donate_host_to_hyp(phys_to_pfn(ram), 2, false).unwrap();
}

#[test]
fn test_share_hyp_and_pin() {
    let (host, ram) = host_with_ram(4);
    let pfn = phys_to_pfn(ram);

    host.host_share_hyp(pfn).unwrap();
    assert_eq!(host.host_state(ram), PageState::SHARED_OWNED);
    let err = host.use_dma(ram, PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);

    host.pin_shared_mem(ram + 8, ram + 64).unwrap();
    let err = host.host_unshare_hyp(pfn).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EBUSY);
    host.unpin_shared_mem(ram + 8, ram + 64);
    host.host_unshare_hyp(pfn).unwrap();
    assert_eq!(host.host_state(ram), PageState::OWNED);

    // Pinning requires the page to be shared first.
    let err = host.pin_shared_mem(ram, ram + PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EBUSY);
}

#[test]
fn test_idmap_notifications() {
    let (host, ram) = host_with_ram(8);
    let idmap = Arc::new(RecordingIdmap::default());
    let sink: Arc<dyn HostIdmap> = idmap.clone();
    host.set_idmap(Arc::downgrade(&sink));

    host.donate_host_to_hyp(phys_to_pfn(ram), 2, false).unwrap();
    host.donate_hyp_to_host(phys_to_pfn(ram), 2).unwrap();
    {
        let mut inner = host.lock();
        inner.donate_to_guest(ram + 4 * PAGE_SIZE, PAGE_SIZE).unwrap();
        inner
            .accept_guest_share(ram + 4 * PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        inner
            .accept_guest_unshare(ram + 4 * PAGE_SIZE, PAGE_SIZE)
            .unwrap();
    }

    let calls = idmap.calls.lock().unwrap().clone();
    let page4 = ram + 4 * PAGE_SIZE;
    assert_eq!(
        calls,
        [
            (ram, ram + 2 * PAGE_SIZE, MemFlags::empty()),
            (ram, ram + 2 * PAGE_SIZE, MemFlags::RW),
            (page4, page4 + PAGE_SIZE, MemFlags::empty()),
            (page4, page4 + PAGE_SIZE, MemFlags::RW),
            (page4, page4 + PAGE_SIZE, MemFlags::empty()),
        ]
    );

    let ranges = host.snapshot().ranges();
    assert_eq!(
        ranges,
        [
            (ram, page4, MemFlags::RW),
            (page4 + PAGE_SIZE, ram + 8 * PAGE_SIZE, MemFlags::RW),
        ]
    );
}

#[test]
fn test_guest_host_legs() {
    let (host, ram) = host_with_ram(4);
    let mut inner = host.lock();

    inner.share_with_guest(ram, PAGE_SIZE).unwrap();
    assert_eq!(inner.host_state(ram), PageState::SHARED_OWNED);
    let err = inner.donate_to_guest(ram, PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);
    inner.unshare_from_guest(ram, PAGE_SIZE).unwrap();
    assert_eq!(inner.host_state(ram), PageState::OWNED);

    // Only pages the guest owns can be shared back by it.
    let err = inner.accept_guest_share(ram, PAGE_SIZE).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);
    assert!(inner.check_state_range(ram, 2 * PAGE_SIZE, PageState::OWNED).is_ok());
    let err = inner
        .check_state_range(ram + 3 * PAGE_SIZE, 2 * PAGE_SIZE, PageState::OWNED)
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
}

#[test]
fn test_mmio_access_decode() {
    // str w2, [x1] from EL1: ISV, SAS=2, SRT=2, WnR.
    let esr = (ESR_EC_DABT_LOW << 26) | (1 << 25) | (1 << 24) | (2 << 22) | (2 << 16) | (1 << 6);
    let access = MMIOAccess::from_esr(esr, 0x9000_0ffe).unwrap();
    assert_eq!(access.size, 4);
    assert!(access.is_write);
    assert_eq!(access.reg, 2);
    assert!(!access.sixty_four);
    assert_eq!(access.end(), 0x9000_1001);

    // No syndrome information.
    assert_eq!(MMIOAccess::from_esr(ESR_EC_DABT_LOW << 26, 0x9000_0000), None);
    // Instruction abort.
    assert_eq!(MMIOAccess::from_esr((0x20 << 26) | (1 << 24), 0), None);
}
