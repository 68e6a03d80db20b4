//! End-to-end fault routing through the process signal handler.
//!
//! Kept in its own test binary: the handler is process-global, and the
//! access below must genuinely trap before the tracker satisfies it.

use std::sync::Arc;

use strato_common::{
    HeapTracker, HostMemory, MemoryPermission, TrackerConfig, install_fault_handler,
    uninstall_fault_handler,
};

const PAGE: u64 = 0x1000;
const RW: MemoryPermission = MemoryPermission::READ_WRITE;

#[test]
fn test_sigsegv_on_evicted_region_is_claimed_and_satisfied() {
    let buffer =
        Arc::new(HostMemory::new(64 * PAGE, 256 * PAGE).expect("failed to create host memory"));
    let tracker = Arc::new(HeapTracker::with_config(
        buffer,
        TrackerConfig {
            max_resident_maps: 2,
            evict_batch: 1,
        },
    ));
    install_fault_handler(Arc::clone(&tracker)).expect("failed to install fault handler");

    // Seed a value into the backing pages for mapping 0.
    tracker.map(0, 0, PAGE, RW, true).expect("map failed");
    let base = tracker.buffer().virtual_base_pointer();
    unsafe { base.write(0xc3) };

    // Push mapping 0 out of residency.
    tracker.map(PAGE, PAGE, PAGE, RW, true).expect("map failed");
    tracker.map(2 * PAGE, 2 * PAGE, PAGE, RW, true).expect("map failed");
    tracker.map(3 * PAGE, 3 * PAGE, PAGE, RW, true).expect("map failed");
    assert!(!tracker.query(0).expect("region missing").is_resident);

    // This read traps, the handler routes it into the tracker, the region
    // is re-installed, and the load retries against the same backing byte.
    let value = unsafe { base.read_volatile() };
    assert_eq!(value, 0xc3);
    assert!(tracker.query(0).expect("region missing").is_resident);
    assert!(
        tracker
            .stats()
            .faults_claimed
            .load(std::sync::atomic::Ordering::Relaxed)
            > 0
    );

    uninstall_fault_handler().expect("failed to uninstall fault handler");
}
