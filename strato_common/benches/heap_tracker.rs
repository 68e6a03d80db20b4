//! Residency tracker throughput under eviction pressure.

use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;

use strato_common::{HeapTracker, HostMemory, MemoryPermission, TrackerConfig};

const PAGE: u64 = 0x1000;

fn bench_fault_in(c: &mut Criterion) {
    let buffer = Arc::new(HostMemory::new(512 * PAGE, 4096 * PAGE).expect("host memory"));
    let tracker = HeapTracker::with_config(
        buffer,
        TrackerConfig {
            max_resident_maps: 64,
            evict_batch: 4,
        },
    );

    // A working set twice the resident cap; rotating faults keep the
    // evictor busy at steady state.
    const MAPPINGS: u64 = 128;
    for i in 0..MAPPINGS {
        tracker
            .map(i * PAGE, (i % 512) * PAGE, PAGE, MemoryPermission::READ_WRITE, true)
            .expect("map failed");
    }

    let mut next = 0u64;
    c.bench_function("fault_in_with_eviction_pressure", |b| {
        b.iter(|| {
            tracker.fault_in(next * PAGE);
            next = (next + 1) % MAPPINGS;
        })
    });
}

fn bench_map_unmap(c: &mut Criterion) {
    let buffer = Arc::new(HostMemory::new(512 * PAGE, 4096 * PAGE).expect("host memory"));
    let tracker = HeapTracker::new(buffer);

    c.bench_function("map_unmap_separate_heap", |b| {
        b.iter(|| {
            tracker
                .map(2048 * PAGE, 0, PAGE, MemoryPermission::READ_WRITE, true)
                .expect("map failed");
            tracker.unmap(2048 * PAGE, PAGE, true).expect("unmap failed");
        })
    });
}

criterion_group!(benches, bench_fault_in, bench_map_unmap);
criterion_main!(benches);
