#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{sync::Barrier, thread};

use brk_heap::{Heap, HeapConfig, HeapPtr};

const THREADS: usize = 8;

fn test_heap() -> Heap {
    let heap = Heap::new(HeapConfig::new().with_pages(4096).with_guard_seed(2));
    heap.setup().unwrap();
    heap
}

#[test]
fn allocate_then_release_from_many_threads() {
    let heap = test_heap();
    let before = heap.stats().used_count;

    let blocks = thread::scope(|s| {
        let handles = (0..THREADS)
            .map(|i| {
                let heap = &heap;
                s.spawn(move || {
                    let size = 100 * (i + 1);
                    let ptr = heap.allocate(size).unwrap();
                    let tag = u8::try_from(i).unwrap();
                    heap.write_bytes(ptr, tag, size).unwrap();
                    (ptr, size, tag)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(heap.stats().used_count, before + THREADS);
    let mut ranges = blocks
        .iter()
        .map(|&(ptr, size, _)| (ptr.addr(), ptr.addr() + size))
        .collect::<Vec<_>>();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{pair:x?} overlap");
    }
    for &(ptr, size, tag) in &blocks {
        assert!(heap.to_vec(ptr, size).unwrap().iter().all(|&b| b == tag));
    }
    heap.validate().unwrap();

    thread::scope(|s| {
        for &(ptr, _, _) in &blocks {
            let heap = &heap;
            s.spawn(move || heap.release(ptr));
        }
    });

    assert_eq!(heap.stats().used_count, before);
    heap.validate().unwrap();
}

#[test]
fn mixed_operations_keep_heap_consistent() {
    let heap = test_heap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for i in 0..THREADS {
            let heap = &heap;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let mut live: Vec<HeapPtr> = Vec::new();
                for round in 0..200 {
                    let size = (i * 37 + round * 13) % 2000 + 1;
                    let ptr = match round % 4 {
                        0 => heap.allocate(size),
                        1 => heap.fill(size, 1),
                        2 => live.pop().map(|ptr| heap.resize(ptr, size).unwrap()),
                        _ => heap.allocate(size),
                    };
                    if let Some(ptr) = ptr {
                        live.push(ptr);
                    }
                    if round % 3 == 0 {
                        heap.release(live.pop());
                    }
                }
                for ptr in live {
                    heap.release(ptr);
                }
            });
        }
    });

    heap.validate().unwrap();
    assert_eq!(heap.stats().used_count, 0);
}
