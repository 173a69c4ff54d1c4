//! Global-Allocator Smoke Test
//!
//! Installs the allocator as the process allocator and exercises the
//! standard collections on one thread. Runs without the libtest
//! harness: the allocator requires blocks to be freed on the thread
//! that allocated them, which the threaded harness does not guarantee
//! for its own bookkeeping.

use std::collections::BTreeMap;

#[global_allocator]
static ALLOC: fmalloc::Fmalloc = fmalloc::Fmalloc;

fn main() {
    // Vec growth exercises realloc through the adapter.
    let mut v: Vec<u64> = Vec::new();
    for i in 0..100_000u64 {
        v.push(i);
    }
    assert_eq!(v.len(), 100_000);
    assert_eq!(v[99_999], 99_999);

    // String churn exercises small classes.
    let mut parts = Vec::new();
    for i in 0..1000 {
        parts.push(format!("chunk-{:05}", i));
    }
    let joined = parts.join(",");
    assert!(joined.starts_with("chunk-00000"));
    assert!(joined.ends_with("chunk-00999"));
    drop(parts);
    drop(joined);

    // BTreeMap exercises steady node-sized traffic.
    let mut map = BTreeMap::new();
    for i in 0..10_000u32 {
        map.insert(i, i * 3);
    }
    assert_eq!(map.get(&9_999), Some(&29_997));
    for i in 0..5_000u32 {
        map.remove(&i);
    }
    assert_eq!(map.len(), 5_000);
    drop(map);
    drop(v);

    if let Err(msg) = fmalloc::stats::check_invariants() {
        panic!("heap invariant violated: {}", msg);
    }
    println!("global allocator smoke test passed");
}
