//! Index behavior at scale: interpolation lookups, merge cycles.

mod common;

use aardwarc::index;
use rand::prelude::*;
use sha2::{Digest, Sha256};

use common::archive;

fn key_of(i: u32) -> String {
    hex::encode(Sha256::digest(i.to_le_bytes()))[..32].to_owned()
}

fn lookup(aa: &aardwarc::Archive, key: &str) -> Vec<index::Entry> {
    let mut out = Vec::new();
    index::iter(aa, Some(key), &mut |e| {
        out.push(e.clone());
        Ok(false)
    })
    .unwrap();
    out
}

#[test]
fn interpolation_over_bulk_inserts() {
    let (_t, aa) = archive(&[], &[]);
    const N: u32 = 100_000;
    for i in 0..N {
        index::insert(&aa, &key_of(i), index::F_RESOURCE, i / 1000, u64::from(i) * 32, None)
            .unwrap();
    }
    index::resort(&aa).unwrap();

    // Every sampled key resolves through the bucket seek to exactly its
    // entry, with the right location attached.
    let mut rng = StdRng::seed_from_u64(0x4161);
    for _ in 0..1000 {
        let i = rng.gen_range(0..N);
        let hits = lookup(&aa, &key_of(i));
        assert_eq!(hits.len(), 1, "key {i}");
        assert_eq!(hits[0].silo, i / 1000);
        assert_eq!(hits[0].offset, u64::from(i) * 32);
    }

    // Absent keys resolve to nothing.
    for _ in 0..100 {
        let i = rng.gen_range(N..2 * N);
        assert!(lookup(&aa, &key_of(i)).is_empty());
    }

    // Full enumeration sees each entry exactly once, in key order.
    let mut count = 0u32;
    let mut prev = String::new();
    index::iter(&aa, None, &mut |e| {
        assert!(e.key > prev, "sorted order violated");
        prev = e.key.clone();
        count += 1;
        Ok(false)
    })
    .unwrap();
    assert_eq!(count, N);
}

#[test]
fn entries_remain_visible_across_merge_cycles() {
    let (_t, aa) = archive(&[], &[]);
    for round in 0u32..4 {
        for i in round * 250..(round + 1) * 250 {
            index::insert(&aa, &key_of(i), index::F_RESOURCE, 0, u64::from(i), None).unwrap();
        }
        // Half the rounds leave the appendix unmerged, so lookups span
        // sorted and appendix files.
        if round % 2 == 0 {
            index::resort(&aa).unwrap();
        }
        for i in (0..(round + 1) * 250).step_by(97) {
            assert_eq!(lookup(&aa, &key_of(i)).len(), 1, "round {round} key {i}");
        }
    }
}

#[test]
fn chunked_merges_handle_small_sort_size() {
    // 4096 bytes is the floor; forces many merge passes over one batch.
    let (_t, aa) = archive(&[], &["index:", "\tsort_size 4096"]);
    const N: u32 = 1000; // 32 KB of appendix vs 4 KB chunks
    for i in 0..N {
        index::insert(&aa, &key_of(i), index::F_RESOURCE, 0, u64::from(i), None).unwrap();
    }
    index::resort(&aa).unwrap();
    let mut count = 0;
    index::iter(&aa, None, &mut |_| {
        count += 1;
        Ok(false)
    })
    .unwrap();
    assert_eq!(count, N);
    for i in (0..N).step_by(41) {
        assert_eq!(lookup(&aa, &key_of(i)).len(), 1, "key {i}");
    }
}
