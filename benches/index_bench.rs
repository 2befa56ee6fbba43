use std::fmt::Write as _;

use criterion::{criterion_group, criterion_main, Criterion};
use sha2::{Digest, Sha256};

use aardwarc::archive::Archive;
use aardwarc::index;

fn key_of(i: u32) -> String {
    hex::encode(Sha256::digest(i.to_le_bytes()))[..32].to_owned()
}

fn scratch_archive() -> (tempfile::TempDir, Archive) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = String::new();
    writeln!(cfg, "WARC-Record-ID:").unwrap();
    writeln!(cfg, "\thttp://bench.example/aw/ 128").unwrap();
    writeln!(cfg, "silo:").unwrap();
    writeln!(cfg, "\tdirectory {}/", dir.path().display()).unwrap();
    let path = dir.path().join("aardwarc.conf");
    std::fs::write(&path, cfg).unwrap();
    let aa = Archive::open(&path).unwrap();
    (dir, aa)
}

fn bench_lookup(c: &mut Criterion) {
    const N: u32 = 50_000;
    let (_dir, aa) = scratch_archive();
    for i in 0..N {
        index::insert(&aa, &key_of(i), index::F_RESOURCE, 0, u64::from(i), None).unwrap();
    }
    index::resort(&aa).unwrap();

    let mut i = 0u32;
    c.bench_function("sorted_lookup", |b| {
        b.iter(|| {
            i = (i + 1) % N;
            let mut hits = 0;
            index::iter(&aa, Some(&key_of(i)), &mut |_| {
                hits += 1;
                Ok(true)
            })
            .unwrap();
            assert_eq!(hits, 1);
        })
    });
}

fn bench_resort(c: &mut Criterion) {
    c.bench_function("resort_10k", |b| {
        b.iter_with_setup(
            || {
                let (dir, aa) = scratch_archive();
                for i in 0..10_000u32 {
                    index::insert(&aa, &key_of(i), index::F_RESOURCE, 0, u64::from(i), None)
                        .unwrap();
                }
                (dir, aa)
            },
            |(_dir, aa)| index::resort(&aa).unwrap(),
        )
    });
}

criterion_group!(benches, bench_lookup, bench_resort);
criterion_main!(benches);
