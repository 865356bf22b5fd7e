/*!
 * Allocation Benchmarks
 * Arena, cluster map and table throughput
 */

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use heaptrace::cluster::{AddressClusterMap, HeapBacking};
use heaptrace::{AllocationTable, Arena, ArenaFlags};

fn bench_arena(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena");
    group.bench_function("alloc_free_64", |b| {
        let arena = Arena::new(ArenaFlags::default(), None);
        b.iter(|| {
            let p = arena.alloc(black_box(64));
            Arena::free(p);
        });
    });
    group.bench_function("alloc_free_4k", |b| {
        let arena = Arena::new(ArenaFlags::default(), None);
        b.iter(|| {
            let p = arena.alloc(black_box(4096));
            Arena::free(p);
        });
    });
    group.finish();
}

fn bench_cluster_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_map");
    group.bench_function("insert_find_remove", |b| {
        let mut map: AddressClusterMap<usize, HeapBacking> = AddressClusterMap::new(HeapBacking);
        let mut addr: usize = 0x1000_0000;
        b.iter(|| {
            addr = addr.wrapping_add(0x40);
            map.insert(black_box(addr), addr);
            black_box(map.find(addr));
            map.find_and_remove(addr);
        });
    });
    group.bench_function("find_inside", |b| {
        let mut map: AddressClusterMap<usize, HeapBacking> = AddressClusterMap::new(HeapBacking);
        for i in 0..1024usize {
            map.insert(0x1000_0000 + i * 256, 128);
        }
        b.iter(|| {
            black_box(map.find_inside(|s| *s, 4096, black_box(0x1000_0000 + 513 * 256 + 64)));
        });
    });
    group.finish();
}

fn bench_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("table");
    group.bench_function("record_free", |b| {
        let table = AllocationTable::new();
        let stack = [0x1000usize, 0x2000, 0x3000];
        let mut addr: usize = 0x2000_0000;
        b.iter(|| {
            addr = addr.wrapping_add(0x80);
            table.record(black_box(addr), 64, &stack);
            table.record_free(addr);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_arena, bench_cluster_map, bench_table);
criterion_main!(benches);
