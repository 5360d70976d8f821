use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use shoal::HashMap;
use std::sync::Arc;

const ENTRIES: u64 = 1 << 14;

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(ENTRIES));
    group.bench_function(BenchmarkId::from_parameter(ENTRIES), |b| {
        b.iter_batched(
            || HashMap::<u64, u64>::with_capacity(ENTRIES as usize),
            |map| {
                let guard = map.guard();
                for i in 0..ENTRIES {
                    map.insert(i, i, &guard);
                }
                drop(guard);
                map
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn get(c: &mut Criterion) {
    let map = HashMap::<u64, u64>::with_capacity(ENTRIES as usize);
    {
        let guard = map.guard();
        for i in 0..ENTRIES {
            map.insert(i, i, &guard);
        }
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(ENTRIES));
    group.bench_function(BenchmarkId::from_parameter(ENTRIES), |b| {
        b.iter(|| {
            let guard = map.guard();
            for i in 0..ENTRIES {
                black_box(map.get(&i, &guard));
            }
        })
    });
    group.finish();
}

fn mixed_readers_and_writers(c: &mut Criterion) {
    let threads = num_cpus::get().clamp(2, 8);

    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(ENTRIES));
    group.bench_function(BenchmarkId::from_parameter(threads), |b| {
        b.iter_batched(
            || {
                let map = Arc::new(HashMap::<u64, u64>::with_capacity(ENTRIES as usize));
                let guard = map.guard();
                for i in 0..ENTRIES {
                    map.insert(i, i, &guard);
                }
                drop(guard);
                map
            },
            |map| {
                let mut handles = Vec::new();
                for t in 0..threads {
                    let map = Arc::clone(&map);
                    handles.push(std::thread::spawn(move || {
                        let guard = map.guard();
                        for i in 0..ENTRIES / threads as u64 {
                            if t % 2 == 0 {
                                black_box(map.get(&i, &guard));
                            } else {
                                map.insert(i, i + 1, &guard);
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, insert, get, mixed_readers_and_writers);
criterion_main!(benches);
