//! Micro benchmarks for column trees driven through a group.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use colstore::storage::{ColumnKind, DbOptions, Group};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const ROW_COUNT: usize = 16_384;
const LOOKUP_SAMPLES: usize = 4_096;
const INDEXED_ROWS: usize = 2_048;

fn micro_column(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/column");
    group.sample_size(30);

    group.throughput(Throughput::Elements(ROW_COUNT as u64));
    group.bench_function("append", |b| {
        b.iter_batched(
            FreshTable::new,
            |mut table| {
                table.append(ROW_COUNT);
                black_box(table.group.table_count());
            },
            BatchSize::SmallInput,
        );
    });

    let mut positions: Vec<usize> = (0..ROW_COUNT).map(|i| i / 2).collect();
    positions.shuffle(&mut ChaCha8Rng::seed_from_u64(0xC011_AB1E));
    group.throughput(Throughput::Elements(ROW_COUNT as u64));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTable::new,
            |mut table| {
                table.insert_at(&positions);
                black_box(table.group.table_count());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(ROW_COUNT as u64 / 2));
    group.bench_function("erase_front", |b| {
        b.iter_batched(
            || {
                let mut table = FreshTable::new();
                table.append(ROW_COUNT);
                table
            },
            |mut table| {
                table.erase_front(ROW_COUNT / 2);
                black_box(table.group.table_count());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INDEXED_ROWS as u64));
    for (name, front) in [("indexed_append", false), ("indexed_insert_front", true)] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let mut table = FreshTable::new();
                    table.index_column();
                    table
                },
                |mut table| {
                    table.insert_indexed(INDEXED_ROWS, front);
                    black_box(table.group.table_count());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.throughput(Throughput::Elements(ROW_COUNT as u64));
    group.bench_function("commit_after_append", |b| {
        b.iter_batched(
            || {
                let mut table = FreshTable::new();
                table.append(ROW_COUNT);
                table
            },
            |mut table| black_box(table.group.commit().expect("commit")),
            BatchSize::SmallInput,
        );
    });

    let mut loaded = FreshTable::new();
    loaded.append(ROW_COUNT);
    loaded.group.commit().expect("commit");
    let mut rng = ChaCha8Rng::seed_from_u64(0xFEED_FACE);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_get", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            let view = loaded.group.table(0).expect("table");
            for _ in 0..LOOKUP_SAMPLES {
                let row = rng.gen_range(0..ROW_COUNT);
                black_box(view.get_int(0, row).expect("get"));
            }
        });
    });

    group.bench_function(BenchmarkId::new("find_all", ROW_COUNT), |b| {
        b.iter(|| {
            let view = loaded.group.table(0).expect("table");
            black_box(view.find_all(0, 77).expect("find"));
        });
    });

    group.finish();
}

struct FreshTable {
    group: Group,
}

impl FreshTable {
    fn new() -> Self {
        let mut group = Group::with_options(DbOptions::default());
        let t = group.add_table().expect("table");
        group.table_mut(t).expect("table").add_column(ColumnKind::Int).expect("column");
        Self { group }
    }

    fn append(&mut self, count: usize) {
        let mut table = self.group.table_mut(0).expect("table");
        table.insert_rows(0, count).expect("rows");
        for row in 0..count {
            table.set_int(0, row, (row % 1000) as i64).expect("set");
        }
    }

    fn insert_at(&mut self, positions: &[usize]) {
        let mut table = self.group.table_mut(0).expect("table");
        for (i, at) in positions.iter().enumerate() {
            let at = (*at).min(table.size());
            table.insert_rows(at, 1).expect("insert");
            table.set_int(0, at, i as i64).expect("set");
        }
    }

    fn index_column(&mut self) {
        let mut table = self.group.table_mut(0).expect("table");
        table.add_search_index(0, false).expect("index");
    }

    fn insert_indexed(&mut self, count: usize, front: bool) {
        let mut table = self.group.table_mut(0).expect("table");
        for i in 0..count {
            let at = if front { 0 } else { table.size() };
            table.insert_rows(at, 1).expect("insert");
            table.set_int(0, at, (i % 97) as i64).expect("set");
        }
    }

    fn erase_front(&mut self, count: usize) {
        let mut table = self.group.table_mut(0).expect("table");
        for _ in 0..count {
            table.erase_row(0).expect("erase");
        }
    }
}

criterion_group!(benches, micro_column);
criterion_main!(benches);
