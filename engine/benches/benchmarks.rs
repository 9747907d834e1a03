//! Performance benchmarks for cellar-engine

use cellar_engine::{
    pull, respond, Error, MergeableStore, MetricDefinition, Metrics, QueryDefinition, Queries,
    Store, StoreConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn filled_store(rows: usize) -> Store {
    let store = Store::new();
    let writer = store.clone();
    store.transaction(|| {
        for i in 0..rows {
            writer
                .set_cell("pets", &format!("pet{i}"), "species", if i % 2 == 0 { "dog" } else { "cat" })
                .set_cell("pets", &format!("pet{i}"), "price", i as f64);
        }
    });
    store
}

fn filled_replica(unique_id: &str, rows: usize) -> MergeableStore {
    let store = MergeableStore::with_config(StoreConfig::default().with_unique_id(unique_id));
    let writer = store.clone();
    store.transaction(|| {
        for i in 0..rows {
            writer.set_cell("pets", &format!("{unique_id}{i}"), "price", i as f64);
        }
    });
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("store_new", |b| b.iter(Store::new));

    group.bench_function("set_cell", |b| {
        let store = Store::new();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            store.set_cell("pets", black_box(&format!("pet{id}")), "price", black_box(5));
        })
    });

    group.bench_function("set_cell_with_listeners", |b| {
        let store = Store::new();
        store.add_cell_listener(None, None, None, |_, _, _, _, _, _, _| {}, false);
        store.add_row_ids_listener(Some("pets"), |_, _, _| {}, false);
        store.add_tables_listener(|_, _| {}, false);
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            store.set_cell("pets", black_box(&format!("pet{id}")), "price", black_box(5));
        })
    });

    group.bench_function("get_cell", |b| {
        let store = filled_store(1000);
        b.iter(|| store.get_cell(black_box("pets"), black_box("pet500"), black_box("price")))
    });

    group.bench_function("get_sorted_row_ids", |b| {
        let store = filled_store(1000);
        b.iter(|| store.get_sorted_row_ids("pets", Some("price"), true, 0, Some(10)))
    });

    group.finish();
}

fn bench_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("transactions");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("write_rows", size), size, |b, &size| {
            b.iter(|| filled_store(black_box(size)))
        });
    }

    group.finish();
}

fn bench_derived(c: &mut Criterion) {
    let mut group = c.benchmark_group("derived");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("metric_update", size), size, |b, &size| {
            let store = filled_store(size);
            let metrics = Metrics::new(&store);
            metrics.set_metric_definition("total", MetricDefinition::new("pets").number_from_cell("price"));
            let mut price = 0;
            b.iter(|| {
                price += 1;
                store.set_cell("pets", "pet0", "price", price);
                metrics.get_metric("total")
            })
        });

        group.bench_with_input(BenchmarkId::new("query_update", size), size, |b, &size| {
            let store = filled_store(size);
            let queries = Queries::new(&store);
            queries.set_query_definition(
                "dogs",
                QueryDefinition::new("pets").select("price").where_eq("species", "dog"),
            );
            let mut price = 0;
            b.iter(|| {
                price += 1;
                store.set_cell("pets", "pet0", "price", price);
                queries.get_result_row_count("dogs")
            })
        });
    }

    group.finish();
}

fn bench_mergeable(c: &mut Criterion) {
    let mut group = c.benchmark_group("mergeable");

    group.bench_function("stamped_set_cell", |b| {
        let store = MergeableStore::with_config(StoreConfig::default().with_unique_id("a"));
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            store.set_cell("pets", black_box(&format!("pet{id}")), "price", black_box(5));
        })
    });

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("merge", size), size, |b, &size| {
            b.iter_batched(
                || (filled_replica("a", size), filled_replica("b", size)),
                |(local, remote)| {
                    local.merge(&remote);
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("pull_one_change", size), size, |b, &size| {
            b.iter_batched(
                || {
                    let remote = filled_replica("a", size);
                    let local = filled_replica("b", 0);
                    local.merge(&remote);
                    remote.set_cell("pets", "a0", "price", -1);
                    (local, remote)
                },
                |(local, remote)| {
                    pull(&local, |message| {
                        respond(&remote, message)?
                            .ok_or_else(|| Error::UnexpectedMessage("no reply".into()))
                    })
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    group.bench_function("content_to_json", |b| {
        let store = filled_store(1000);
        b.iter(|| store.get_json())
    });

    group.bench_function("content_from_json", |b| {
        let json = filled_store(1000).get_json();
        let store = Store::new();
        b.iter(|| store.set_json(black_box(&json)).map(|_| ()))
    });

    group.bench_function("mergeable_content_to_json", |b| {
        let store = filled_replica("a", 1000);
        b.iter(|| serde_json::to_string(&store.get_mergeable_content()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_transactions,
    bench_derived,
    bench_mergeable,
    bench_serialization
);
criterion_main!(benches);
