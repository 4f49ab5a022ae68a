//! Performance benchmarks for versioned writes, history, merges, and locks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use refsync::locks::LockManager;
use refsync::storage::{history, library_queries, Storage, VersionStore};
use refsync::sync::merge::{apply_changes, changed_fields, union_tags};
use refsync::types::*;

fn store_with_library() -> (Storage, VersionStore, LibraryId) {
    let storage = Storage::open_in_memory().unwrap();
    let library = storage
        .with_transaction(|conn| {
            let connection = library_queries::create_connection(conn, "bench", "acct", None)?;
            library_queries::create_library(
                conn,
                connection.id,
                "bench-lib",
                "Bench",
                LibraryKind::Personal,
                ResolutionStrategy::Manual,
            )
        })
        .unwrap();
    (storage.clone(), VersionStore::new(storage), library.id)
}

fn key_for(i: usize) -> String {
    format!("K{:07}", i % 10_000_000)
}

fn titled(i: usize) -> ItemPayload {
    let mut payload = ItemPayload::new();
    payload.insert("title".to_string(), serde_json::json!(format!("Item {}", i)));
    payload.insert("year".to_string(), serde_json::json!(2000 + (i % 25)));
    payload
}

fn bench_cas_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("cas");
    group.throughput(Throughput::Elements(1));

    group.bench_function("create", |b| {
        let (_storage, store, library) = store_with_library();
        let mut i = 0;
        b.iter(|| {
            let key = ItemKey::new(library, key_for(i));
            i += 1;
            store
                .compare_and_swap(black_box(&ProposedWrite::create(
                    key,
                    ItemKind::Record,
                    titled(i),
                    "bench",
                )))
                .unwrap()
        })
    });

    group.bench_function("update_chain", |b| {
        let (_storage, store, library) = store_with_library();
        let key = ItemKey::new(library, "ABCD1234");
        store
            .compare_and_swap(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                titled(0),
                "bench",
            ))
            .unwrap();

        let mut version = 1i64;
        b.iter(|| {
            let write = ProposedWrite::update(key.clone(), version, titled(version as usize), "bench");
            let committed = store.compare_and_swap(black_box(&write)).unwrap();
            version = committed.item.version;
            committed
        })
    });

    group.bench_function("stale_rejected", |b| {
        let (_storage, store, library) = store_with_library();
        let key = ItemKey::new(library, "ABCD1234");
        store
            .compare_and_swap(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                titled(0),
                "bench",
            ))
            .unwrap();
        store
            .compare_and_swap(&ProposedWrite::update(key.clone(), 1, titled(1), "bench"))
            .unwrap();

        // Base version 1 lost the race for good; every attempt bounces
        b.iter(|| {
            let stale = ProposedWrite::update(key.clone(), 1, titled(9), "laggard");
            store.compare_and_swap(black_box(&stale)).unwrap_err()
        })
    });

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let (_storage, store, library) = store_with_library();

    let mut keys = Vec::new();
    for i in 0..1000 {
        let key = ItemKey::new(library, key_for(i));
        store
            .compare_and_swap(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                titled(i),
                "bench",
            ))
            .unwrap();
        keys.push(key);
    }

    let mut group = c.benchmark_group("reads");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_by_key", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            store.get(black_box(key)).unwrap()
        })
    });

    group.bench_function("count_pending", |b| {
        b.iter(|| store.count_pending(black_box(library)).unwrap())
    });

    group.finish();
}

fn bench_history(c: &mut Criterion) {
    let (storage, store, library) = store_with_library();
    let key = ItemKey::new(library, "ABCD1234");
    store
        .compare_and_swap(&ProposedWrite::create(
            key.clone(),
            ItemKind::Record,
            titled(0),
            "bench",
        ))
        .unwrap();
    for version in 1..100 {
        store
            .compare_and_swap(&ProposedWrite::update(
                key.clone(),
                version,
                titled(version as usize),
                "bench",
            ))
            .unwrap();
    }
    let item_id = store.get(&key).unwrap().id;

    let mut group = c.benchmark_group("history");

    for limit in [10i64, 50].iter() {
        group.throughput(Throughput::Elements(*limit as u64));
        group.bench_with_input(BenchmarkId::new("newest", limit), limit, |b, &limit| {
            b.iter(|| {
                storage
                    .with_connection(|conn| {
                        history::history_for_item(conn, black_box(item_id), limit, None)
                    })
                    .unwrap()
            })
        });
    }

    group.bench_function("changed_fields_between", |b| {
        b.iter(|| {
            storage
                .with_connection(|conn| {
                    history::changed_fields_between(conn, black_box(item_id), 10, 90)
                })
                .unwrap()
        })
    });

    group.finish();
}

fn payload_with_fields(count: usize, prefix: &str) -> ItemPayload {
    (0..count)
        .map(|i| {
            (
                format!("{}_{}", prefix, i),
                serde_json::json!(format!("value {}", i)),
            )
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_merge");

    for size in [4usize, 16, 64].iter() {
        let base = payload_with_fields(*size, "field");
        let mut current = base.clone();
        current.insert("abstract".to_string(), serde_json::json!("current side"));
        let mut proposed = base.clone();
        proposed.insert("pages".to_string(), serde_json::json!("1-10"));

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(
            BenchmarkId::new("apply_changes", size),
            &(current, base, proposed),
            |b, (current, base, proposed)| {
                b.iter(|| apply_changes(black_box(current), black_box(base), black_box(proposed)))
            },
        );
    }

    group.bench_function("changed_fields_16", |b| {
        let base = payload_with_fields(16, "field");
        let mut proposed = base.clone();
        proposed.insert("field_3".to_string(), serde_json::json!("edited"));
        proposed.insert("extra".to_string(), serde_json::json!("new"));
        b.iter(|| changed_fields(black_box(&base), black_box(&proposed)))
    });

    group.bench_function("union_tags", |b| {
        let current = serde_json::json!(["ml", "nlp", "transformers", "to-read"]);
        let proposed = serde_json::json!(["nlp", "attention", "seminal", "to-read"]);
        b.iter(|| union_tags(black_box(Some(&current)), black_box(Some(&proposed))))
    });

    group.finish();
}

fn bench_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("locks");
    group.throughput(Throughput::Elements(1));

    group.bench_function("soft_refresh", |b| {
        let locks = LockManager::new(Storage::open_in_memory().unwrap(), 300);
        let target = LockTarget::item(1);
        b.iter(|| locks.acquire_soft(black_box(target), "bench", None).unwrap())
    });

    group.bench_function("hard_acquire_release", |b| {
        let locks = LockManager::new(Storage::open_in_memory().unwrap(), 300);
        let target = LockTarget::item(1);
        b.iter(|| {
            locks.acquire_hard(black_box(target), "bench", None).unwrap();
            locks.release(target, "bench", LockMode::Hard).unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cas_writes,
    bench_reads,
    bench_history,
    bench_merge,
    bench_locks,
);

criterion_main!(benches);
