// Find/Query operation benchmarks
use bson::doc;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;

mod common;
use common::Handle;

async fn setup_server_with_data(doc_count: usize) -> (Handle, TcpStream) {
    let (handle, mut stream) = common::spawn().await;

    common::send(&mut stream, 1, &doc! {"create": "bench", "$db": "bench"}).await;

    let batch_size = 100;
    let mut inserted = 0;
    while inserted < doc_count {
        let to_insert = std::cmp::min(batch_size, doc_count - inserted);
        let docs: Vec<bson::Document> = (0..to_insert)
            .map(|i| {
                doc! {
                    "_id": bson::oid::ObjectId::new(),
                    "index": (inserted + i) as i32,
                    "name": format!("user_{}", inserted + i),
                    "age": rand::thread_rng().gen_range(18..80),
                    "score": rand::thread_rng().gen_range(0.0..100.0),
                    "tags": vec!["tag1", "tag2", "tag3"],
                    "active": rand::thread_rng().gen_bool(0.8),
                }
            })
            .collect();

        common::send(&mut stream, 2, &doc! {"insert": "bench", "documents": docs, "$db": "bench"}).await;
        inserted += to_insert;
    }

    (handle, stream)
}

fn bench_find_by_id(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("find_by_id");
    group.measurement_time(Duration::from_secs(10));

    for &collection_size in &[100, 1000, 10000] {
        group.bench_with_input(
            BenchmarkId::new("collection_size", collection_size),
            &collection_size,
            |b, &size| {
                b.to_async(&rt).iter(|| async {
                    let (_handle, mut stream) = setup_server_with_data(size).await;
                    let find = doc! {"find": "bench", "filter": {"index": 0}, "$db": "bench"};
                    let response = common::send(&mut stream, 3, &find).await;
                    black_box(response);
                });
            },
        );
    }

    group.finish();
}

fn bench_find_with_filter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("find_with_filter");
    group.measurement_time(Duration::from_secs(10));

    let collection_size = 1000;

    group.bench_function("equality", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {"find": "bench", "filter": {"active": true}, "$db": "bench"};
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.bench_function("range_gt", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {"find": "bench", "filter": {"age": {"$gt": 50}}, "$db": "bench"};
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.bench_function("in_operator", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {"find": "bench", "filter": {"age": {"$in": [25, 35, 45, 55, 65]}}, "$db": "bench"};
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.bench_function("or_operator", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {
                "find": "bench",
                "filter": {"$or": [{"age": {"$lt": 30}}, {"age": {"$gt": 60}}]},
                "$db": "bench",
            };
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.bench_function("complex", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {
                "find": "bench",
                "filter": {
                    "$and": [
                        {"active": true},
                        {"age": {"$gte": 25, "$lte": 55}},
                        {"score": {"$gt": 50.0}},
                    ]
                },
                "$db": "bench",
            };
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.finish();
}

fn bench_find_with_projection(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("find_with_projection");
    group.measurement_time(Duration::from_secs(10));

    let collection_size = 1000;

    group.bench_function("include_fields", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {
                "find": "bench",
                "filter": {},
                "projection": {"name": 1i32, "age": 1i32},
                "limit": 100i32,
                "$db": "bench",
            };
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.bench_function("exclude_fields", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {
                "find": "bench",
                "filter": {},
                "projection": {"tags": 0i32},
                "limit": 100i32,
                "$db": "bench",
            };
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.finish();
}

fn bench_find_with_sort(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("find_with_sort");
    group.measurement_time(Duration::from_secs(10));

    let collection_size = 1000;

    group.bench_function("sort_single", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {"find": "bench", "filter": {}, "sort": {"age": 1i32}, "limit": 100i32, "$db": "bench"};
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.bench_function("sort_multiple", |b| {
        b.to_async(&rt).iter(|| async {
            let (_handle, mut stream) = setup_server_with_data(collection_size).await;
            let find = doc! {
                "find": "bench",
                "filter": {},
                "sort": {"active": -1i32, "age": 1i32, "score": -1i32},
                "limit": 100i32,
                "$db": "bench",
            };
            black_box(common::send(&mut stream, 3, &find).await);
        });
    });

    group.finish();
}

criterion_group!(
    find_benches,
    bench_find_by_id,
    bench_find_with_filter,
    bench_find_with_projection,
    bench_find_with_sort
);
criterion_main!(find_benches);
