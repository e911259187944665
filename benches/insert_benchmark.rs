// Insert operation benchmarks
use bson::doc;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use std::time::Duration;

mod common;
use common::random_string;

#[derive(Debug, Clone, Copy)]
enum DocumentSize {
    Small,
    Medium,
    Large,
}

fn generate_document(size: DocumentSize) -> bson::Document {
    match size {
        DocumentSize::Small => {
            doc! {
                "_id": bson::oid::ObjectId::new(),
                "name": random_string(10),
                "value": rand::thread_rng().gen_range(1..1000),
            }
        }
        DocumentSize::Medium => {
            doc! {
                "_id": bson::oid::ObjectId::new(),
                "name": random_string(10),
                "email": format!("{}@example.com", random_string(8)),
                "age": rand::thread_rng().gen_range(18..80),
                "tags": (0..5).map(|_| random_string(5)).collect::<Vec<_>>(),
            }
        }
        DocumentSize::Large => {
            doc! {
                "_id": bson::oid::ObjectId::new(),
                "name": random_string(20),
                "description": random_string(200),
                "data": (0..100).map(|_| random_string(30)).collect::<Vec<_>>(),
            }
        }
    }
}

fn bench_insert_single(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("insert_single");
    group.measurement_time(Duration::from_secs(10));

    for size in [DocumentSize::Small, DocumentSize::Medium, DocumentSize::Large] {
        let size_name = format!("{:?}", size);

        group.bench_with_input(BenchmarkId::new("size", &size_name), &size, |b, &doc_size| {
            b.to_async(&rt).iter(|| async {
                let (_handle, mut stream) = common::spawn().await;

                common::send(&mut stream, 1, &doc! {"create": "bench", "$db": "bench"}).await;

                let document = generate_document(doc_size);
                let insert = doc! {"insert": "bench", "documents": [document], "$db": "bench"};
                let response = common::send(&mut stream, 2, &insert).await;

                black_box(response);
            });
        });
    }

    group.finish();
}

fn bench_insert_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("insert_batch");
    group.measurement_time(Duration::from_secs(10));

    for batch_size in [10, 50, 100, 500] {
        group.bench_with_input(BenchmarkId::new("batch_size", batch_size), &batch_size, |b, &size| {
            b.to_async(&rt).iter(|| async {
                let (_handle, mut stream) = common::spawn().await;

                common::send(&mut stream, 1, &doc! {"create": "bench", "$db": "bench"}).await;

                let docs: Vec<bson::Document> = (0..size).map(|_| generate_document(DocumentSize::Medium)).collect();
                let insert = doc! {"insert": "bench", "documents": docs, "$db": "bench"};
                let response = common::send(&mut stream, 2, &insert).await;

                black_box(response);
            });
        });
    }

    group.finish();
}

criterion_group!(insert_benches, bench_insert_single, bench_insert_batch);
criterion_main!(insert_benches);
