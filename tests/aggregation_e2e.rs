//! Scenario 6: $unwind + $group, plus invariants I6 (find/aggregate parity)
//! and I7 (aggregation doesn't mutate its source).

mod common;

use bson::{Bson, doc};
use common::TestServer;

#[tokio::test]
async fn unwind_then_group_matches_the_literal_scenario() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .command(
            1,
            doc! {
                "insert": "sales",
                "documents": [
                    {"_id": 1i32, "qty": 2i32, "tags": ["a", "b"]},
                    {"_id": 2i32, "qty": 3i32, "tags": ["a"]},
                    {"_id": 3i32, "qty": 5i32, "tags": []},
                ],
                "$db": "shop",
            },
        )
        .await;

    let (resp, _) = client
        .command(
            2,
            doc! {
                "aggregate": "sales",
                "pipeline": [
                    {"$unwind": "$tags"},
                    {"$group": {"_id": "$tags", "total": {"$sum": "$qty"}, "count": {"$sum": 1i32}}},
                    {"$sort": {"_id": 1i32}},
                ],
                "cursor": {},
                "$db": "shop",
            },
        )
        .await;

    let batch = resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(
        batch,
        &vec![
            Bson::Document(doc! {"_id": "a", "total": 5i32, "count": 2i32}),
            Bson::Document(doc! {"_id": "b", "total": 2i32, "count": 1i32}),
        ]
    );

    // Source documents survive untouched (I7).
    let (find_resp, _) = client.command(3, doc! {"find": "sales", "filter": {}, "$db": "shop"}).await;
    let source = find_resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(source[0].as_document().unwrap().get_array("tags").unwrap().len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn match_sort_skip_limit_matches_equivalent_find() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .command(
            1,
            doc! {
                "insert": "nums",
                "documents": (1..=10).map(|n| Bson::Document(doc! {"_id": n, "v": n})).collect::<Vec<_>>(),
                "$db": "d",
            },
        )
        .await;

    let (agg_resp, _) = client
        .command(
            2,
            doc! {
                "aggregate": "nums",
                "pipeline": [
                    {"$match": {"v": {"$gt": 2i32}}},
                    {"$sort": {"v": 1i32}},
                    {"$skip": 1i32},
                    {"$limit": 3i32},
                ],
                "cursor": {},
                "$db": "d",
            },
        )
        .await;
    let agg_batch = agg_resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();

    let (find_resp, _) = client
        .command(
            3,
            doc! {"find": "nums", "filter": {"v": {"$gt": 2i32}}, "sort": {"v": 1i32}, "skip": 1i32, "limit": 3i32, "$db": "d"},
        )
        .await;
    let find_batch = find_resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();

    assert_eq!(agg_batch, find_batch);
    assert_eq!(agg_batch.len(), 3);

    server.shutdown().await;
}
