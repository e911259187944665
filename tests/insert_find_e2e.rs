//! Scenario 2: insert then find returns documents in insertion order.

mod common;

use bson::{Bson, doc};
use common::TestServer;

#[tokio::test]
async fn insert_then_find_round_trips_in_insertion_order() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (insert_resp, _) = client
        .command(
            1,
            doc! {
                "insert": "tokens",
                "documents": [
                    {"_id": 1i32, "v": "a"},
                    {"_id": 2i32, "v": "b"},
                ],
                "$db": "account",
            },
        )
        .await;
    assert_eq!(insert_resp.get_f64("ok").unwrap(), 1.0);
    assert_eq!(insert_resp.get_i32("n").unwrap(), 2);

    let (find_resp, _) = client
        .command(2, doc! {"find": "tokens", "filter": {}, "$db": "account"})
        .await;
    assert_eq!(find_resp.get_f64("ok").unwrap(), 1.0);
    let cursor = find_resp.get_document("cursor").unwrap();
    let batch = cursor.get_array("firstBatch").unwrap();
    assert_eq!(
        batch,
        &vec![
            Bson::Document(doc! {"_id": 1i32, "v": "a"}),
            Bson::Document(doc! {"_id": 2i32, "v": "b"}),
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn count_documents_and_distinct_reflect_inserted_data() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .command(
            1,
            doc! {"insert": "items", "documents": [
                {"_id": 1i32, "color": "red"},
                {"_id": 2i32, "color": "blue"},
                {"_id": 3i32, "color": "red"},
            ], "$db": "shop"},
        )
        .await;

    let (count_resp, _) = client
        .command(2, doc! {"count": "items", "query": {}, "$db": "shop"})
        .await;
    assert_eq!(count_resp.get_i64("n").unwrap(), 3);

    let (distinct_resp, _) = client
        .command(3, doc! {"distinct": "items", "key": "color", "$db": "shop"})
        .await;
    let mut values: Vec<String> = distinct_resp
        .get_array("values")
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    values.sort();
    assert_eq!(values, vec!["blue".to_string(), "red".to_string()]);

    server.shutdown().await;
}
