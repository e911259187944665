//! Broader command-surface coverage beyond the six literal scenarios:
//! indexes, collection/database admin, findAndModify variants, bulkWrite,
//! and the protocol-level invariants I3/I5.

mod common;

use bson::{Bson, doc};
use common::TestServer;
use jongodb::protocol;

#[tokio::test]
async fn response_to_always_echoes_the_request_id() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    for request_id in [1, 999, i32::MAX - 1] {
        let (_, response_to) = client.command(request_id, doc! {"ping": 1i32, "$db": "admin"}).await;
        assert_eq!(response_to, request_id);
    }

    server.shutdown().await;
}

#[test]
fn op_msg_kind0_round_trips_byte_for_byte() {
    let body = doc! {"ping": 1i32, "$db": "admin"};
    let wire = protocol::encode_op_msg(&body, 0, 7).unwrap();
    let mut buf = bytes::BytesMut::from(&wire[..]);
    let frame = protocol::try_take_frame(&mut buf).unwrap().unwrap();
    let decoded = protocol::decode_op_msg(&frame).unwrap();
    let re_encoded = protocol::encode_op_msg(&decoded.body, 0, 7).unwrap();
    assert_eq!(wire, re_encoded);
}

#[tokio::test]
async fn list_collections_and_drop_reflect_admin_commands() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.command(1, doc! {"create": "widgets", "$db": "d"}).await;
    client
        .command(2, doc! {"insert": "gadgets", "documents": [{"_id": 1i32}], "$db": "d"})
        .await;

    let (list_resp, _) = client.command(3, doc! {"listCollections": 1i32, "$db": "d"}).await;
    let names: Vec<String> = list_resp
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|v| v.as_document().unwrap().get_str("name").unwrap().to_string())
        .collect();
    assert!(names.contains(&"widgets".to_string()));
    assert!(names.contains(&"gadgets".to_string()));

    let (drop_resp, _) = client.command(4, doc! {"drop": "widgets", "$db": "d"}).await;
    assert_eq!(drop_resp.get_f64("ok").unwrap(), 1.0);

    let (list_after, _) = client.command(5, doc! {"listCollections": 1i32, "$db": "d"}).await;
    let names_after: Vec<String> = list_after
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|v| v.as_document().unwrap().get_str("name").unwrap().to_string())
        .collect();
    assert!(!names_after.contains(&"widgets".to_string()));

    server.shutdown().await;
}

#[tokio::test]
async fn create_indexes_then_list_indexes_reports_the_new_index() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (create_resp, _) = client
        .command(
            1,
            doc! {
                "createIndexes": "people",
                "indexes": [{"key": {"name": 1i32}, "name": "name_1"}],
                "$db": "d",
            },
        )
        .await;
    assert_eq!(create_resp.get_i32("numIndexesAfter").unwrap(), 2);

    let (list_resp, _) = client.command(2, doc! {"listIndexes": "people", "$db": "d"}).await;
    let names: Vec<String> = list_resp
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|v| v.as_document().unwrap().get_str("name").unwrap().to_string())
        .collect();
    assert!(names.contains(&"name_1".to_string()));
    assert!(names.contains(&"_id_".to_string()));

    server.shutdown().await;
}

#[tokio::test]
async fn find_one_and_update_returns_previous_document_by_default() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .command(1, doc! {"insert": "counters", "documents": [{"_id": "c", "n": 1i32}], "$db": "d"})
        .await;

    let (resp, _) = client
        .command(
            2,
            doc! {
                "findAndModify": "counters",
                "query": {"_id": "c"},
                "update": {"$inc": {"n": 1i32}},
                "$db": "d",
            },
        )
        .await;
    assert_eq!(resp.get_document("value").unwrap().get_i32("n").unwrap(), 1);
    assert_eq!(resp.get_document("lastErrorObject").unwrap().get_i32("n").unwrap(), 1);

    let (find_resp, _) = client.command(3, doc! {"find": "counters", "filter": {}, "$db": "d"}).await;
    let batch = find_resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch[0].as_document().unwrap().get_i32("n").unwrap(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn bulk_write_mixes_insert_update_and_delete_in_one_call() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (resp, _) = client
        .command(
            1,
            doc! {
                "bulkWrite": "items",
                "requests": [
                    {"insertOne": {"document": {"_id": 1i32, "n": 1i32}}},
                    {"insertOne": {"document": {"_id": 2i32, "n": 1i32}}},
                    {"updateOne": {"filter": {"_id": 1i32}, "update": {"$set": {"n": 9i32}}}},
                    {"deleteOne": {"filter": {"_id": 2i32}}},
                ],
                "$db": "d",
            },
        )
        .await;

    assert_eq!(resp.get_i64("insertedCount").unwrap(), 2);
    assert_eq!(resp.get_i64("matchedCount").unwrap(), 1);
    assert_eq!(resp.get_i64("modifiedCount").unwrap(), 1);
    assert_eq!(resp.get_i64("deletedCount").unwrap(), 1);

    let (find_resp, _) = client.command(2, doc! {"find": "items", "filter": {}, "$db": "d"}).await;
    let batch = find_resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].as_document().unwrap().get_i32("n").unwrap(), 9);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_command_reports_command_not_found() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (resp, _) = client.command(1, doc! {"notACommand": 1i32, "$db": "admin"}).await;
    assert_eq!(resp.get_f64("ok").unwrap(), 0.0);
    assert_eq!(resp.get_i32("code").unwrap(), 59);
    assert_eq!(resp.get_str("codeName").unwrap(), "CommandNotFound");

    server.shutdown().await;
}

#[tokio::test]
async fn end_sessions_is_accepted_as_a_no_op() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let session = doc! {"id": Bson::Binary(bson::Binary {
        subtype: bson::spec::BinarySubtype::Uuid,
        bytes: vec![3u8; 16],
    })};
    let (resp, _) = client
        .command(1, doc! {"endSessions": [session], "$db": "admin"})
        .await;
    assert_eq!(resp.get_f64("ok").unwrap(), 1.0);

    server.shutdown().await;
}
