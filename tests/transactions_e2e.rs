//! Scenarios 4 and 5: transaction commit visibility and error-label rules.

mod common;

use bson::{Binary, Bson, doc, spec::BinarySubtype};
use common::TestServer;

fn lsid(tag: u8) -> bson::Document {
    doc! {"id": Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: vec![tag; 16] })}
}

#[tokio::test]
async fn transaction_commit_makes_writes_visible_to_other_sessions() {
    let server = TestServer::start().await;
    let mut writer = server.connect().await;
    let mut reader = server.connect().await;

    let session = lsid(1);

    let (start_resp, _) = writer
        .command(
            1,
            doc! {
                "insert": "coll",
                "documents": [{"_id": "t1"}],
                "$db": "app",
                "lsid": session.clone(),
                "txnNumber": 5i64,
                "autocommit": false,
                "startTransaction": true,
            },
        )
        .await;
    assert_eq!(start_resp.get_f64("ok").unwrap(), 1.0);

    // A separate session must not see the uncommitted write.
    let (mid_resp, _) = reader.command(2, doc! {"find": "coll", "filter": {}, "$db": "app"}).await;
    assert!(
        mid_resp
            .get_document("cursor")
            .unwrap()
            .get_array("firstBatch")
            .unwrap()
            .is_empty()
    );

    let (commit_resp, _) = writer
        .command(
            3,
            doc! {
                "commitTransaction": 1i32,
                "$db": "admin",
                "lsid": session,
                "txnNumber": 5i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(commit_resp.get_f64("ok").unwrap(), 1.0);

    let (after_resp, _) = reader.command(4, doc! {"find": "coll", "filter": {}, "$db": "app"}).await;
    let batch = after_resp.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_transaction_gets_transient_label_on_find_and_commit_label_on_commit() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let session = lsid(2);

    let (find_resp, _) = client
        .command(
            1,
            doc! {
                "find": "coll",
                "filter": {},
                "$db": "app",
                "lsid": session.clone(),
                "txnNumber": 1i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(find_resp.get_f64("ok").unwrap(), 0.0);
    assert_eq!(find_resp.get_i32("code").unwrap(), 251);
    assert_eq!(find_resp.get_str("codeName").unwrap(), "NoSuchTransaction");
    assert_eq!(
        find_resp.get_array("errorLabels").unwrap()[0].as_str().unwrap(),
        "TransientTransactionError"
    );

    let (commit_resp, _) = client
        .command(
            2,
            doc! {
                "commitTransaction": 1i32,
                "$db": "admin",
                "lsid": session.clone(),
                "txnNumber": 1i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(commit_resp.get_i32("code").unwrap(), 251);
    assert_eq!(
        commit_resp.get_array("errorLabels").unwrap()[0].as_str().unwrap(),
        "UnknownTransactionCommitResult"
    );

    let (abort_resp, _) = client
        .command(
            3,
            doc! {
                "abortTransaction": 1i32,
                "$db": "admin",
                "lsid": session,
                "txnNumber": 1i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(abort_resp.get_i32("code").unwrap(), 251);
    assert!(!abort_resp.contains_key("errorLabels"));

    server.shutdown().await;
}
