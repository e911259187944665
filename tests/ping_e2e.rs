//! Scenario 1: ping over OP_MSG.

mod common;

use bson::doc;
use common::TestServer;

#[tokio::test]
async fn ping_returns_ok_and_echoes_response_to() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (body, response_to) = client.command(42, doc! {"ping": 1i32, "$db": "admin"}).await;

    assert_eq!(body.get_f64("ok").unwrap(), 1.0);
    assert_eq!(response_to, 42);

    server.shutdown().await;
}

#[tokio::test]
async fn hello_reports_writable_primary_and_wire_versions() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (body, _) = client.command(1, doc! {"hello": 1i32, "$db": "admin"}).await;

    assert_eq!(body.get_f64("ok").unwrap(), 1.0);
    assert_eq!(body.get_bool("ismaster").unwrap(), true);
    assert_eq!(body.get_bool("isWritablePrimary").unwrap(), true);
    assert!(body.get_i32("maxWireVersion").unwrap() >= body.get_i32("minWireVersion").unwrap());

    server.shutdown().await;
}

#[tokio::test]
async fn hello_advertises_replica_set_when_configured() {
    let server = TestServer::start_with_replica_set(Some("rs0".to_string())).await;
    let mut client = server.connect().await;

    let (body, _) = client.command(1, doc! {"hello": 1i32, "$db": "admin"}).await;

    assert_eq!(body.get_str("setName").unwrap(), "rs0");
    assert!(body.contains_key("hosts"));

    server.shutdown().await;
}
