#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use clawdesk_protocol::{ClientError, ClientOptions, GatewayClient, MALFORMED_FRAME_CODE};
use common::{FakeGateway, ServerConn, WAIT};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn connected_client(gateway: &mut FakeGateway) -> (GatewayClient, ServerConn) {
    let client = GatewayClient::builder(gateway.options()).start();
    let mut conn = gateway.next_connection().await;
    conn.handshake().await;
    tokio::time::timeout(WAIT, client.wait_connected())
        .await
        .unwrap()
        .unwrap();
    (client, conn)
}

/// One request/response round trip; commands sent earlier are processed by then.
async fn round_trip(client: &GatewayClient, conn: &mut ServerConn) {
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("ping", None).await })
    };
    let frame = conn.recv_frame().await;
    conn.respond(frame["id"].as_str().unwrap(), json!("pong")).await;
    assert_eq!(pending.await.unwrap().unwrap(), json!("pong"));
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_concurrent_requests_resolve_by_id() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.request("echo", Some(json!({"n": i}))).await })
        })
        .collect();

    let mut frames = Vec::new();
    for _ in 0..8 {
        frames.push(conn.recv_frame().await);
    }
    let ids: HashSet<_> = frames.iter().map(|f| f["id"].as_str().unwrap().to_string()).collect();
    assert_eq!(ids.len(), 8);

    for frame in frames.iter().rev() {
        conn.respond(frame["id"].as_str().unwrap(), json!({"n": frame["params"]["n"]}))
            .await;
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle.await.unwrap().unwrap();
        assert_eq!(value["n"], json!(i));
    }
    client.stop().await;
}

#[tokio::test]
async fn test_pending_requests_fail_when_socket_closes() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.request("slow", None).await })
        })
        .collect();
    for _ in 0..3 {
        conn.recv_frame().await;
    }
    conn.close(1011, "boom").await;

    for handle in handles {
        assert_eq!(
            handle.await.unwrap(),
            Err(ClientError::ConnectionClosed {
                code: 1011,
                reason: "boom".to_string()
            })
        );
    }
    client.stop().await;
}

#[tokio::test]
async fn test_request_without_socket_fails_immediately() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = GatewayClient::builder(ClientOptions::for_port(port)).start();

    let result = tokio::time::timeout(Duration::from_millis(500), client.request("health", None))
        .await
        .unwrap();
    assert_eq!(result, Err(ClientError::NotConnected));
    client.stop().await;
}

#[tokio::test]
async fn test_request_during_handshake_waits_for_hello() {
    let mut gateway = FakeGateway::bind().await;
    let client = GatewayClient::builder(gateway.options()).start();

    let mut conn = gateway.next_connection().await;
    conn.send_challenge("n").await;
    let (connect_id, _) = conn.expect_connect().await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("status", Some(json!({"verbose": true}))).await })
    };
    assert!(conn.try_recv_frame(Duration::from_millis(200)).await.is_none());

    conn.send_hello(&connect_id).await;
    let frame = conn.recv_frame().await;
    assert_eq!(frame["method"], "status");
    assert_eq!(frame["params"]["verbose"], true);
    conn.respond(frame["id"].as_str().unwrap(), json!({"ok": 1})).await;

    assert_eq!(pending.await.unwrap().unwrap(), json!({"ok": 1}));
    client.stop().await;
}

#[tokio::test]
async fn test_error_response_is_rejected() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("chat.send", None).await })
    };
    let frame = conn.recv_frame().await;
    conn.reject(frame["id"].as_str().unwrap(), "FORBIDDEN", "missing scope")
        .await;

    match pending.await.unwrap() {
        Err(ClientError::Rejected { code, message, .. }) => {
            assert_eq!(code, "FORBIDDEN");
            assert_eq!(message, "missing scope");
        }
        other => panic!("unexpected result {:?}", other),
    }
    client.stop().await;
}

#[tokio::test]
async fn test_typed_request() {
    #[derive(Deserialize)]
    struct Echo {
        n: u32,
    }

    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request_as::<Echo, _>("echo", &json!({"n": 5})).await })
    };
    let frame = conn.recv_frame().await;
    conn.respond(frame["id"].as_str().unwrap(), frame["params"].clone())
        .await;

    assert_eq!(pending.await.unwrap().unwrap().n, 5);
    client.stop().await;
}

#[tokio::test]
async fn test_panicking_callback_does_not_stop_delivery() {
    let mut gateway = FakeGateway::bind().await;
    let client = GatewayClient::builder(gateway.options())
        .on_event(|event| {
            if event.event == "boom" {
                panic!("callback failure");
            }
        })
        .start();
    let mut conn = gateway.next_connection().await;
    conn.handshake().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.add_event_listener(move |event| sink.lock().unwrap().push(event.event.clone()));
    round_trip(&client, &mut conn).await;

    conn.send_event("boom", 1, json!({})).await;
    conn.send_event("tick", 2, json!({})).await;
    conn.send_event("chat", 3, json!({"text": "hi"})).await;

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec!["boom", "tick", "chat"]);
    assert_eq!(client.last_seq(), Some(3));
    client.stop().await;
}

#[tokio::test]
async fn test_removed_listener_stops_receiving() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let first = Arc::new(Mutex::new(0u32));
    let second = Arc::new(Mutex::new(0u32));
    let (a, b) = (first.clone(), second.clone());
    let first_id = client.add_event_listener(move |_| *a.lock().unwrap() += 1);
    client.add_event_listener(move |_| *b.lock().unwrap() += 1);
    round_trip(&client, &mut conn).await;

    conn.send_event("tick", 1, json!({})).await;
    wait_until(|| *second.lock().unwrap() == 1).await;
    assert_eq!(*first.lock().unwrap(), 1);

    client.remove_event_listener(first_id);
    round_trip(&client, &mut conn).await;

    conn.send_event("tick", 2, json!({})).await;
    wait_until(|| *second.lock().unwrap() == 2).await;
    assert_eq!(*first.lock().unwrap(), 1);
    client.stop().await;
}

#[tokio::test]
async fn test_stop_fails_pending_and_closes_normally() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", None).await })
    };
    conn.recv_frame().await;

    client.stop().await;
    assert_eq!(pending.await.unwrap(), Err(ClientError::Stopped));
    assert_eq!(conn.recv_close().await, Some(1000));
    assert!(!client.is_connected());
    assert_eq!(client.request("again", None).await, Err(ClientError::Stopped));
}

#[tokio::test]
async fn test_malformed_frame_closes_and_reconnects() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", None).await })
    };
    conn.recv_frame().await;

    conn.send_raw("{not json").await;
    assert_eq!(conn.recv_close().await, Some(MALFORMED_FRAME_CODE));
    assert_eq!(
        pending.await.unwrap(),
        Err(ClientError::ConnectionClosed {
            code: MALFORMED_FRAME_CODE,
            reason: "malformed frame".to_string()
        })
    );

    let mut second = gateway.next_connection().await;
    second.handshake().await;
    tokio::time::timeout(WAIT, client.wait_connected())
        .await
        .unwrap()
        .unwrap();
    round_trip(&client, &mut second).await;
    client.stop().await;
}

#[tokio::test]
async fn test_unknown_frame_type_is_ignored() {
    let mut gateway = FakeGateway::bind().await;
    let (client, mut conn) = connected_client(&mut gateway).await;

    conn.send_json(json!({"type": "telemetry", "data": 1})).await;
    round_trip(&client, &mut conn).await;
    assert!(client.is_connected());
    client.stop().await;
}
