#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Scriptable in-process gateway for client tests.

use clawdesk_protocol::{ClientOptions, ReconnectPolicy};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakeGateway {
    pub port: u16,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeGateway {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let accepted_at = Instant::now();
                if let Ok(ws) = accept_async(socket).await {
                    if tx.send(ServerConn { ws, accepted_at }).is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            port,
            connections: rx,
        }
    }

    /// Options pointing at this gateway with test-sized reconnect delays.
    pub fn options(&self) -> ClientOptions {
        let mut options = ClientOptions::for_port(self.port);
        options.reconnect = ReconnectPolicy {
            floor: Duration::from_millis(50),
            max: Duration::from_millis(500),
            factor: 2.0,
        };
        options
    }

    pub async fn next_connection(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a client connection")
            .expect("listener stopped")
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
    pub accepted_at: Instant,
}

impl ServerConn {
    /// Next JSON text frame from the client.
    pub async fn recv_frame(&mut self) -> Value {
        self.try_recv_frame(WAIT)
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next JSON text frame, or `None` if nothing arrives in time or the
    /// client closed.
    pub async fn try_recv_frame(&mut self, within: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    /// Wait for the client's close frame and return its code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    pub async fn send_challenge(&mut self, nonce: &str) {
        self.send_json(json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": {"nonce": nonce, "ts": 1_700_000_000_000u64}
        }))
        .await;
    }

    pub async fn send_event(&mut self, event: &str, seq: u64, payload: Value) {
        self.send_json(json!({"type": "event", "event": event, "seq": seq, "payload": payload}))
            .await;
    }

    pub async fn respond(&mut self, id: &str, payload: Value) {
        self.send_json(json!({"type": "res", "id": id, "ok": true, "payload": payload}))
            .await;
    }

    pub async fn reject(&mut self, id: &str, code: &str, message: &str) {
        self.send_json(json!({
            "type": "res",
            "id": id,
            "ok": false,
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    /// Read the `connect` request, returning its id and params.
    pub async fn expect_connect(&mut self) -> (String, Value) {
        let frame = self.recv_frame().await;
        assert_eq!(frame["type"], "req");
        assert_eq!(frame["method"], "connect");
        (
            frame["id"].as_str().unwrap().to_string(),
            frame["params"].clone(),
        )
    }

    pub async fn send_hello(&mut self, id: &str) {
        self.respond(
            id,
            json!({
                "type": "hello-ok",
                "protocol": 3,
                "features": {"methods": ["echo"], "events": ["tick"]},
                "policy": {"tickIntervalMs": 30000}
            }),
        )
        .await;
    }

    /// Challenge, read `connect`, answer `hello-ok`; returns the connect params.
    pub async fn handshake(&mut self) -> Value {
        self.send_challenge("test-nonce").await;
        let (id, params) = self.expect_connect().await;
        self.send_hello(&id).await;
        params
    }

    pub async fn close(&mut self, code: u16, reason: &str) {
        let _ = self
            .ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })))
            .await;
    }
}
