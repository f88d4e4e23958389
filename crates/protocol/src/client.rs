//! Reconnecting gateway client.
//!
//! One task owns the socket and every piece of session state. Handles talk to
//! it over a command channel; the task multiplexes commands, inbound frames and
//! the challenge timer, so nothing here needs a lock.

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::error::ClientError;
use crate::frame::{ErrorShape, EventFrame, Frame, HelloOk, RequestFrame, ResponseFrame};
use crate::handshake::{
    challenge_nonce, parse_hello, ClientDescriptor, ConnectParams, CHALLENGE_EVENT, CLIENT_MODE,
    CONNECT_FAILED_CODE, CONNECT_FAILED_REASON, CONNECT_METHOD, MALFORMED_FRAME_CODE,
    MALFORMED_FRAME_REASON,
};
use crate::signer::DeviceAuthSigner;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Reply = oneshot::Sender<Result<Value, ClientError>>;

pub type EventCallback = Arc<dyn Fn(&EventFrame) + Send + Sync>;
pub type HelloCallback = Arc<dyn Fn(&HelloOk) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    /// Bearer token sent in `auth` and signed into the device assertion.
    pub token: Option<String>,
    pub client_id: String,
    pub client_version: String,
    pub platform: String,
    pub locale: String,
    /// How long to wait for `connect.challenge` before connecting without a nonce.
    pub challenge_wait: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: "cli".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            locale: "en-US".to_string(),
            challenge_wait: Duration::from_millis(750),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn for_port(port: u16) -> Self {
        Self::new(format!("ws://127.0.0.1:{}", port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Socket open and `hello-ok` received.
    pub connected: bool,
    pub last_seq: Option<u64>,
}

enum Command {
    Request {
        method: String,
        params: Option<Value>,
        reply: Reply,
    },
    AddListener(ListenerId, EventCallback),
    RemoveListener(ListenerId),
    Stop(oneshot::Sender<()>),
}

pub struct GatewayClientBuilder {
    options: ClientOptions,
    signer: Option<Arc<dyn DeviceAuthSigner>>,
    on_hello: Option<HelloCallback>,
    on_event: Option<EventCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

impl GatewayClientBuilder {
    pub fn signer(mut self, signer: Arc<dyn DeviceAuthSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn on_hello<F>(mut self, f: F) -> Self
    where
        F: Fn(&HelloOk) + Send + Sync + 'static,
    {
        self.on_hello = Some(Arc::new(f));
        self
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn start(self) -> GatewayClient {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let task = ClientTask {
            backoff: Backoff::new(self.options.reconnect.clone()),
            options: self.options,
            signer: self.signer,
            on_hello: self.on_hello,
            on_event: self.on_event,
            on_close: self.on_close,
            on_error: self.on_error,
            listeners: Vec::new(),
            commands: commands_rx,
            status: status_tx,
        };
        tokio::spawn(task.run());

        GatewayClient {
            commands: commands_tx,
            status: status_rx,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Handle to the connection task. Dropping every clone stops the client.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    next_listener: Arc<AtomicU64>,
}

impl GatewayClient {
    pub fn builder(options: ClientOptions) -> GatewayClientBuilder {
        GatewayClientBuilder {
            options,
            signer: None,
            on_hello: None,
            on_event: None,
            on_close: None,
            on_error: None,
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Fails immediately with `NotConnected` when there is no socket. While the
    /// handshake is in progress the request is held back until `hello-ok`.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn request_as<T, P>(&self, method: &str, params: &P) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)?;
        let params = if params.is_null() { None } else { Some(params) };
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn add_event_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let _ = self.commands.send(Command::AddListener(id, Arc::new(f)));
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) {
        let _ = self.commands.send(Command::RemoveListener(id));
    }

    /// Close the socket, cancel reconnection and fail everything in flight.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.status.borrow().last_seq
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Resolve once the handshake has completed.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.connected)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }
}

struct QueuedRequest {
    method: String,
    params: Option<Value>,
    reply: Reply,
}

/// State of one physical connection.
struct Session {
    pending: HashMap<String, Reply>,
    queued: Vec<QueuedRequest>,
    nonce: Option<String>,
    connect_sent: bool,
    connect_id: Option<String>,
    handshake_complete: bool,
    opened_at: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            queued: Vec::new(),
            nonce: None,
            connect_sent: false,
            connect_id: None,
            handshake_complete: false,
            opened_at: Instant::now(),
        }
    }

    fn fail_all(&mut self, error: &ClientError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error.clone()));
        }
        for queued in self.queued.drain(..) {
            let _ = queued.reply.send(Err(error.clone()));
        }
    }
}

enum Exit {
    Closed { code: u16, reason: String },
    Stopped(Option<oneshot::Sender<()>>),
}

struct ClientTask {
    options: ClientOptions,
    signer: Option<Arc<dyn DeviceAuthSigner>>,
    on_hello: Option<HelloCallback>,
    on_event: Option<EventCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
    listeners: Vec<(ListenerId, EventCallback)>,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
}

impl ClientTask {
    async fn run(mut self) {
        loop {
            let url = self.options.url.clone();
            let connected = {
                let connect = connect_async(url);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        result = &mut connect => break result,
                        command = self.commands.recv() => {
                            if self.handle_offline(command).is_break() {
                                return;
                            }
                        }
                    }
                }
            };

            match connected {
                Ok((ws, _)) => {
                    tracing::debug!(url = %self.options.url, "Gateway socket open");
                    match self.run_session(ws).await {
                        Some((code, reason)) => {
                            tracing::info!(code, reason = %reason, "Gateway connection closed");
                            if let Some(on_close) = &self.on_close {
                                guarded("close callback", || on_close(code, &reason));
                            }
                        }
                        None => return,
                    }
                }
                Err(e) => {
                    tracing::debug!(url = %self.options.url, error = %e, "Gateway connect failed");
                    self.report_error(&ClientError::Transport(e.to_string()));
                }
            }

            let delay = self.backoff.next_delay();
            crate::metrics::increment_reconnects();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => {
                        if self.handle_offline(command).is_break() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Commands while no socket is open.
    fn handle_offline(&mut self, command: Option<Command>) -> ControlFlow<()> {
        match command {
            None => ControlFlow::Break(()),
            Some(Command::Stop(reply)) => {
                let _ = reply.send(());
                ControlFlow::Break(())
            }
            Some(Command::Request { reply, .. }) => {
                let _ = reply.send(Err(ClientError::NotConnected));
                ControlFlow::Continue(())
            }
            Some(Command::AddListener(id, listener)) => {
                self.listeners.push((id, listener));
                ControlFlow::Continue(())
            }
            Some(Command::RemoveListener(id)) => {
                self.listeners.retain(|(existing, _)| *existing != id);
                ControlFlow::Continue(())
            }
        }
    }

    /// Drive one connection. `Some((code, reason))` when it closed, `None`
    /// when the client was stopped.
    async fn run_session(&mut self, ws: WsStream) -> Option<(u16, String)> {
        let (mut sink, mut stream) = ws.split();
        let mut session = Session::new();
        let challenge = tokio::time::sleep(self.options.challenge_wait);
        tokio::pin!(challenge);

        let exit = loop {
            tokio::select! {
                _ = &mut challenge, if !session.connect_sent => {
                    tracing::debug!("No connect challenge received, connecting without nonce");
                    if let Err(exit) = self.send_connect(&mut sink, &mut session).await {
                        break exit;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(exit) = self.handle_text(&text, &mut sink, &mut session).await {
                            break exit;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((NO_STATUS, String::new()));
                        break Exit::Closed { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Exit::Closed { code: ABNORMAL_CLOSURE, reason: e.to_string() };
                    }
                    None => {
                        break Exit::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "connection lost".to_string(),
                        };
                    }
                },
                command = self.commands.recv() => match command {
                    None => {
                        send_close(&mut sink, NORMAL_CLOSURE, "client stopped").await;
                        break Exit::Stopped(None);
                    }
                    Some(Command::Stop(reply)) => {
                        send_close(&mut sink, NORMAL_CLOSURE, "client stopped").await;
                        break Exit::Stopped(Some(reply));
                    }
                    Some(Command::Request { method, params, reply }) => {
                        if session.handshake_complete {
                            if let Err(exit) = write_request(&mut sink, &mut session, method, params, reply).await {
                                break exit;
                            }
                        } else {
                            session.queued.push(QueuedRequest { method, params, reply });
                        }
                    }
                    Some(Command::AddListener(id, listener)) => self.listeners.push((id, listener)),
                    Some(Command::RemoveListener(id)) => {
                        self.listeners.retain(|(existing, _)| *existing != id);
                    }
                },
            }
        };

        self.status.send_modify(|status| status.connected = false);
        match exit {
            Exit::Closed { code, reason } => {
                session.fail_all(&ClientError::ConnectionClosed {
                    code,
                    reason: reason.clone(),
                });
                Some((code, reason))
            }
            Exit::Stopped(reply) => {
                session.fail_all(&ClientError::Stopped);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                None
            }
        }
    }

    async fn send_connect(&mut self, sink: &mut WsSink, session: &mut Session) -> Result<(), Exit> {
        session.connect_sent = true;

        let descriptor = ClientDescriptor {
            id: self.options.client_id.clone(),
            version: self.options.client_version.clone(),
            platform: self.options.platform.clone(),
            mode: CLIENT_MODE.to_string(),
        };
        let mut params = ConnectParams::new(descriptor, self.options.token.as_deref(), &self.options.locale);

        if let (Some(signer), Some(token)) = (&self.signer, &self.options.token) {
            let auth_params = params.device_auth_params(token, session.nonce.as_deref());
            match signer.sign(&auth_params).await {
                Ok(device) => params.device = Some(device),
                Err(e) => {
                    tracing::warn!(error = %e, "Device auth signing failed, connecting without device identity");
                }
            }
        }

        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(error = %e, "Could not encode connect params");
                return Err(fail_handshake(sink).await);
            }
        };

        let id = Uuid::new_v4().to_string();
        session.connect_id = Some(id.clone());
        tracing::debug!(nonce = session.nonce.is_some(), "Sending connect");

        let frame = Frame::Req(RequestFrame {
            id,
            method: CONNECT_METHOD.to_string(),
            params: Some(params),
        });
        match serde_json::to_string(&frame) {
            Ok(text) => send_text(sink, text).await,
            Err(e) => {
                tracing::error!(error = %e, "Could not encode connect frame");
                Err(fail_handshake(sink).await)
            }
        }
    }

    async fn handle_text(&mut self, text: &str, sink: &mut WsSink, session: &mut Session) -> Result<(), Exit> {
        let Some(frame) = Frame::parse(text) else {
            tracing::warn!("Malformed frame from gateway, dropping connection");
            send_close(sink, MALFORMED_FRAME_CODE, MALFORMED_FRAME_REASON).await;
            return Err(Exit::Closed {
                code: MALFORMED_FRAME_CODE,
                reason: MALFORMED_FRAME_REASON.to_string(),
            });
        };

        match frame {
            Frame::Event(event) if event.event == CHALLENGE_EVENT => {
                if let Some(nonce) = challenge_nonce(event.payload.as_ref()) {
                    session.nonce = Some(nonce);
                }
                if !session.connect_sent {
                    self.send_connect(sink, session).await?;
                }
                Ok(())
            }
            Frame::Event(event) => {
                if let Some(seq) = event.seq {
                    self.status.send_modify(|status| status.last_seq = Some(seq));
                }
                self.dispatch_event(&event);
                Ok(())
            }
            Frame::Res(res) if session.connect_id.as_deref() == Some(res.id.as_str()) => {
                self.finish_handshake(res, sink, session).await
            }
            Frame::Res(res) => {
                match session.pending.remove(&res.id) {
                    Some(reply) => {
                        let _ = reply.send(response_result(res));
                    }
                    None => tracing::debug!(id = %res.id, "Response for unknown request"),
                }
                Ok(())
            }
            Frame::Req(req) => {
                tracing::debug!(method = %req.method, "Ignoring request from gateway");
                Ok(())
            }
            Frame::Unknown => {
                tracing::debug!("Ignoring frame of unknown type");
                Ok(())
            }
        }
    }

    async fn finish_handshake(
        &mut self,
        res: ResponseFrame,
        sink: &mut WsSink,
        session: &mut Session,
    ) -> Result<(), Exit> {
        session.connect_id = None;
        let hello = if res.ok {
            parse_hello(res.payload)
        } else {
            Err(rejection(res.error))
        };

        let hello = match hello {
            Ok(hello) => hello,
            Err(e) => {
                tracing::warn!(error = %e, "Gateway handshake failed");
                self.report_error(&e);
                return Err(fail_handshake(sink).await);
            }
        };

        session.handshake_complete = true;
        self.backoff.reset();
        self.status.send_modify(|status| status.connected = true);
        crate::metrics::record_handshake_latency(session.opened_at.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(protocol = hello.protocol, "Gateway handshake complete");

        if let Some(on_hello) = &self.on_hello {
            guarded("hello callback", || on_hello(&hello));
        }

        for queued in std::mem::take(&mut session.queued) {
            write_request(sink, session, queued.method, queued.params, queued.reply).await?;
        }
        Ok(())
    }

    fn dispatch_event(&self, event: &EventFrame) {
        if let Some(on_event) = &self.on_event {
            guarded("event callback", || on_event(event));
        }
        for (_, listener) in &self.listeners {
            guarded("event listener", || listener(event));
        }
    }

    fn report_error(&self, error: &ClientError) {
        if let Some(on_error) = &self.on_error {
            guarded("error callback", || on_error(error));
        }
    }
}

async fn write_request(
    sink: &mut WsSink,
    session: &mut Session,
    method: String,
    params: Option<Value>,
    reply: Reply,
) -> Result<(), Exit> {
    let id = Uuid::new_v4().to_string();
    let frame = Frame::Req(RequestFrame {
        id: id.clone(),
        method,
        params,
    });
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return Ok(());
        }
    };

    session.pending.insert(id, reply);
    crate::metrics::increment_requests();
    send_text(sink, text).await
}

async fn send_text(sink: &mut WsSink, text: String) -> Result<(), Exit> {
    sink.send(Message::Text(text))
        .await
        .map_err(|e| Exit::Closed {
            code: ABNORMAL_CLOSURE,
            reason: e.to_string(),
        })
}

async fn send_close(sink: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Close frame not delivered");
    }
}

async fn fail_handshake(sink: &mut WsSink) -> Exit {
    send_close(sink, CONNECT_FAILED_CODE, CONNECT_FAILED_REASON).await;
    Exit::Closed {
        code: CONNECT_FAILED_CODE,
        reason: CONNECT_FAILED_REASON.to_string(),
    }
}

fn response_result(res: ResponseFrame) -> Result<Value, ClientError> {
    if res.ok {
        Ok(res.payload.unwrap_or(Value::Null))
    } else {
        Err(rejection(res.error))
    }
}

fn rejection(error: Option<ErrorShape>) -> ClientError {
    match error {
        Some(error) => ClientError::Rejected {
            code: error.code,
            message: error.message,
            details: error.details,
        },
        None => ClientError::Rejected {
            code: "UNKNOWN".to_string(),
            message: "request failed".to_string(),
            details: None,
        },
    }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("{} panicked", what);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_result() {
        let ok = ResponseFrame {
            id: "1".to_string(),
            ok: true,
            payload: Some(json!({"n": 1})),
            error: None,
        };
        assert_eq!(response_result(ok), Ok(json!({"n": 1})));

        let rejected = ResponseFrame {
            id: "2".to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: "INVALID".to_string(),
                message: "bad params".to_string(),
                details: Some(json!({"field": "x"})),
                retryable: None,
            }),
        };
        assert_eq!(
            response_result(rejected),
            Err(ClientError::Rejected {
                code: "INVALID".to_string(),
                message: "bad params".to_string(),
                details: Some(json!({"field": "x"})),
            })
        );
    }

    #[test]
    fn test_guarded_swallows_panics() {
        let mut ran = false;
        guarded("test", || ran = true);
        assert!(ran);
        guarded("test", || panic!("boom"));
    }

    #[test]
    fn test_session_fail_all() {
        let mut session = Session::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        session.pending.insert("a".to_string(), tx1);
        session.queued.push(QueuedRequest {
            method: "m".to_string(),
            params: None,
            reply: tx2,
        });

        let error = ClientError::ConnectionClosed {
            code: 1011,
            reason: "boom".to_string(),
        };
        session.fail_all(&error);

        assert_eq!(rx1.try_recv().unwrap(), Err(error.clone()));
        assert_eq!(rx2.try_recv().unwrap(), Err(error));
        assert!(session.pending.is_empty());
        assert!(session.queued.is_empty());
    }
}
