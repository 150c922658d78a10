//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mission_control_client::ws::{Frame, Socket, Transport};
use mission_control_shared::{ConnectionError, Session};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

/// How the fake server answers one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    Refuse,
    /// Never completes.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub url: String,
    pub protocol: Option<String>,
    pub at: Instant,
}

/// In-memory transport. Each accepted handshake hands the server side of
/// the socket to the test through the receiver returned by [`FakeTransport::new`].
pub struct FakeTransport {
    script: Mutex<VecDeque<Handshake>>,
    attempts: Mutex<Vec<Attempt>>,
    open: Arc<AtomicUsize>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            open: Arc::new(AtomicUsize::new(0)),
            servers,
        });
        (transport, receiver)
    }

    /// Queue handshake outcomes; once the queue is empty every handshake succeeds.
    pub fn script(&self, outcomes: &[Handshake]) {
        self.script.lock().extend(outcomes.iter().copied());
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    pub fn open_sockets(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        url: &Url,
        protocol: Option<&str>,
    ) -> Result<Box<dyn Socket>, ConnectionError> {
        self.attempts.lock().push(Attempt {
            url: url.to_string(),
            protocol: protocol.map(str::to_string),
            at: Instant::now(),
        });
        let outcome = self.script.lock().pop_front().unwrap_or(Handshake::Accept);
        match outcome {
            Handshake::Refuse => Err(ConnectionError::Handshake("connection refused".into())),
            Handshake::Hang => {
                std::future::pending::<()>().await;
                Err(ConnectionError::Handshake("unreachable".into()))
            }
            Handshake::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                self.open.fetch_add(1, Ordering::SeqCst);
                let _ = self.servers.send(ServerEnd {
                    protocol: protocol.map(str::to_string),
                    to_client,
                    from_client,
                });
                let socket: Box<dyn Socket> = Box::new(FakeSocket {
                    inbound,
                    outbound,
                    protocol: protocol.map(str::to_string),
                    open: self.open.clone(),
                });
                Ok(socket)
            }
        }
    }
}

struct FakeSocket {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    protocol: Option<String>,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl Socket for FakeSocket {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::Send("server end dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError> {
        let _ = self.outbound.send(Frame::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The server's side of one accepted socket. Dropping it looks like the
/// network going away (close code 1006 on the client).
pub struct ServerEnd {
    pub protocol: Option<String>,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Frame::Text(text.to_string()));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Frame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame from the client, parsed as JSON.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.next_frame().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                _ => continue,
            }
        }
    }
}

pub fn session(token: &str) -> Session {
    Session {
        access_token: Some(token.to_string()),
        user_id: "op-1".to_string(),
        enterprise_id: Some("ent-1".to_string()),
        expiry: None,
    }
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Thread-safe recorder usable from handler closures.
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, item: T) {
        self.0.lock().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Paused-clock timing check with a little slack for timer rounding.
pub fn assert_elapsed(since: Instant, expected: Duration) {
    let elapsed = since.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(5),
        "elapsed {elapsed:?}, expected {expected:?}"
    );
}
