//! Mock backend speaking the length-delimited JSON protocol.
//!
//! Each accepted connection sends its greeting frames, then answers every
//! `chat_message` with whatever the script returns. Replies to one request
//! are sent in order; replies to different requests may interleave.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use chorus::backends::wire;
use chorus::config::{AggregatorConfig, BackendConfig, Domain};

pub enum Action {
    /// Wait, then send the frame.
    Send(Duration, Value),
    /// Close the connection.
    Hangup,
}

pub type Script = Arc<dyn Fn(&Value) -> Vec<Action> + Send + Sync>;

pub struct MockBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    shutdown: CancellationToken,
}

impl MockBackend {
    pub async fn spawn(script: Script) -> Self {
        Self::spawn_with_greeting(script, Vec::new()).await
    }

    pub async fn spawn_with_greeting(script: Script, greeting: Vec<Value>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
        let addr = listener.local_addr().expect("mock addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (reqs, token) = (requests.clone(), shutdown.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve(stream, script.clone(), greeting.clone(), reqs.clone(), token.clone()));
                    }
                }
            }
        });

        Self { addr, requests, shutdown }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Every `chat_message` received so far, across connections.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn encode(v: &Value) -> Bytes {
    Bytes::from(serde_json::to_vec(v).unwrap())
}

/// Serve one accepted connection until the peer or the script hangs up.
pub async fn serve(
    stream: TcpStream,
    script: Script,
    greeting: Vec<Value>,
    requests: Arc<Mutex<Vec<Value>>>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, wire::codec());
    for frame in &greeting {
        if framed.send(encode(frame)).await.is_err() {
            return;
        }
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Option<Value>>();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(next) = out_rx.recv() => match next {
                Some(v) => {
                    if framed.send(encode(&v)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            frame = framed.next() => {
                let Some(Ok(buf)) = frame else { break };
                let request: Value = serde_json::from_slice(&buf).unwrap();
                requests.lock().unwrap().push(request.clone());
                let actions = script(&request);
                let tx = out_tx.clone();
                tokio::spawn(async move {
                    for action in actions {
                        match action {
                            Action::Send(delay, v) => {
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                let _ = tx.send(Some(v));
                            }
                            Action::Hangup => {
                                let _ = tx.send(None);
                            }
                        }
                    }
                });
            }
        }
    }
}

fn cid(request: &Value) -> Value {
    request["correlationId"].clone()
}

/// Reply once with `text`.
pub fn answer(text: &str) -> Script {
    let text = text.to_string();
    Arc::new(move |req| vec![Action::Send(Duration::ZERO, json!({"correlationId": cid(req), "response": text}))])
}

/// Reply once with `text` after `delay`.
pub fn answer_after(delay: Duration, text: &str) -> Script {
    let text = text.to_string();
    Arc::new(move |req| vec![Action::Send(delay, json!({"correlationId": cid(req), "response": text}))])
}

/// Reply without a correlation id.
pub fn answer_uncorrelated(text: &str) -> Script {
    let text = text.to_string();
    Arc::new(move |_| vec![Action::Send(Duration::ZERO, json!({"response": text}))])
}

pub fn silent() -> Script {
    Arc::new(|_| Vec::new())
}

pub fn fail_with(message: &str) -> Script {
    let message = message.to_string();
    Arc::new(move |req| {
        vec![Action::Send(Duration::ZERO, json!({"correlationId": cid(req), "kind": "error", "error": message}))]
    })
}

pub fn hang_up() -> Script {
    Arc::new(|_| vec![Action::Hangup])
}

/// Send one chunk, then close the connection before the stream ends.
pub fn chunk_then_hang_up(chunk: &str) -> Script {
    let chunk = chunk.to_string();
    Arc::new(move |req| {
        vec![
            Action::Send(Duration::ZERO, json!({"correlationId": cid(req), "kind": "chunk", "content": chunk})),
            Action::Hangup,
        ]
    })
}

/// Stream `chunks` with `gap` between frames, then `end`.
pub fn stream(chunks: &[&str], gap: Duration) -> Script {
    let chunks: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
    Arc::new(move |req| {
        let id = cid(req);
        let mut actions: Vec<Action> = chunks
            .iter()
            .map(|c| Action::Send(gap, json!({"correlationId": id, "kind": "chunk", "content": c})))
            .collect();
        actions.push(Action::Send(gap, json!({"correlationId": id, "kind": "end"})));
        actions
    })
}

/// An endpoint nothing listens on.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn backend(name: &str, endpoint: &str, domain: Domain) -> BackendConfig {
    BackendConfig::new(name, endpoint).with_domain(domain)
}

/// Discovery off, quick reconnects, short response timeout.
pub fn config(backends: Vec<BackendConfig>) -> AggregatorConfig {
    let mut config = AggregatorConfig::new(backends);
    config.discovery.skip = true;
    config.reconnect.base_delay_ms = 50;
    config.reconnect.cap_delay_ms = 200;
    config.reconnect.connect_timeout_ms = 500;
    config.dispatch.response_timeout_ms = 5_000;
    config
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
