//! Scripted MAGE backend for integration tests.
//!
//! Every request is recorded on arrival and answered by a responder closure
//! that sees the request number and the recorded request.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::Router;
use mage_client::ClientConfig;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub body: String,
    pub at: Instant,
}

impl Recorded {
    /// Value of a decoded query parameter.
    pub fn param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Arc<dyn Fn(usize, &Recorded) -> Reply + Send + Sync>;

struct BackendState {
    requests: Mutex<Vec<Recorded>>,
    responder: Responder,
}

pub struct TestBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
}

impl TestBackend {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(usize, &Recorded) -> Reply + Send + Sync + 'static,
    {
        let state = Arc::new(BackendState {
            requests: Mutex::new(Vec::new()),
            responder: Arc::new(responder),
        });

        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Server error");
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Requests whose path starts with `prefix`.
    pub fn requests_to(&self, prefix: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.starts_with(prefix))
            .collect()
    }

    /// Wait until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<Recorded> {
        let start = Instant::now();
        loop {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Expected {} requests within {:?}, got {}",
                    count,
                    timeout,
                    requests.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Client configuration pointing both surfaces at this backend.
    pub fn config(&self, transport: &str, commands: &str) -> ClientConfig {
        let text = format!(
            r#"{{
                "server": {{
                    "commandCenter": {{ "url": "{game}", "commands": {commands} }},
                    "msgStream": {{
                        "detect": ["{transport}"],
                        "transports": {{
                            "{transport}": {{
                                "url": "{stream}",
                                "afterRequestInterval": 20,
                                "afterErrorInterval": 200,
                                "timeout": 1000
                            }}
                        }}
                    }}
                }}
            }}"#,
            game = self.url("/game"),
            stream = self.url("/msgstream"),
            transport = transport,
            commands = commands,
        );
        ClientConfig::from_json(&text).unwrap()
    }
}

async fn handle(
    State(state): State<Arc<BackendState>>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, String) {
    let recorded = Recorded {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        body,
        at: Instant::now(),
    };

    let index = {
        let mut requests = state.requests.lock().unwrap();
        requests.push(recorded.clone());
        requests.len() - 1
    };

    let reply = (state.responder)(index, &recorded);
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    (
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        reply.body,
    )
}

/// Drain every event currently buffered on a broadcast receiver.
pub fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
