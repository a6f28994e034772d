//! Scripted HTTP server for exercising the outbound clients in tests

use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};

/// A request the server received
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct Script {
    /// Replies in order; the last one repeats once the rest are used up
    replies: Vec<(u16, String)>,
    received: Vec<Received>,
}

pub(crate) struct TestServer {
    pub url: String,
    script: Arc<Mutex<Script>>,
}

impl TestServer {
    /// Bind to an ephemeral local port and answer with `replies`
    pub async fn start(replies: Vec<(u16, &str)>) -> Self {
        let script = Arc::new(Mutex::new(Script {
            replies: replies
                .into_iter()
                .map(|(status, body)| (status, body.to_string()))
                .collect(),
            received: Vec::new(),
        }));

        let app = Router::new().fallback(reply).with_state(script.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            url: format!("http://{}", addr),
            script,
        }
    }

    pub fn received(&self) -> Vec<Received> {
        self.script.lock().unwrap().received.clone()
    }
}

async fn reply(
    State(script): State<Arc<Mutex<Script>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut script = script.lock().unwrap();
    let index = script.received.len().min(script.replies.len().saturating_sub(1));
    let (status, text) = script.replies.get(index).cloned().unwrap_or((200, String::new()));
    script.received.push(Received {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    });

    let status = StatusCode::from_u16(status).unwrap();
    (status, [("content-type", "application/json")], text).into_response()
}

/// Address of a port nothing listens on
pub(crate) async fn closed_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
