//! Minimal in-process HTTP server serving canned registry and MCP responses.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub type Handler = dyn Fn(&str) -> (u16, String) + Send + Sync;

pub struct TestServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Request targets (path and query) in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Request bodies in arrival order.
    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve every request with `handler(path_and_query)`.
pub async fn serve(handler: impl Fn(&str) -> (u16, String) + Send + Sync + 'static) -> TestServer {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler: Arc<Handler> = Arc::new(handler);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let bodies = Arc::new(Mutex::new(Vec::new()));

    let seen = requests.clone();
    let seen_bodies = bodies.clone();
    let task = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let handler = handler.clone();
            let seen = seen.clone();
            let seen_bodies = seen_bodies.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let header_end = loop {
                    let mut tmp = [0u8; 1024];
                    let n = match socket.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    let mut tmp = [0u8; 1024];
                    match socket.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }
                let body_end = buf.len().min(header_end + content_length);
                seen_bodies
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf[header_end..body_end]).to_string());

                let target = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                seen.lock().unwrap().push(target.clone());

                let (status, body) = handler(&target);
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    if status == 200 { "OK" } else { "Error" },
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    TestServer {
        base_url: format!("http://{}", addr),
        requests,
        bodies,
        task,
    }
}

/// One registry listing entry.
pub fn entry(name: &str) -> Value {
    json!({
        "server": {
            "name": name,
            "description": format!("{} server", name),
            "version": "1.0.0",
            "remotes": [{"type": "streamable-http", "url": "https://mcp.example/mcp"}]
        },
        "_meta": {}
    })
}

/// A `/v0/servers` page body.
pub fn page(names: &[&str], next_cursor: Option<&str>) -> String {
    let mut metadata = json!({"count": names.len()});
    if let Some(cursor) = next_cursor {
        metadata["nextCursor"] = json!(cursor);
    }
    json!({
        "servers": names.iter().map(|n| entry(n)).collect::<Vec<_>>(),
        "metadata": metadata
    })
    .to_string()
}

/// Value of `key` in the query string of a request target.
pub fn query_param<'a>(target: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = target.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}
