//! Minimal HTTP/1.1 front end for a node.
//!
//! One request per connection, JSON in and out:
//!
//! - `GET /chain`
//! - `POST /transactions/new` with `{"sender", "recipient", "amount"}`
//! - `GET /mine`
//! - `POST /nodes/register` with `{"nodes": [...]}`
//! - `GET /nodes/resolve`

use serde::Deserialize;
use serde_json::{json, Number, Value};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runtime::Runtime;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Deserialize)]
struct NewTransactionRequest {
    sender: String,
    recipient: String,
    amount: Number,
}

#[derive(Deserialize)]
struct RegisterNodesRequest {
    nodes: Vec<String>,
}

/// Status code and JSON body of a handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "error": message.into() }))
    }
}

/// Accept connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    runtime: Arc<Runtime>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "http listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("http server stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, runtime).await {
                        debug!(%peer, error = %e, "connection error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, runtime: Arc<Runtime>) -> io::Result<()> {
    let response = match read_request(&mut stream, READ_TIMEOUT).await {
        Ok(req) => {
            debug!(method = %req.method, path = %req.path, "request");
            route(&runtime, &req.method, &req.path, &req.body).await
        }
        Err(e) => Response::error(400, e.to_string()),
    };
    stream.write_all(&build_response(&response)).await?;
    stream.shutdown().await
}

/// Dispatch one request against the node.
pub async fn route(runtime: &Runtime, method: &str, path: &str, body: &[u8]) -> Response {
    let path = path.split('?').next().unwrap_or(path);
    match (method, path) {
        ("GET", "/chain") => {
            let snapshot = runtime.chain().await;
            match serde_json::to_value(&snapshot) {
                Ok(body) => Response::new(200, body),
                Err(e) => Response::error(500, e.to_string()),
            }
        }
        ("POST", "/transactions/new") => {
            let req = match serde_json::from_slice::<NewTransactionRequest>(body) {
                Ok(req) => req,
                Err(_) => return Response::error(400, "Missing values"),
            };
            let index = runtime
                .new_transaction(req.sender, req.recipient, req.amount)
                .await;
            Response::new(
                201,
                json!({
                    "message": format!("Transaction will be added to Block {index}"),
                    "index": index,
                }),
            )
        }
        ("GET", "/mine") => match runtime.mine().await {
            Ok(block) => Response::new(
                200,
                json!({
                    "message": "New Block Forged",
                    "index": block.index,
                    "transactions": block.transactions,
                    "proof": block.proof,
                    "previous_hash": block.previous_hash,
                }),
            ),
            Err(e) => Response::error(500, e.to_string()),
        },
        ("POST", "/nodes/register") => {
            let req = match serde_json::from_slice::<RegisterNodesRequest>(body) {
                Ok(req) if !req.nodes.is_empty() => req,
                _ => return Response::error(400, "Please supply a valid list of nodes"),
            };
            for node in &req.nodes {
                if let Err(e) = runtime.register_node(node).await {
                    return Response::error(400, e.to_string());
                }
            }
            Response::new(
                201,
                json!({
                    "message": "New nodes have been added",
                    "total_nodes": runtime.peers().await,
                }),
            )
        }
        ("GET", "/nodes/resolve") => {
            let resolution = runtime.resolve_conflicts().await;
            let message = if resolution.replaced {
                "Our chain was replaced"
            } else {
                "Our chain is authoritative"
            };
            Response::new(
                200,
                json!({
                    "message": message,
                    "replaced": resolution.replaced,
                    "chain": *resolution.chain,
                }),
            )
        }
        _ => Response::error(404, "not found"),
    }
}

async fn read_request(stream: &mut TcpStream, timeout: Duration) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let header_end = loop {
        let mut tmp = [0u8; 1024];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "malformed request"));
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
    };

    let header_str = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header"))?;
    let mut lines = header_str.split("\r\n").filter(|l| !l.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let content_len: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_len > MAX_BODY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "content-length exceeds limit",
        ));
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_len {
        let mut tmp = vec![0u8; (content_len - body.len()).min(8192)];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete request body",
            ));
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_len);

    Ok(HttpRequest { method, path, body })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

fn build_response(response: &Response) -> Vec<u8> {
    let body = response.body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
        response.status,
        reason(response.status),
        body.len()
    )
    .into_bytes()
}
