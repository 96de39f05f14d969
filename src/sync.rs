use async_trait::async_trait;
use reqwest::{Client, Url};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use crate::types::ChainResponse;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    #[error("Peer {peer} timed out")]
    Timeout { peer: String },
    #[error("Peer {peer} answered with status {status}")]
    BadStatus { peer: String, status: u16 },
    #[error("Peer {peer} sent a malformed chain: {reason}")]
    Malformed { peer: String, reason: String },
}

/// Something that can hand over a peer's full chain.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Address or label used in logs.
    fn peer(&self) -> &str;

    /// Fetch the peer's `(length, chain)` snapshot.
    async fn fetch(&self) -> Result<ChainResponse, SyncError>;
}

/// Fetches `GET /chain` from a peer node over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChainSource {
    address: String,
    client: Client,
}

impl HttpChainSource {
    pub fn new(address: impl Into<String>, client: Client) -> Self {
        Self {
            address: address.into(),
            client,
        }
    }

    /// Client shared by every peer source of a node.
    pub fn client(timeout: Duration) -> Result<Client, SyncError> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Unreachable {
                peer: "*".to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ChainSource for HttpChainSource {
    fn peer(&self) -> &str {
        &self.address
    }

    async fn fetch(&self) -> Result<ChainResponse, SyncError> {
        let url = format!("http://{}/chain", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Unreachable {
                peer: self.address.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::BadStatus {
                peer: self.address.clone(),
                status: status.as_u16(),
            });
        }

        response
            .json::<ChainResponse>()
            .await
            .map_err(|e| SyncError::Malformed {
                peer: self.address.clone(),
                reason: e.to_string(),
            })
    }
}

/// Fixed response, for tests and for wiring a node to an in-process peer.
#[derive(Debug, Clone)]
pub struct StaticChainSource {
    label: String,
    response: Option<ChainResponse>,
}

impl StaticChainSource {
    pub fn new(label: impl Into<String>, response: ChainResponse) -> Self {
        Self {
            label: label.into(),
            response: Some(response),
        }
    }

    /// A source that always fails as unreachable.
    pub fn unreachable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            response: None,
        }
    }
}

#[async_trait]
impl ChainSource for StaticChainSource {
    fn peer(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> Result<ChainResponse, SyncError> {
        self.response.clone().ok_or_else(|| SyncError::Unreachable {
            peer: self.label.clone(),
            reason: "no response".to_string(),
        })
    }
}

/// Normalize a node address to `host[:port]`.
///
/// Accepts `http://host:port/...` as well as a bare `host:port`.
pub fn parse_address(address: &str) -> Result<String, SyncError> {
    let trimmed = address.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&with_scheme).map_err(|_| SyncError::InvalidAddress(address.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SyncError::InvalidAddress(address.to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Deduplicated set of peer addresses known to a node.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    nodes: BTreeSet<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its normalized address.
    pub fn register(&mut self, address: &str) -> Result<String, SyncError> {
        let node = parse_address(address)?;
        self.nodes.insert(node.clone());
        Ok(node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(
            parse_address("http://192.168.0.5:5000").unwrap(),
            "192.168.0.5:5000"
        );
        assert_eq!(
            parse_address("http://192.168.0.5:5000/chain").unwrap(),
            "192.168.0.5:5000"
        );
        assert_eq!(parse_address("localhost:5001").unwrap(), "localhost:5001");
        assert_eq!(parse_address("  node.example  ").unwrap(), "node.example");
        assert!(matches!(
            parse_address("http://"),
            Err(SyncError::InvalidAddress(_))
        ));
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_registry_deduplicates() {
        let mut peers = PeerRegistry::new();
        assert_eq!(peers.register("http://127.0.0.1:5001").unwrap(), "127.0.0.1:5001");
        peers.register("127.0.0.1:5001").unwrap();
        peers.register("127.0.0.1:5002").unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains("127.0.0.1:5002"));
        assert_eq!(
            peers.iter().collect::<Vec<_>>(),
            vec!["127.0.0.1:5001", "127.0.0.1:5002"]
        );
    }

    #[tokio::test]
    async fn test_static_source() {
        let ok = StaticChainSource::new("a", ChainResponse::new(Vec::new()));
        assert_eq!(ok.fetch().await.unwrap().length, 0);

        let down = StaticChainSource::unreachable("b");
        assert_eq!(down.peer(), "b");
        assert!(matches!(
            down.fetch().await,
            Err(SyncError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_source_reports_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpChainSource::client(Duration::from_secs(2)).unwrap();
        let source = HttpChainSource::new(addr.to_string(), client);
        assert!(matches!(
            source.fetch().await,
            Err(SyncError::Unreachable { .. })
        ));
    }
}
