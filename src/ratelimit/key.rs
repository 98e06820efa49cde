//! Client keys and the extraction of keys from incoming requests.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Identifier that partitions rate limits between callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ClientKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the limiter needs to know about an incoming request.
///
/// Header names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Transport-layer peer address
    pub peer_addr: Option<SocketAddr>,

    /// Request headers
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Maps a request to the key its budget is tracked under.
pub trait KeyExtractor: Send + Sync {
    /// Returns `None` when the request carries nothing to key on.
    fn extract(&self, request: &RequestMeta) -> Option<ClientKey>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&RequestMeta) -> Option<ClientKey> + Send + Sync,
{
    fn extract(&self, request: &RequestMeta) -> Option<ClientKey> {
        self(request)
    }
}

/// Keys requests by the peer's IP address. Ports are ignored so that
/// reconnecting clients share one budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddr;

impl KeyExtractor for PeerAddr {
    fn extract(&self, request: &RequestMeta) -> Option<ClientKey> {
        request
            .peer_addr
            .map(|addr| ClientKey::new(addr.ip().to_string()))
    }
}

/// Keys requests by a header value, e.g. `X-Forwarded-For` behind a proxy.
///
/// For comma-separated values the first entry is used.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: String,
}

impl HeaderKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, request: &RequestMeta) -> Option<ClientKey> {
        let value = request.header(&self.name)?;
        let first = value.split(',').next()?.trim();
        if first.is_empty() {
            None
        } else {
            Some(ClientKey::new(first))
        }
    }
}
