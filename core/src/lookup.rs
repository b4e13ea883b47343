//! Resolver seam for reverse DNS and ident lookups
//!
//! The concrete resolver is an external collaborator; the core only
//! consumes this interface on accept. The default implementation
//! resolves nothing, leaving the IP as the hostname, which keeps the
//! accept path non-blocking without a resolver wired in.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};

/// Result of a reverse DNS lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    pub hostname: Option<String>,
}

/// Result of an ident (RFC 1413) lookup.
#[derive(Debug, Clone, Default)]
pub struct IdentResult {
    pub username: Option<String>,
}

/// Interface the accept path calls into.
#[async_trait]
pub trait LookupService: Send + Sync {
    async fn reverse_dns(&self, ip: IpAddr) -> LookupResult;
    async fn ident(&self, remote: SocketAddr, local: SocketAddr) -> IdentResult;
}

/// Resolver that answers nothing, immediately.
pub struct NullLookupService;

#[async_trait]
impl LookupService for NullLookupService {
    async fn reverse_dns(&self, _ip: IpAddr) -> LookupResult {
        LookupResult::default()
    }

    async fn ident(&self, _remote: SocketAddr, _local: SocketAddr) -> IdentResult {
        IdentResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_lookup_answers_nothing() {
        let lookup = NullLookupService;
        let dns = lookup.reverse_dns("10.0.0.1".parse().unwrap()).await;
        assert!(dns.hostname.is_none());
    }
}
