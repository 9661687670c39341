//! Hostname resolution used by the pool refresher.

use std::collections::BTreeSet;
use std::io;
use std::net::IpAddr;

use futures_util::future::BoxFuture;

/// Resolves an upstream host to the set of addresses it currently points at.
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<BTreeSet<IpAddr>>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via Tokio).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<BTreeSet<IpAddr>>> {
        let target = format!("{}:{}", host, port);
        Box::pin(async move {
            let addrs: BTreeSet<IpAddr> = tokio::net::lookup_host(target)
                .await?
                .map(|addr| addr.ip())
                .collect();
            if addrs.is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no addresses returned"));
            }
            Ok(addrs)
        })
    }
}
