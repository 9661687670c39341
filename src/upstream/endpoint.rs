//! Upstream endpoint identity.

use serde::Serialize;
use url::Url;

/// Which configured slot an endpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointName {
    Primary,
    Secondary,
}

/// One of the two upstream JSON-RPC endpoints.
///
/// Endpoints are immutable; the role an endpoint plays is decided by the
/// current [`RoleAssignment`](crate::proxy::roles::RoleAssignment) and its
/// pooled client lives in the [`EndpointPool`](crate::upstream::EndpointPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: EndpointName,
    url: Url,
}

impl Endpoint {
    pub fn new(name: EndpointName, url: Url) -> Self {
        Self { name, url }
    }

    pub fn name(&self) -> EndpointName {
        self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}
