use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one scheduler node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub address: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Endpoint for this host, falling back to localhost when the hostname is unreadable.
    pub fn local(port: u16) -> Self {
        let address = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self::new(address, port)
    }

    /// Stable key used for weight records.
    pub fn id(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn parse_id(id: &str) -> Option<Self> {
        let (address, port) = id.rsplit_once(':')?;
        if address.is_empty() {
            return None;
        }
        Some(Self::new(address, port.parse().ok()?))
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
