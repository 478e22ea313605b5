use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A running copy of a service as published to a registry.
///
/// Endpoints are URLs of the form `<scheme>://<host>:<port>`, e.g.
/// `rpc://10.0.0.5:9000` or `http://10.0.0.5:8000`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// First endpoint with the given scheme, without the scheme prefix.
    #[must_use]
    pub fn endpoint_for(&self, scheme: &str) -> Option<&str> {
        self.endpoints.iter().find_map(|e| {
            e.strip_prefix(scheme)
                .and_then(|rest| rest.strip_prefix("://"))
        })
    }
}
