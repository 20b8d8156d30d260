use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-request hints consumed by sticky balancing strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingContext {
    pub request_id: Option<String>,
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl LoadBalancingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Key used for consistent hashing: session id, then request id,
    /// then client IP, then path.
    pub fn hash_key(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or(self.request_id.as_deref())
            .or(self.client_ip.as_deref())
            .or(self.path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_precedence() {
        let ctx = LoadBalancingContext::new()
            .with_client_ip("10.1.1.1")
            .with_request_id("req-7");
        assert_eq!(ctx.hash_key(), Some("req-7"));

        let ctx = ctx.with_session_id("sess-1");
        assert_eq!(ctx.hash_key(), Some("sess-1"));

        assert_eq!(LoadBalancingContext::new().hash_key(), None);
        assert_eq!(
            LoadBalancingContext::new().with_path("/cart").hash_key(),
            Some("/cart")
        );
    }
}
