//! Request context and per-request authentication info.

use std::time::Instant;

use bsv_auth_msg::{Certificate, IdentityKey};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Inbound HTTP request as seen by the bridge.
pub type BridgeRequest = http::Request<Bytes>;

/// Outbound HTTP response produced by the bridge.
pub type BridgeResponse = http::Response<Bytes>;

/// Identity label for requests that carry no authentication.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Everything about a request the bridge keeps after the body is consumed.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Process-local id, used to match engine callbacks with the request.
    pub id: Uuid,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            received_at: Instant::now(),
        }
    }

    pub fn from_request(request: &BridgeRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            headers: request.headers().clone(),
            received_at: Instant::now(),
        }
    }

    /// Adds a header, skipping names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!(header = name, "skipping invalid header"),
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Headers as string pairs. Values that are not visible ASCII are skipped.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
    }
}

fn serialize_identity<S: Serializer>(
    key: &Option<IdentityKey>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match key {
        Some(key) => serializer.serialize_str(&key.to_hex()),
        None => serializer.serialize_str(UNKNOWN_IDENTITY),
    }
}

/// Authentication outcome attached to a request that reaches the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    #[serde(serialize_with = "serialize_identity")]
    pub identity_key: Option<IdentityKey>,
    pub certificates: Vec<Certificate>,
    pub is_authenticated: bool,
}

impl AuthInfo {
    /// Unauthenticated request let through by policy.
    pub fn unknown() -> Self {
        Self {
            identity_key: None,
            certificates: Vec::new(),
            is_authenticated: false,
        }
    }

    pub fn authenticated(identity_key: IdentityKey, certificates: Vec<Certificate>) -> Self {
        Self {
            identity_key: Some(identity_key),
            certificates,
            is_authenticated: true,
        }
    }

    /// Hex identity key, or `unknown`.
    pub fn identity_label(&self) -> String {
        self.identity_key
            .as_ref()
            .map(IdentityKey::to_hex)
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_request() {
        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/protected/item?id=7")
            .header("X-Bsv-Payment", "{}")
            .body(Bytes::new())
            .unwrap();
        let ctx = RequestContext::from_request(&request);
        assert_eq!(ctx.path, "/protected/item");
        assert_eq!(ctx.query.as_deref(), Some("id=7"));
        assert_eq!(ctx.header("x-bsv-payment"), Some("{}"));
        assert_eq!(ctx.header_pairs().count(), 1);
    }

    #[test]
    fn test_unknown_auth_serializes_label() {
        let auth = AuthInfo::unknown();
        let value = serde_json::to_value(&auth).unwrap();
        assert_eq!(value["identityKey"], "unknown");
        assert_eq!(value["isAuthenticated"], false);
        assert_eq!(auth.identity_label(), UNKNOWN_IDENTITY);
    }
}
