//! Configuration for the transport bridge.

use bsv_auth_msg::headers::AUTH_VERSION;
use bsv_auth_msg::RequestedCertificateSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the transport bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Protocol version the bridge speaks.
    pub auth_version: String,

    /// Let requests without authentication headers through as `unknown`.
    pub allow_unauthenticated: bool,

    /// Seconds an unresolved handle may wait for the authentication engine.
    pub handle_ttl_secs: u64,

    /// Seconds a certificate listener registration may stay unresolved.
    pub listener_ttl_secs: u64,

    /// Seconds a general request waits for pending certificates.
    pub certificate_wait_secs: u64,

    /// Seconds an issued payment nonce stays redeemable.
    pub nonce_ttl_secs: u64,

    /// Seconds of inactivity after which a session is swept.
    pub session_max_age_secs: u64,

    /// Certificates the engine asks new peers for in its initial response.
    pub requested_certificates: Option<RequestedCertificateSet>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            auth_version: AUTH_VERSION.to_string(),
            allow_unauthenticated: false,
            handle_ttl_secs: 30,
            listener_ttl_secs: 300,
            certificate_wait_secs: 10,
            nonce_ttl_secs: 300,
            session_max_age_secs: 3600,
            requested_certificates: None,
        }
    }
}

impl BridgeConfig {
    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_ttl_secs)
    }

    pub fn listener_ttl(&self) -> Duration {
        Duration::from_secs(self.listener_ttl_secs)
    }

    pub fn certificate_wait(&self) -> Duration {
        Duration::from_secs(self.certificate_wait_secs)
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.auth_version, "0.1");
        assert!(!config.allow_unauthenticated);
        assert_eq!(config.handle_ttl(), Duration::from_secs(30));
        assert_eq!(config.session_max_age(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"allow_unauthenticated": true, "nonce_ttl_secs": 60}"#)
                .unwrap();
        assert!(config.allow_unauthenticated);
        assert_eq!(config.nonce_ttl(), Duration::from_secs(60));
        assert_eq!(config.handle_ttl_secs, 30);
        assert!(config.requested_certificates.is_none());
    }

    #[test]
    fn test_requested_certificates_from_json() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"requested_certificates": {"certifiers": ["02ab"], "types": {"age": ["over18"]}}}"#,
        )
        .unwrap();
        let requested = config.requested_certificates.unwrap();
        assert_eq!(requested.certifiers, vec!["02ab".to_string()]);
        assert_eq!(requested.types["age"], vec!["over18".to_string()]);
    }
}
