//! Issued payment nonces with expiry and single use.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use rand::RngCore;
use tracing::debug;

use crate::error::PaymentError;

/// Raw nonce length before base64.
pub const NONCE_LEN: usize = 32;

/// Nonces this process has issued and not yet seen redeemed.
pub struct NonceStore {
    issued: DashMap<String, Instant>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            issued: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh random nonce.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = STANDARD.encode(bytes);
        self.issued.insert(nonce.clone(), Instant::now());
        nonce
    }

    /// Redeem a nonce. Succeeds only for a structurally valid, issued,
    /// unexpired nonce that was never redeemed before.
    pub fn consume(&self, nonce: &str, now: Instant) -> Result<(), PaymentError> {
        let well_formed = STANDARD
            .decode(nonce)
            .map(|bytes| bytes.len() == NONCE_LEN)
            .unwrap_or(false);
        if !well_formed {
            return Err(PaymentError::InvalidNonce(
                "nonce is not a base64 encoded 32-byte value".to_string(),
            ));
        }

        let (_, issued_at) = self.issued.remove(nonce).ok_or_else(|| {
            PaymentError::InvalidNonce("nonce was not issued or was already used".to_string())
        })?;
        if now.saturating_duration_since(issued_at) >= self.ttl {
            return Err(PaymentError::InvalidNonce("nonce has expired".to_string()));
        }
        Ok(())
    }

    /// Forget nonces past their TTL. Returns how many.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.issued.len();
        self.issued
            .retain(|_, issued_at| now.saturating_duration_since(*issued_at) < self.ttl);
        let expired = before.saturating_sub(self.issued.len());
        if expired > 0 {
            debug!(expired, "expired unredeemed payment nonces");
        }
        expired
    }

    pub fn outstanding(&self) -> usize {
        self.issued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_issued_nonces_are_distinct() {
        let store = NonceStore::new(Duration::from_secs(300));
        let nonces: HashSet<String> = (0..100).map(|_| store.issue()).collect();
        assert_eq!(nonces.len(), 100);
        assert_eq!(store.outstanding(), 100);
    }

    #[test]
    fn test_single_use() {
        let store = NonceStore::new(Duration::from_secs(300));
        let nonce = store.issue();
        assert!(store.consume(&nonce, Instant::now()).is_ok());
        assert!(matches!(
            store.consume(&nonce, Instant::now()),
            Err(PaymentError::InvalidNonce(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        let store = NonceStore::new(Duration::from_secs(300));
        let forged = STANDARD.encode([7u8; NONCE_LEN]);
        assert!(store.consume(&forged, Instant::now()).is_err());
        assert!(store.consume("deadbeef", Instant::now()).is_err());
        assert!(store.consume("", Instant::now()).is_err());
    }

    #[test]
    fn test_expiry() {
        let store = NonceStore::new(Duration::from_secs(60));
        let nonce = store.issue();
        let later = Instant::now() + Duration::from_secs(61);
        assert!(store.consume(&nonce, later).is_err());

        store.issue();
        assert_eq!(store.sweep_expired(Instant::now()), 0);
        assert_eq!(store.sweep_expired(later), 1);
        assert_eq!(store.outstanding(), 0);
    }
}
