//! Wallet collaborator interface.

use bsv_auth_msg::IdentityKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Key derivation parameters for wallet key operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyQuery {
    /// Use the wallet's root identity key instead of a derived key.
    pub identity_key: bool,
    pub protocol_id: Option<String>,
    pub key_id: Option<String>,
    pub counterparty: Option<String>,
}

impl KeyQuery {
    pub fn identity() -> Self {
        Self {
            identity_key: true,
            ..Default::default()
        }
    }
}

/// A payment transaction handed to the wallet for internalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalizeAction {
    /// Opaque transaction payload from the payment envelope.
    pub transaction: Value,
    pub satoshis: u64,
    pub derivation_prefix: String,
    pub nonce: String,
    pub sender_identity_key: Option<String>,
    pub description: String,
}

/// Wallet verdict on an internalized payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalizeActionResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satoshis_paid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// The cryptographic wallet.
pub trait Wallet: Send + Sync {
    fn get_public_key(&self, query: &KeyQuery) -> Result<IdentityKey>;

    fn create_signature(&self, data: &[u8], query: &KeyQuery) -> Result<Vec<u8>>;

    fn verify_signature(&self, data: &[u8], signature: &[u8], query: &KeyQuery) -> Result<bool>;

    fn internalize_action(&self, action: InternalizeAction) -> Result<InternalizeActionResult>;
}
