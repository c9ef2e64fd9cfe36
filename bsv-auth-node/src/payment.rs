//! Payment challenge and verification.
//!
//! The gate runs after authentication and walks each request through:
//!
//! ```text
//! Unpriced ──price == 0──▶ Free
//!    │
//!    └──price > 0──▶ Priced ──no x-bsv-payment──▶ Challenged (402)
//!                       │
//!                       └──header──▶ Verifying ──▶ Accepted (200)
//!                                       │
//!                                       └──────▶ Rejected (400/402)
//! ```
//!
//! Verification checks, in order: envelope shape, nonce (issued, unexpired,
//! unused), derivation prefix, and finally the wallet's verdict.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bsv_auth_msg::headers::{
    HEADER_PAYMENT, HEADER_PAYMENT_DERIVATION_PREFIX, HEADER_PAYMENT_SATOSHIS_PAID,
    HEADER_PAYMENT_SATOSHIS_REQUIRED, HEADER_PAYMENT_VERSION, PAYMENT_VERSION,
};
use bsv_auth_msg::IdentityKey;
use http::{HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::{AuthInfo, BridgeResponse, RequestContext};
use crate::error::{error_body, json_response, Error, ErrorCode, PaymentError, Result};
use crate::event::{BridgeEvent, EventBus};
use crate::nonce::NonceStore;
use crate::wallet::{InternalizeAction, KeyQuery, Wallet};

/// Computes the price of a request in satoshis.
pub type PriceFn = Arc<dyn Fn(&RequestContext) -> Result<u64> + Send + Sync>;

/// Path-based sample pricing: free for `/`, `/free/`, `/public/` and
/// `/health/`, 500 for `/protected/`, 1000 for `/premium/`, 100 otherwise.
pub fn path_price(ctx: &RequestContext) -> Result<u64> {
    let path = ctx.path.as_str();
    let price = if path == "/"
        || path.starts_with("/free/")
        || path.starts_with("/public/")
        || path.starts_with("/health/")
    {
        0
    } else if path.starts_with("/protected/") {
        500
    } else if path.starts_with("/premium/") {
        1000
    } else {
        100
    };
    Ok(price)
}

/// Prefix a payment for `path` must be derived under.
pub fn derivation_prefix(path: &str, identity_key: Option<&IdentityKey>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    match identity_key {
        Some(key) => hasher.update(key.to_hex().as_bytes()),
        None => hasher.update(crate::context::UNKNOWN_IDENTITY.as_bytes()),
    }
    STANDARD.encode(hasher.finalize())
}

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

/// Payment presented in the `x-bsv-payment` header.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub derivation_prefix: String,
    pub nonce: String,
    #[serde(default)]
    pub satoshis: Option<u64>,
    #[serde(alias = "beef")]
    pub transaction: Value,
}

impl PaymentEnvelope {
    pub fn from_header(value: &str) -> std::result::Result<Self, PaymentError> {
        let envelope: PaymentEnvelope = serde_json::from_str(value)
            .map_err(|e| PaymentError::MalformedPayment(e.to_string()))?;
        if envelope.derivation_prefix.is_empty() || envelope.nonce.is_empty() {
            return Err(PaymentError::MalformedPayment(
                "nonce and derivationPrefix must not be empty".to_string(),
            ));
        }
        if envelope.transaction.is_null() {
            return Err(PaymentError::MalformedPayment(
                "transaction is required".to_string(),
            ));
        }
        Ok(envelope)
    }
}

/// Payment outcome attached to a request that reaches the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub satoshis_required: u64,
    pub derivation_prefix: Option<String>,
    pub nonce: Option<String>,
    pub satoshis_paid: u64,
    pub accepted: bool,
    pub transaction: Option<Value>,
    pub transaction_id: Option<String>,
}

impl PaymentRecord {
    /// Record for a request priced at zero.
    pub fn free() -> Self {
        Self {
            satoshis_required: 0,
            derivation_prefix: None,
            nonce: None,
            satoshis_paid: 0,
            accepted: true,
            transaction: None,
            transaction_id: None,
        }
    }
}

/// Terms of a 402 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChallenge {
    pub satoshis_required: u64,
    pub nonce: String,
    pub derivation_prefix: String,
}

impl PaymentChallenge {
    pub fn to_response(&self) -> BridgeResponse {
        let mut extra = Map::new();
        extra.insert("satoshisRequired".to_string(), json!(self.satoshis_required));
        extra.insert("nonce".to_string(), json!(self.nonce));
        extra.insert("derivationPrefix".to_string(), json!(self.derivation_prefix));
        let body = error_body(
            ErrorCode::PaymentRequired,
            &format!(
                "Payment of {} satoshis is required for this request.",
                self.satoshis_required
            ),
            extra,
        );

        let mut response = json_response(StatusCode::PAYMENT_REQUIRED, &body);
        let headers = response.headers_mut();
        headers.insert(
            HEADER_PAYMENT_VERSION,
            HeaderValue::from_static(PAYMENT_VERSION),
        );
        headers.insert(
            HEADER_PAYMENT_SATOSHIS_REQUIRED,
            HeaderValue::from(self.satoshis_required),
        );
        // base64 is always a valid header value
        if let Ok(value) = HeaderValue::from_str(&self.derivation_prefix) {
            headers.insert(HEADER_PAYMENT_DERIVATION_PREFIX, value);
        }
        response
    }
}

/// Add `x-bsv-payment-satoshis-paid` for an accepted, non-free payment.
pub fn annotate_response(response: &mut BridgeResponse, record: &PaymentRecord) {
    if record.accepted && record.satoshis_required > 0 {
        response.headers_mut().insert(
            HEADER_PAYMENT_SATOSHIS_PAID,
            HeaderValue::from(record.satoshis_paid),
        );
    }
}

// ----------------------------------------------------------------------------
// State machine
// ----------------------------------------------------------------------------

/// Where a request stands in the payment flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Unpriced,
    Free,
    Priced,
    Challenged,
    Verifying,
    Accepted,
    Rejected,
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentState::Unpriced => "Unpriced",
            PaymentState::Free => "Free",
            PaymentState::Priced => "Priced",
            PaymentState::Challenged => "Challenged",
            PaymentState::Verifying => "Verifying",
            PaymentState::Accepted => "Accepted",
            PaymentState::Rejected => "Rejected",
        };
        f.write_str(name)
    }
}

/// Result of running a request through the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    /// Free or paid: the request proceeds with this record.
    Proceed(PaymentRecord),
    /// No payment presented for a priced request.
    Challenge(PaymentChallenge),
}

impl PaymentOutcome {
    pub fn state(&self) -> PaymentState {
        match self {
            PaymentOutcome::Proceed(record) if record.satoshis_required == 0 => PaymentState::Free,
            PaymentOutcome::Proceed(_) => PaymentState::Accepted,
            PaymentOutcome::Challenge(_) => PaymentState::Challenged,
        }
    }
}

/// Builder for [`PaymentGate`].
#[derive(Default)]
pub struct PaymentGateBuilder {
    wallet: Option<Arc<dyn Wallet>>,
    price: Option<PriceFn>,
    nonce_ttl: Option<Duration>,
    events: Option<EventBus>,
}

impl PaymentGateBuilder {
    pub fn wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn price_fn(mut self, price: PriceFn) -> Self {
        self.price = Some(price);
        self
    }

    pub fn nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = Some(ttl);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Fails with a configuration error when the wallet or price function is
    /// missing, or when the wallet cannot report its identity key.
    pub fn build(self) -> Result<PaymentGate> {
        let wallet = self
            .wallet
            .ok_or_else(|| Error::Configuration("payment gate requires a wallet".to_string()))?;
        let price = self.price.ok_or_else(|| {
            Error::Configuration("payment gate requires a price function".to_string())
        })?;
        let server_identity = wallet
            .get_public_key(&KeyQuery::identity())
            .map_err(|e| Error::Configuration(format!("wallet identity unavailable: {}", e)))?;
        info!(server_identity = %server_identity, "payment gate ready");

        Ok(PaymentGate {
            wallet,
            price,
            nonces: NonceStore::new(self.nonce_ttl.unwrap_or(Duration::from_secs(300))),
            events: self.events.unwrap_or_default(),
            server_identity,
        })
    }
}

/// Payment gate for priced resources.
pub struct PaymentGate {
    wallet: Arc<dyn Wallet>,
    price: PriceFn,
    nonces: NonceStore,
    events: EventBus,
    server_identity: IdentityKey,
}

impl PaymentGate {
    pub fn builder() -> PaymentGateBuilder {
        PaymentGateBuilder::default()
    }

    /// Identity key of the wallet receiving payments.
    pub fn server_identity(&self) -> &IdentityKey {
        &self.server_identity
    }

    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    /// Price, challenge or verify the payment for a request.
    pub fn process(&self, ctx: &RequestContext, auth: &AuthInfo) -> Result<PaymentOutcome> {
        let price = (self.price)(ctx).map_err(|e| {
            PaymentError::Internal(format!(
                "An internal error occurred while determining the payment required for this request: {}",
                e
            ))
        })?;
        if price == 0 {
            debug!(path = %ctx.path, state = %PaymentState::Free, "request is free");
            return Ok(PaymentOutcome::Proceed(PaymentRecord::free()));
        }
        debug!(path = %ctx.path, price, state = %PaymentState::Priced, "request is priced");

        if !auth.is_authenticated {
            return Err(Error::AuthenticationRequired(
                "Valid authentication required for payment processing.".to_string(),
            ));
        }

        let prefix = derivation_prefix(&ctx.path, auth.identity_key.as_ref());
        let Some(header) = ctx.header(HEADER_PAYMENT) else {
            let challenge = PaymentChallenge {
                satoshis_required: price,
                nonce: self.nonces.issue(),
                derivation_prefix: prefix,
            };
            info!(path = %ctx.path, price, state = %PaymentState::Challenged, "payment required");
            self.events.publish(BridgeEvent::PaymentChallenged {
                path: ctx.path.clone(),
                satoshis: price,
            });
            return Ok(PaymentOutcome::Challenge(challenge));
        };

        match self.verify(ctx, auth, header, price, prefix) {
            Ok(record) => Ok(PaymentOutcome::Proceed(record)),
            Err(e) => {
                warn!(path = %ctx.path, state = %PaymentState::Rejected, error = %e, "payment not accepted");
                self.events.publish(BridgeEvent::PaymentFailed {
                    path: ctx.path.clone(),
                    code: Error::from(e.clone()).code().to_string(),
                });
                Err(e.into())
            }
        }
    }

    fn verify(
        &self,
        ctx: &RequestContext,
        auth: &AuthInfo,
        header: &str,
        price: u64,
        expected_prefix: String,
    ) -> std::result::Result<PaymentRecord, PaymentError> {
        debug!(path = %ctx.path, state = %PaymentState::Verifying, "verifying payment");
        let envelope = PaymentEnvelope::from_header(header)?;
        self.nonces.consume(&envelope.nonce, Instant::now())?;
        if envelope.derivation_prefix != expected_prefix {
            return Err(PaymentError::InvalidDerivationPrefix {
                expected: expected_prefix,
                actual: envelope.derivation_prefix,
            });
        }

        let action = InternalizeAction {
            transaction: envelope.transaction.clone(),
            satoshis: price,
            derivation_prefix: envelope.derivation_prefix.clone(),
            nonce: envelope.nonce.clone(),
            sender_identity_key: auth.identity_key.as_ref().map(IdentityKey::to_hex),
            description: format!("Payment for request to {}", ctx.path),
        };
        let result = self
            .wallet
            .internalize_action(action)
            .map_err(|e| PaymentError::Internal(e.to_string()))?;
        if !result.accepted {
            return Err(PaymentError::Rejected("Payment was rejected.".to_string()));
        }

        let record = PaymentRecord {
            satoshis_required: price,
            derivation_prefix: Some(envelope.derivation_prefix),
            nonce: Some(envelope.nonce),
            satoshis_paid: result.satoshis_paid.unwrap_or(price),
            accepted: true,
            transaction: Some(envelope.transaction),
            transaction_id: result.transaction_id,
        };
        info!(
            path = %ctx.path,
            satoshis_paid = record.satoshis_paid,
            transaction_id = ?record.transaction_id,
            state = %PaymentState::Accepted,
            "payment accepted"
        );
        self.events.publish(BridgeEvent::PaymentAccepted {
            identity_key: auth.identity_label(),
            satoshis_paid: record.satoshis_paid,
            transaction_id: record.transaction_id.clone(),
        });
        Ok(record)
    }

    /// Forget expired nonces. Returns how many.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.nonces.sweep_expired(now)
    }
}
