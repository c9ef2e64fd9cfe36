//! Wire header names and the mapping between headers and message fields.
//!
//! Every internal field that travels in a header has exactly one wire name and
//! every `x-bsv-auth-*` wire name maps back to exactly one field. Lookups are
//! case-insensitive because HTTP header names are.

use std::fmt;

/// Prefix shared by all authentication headers.
pub const AUTH_HEADER_PREFIX: &str = "x-bsv-auth-";

/// Protocol version header.
pub const HEADER_VERSION: &str = "x-bsv-auth-version";
/// Message type header.
pub const HEADER_MESSAGE_TYPE: &str = "x-bsv-auth-message-type";
/// Sender identity key header (hex).
pub const HEADER_IDENTITY_KEY: &str = "x-bsv-auth-identity-key";
/// Sender nonce header.
pub const HEADER_NONCE: &str = "x-bsv-auth-nonce";
/// Recipient nonce header.
pub const HEADER_YOUR_NONCE: &str = "x-bsv-auth-your-nonce";
/// Signature header (hex).
pub const HEADER_SIGNATURE: &str = "x-bsv-auth-signature";
/// Requested certificate set header (JSON).
pub const HEADER_REQUESTED_CERTIFICATES: &str = "x-bsv-auth-requested-certificates";
/// General message correlation id header (base64 of 32 bytes).
pub const HEADER_REQUEST_ID: &str = "x-bsv-auth-request-id";

/// Payment envelope presented by the client.
pub const HEADER_PAYMENT: &str = "x-bsv-payment";
/// Payment protocol version.
pub const HEADER_PAYMENT_VERSION: &str = "x-bsv-payment-version";
/// Satoshis required for the resource.
pub const HEADER_PAYMENT_SATOSHIS_REQUIRED: &str = "x-bsv-payment-satoshis-required";
/// Derivation prefix the payment must be bound to.
pub const HEADER_PAYMENT_DERIVATION_PREFIX: &str = "x-bsv-payment-derivation-prefix";
/// Satoshis accepted by the wallet.
pub const HEADER_PAYMENT_SATOSHIS_PAID: &str = "x-bsv-payment-satoshis-paid";

/// Canonical authentication protocol version.
pub const AUTH_VERSION: &str = "0.1";
/// Canonical payment protocol version.
pub const PAYMENT_VERSION: &str = "1.0";

/// Handshake endpoint path.
pub const WELL_KNOWN_AUTH_PATH: &str = "/.well-known/bsv/auth";

/// Message fields that travel in `x-bsv-auth-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeaderField {
    Version,
    MessageType,
    IdentityKey,
    Nonce,
    YourNonce,
    Signature,
    RequestedCertificates,
    RequestId,
}

impl HeaderField {
    /// All fields in wire order.
    pub const ALL: [HeaderField; 8] = [
        HeaderField::Version,
        HeaderField::MessageType,
        HeaderField::IdentityKey,
        HeaderField::Nonce,
        HeaderField::YourNonce,
        HeaderField::Signature,
        HeaderField::RequestedCertificates,
        HeaderField::RequestId,
    ];

    /// Wire header name for this field.
    pub fn wire_name(self) -> &'static str {
        match self {
            HeaderField::Version => HEADER_VERSION,
            HeaderField::MessageType => HEADER_MESSAGE_TYPE,
            HeaderField::IdentityKey => HEADER_IDENTITY_KEY,
            HeaderField::Nonce => HEADER_NONCE,
            HeaderField::YourNonce => HEADER_YOUR_NONCE,
            HeaderField::Signature => HEADER_SIGNATURE,
            HeaderField::RequestedCertificates => HEADER_REQUESTED_CERTIFICATES,
            HeaderField::RequestId => HEADER_REQUEST_ID,
        }
    }

    /// Internal field name, as used in the JSON wire form.
    pub fn field_name(self) -> &'static str {
        match self {
            HeaderField::Version => "version",
            HeaderField::MessageType => "messageType",
            HeaderField::IdentityKey => "identityKey",
            HeaderField::Nonce => "nonce",
            HeaderField::YourNonce => "yourNonce",
            HeaderField::Signature => "signature",
            HeaderField::RequestedCertificates => "requestedCertificates",
            HeaderField::RequestId => "requestId",
        }
    }

    /// Field for a wire header name, ignoring ASCII case.
    pub fn from_wire(name: &str) -> Option<HeaderField> {
        Self::ALL
            .into_iter()
            .find(|field| field.wire_name().eq_ignore_ascii_case(name))
    }

    /// Field for an internal field name.
    pub fn from_field_name(name: &str) -> Option<HeaderField> {
        Self::ALL.into_iter().find(|field| field.field_name() == name)
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Whether a header name belongs to the authentication protocol.
pub fn is_auth_header(name: &str) -> bool {
    name.get(..AUTH_HEADER_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(AUTH_HEADER_PREFIX))
}
