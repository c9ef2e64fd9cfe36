//! Protocol message model.
//!
//! A [`ProtocolMessage`] carries the fields common to every message (version,
//! sender identity, nonces, signature) and a [`MessageKind`] that declares
//! exactly the fields legal for its variant.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Length of a compressed secp256k1 public key.
pub const IDENTITY_KEY_LEN: usize = 33;

/// Length of a general message correlation id.
pub const REQUEST_ID_LEN: usize = 32;

/// The five message variants of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    InitialRequest,
    InitialResponse,
    General,
    CertificateRequest,
    CertificateResponse,
}

impl MessageType {
    /// Wire spelling of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::InitialRequest => "initialRequest",
            MessageType::InitialResponse => "initialResponse",
            MessageType::General => "general",
            MessageType::CertificateRequest => "certificateRequest",
            MessageType::CertificateResponse => "certificateResponse",
        }
    }

    /// Whether the message is correlated by request id rather than nonce.
    pub fn is_general(&self) -> bool {
        matches!(self, MessageType::General)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initialRequest" => Ok(MessageType::InitialRequest),
            "initialResponse" => Ok(MessageType::InitialResponse),
            "general" => Ok(MessageType::General),
            "certificateRequest" => Ok(MessageType::CertificateRequest),
            "certificateResponse" => Ok(MessageType::CertificateResponse),
            other => Err(Error::UnknownMessageType(other.to_string())),
        }
    }
}

/// Compressed secp256k1 public key identifying a peer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey([u8; IDENTITY_KEY_LEN]);

impl IdentityKey {
    /// Build from raw compressed key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; IDENTITY_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidIdentityKey(format!(
                "expected {} bytes, got {}",
                IDENTITY_KEY_LEN,
                bytes.len()
            ))
        })?;
        if key[0] != 0x02 && key[0] != 0x03 {
            return Err(Error::InvalidIdentityKey(format!(
                "unexpected prefix byte 0x{:02x}",
                key[0]
            )));
        }
        Ok(Self(key))
    }

    /// Parse the lowercase or uppercase hex form.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| Error::InvalidIdentityKey(format!("{}: {}", value, e)))?;
        Self::from_bytes(&bytes)
    }

    /// Lowercase hex form used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.to_hex())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for IdentityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for IdentityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdentityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// 32-byte correlation id of a general message, base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn new(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; REQUEST_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::malformed(format!(
                "request id must be {} bytes, got {}",
                REQUEST_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(id))
    }

    /// Decode the base64 header form.
    pub fn from_base64(value: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(value)
            .map_err(|e| Error::malformed(format!("request id is not base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.to_base64())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Identity certificate presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(rename = "type", default)]
    pub cert_type: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certifier: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_outpoint: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Certificate {
    pub fn new(cert_type: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            cert_type: cert_type.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// A certificate must at least name its type and subject.
    pub fn has_minimal_shape(&self) -> bool {
        !self.cert_type.trim().is_empty() && !self.subject.trim().is_empty()
    }
}

/// Certificates a peer asks the other side to present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedCertificateSet {
    /// Acceptable certifier identity keys (hex).
    #[serde(default)]
    pub certifiers: Vec<String>,

    /// Certificate type to the fields that must be revealed.
    #[serde(default)]
    pub types: BTreeMap<String, Vec<String>>,
}

impl RequestedCertificateSet {
    pub fn is_empty(&self) -> bool {
        self.certifiers.is_empty() && self.types.is_empty()
    }
}

/// Variant-specific message fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    InitialRequest {
        initial_nonce: String,
        requested_certificates: Option<RequestedCertificateSet>,
    },
    InitialResponse {
        initial_nonce: String,
        certificates: Vec<Certificate>,
        requested_certificates: Option<RequestedCertificateSet>,
    },
    /// Application traffic. For requests the payload is the raw HTTP body; for
    /// responses it is a [`crate::frame::ResponseFrame`].
    General {
        request_id: RequestId,
        payload: Vec<u8>,
    },
    CertificateRequest {
        requested_certificates: Option<RequestedCertificateSet>,
    },
    CertificateResponse {
        certificates: Vec<Certificate>,
    },
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub version: String,
    /// Absent only on an initial request from a not yet identified peer.
    pub identity_key: Option<IdentityKey>,
    /// Sender nonce. Initial messages carry theirs in the kind as `initial_nonce`.
    pub nonce: Option<String>,
    pub your_nonce: Option<String>,
    pub signature: Option<Vec<u8>>,
    /// Set when a general message arrived without a message type header.
    /// The header form then leaves it out again.
    pub implicit_type: bool,
    pub kind: MessageKind,
}

impl ProtocolMessage {
    /// Message with no common fields set besides the version.
    pub fn new(version: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            version: version.into(),
            identity_key: None,
            nonce: None,
            your_nonce: None,
            signature: None,
            implicit_type: false,
            kind,
        }
    }

    pub fn with_identity_key(mut self, identity_key: IdentityKey) -> Self {
        self.identity_key = Some(identity_key);
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_your_nonce(mut self, your_nonce: impl Into<String>) -> Self {
        self.your_nonce = Some(your_nonce.into());
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn message_type(&self) -> MessageType {
        match &self.kind {
            MessageKind::InitialRequest { .. } => MessageType::InitialRequest,
            MessageKind::InitialResponse { .. } => MessageType::InitialResponse,
            MessageKind::General { .. } => MessageType::General,
            MessageKind::CertificateRequest { .. } => MessageType::CertificateRequest,
            MessageKind::CertificateResponse { .. } => MessageType::CertificateResponse,
        }
    }

    /// The nonce this message was sent under: the initial nonce for initial
    /// messages, the sender nonce otherwise.
    pub fn sender_nonce(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::InitialRequest { initial_nonce, .. }
            | MessageKind::InitialResponse { initial_nonce, .. } => Some(initial_nonce),
            _ => self.nonce.as_deref(),
        }
    }

    pub fn initial_nonce(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::InitialRequest { initial_nonce, .. }
            | MessageKind::InitialResponse { initial_nonce, .. } => Some(initial_nonce),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.kind {
            MessageKind::General { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.kind {
            MessageKind::General { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn certificates(&self) -> &[Certificate] {
        match &self.kind {
            MessageKind::InitialResponse { certificates, .. }
            | MessageKind::CertificateResponse { certificates } => certificates,
            _ => &[],
        }
    }

    pub fn requested_certificates(&self) -> Option<&RequestedCertificateSet> {
        match &self.kind {
            MessageKind::InitialRequest {
                requested_certificates,
                ..
            }
            | MessageKind::InitialResponse {
                requested_certificates,
                ..
            }
            | MessageKind::CertificateRequest {
                requested_certificates,
            } => requested_certificates.as_ref(),
            _ => None,
        }
    }

    /// Enforce the identity invariant: only an initial request may omit the key.
    pub fn validate(&self) -> Result<()> {
        if self.identity_key.is_none() && self.message_type() != MessageType::InitialRequest {
            return Err(Error::MissingHeader(crate::headers::HEADER_IDENTITY_KEY));
        }
        if self.version.is_empty() {
            return Err(Error::MissingHeader(crate::headers::HEADER_VERSION));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_hex() -> String {
        format!("02{}", "ab".repeat(32))
    }

    #[test]
    fn test_message_type_wire_names() {
        for ty in [
            MessageType::InitialRequest,
            MessageType::InitialResponse,
            MessageType::General,
            MessageType::CertificateRequest,
            MessageType::CertificateResponse,
        ] {
            assert_eq!(ty.as_str().parse::<MessageType>().unwrap(), ty);
            assert_eq!(
                serde_json::to_string(&ty).unwrap(),
                format!("\"{}\"", ty.as_str())
            );
        }
        assert!(matches!(
            "initial".parse::<MessageType>(),
            Err(Error::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_identity_key_validation() {
        let key = IdentityKey::from_hex(&key_hex()).unwrap();
        assert_eq!(key.to_hex(), key_hex());
        assert_eq!(key.as_bytes().len(), IDENTITY_KEY_LEN);

        assert!(IdentityKey::from_hex("zz").is_err());
        assert!(IdentityKey::from_hex(&"02".repeat(32)).is_err());
        assert!(IdentityKey::from_hex(&format!("04{}", "ab".repeat(32))).is_err());
    }

    #[test]
    fn test_request_id_base64() {
        let id = RequestId::random();
        assert_eq!(RequestId::from_base64(&id.to_base64()).unwrap(), id);
        assert!(RequestId::from_base64("c2hvcnQ=").is_err());
        assert!(RequestId::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_certificate_shape() {
        assert!(Certificate::new("employment", "02aa").has_minimal_shape());
        assert!(!Certificate::new("", "02aa").has_minimal_shape());
        assert!(!Certificate::new("employment", " ").has_minimal_shape());

        let parsed: Certificate = serde_json::from_str(r#"{"subject":"02aa"}"#).unwrap();
        assert!(!parsed.has_minimal_shape());
    }

    #[test]
    fn test_identity_invariant() {
        let request = ProtocolMessage::new(
            "0.1",
            MessageKind::InitialRequest {
                initial_nonce: "n1".to_string(),
                requested_certificates: None,
            },
        );
        assert!(request.validate().is_ok());
        assert_eq!(request.sender_nonce(), Some("n1"));

        let general = ProtocolMessage::new(
            "0.1",
            MessageKind::General {
                request_id: RequestId::random(),
                payload: Vec::new(),
            },
        );
        assert!(matches!(general.validate(), Err(Error::MissingHeader(_))));

        let general = general.with_identity_key(IdentityKey::from_hex(&key_hex()).unwrap());
        assert!(general.validate().is_ok());
        assert_eq!(general.message_type(), MessageType::General);
    }
}
