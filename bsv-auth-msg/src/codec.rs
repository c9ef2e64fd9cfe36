//! Conversion between HTTP requests and [`ProtocolMessage`] values.
//!
//! Header form: every field travels in an `x-bsv-auth-*` header. Classification
//! follows three rules, in order:
//!
//! 1. no authentication header at all decodes to `None`;
//! 2. a request id header makes the message `general` and the body its payload;
//! 3. otherwise the message type header selects the variant.
//!
//! JSON form: non-general handshake messages posted to the well-known endpoint
//! may carry the whole message as a JSON body instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::headers::{is_auth_header, HeaderField, AUTH_VERSION};
use crate::message::{
    Certificate, IdentityKey, MessageKind, MessageType, ProtocolMessage, RequestId,
    RequestedCertificateSet,
};

/// Authentication headers found on a request, keyed by field.
#[derive(Debug, Default)]
struct AuthHeaders<'a> {
    fields: BTreeMap<HeaderField, &'a str>,
}

impl<'a> AuthHeaders<'a> {
    fn collect<I>(headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut fields = BTreeMap::new();
        for (name, value) in headers {
            if !is_auth_header(name) {
                continue;
            }
            let field = HeaderField::from_wire(name)
                .ok_or_else(|| Error::malformed(format!("unknown header {}", name)))?;
            if fields.insert(field, value).is_some() {
                return Err(Error::malformed(format!("duplicate header {}", field)));
            }
        }
        Ok(Self { fields })
    }

    fn get(&self, field: HeaderField) -> Option<&'a str> {
        self.fields.get(&field).copied()
    }

    fn require(&self, field: HeaderField) -> Result<&'a str> {
        self.get(field).ok_or(Error::MissingHeader(field.wire_name()))
    }
}

fn parse_signature(value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| Error::malformed(format!("signature is not hex: {}", e)))
}

fn parse_requested(value: &str) -> Result<RequestedCertificateSet> {
    serde_json::from_str(value)
        .map_err(|e| Error::malformed(format!("requested certificates: {}", e)))
}

/// Certificates carried in the body of a header-form certificate response:
/// either a bare JSON array or `{"certificates": [...]}`.
fn parse_body_certificates(body: &[u8]) -> Result<Vec<Certificate>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Body {
        List(Vec<Certificate>),
        Wrapped { certificates: Vec<Certificate> },
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match serde_json::from_slice(body) {
        Ok(Body::List(certificates)) | Ok(Body::Wrapped { certificates }) => Ok(certificates),
        Err(e) => Err(Error::malformed(format!("certificate body: {}", e))),
    }
}

/// Decode a request into a protocol message.
///
/// Returns `Ok(None)` when the request carries no authentication headers, which
/// leaves the unauthenticated-request policy to the caller.
pub fn decode<'a, I>(headers: I, body: &[u8]) -> Result<Option<ProtocolMessage>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let headers = AuthHeaders::collect(headers)?;
    if headers.fields.is_empty() {
        return Ok(None);
    }

    let version = headers.require(HeaderField::Version)?.to_string();
    let identity_key = headers
        .get(HeaderField::IdentityKey)
        .map(IdentityKey::from_hex)
        .transpose()?;
    let nonce = headers.get(HeaderField::Nonce).map(str::to_string);
    let your_nonce = headers.get(HeaderField::YourNonce).map(str::to_string);
    let signature = headers
        .get(HeaderField::Signature)
        .map(parse_signature)
        .transpose()?;
    let requested = headers
        .get(HeaderField::RequestedCertificates)
        .map(parse_requested)
        .transpose()?;

    let declared = headers
        .get(HeaderField::MessageType)
        .map(str::parse::<MessageType>)
        .transpose()?;

    let request_id = headers.get(HeaderField::RequestId);
    let (kind, nonce, implicit_type) = if let Some(request_id) = request_id {
        if let Some(other) = declared.filter(|ty| !ty.is_general()) {
            return Err(Error::malformed(format!(
                "request id present on a {} message",
                other
            )));
        }
        let kind = MessageKind::General {
            request_id: RequestId::from_base64(request_id)?,
            payload: body.to_vec(),
        };
        (kind, nonce, declared.is_none())
    } else {
        let message_type = declared.ok_or(Error::MissingHeader(
            HeaderField::MessageType.wire_name(),
        ))?;
        let (kind, nonce) = match message_type {
            MessageType::InitialRequest => (
                MessageKind::InitialRequest {
                    initial_nonce: headers.require(HeaderField::Nonce)?.to_string(),
                    requested_certificates: requested,
                },
                None,
            ),
            MessageType::InitialResponse => (
                MessageKind::InitialResponse {
                    initial_nonce: headers.require(HeaderField::Nonce)?.to_string(),
                    certificates: parse_body_certificates(body)?,
                    requested_certificates: requested,
                },
                None,
            ),
            MessageType::CertificateRequest => (
                MessageKind::CertificateRequest {
                    requested_certificates: requested,
                },
                nonce,
            ),
            MessageType::CertificateResponse => (
                MessageKind::CertificateResponse {
                    certificates: parse_body_certificates(body)?,
                },
                nonce,
            ),
            MessageType::General => {
                return Err(Error::MissingHeader(HeaderField::RequestId.wire_name()))
            }
        };
        (kind, nonce, false)
    };

    let message = ProtocolMessage {
        version,
        identity_key,
        nonce,
        your_nonce,
        signature,
        implicit_type,
        kind,
    };
    message.validate()?;
    debug!(
        message_type = %message.message_type(),
        identity_key = ?message.identity_key.as_ref().map(IdentityKey::to_hex),
        "decoded protocol message from headers"
    );
    Ok(Some(message))
}

/// Encode the header form of a message, in wire order.
///
/// Certificates and the general payload are not headers; they travel in the
/// body.
pub fn encode(message: &ProtocolMessage) -> Result<Vec<(&'static str, String)>> {
    let mut headers = Vec::with_capacity(HeaderField::ALL.len());
    for field in HeaderField::ALL {
        let value = match field {
            HeaderField::Version => Some(message.version.clone()),
            HeaderField::MessageType
                if message.implicit_type && message.message_type().is_general() =>
            {
                None
            }
            HeaderField::MessageType => Some(message.message_type().as_str().to_string()),
            HeaderField::IdentityKey => message.identity_key.as_ref().map(IdentityKey::to_hex),
            HeaderField::Nonce => message.sender_nonce().map(str::to_string),
            HeaderField::YourNonce => message.your_nonce.clone(),
            HeaderField::Signature => message.signature.as_ref().map(hex::encode),
            HeaderField::RequestedCertificates => message
                .requested_certificates()
                .map(serde_json::to_string)
                .transpose()?,
            HeaderField::RequestId => message.request_id().map(RequestId::to_base64),
        };
        if let Some(value) = value {
            headers.push((field.wire_name(), value));
        }
    }
    Ok(headers)
}

/// JSON body form of a handshake message.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default = "default_version")]
    version: String,
    message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity_key: Option<IdentityKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    your_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificates: Option<Vec<Certificate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    requested_certificates: Option<RequestedCertificateSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<Vec<u8>>,
}

fn default_version() -> String {
    AUTH_VERSION.to_string()
}

impl TryFrom<WireMessage> for ProtocolMessage {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let initial_nonce = |wire: &WireMessage| {
            wire.initial_nonce
                .clone()
                .or_else(|| wire.nonce.clone())
                .ok_or(Error::MissingHeader(HeaderField::Nonce.wire_name()))
        };
        let (kind, nonce) = match wire.message_type {
            MessageType::InitialRequest => (
                MessageKind::InitialRequest {
                    initial_nonce: initial_nonce(&wire)?,
                    requested_certificates: wire.requested_certificates,
                },
                None,
            ),
            MessageType::InitialResponse => (
                MessageKind::InitialResponse {
                    initial_nonce: initial_nonce(&wire)?,
                    certificates: wire.certificates.unwrap_or_default(),
                    requested_certificates: wire.requested_certificates,
                },
                None,
            ),
            MessageType::CertificateRequest => (
                MessageKind::CertificateRequest {
                    requested_certificates: wire.requested_certificates,
                },
                wire.nonce,
            ),
            MessageType::CertificateResponse => (
                MessageKind::CertificateResponse {
                    certificates: wire.certificates.unwrap_or_default(),
                },
                wire.nonce,
            ),
            MessageType::General => {
                return Err(Error::malformed(
                    "general messages travel in headers, not in a JSON body",
                ))
            }
        };
        let message = ProtocolMessage {
            version: wire.version,
            identity_key: wire.identity_key,
            nonce,
            your_nonce: wire.your_nonce,
            signature: wire.signature,
            implicit_type: false,
            kind,
        };
        message.validate()?;
        Ok(message)
    }
}

impl TryFrom<&ProtocolMessage> for WireMessage {
    type Error = Error;

    fn try_from(message: &ProtocolMessage) -> Result<Self> {
        if message.message_type().is_general() {
            return Err(Error::malformed(
                "general messages travel in headers, not in a JSON body",
            ));
        }
        let certificates = match &message.kind {
            MessageKind::InitialResponse { certificates, .. }
            | MessageKind::CertificateResponse { certificates } => Some(certificates.clone()),
            _ => None,
        };
        Ok(Self {
            version: message.version.clone(),
            message_type: message.message_type(),
            identity_key: message.identity_key.clone(),
            nonce: message.nonce.clone(),
            initial_nonce: message.initial_nonce().map(str::to_string),
            your_nonce: message.your_nonce.clone(),
            certificates,
            requested_certificates: message.requested_certificates().cloned(),
            signature: message.signature.clone(),
        })
    }
}

/// Decode a handshake message from its JSON body form.
pub fn decode_json(body: &[u8]) -> Result<ProtocolMessage> {
    let wire: WireMessage = serde_json::from_slice(body)
        .map_err(|e| Error::malformed(format!("handshake body: {}", e)))?;
    ProtocolMessage::try_from(wire)
}

/// Encode a handshake message as its JSON body form.
pub fn encode_json(message: &ProtocolMessage) -> Result<Vec<u8>> {
    let wire = WireMessage::try_from(message)?;
    Ok(serde_json::to_vec(&wire)?)
}
