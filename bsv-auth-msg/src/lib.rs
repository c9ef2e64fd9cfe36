//! Protocol messages for BRC-103/104 mutual authentication over HTTP.
//!
//! This crate defines the typed message model shared by the bridge and its
//! hosting adapters:
//!
//! - [`ProtocolMessage`] and [`MessageKind`]: one variant per handshake message
//!   type, each declaring exactly the fields it may carry
//! - [`codec`]: classification of HTTP requests into messages via the
//!   `x-bsv-auth-*` headers, and the JSON body form used by the handshake
//!   endpoint
//! - [`frame`]: the binary framing of general response payloads
//! - [`headers`]: bit-exact wire header names and the field mapping
//!
//! Nothing here performs cryptography. Signatures and identity keys are
//! carried as opaque bytes and validated only for shape.

pub mod codec;
pub mod error;
pub mod frame;
pub mod headers;
pub mod message;

pub use error::{Error, Result};
pub use frame::ResponseFrame;
pub use message::{
    Certificate, IdentityKey, MessageKind, MessageType, ProtocolMessage, RequestId,
    RequestedCertificateSet,
};
