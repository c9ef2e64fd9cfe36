//! Collaborator interfaces the bridge consumes and exposes.
//!
//! The authentication engine implements [`Peer`]. The bridge implements
//! [`Transport`], which the engine calls synchronously to deliver the message
//! answering a request.

use bsv_auth_msg::{Certificate, IdentityKey, ProtocolMessage, RequestedCertificateSet};

use crate::context::RequestContext;
use crate::error::Result;

/// Identifier returned when registering a callback with the engine.
pub type ListenerId = u64;

/// Invoked by the engine when a peer delivers certificates.
pub type CertificatesReceivedCallback = Box<dyn Fn(&IdentityKey, &[Certificate]) + Send + Sync>;

/// Invoked by the engine for every verified general message.
pub type GeneralMessageCallback = Box<dyn Fn(&RequestContext, &IdentityKey, &[u8]) + Send + Sync>;

/// Authenticated session as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub session_nonce: String,
    pub peer_identity_key: IdentityKey,
    pub is_authenticated: bool,
    pub certificates: Vec<Certificate>,
}

/// The mutual authentication engine.
pub trait Peer: Send + Sync {
    /// Verify and process an inbound message. Any reply is delivered through
    /// [`Transport::send`] before this returns.
    fn handle_incoming_message(&self, ctx: &RequestContext, message: ProtocolMessage)
        -> Result<()>;

    /// Ask every new peer for `requested` in the initial response.
    fn request_certificates(&self, requested: RequestedCertificateSet);

    fn listen_for_certificates_received(&self, callback: CertificatesReceivedCallback)
        -> ListenerId;

    fn stop_listening_for_certificates_received(&self, listener_id: ListenerId);

    fn listen_for_general_messages(&self, callback: GeneralMessageCallback) -> ListenerId;

    fn get_authenticated_session(
        &self,
        ctx: &RequestContext,
        identity_key: &IdentityKey,
        wait: bool,
    ) -> Option<PeerSession>;

    /// Sign `payload` as a general message to `identity_key` and deliver it
    /// through the transport.
    fn to_peer(&self, ctx: &RequestContext, payload: Vec<u8>, identity_key: &IdentityKey)
        -> Result<()>;
}

/// Outbound side of the bridge, called back by the engine.
pub trait Transport: Send + Sync {
    fn send(&self, ctx: &RequestContext, message: ProtocolMessage) -> Result<()>;
}
