//! Test utilities for the transport bridge
//!
//! [`ScriptedPeer`] stands in for the authentication engine and
//! [`ScriptedWallet`] for the payment wallet. Both keep their behaviour simple
//! and observable so tests can assert on what the bridge asked of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bsv_auth_msg::message::{IDENTITY_KEY_LEN, REQUEST_ID_LEN};
use bsv_auth_msg::{
    Certificate, IdentityKey, MessageKind, ProtocolMessage, RequestId, RequestedCertificateSet,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::peer::{
    CertificatesReceivedCallback, GeneralMessageCallback, ListenerId, Peer, PeerSession,
    Transport,
};
use crate::wallet::{InternalizeAction, InternalizeActionResult, KeyQuery, Wallet};

/// Deterministic compressed identity key filled with `n`.
pub fn identity_key(n: u8) -> IdentityKey {
    let mut bytes = [n; IDENTITY_KEY_LEN];
    bytes[0] = 0x02;
    // 33 bytes with an 0x02 prefix always parse
    IdentityKey::from_bytes(&bytes).expect("valid identity key")
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

type SharedCertificatesCallback = Arc<dyn Fn(&IdentityKey, &[Certificate]) + Send + Sync>;
type SharedGeneralCallback = Arc<dyn Fn(&RequestContext, &IdentityKey, &[u8]) + Send + Sync>;

/// Authentication engine that trusts every signature.
///
/// An initial request authenticates its sender. General messages from an
/// authenticated sender are handed to the general listeners; from anyone else
/// they fail with an authentication error.
pub struct ScriptedPeer {
    server_key: IdentityKey,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    certificate_listeners: Mutex<BTreeMap<ListenerId, SharedCertificatesCallback>>,
    general_listeners: Mutex<BTreeMap<ListenerId, SharedGeneralCallback>>,
    sessions: Mutex<HashMap<IdentityKey, PeerSession>>,
    next_listener: AtomicU64,
    silent_handshake: AtomicBool,
    reject_signatures: AtomicBool,
    requested_certificates: Mutex<Option<RequestedCertificateSet>>,
}

impl ScriptedPeer {
    /// Peer with no transport yet. Replies fail until [`ScriptedPeer::attach`].
    pub fn detached(server_key: IdentityKey) -> Self {
        Self {
            server_key,
            transport: RwLock::new(None),
            certificate_listeners: Mutex::new(BTreeMap::new()),
            general_listeners: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            silent_handshake: AtomicBool::new(false),
            reject_signatures: AtomicBool::new(false),
            requested_certificates: Mutex::new(None),
        }
    }

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().unwrap() = Some(transport);
    }

    pub fn server_key(&self) -> &IdentityKey {
        &self.server_key
    }

    /// Process handshake messages without replying.
    pub fn set_silent_handshake(&self, silent: bool) {
        self.silent_handshake.store(silent, Ordering::SeqCst);
    }

    /// Fail every signed message as if its signature were invalid.
    pub fn set_reject_signatures(&self, reject: bool) {
        self.reject_signatures.store(reject, Ordering::SeqCst);
    }

    /// Mark an identity authenticated without a handshake.
    pub fn authenticate(&self, identity_key: &IdentityKey) {
        self.sessions.lock().unwrap().insert(
            identity_key.clone(),
            PeerSession {
                session_nonce: random_nonce(),
                peer_identity_key: identity_key.clone(),
                is_authenticated: true,
                certificates: Vec::new(),
            },
        );
    }

    pub fn certificate_listener_count(&self) -> usize {
        self.certificate_listeners.lock().unwrap().len()
    }

    /// Invoke every certificate listener as the engine would.
    pub fn deliver_certificates(&self, sender: &IdentityKey, certificates: &[Certificate]) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(sender) {
            session.certificates = certificates.to_vec();
        }
        // listeners unregister themselves from inside the callback
        let listeners: Vec<SharedCertificatesCallback> = self
            .certificate_listeners
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(sender, certificates);
        }
    }

    fn reply(&self, ctx: &RequestContext, message: ProtocolMessage) -> Result<()> {
        let transport = self
            .transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal("no transport attached".to_string()))?;
        transport.send(ctx, message)
    }

    fn signed(&self, kind: MessageKind) -> ProtocolMessage {
        ProtocolMessage::new(bsv_auth_msg::headers::AUTH_VERSION, kind)
            .with_identity_key(self.server_key.clone())
            .with_signature(vec![0x30, 0x44, 0x02, 0x20])
    }

    fn require_identity(message: &ProtocolMessage) -> Result<IdentityKey> {
        message
            .identity_key
            .clone()
            .ok_or_else(|| Error::Authentication("sender did not identify itself".to_string()))
    }
}

impl Peer for ScriptedPeer {
    fn request_certificates(&self, requested: RequestedCertificateSet) {
        *self.requested_certificates.lock().unwrap() = Some(requested);
    }

    fn handle_incoming_message(&self, ctx: &RequestContext, message: ProtocolMessage) -> Result<()> {
        if message.signature.is_none() && !matches!(message.kind, MessageKind::InitialRequest { .. }) {
            return Err(Error::Authentication("message is not signed".to_string()));
        }
        if self.reject_signatures.load(Ordering::SeqCst) {
            return Err(Error::Authentication("invalid signature".to_string()));
        }
        let silent = self.silent_handshake.load(Ordering::SeqCst);

        match &message.kind {
            MessageKind::InitialRequest { initial_nonce, .. } => {
                let sender = Self::require_identity(&message)?;
                self.authenticate(&sender);
                if silent {
                    return Ok(());
                }
                let requested_certificates = self.requested_certificates.lock().unwrap().clone();
                let reply = self
                    .signed(MessageKind::InitialResponse {
                        initial_nonce: random_nonce(),
                        certificates: Vec::new(),
                        requested_certificates,
                    })
                    .with_your_nonce(initial_nonce.clone());
                self.reply(ctx, reply)
            }
            MessageKind::InitialResponse { .. } => Err(Error::Authentication(
                "unexpected initial response".to_string(),
            )),
            MessageKind::CertificateResponse { certificates } => {
                let sender = Self::require_identity(&message)?;
                self.deliver_certificates(&sender, certificates);
                Ok(())
            }
            MessageKind::CertificateRequest { .. } => {
                Self::require_identity(&message)?;
                if silent {
                    return Ok(());
                }
                let mut reply = self
                    .signed(MessageKind::CertificateResponse {
                        certificates: Vec::new(),
                    })
                    .with_nonce(random_nonce());
                if let Some(nonce) = &message.nonce {
                    reply = reply.with_your_nonce(nonce.clone());
                }
                self.reply(ctx, reply)
            }
            MessageKind::General { payload, .. } => {
                let sender = Self::require_identity(&message)?;
                let authenticated = self
                    .sessions
                    .lock()
                    .unwrap()
                    .get(&sender)
                    .map(|session| session.is_authenticated)
                    .unwrap_or(false);
                if !authenticated {
                    return Err(Error::Authentication(format!(
                        "no session for {}",
                        sender
                    )));
                }
                let listeners: Vec<SharedGeneralCallback> = self
                    .general_listeners
                    .lock()
                    .unwrap()
                    .values()
                    .cloned()
                    .collect();
                for listener in listeners {
                    listener(ctx, &sender, payload);
                }
                Ok(())
            }
        }
    }

    fn listen_for_certificates_received(&self, callback: CertificatesReceivedCallback) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.certificate_listeners
            .lock()
            .unwrap()
            .insert(id, Arc::from(callback));
        id
    }

    fn stop_listening_for_certificates_received(&self, listener_id: ListenerId) {
        self.certificate_listeners.lock().unwrap().remove(&listener_id);
    }

    fn listen_for_general_messages(&self, callback: GeneralMessageCallback) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.general_listeners
            .lock()
            .unwrap()
            .insert(id, Arc::from(callback));
        id
    }

    fn get_authenticated_session(
        &self,
        _ctx: &RequestContext,
        identity_key: &IdentityKey,
        _wait: bool,
    ) -> Option<PeerSession> {
        self.sessions.lock().unwrap().get(identity_key).cloned()
    }

    fn to_peer(&self, ctx: &RequestContext, payload: Vec<u8>, identity_key: &IdentityKey) -> Result<()> {
        let request_id = payload
            .get(..REQUEST_ID_LEN)
            .ok_or_else(|| Error::MalformedMessage("payload shorter than a request id".to_string()))
            .and_then(|bytes| RequestId::from_slice(bytes).map_err(Error::from))?;
        let your_nonce = self
            .sessions
            .lock()
            .unwrap()
            .get(identity_key)
            .map(|session| session.session_nonce.clone())
            .unwrap_or_else(random_nonce);
        let message = self
            .signed(MessageKind::General {
                request_id,
                payload,
            })
            .with_nonce(random_nonce())
            .with_your_nonce(your_nonce);
        self.reply(ctx, message)
    }
}

/// Wallet whose verdict on payments is fixed at construction.
pub struct ScriptedWallet {
    identity: Option<IdentityKey>,
    accept: bool,
    fail: bool,
    satoshis_paid: Option<u64>,
    internalized: Mutex<Vec<InternalizeAction>>,
}

impl ScriptedWallet {
    fn with_verdict(accept: bool, fail: bool) -> Self {
        Self {
            identity: Some(identity_key(0x0f)),
            accept,
            fail,
            satoshis_paid: None,
            internalized: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::with_verdict(true, false)
    }

    pub fn rejecting() -> Self {
        Self::with_verdict(false, false)
    }

    /// Every internalization errors out.
    pub fn failing() -> Self {
        Self::with_verdict(false, true)
    }

    /// Wallet that cannot report an identity key.
    pub fn without_identity() -> Self {
        Self {
            identity: None,
            ..Self::accepting()
        }
    }

    pub fn with_satoshis_paid(mut self, satoshis: u64) -> Self {
        self.satoshis_paid = Some(satoshis);
        self
    }

    /// Actions handed to `internalize_action` so far.
    pub fn internalized(&self) -> Vec<InternalizeAction> {
        self.internalized.lock().unwrap().clone()
    }
}

impl Wallet for ScriptedWallet {
    fn get_public_key(&self, _query: &KeyQuery) -> Result<IdentityKey> {
        self.identity
            .clone()
            .ok_or_else(|| Error::Internal("wallet is locked".to_string()))
    }

    fn create_signature(&self, data: &[u8], _query: &KeyQuery) -> Result<Vec<u8>> {
        Ok(Sha256::digest(data).to_vec())
    }

    fn verify_signature(&self, data: &[u8], signature: &[u8], _query: &KeyQuery) -> Result<bool> {
        Ok(Sha256::digest(data).as_slice() == signature)
    }

    fn internalize_action(&self, action: InternalizeAction) -> Result<InternalizeActionResult> {
        let satoshis = action.satoshis;
        self.internalized.lock().unwrap().push(action);
        if self.fail {
            return Err(Error::Internal("wallet storage unavailable".to_string()));
        }
        Ok(InternalizeActionResult {
            accepted: self.accept,
            satoshis_paid: self.accept.then(|| self.satoshis_paid.unwrap_or(satoshis)),
            transaction_id: self.accept.then(|| format!("txid-{}", satoshis)),
        })
    }
}
