//! Transport coordinator: the entry point hosting adapters call per request.
//!
//! A request ends in one of two ways:
//!
//! - [`Outcome::Respond`]: the bridge answers on its own (handshake replies,
//!   402 challenges, errors);
//! - [`Outcome::Proceed`]: the request is admitted. The adapter runs the
//!   application and hands its response back to
//!   [`TransportCoordinator::complete`], which signs and frames it for the
//!   authenticated peer.
//!
//! Every call is synchronous. The engine answers through
//! [`crate::transport::HttpTransport`] before
//! [`Peer::handle_incoming_message`] returns, so each request finds its
//! response in its own pending handle right after the engine call.

use std::sync::{mpsc, Arc};
use std::time::Instant;

use bsv_auth_msg::headers::{is_auth_header, WELL_KNOWN_AUTH_PATH};
use bsv_auth_msg::{codec, Certificate, IdentityKey, MessageType, ProtocolMessage, RequestId, ResponseFrame};
use chrono::Utc;
use dashmap::DashMap;
use http::{Method, StatusCode};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::certificates::{CertificateListenerManager, CertificatesHandler};
use crate::config::BridgeConfig;
use crate::context::{AuthInfo, BridgeRequest, BridgeResponse, RequestContext};
use crate::error::{json_response, Error, ErrorSeverity, Result};
use crate::event::{BridgeEvent, EventBus};
use crate::payment::{annotate_response, PaymentChallenge, PaymentGate, PaymentOutcome, PaymentRecord};
use crate::peer::Peer;
use crate::registry::{CorrelationKey, Handle, HandleRegistry, PendingResponse};
use crate::session::{SessionRecord, SessionStore, SessionUpdate};
use crate::transport::HttpTransport;

/// What the adapter does with a request.
#[derive(Debug)]
pub enum Outcome {
    /// Send this response; the application is not involved.
    Respond(BridgeResponse),
    /// Run the application, then pass its response to
    /// [`TransportCoordinator::complete`].
    Proceed(Admission),
}

/// An admitted request.
#[derive(Debug)]
pub struct Admission {
    pub auth: AuthInfo,
    pub payment: Option<PaymentRecord>,
    pub context: RequestContext,
    reply: Option<GeneralReply>,
}

impl Admission {
    /// Whether the response will be signed for an authenticated peer.
    pub fn is_signed(&self) -> bool {
        self.reply.is_some()
    }
}

/// Where the signed answer to a general request goes.
#[derive(Debug)]
struct GeneralReply {
    request_id: RequestId,
    identity_key: IdentityKey,
    pending: PendingResponse,
}

enum GateResult {
    Pass(Option<PaymentRecord>),
    Challenge(PaymentChallenge),
}

/// Counts from one [`TransportCoordinator::sweep`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub handles: usize,
    pub listeners: usize,
    pub nonces: usize,
    pub sessions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.handles + self.listeners + self.nonces + self.sessions
    }
}

/// Coordinates the codec, handle registry, certificate listeners and payment
/// gate around one authentication engine.
pub struct TransportCoordinator {
    config: BridgeConfig,
    transport: Arc<HttpTransport>,
    peer: Arc<dyn Peer>,
    sessions: Arc<dyn SessionStore>,
    certificates: CertificateListenerManager,
    certificates_handler: Option<CertificatesHandler>,
    payment: Option<PaymentGate>,
    verified: Arc<DashMap<Uuid, IdentityKey>>,
    events: EventBus,
}

impl TransportCoordinator {
    /// `transport` must be the transport `peer` delivers its replies to.
    pub fn new(
        config: BridgeConfig,
        transport: Arc<HttpTransport>,
        peer: Arc<dyn Peer>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        if config.auth_version.trim().is_empty() {
            return Err(Error::Configuration("auth_version must not be empty".to_string()));
        }
        if config.handle_ttl_secs == 0 {
            return Err(Error::Configuration("handle_ttl_secs must be positive".to_string()));
        }

        if let Some(requested) = &config.requested_certificates {
            peer.request_certificates(requested.clone());
        }

        let events = EventBus::new();
        let certificates = CertificateListenerManager::new(
            peer.clone(),
            transport.registry().clone(),
            config.listener_ttl(),
            events.clone(),
        );

        let verified: Arc<DashMap<Uuid, IdentityKey>> = Arc::new(DashMap::new());
        let sink = verified.clone();
        let listener_id = peer.listen_for_general_messages(Box::new(move |ctx, sender, _payload| {
            sink.insert(ctx.id, sender.clone());
        }));
        info!(
            listener_id,
            auth_version = %config.auth_version,
            allow_unauthenticated = config.allow_unauthenticated,
            "transport coordinator ready"
        );

        Ok(Self {
            config,
            transport,
            peer,
            sessions,
            certificates,
            certificates_handler: None,
            payment: None,
            verified,
            events,
        })
    }

    /// Charge for priced resources.
    pub fn with_payment_gate(mut self, gate: PaymentGate) -> Self {
        self.payment = Some(gate);
        self
    }

    /// Require certificates from new identities and hand them to `callback`
    /// once accepted. The session store is updated before the callback runs.
    pub fn with_certificates_callback(mut self, callback: CertificatesHandler) -> Self {
        let sessions = self.sessions.clone();
        self.certificates_handler = Some(Arc::new(move |identity_key: &IdentityKey, certificates: &[Certificate]| {
            store_certificates(sessions.as_ref(), identity_key, certificates)?;
            callback(identity_key, certificates)
        }));
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        self.transport.registry()
    }

    pub fn certificates(&self) -> &CertificateListenerManager {
        &self.certificates
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn payment_gate(&self) -> Option<&PaymentGate> {
        self.payment.as_ref()
    }

    /// Classify and process a request.
    pub fn handle_request(&self, request: BridgeRequest) -> Outcome {
        let ctx = RequestContext::from_request(&request);
        debug!(request = %ctx.id, method = %ctx.method, path = %ctx.path, "handling request");
        match self.route(&ctx, request.body()) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Respond(self.error_response(&ctx, &e)),
        }
    }

    /// Turn the application's response to an admitted request into the
    /// response sent to the client.
    pub fn complete(&self, admission: Admission, mut response: BridgeResponse) -> BridgeResponse {
        if let Some(record) = &admission.payment {
            annotate_response(&mut response, record);
        }
        match admission.reply {
            None => response,
            Some(reply) => self
                .sign_response(&admission.context, reply, response)
                .unwrap_or_else(|e| self.error_response(&admission.context, &e)),
        }
    }

    /// Expire stale handles, listener registrations, nonces and sessions.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            handles: self.registry().sweep_expired(now).total(),
            listeners: self.certificates.sweep_expired(now),
            nonces: self
                .payment
                .as_ref()
                .map(|gate| gate.sweep_expired(now))
                .unwrap_or(0),
            sessions: self.sessions.sweep_expired(Utc::now()),
        };
        if report.total() > 0 {
            info!(?report, "swept expired bridge state");
            self.events.publish(BridgeEvent::Expired {
                handles: report.handles,
                listeners: report.listeners,
                nonces: report.nonces,
                sessions: report.sessions,
            });
        }
        report
    }

    fn route(&self, ctx: &RequestContext, body: &[u8]) -> Result<Outcome> {
        let message = match codec::decode(ctx.header_pairs(), body)? {
            Some(message) => Some(message),
            None if is_handshake_endpoint(ctx) => Some(codec::decode_json(body)?),
            None => None,
        };

        match message {
            None => self.handle_unauthenticated(ctx),
            Some(message) => {
                if message.version != self.config.auth_version {
                    return Err(Error::MalformedMessage(format!(
                        "unsupported auth version {}",
                        message.version
                    )));
                }
                if message.message_type().is_general() {
                    self.handle_general(ctx, message)
                } else {
                    self.handle_handshake(ctx, message).map(Outcome::Respond)
                }
            }
        }
    }

    fn handle_unauthenticated(&self, ctx: &RequestContext) -> Result<Outcome> {
        if !self.config.allow_unauthenticated {
            warn!(request = %ctx.id, path = %ctx.path, "no auth headers and unauthenticated access is off");
            return Err(Error::Authentication("no authentication headers".to_string()));
        }
        debug!(request = %ctx.id, "admitting unauthenticated request as unknown");
        let auth = AuthInfo::unknown();
        match self.run_gate(ctx, &auth)? {
            GateResult::Pass(payment) => Ok(Outcome::Proceed(Admission {
                auth,
                payment,
                context: ctx.clone(),
                reply: None,
            })),
            GateResult::Challenge(challenge) => Ok(Outcome::Respond(challenge.to_response())),
        }
    }

    fn handle_handshake(&self, ctx: &RequestContext, message: ProtocolMessage) -> Result<BridgeResponse> {
        let message_type = message.message_type();
        let identity_key = message.identity_key.clone();
        let key = message
            .sender_nonce()
            .ok_or_else(|| Error::MalformedMessage(format!("{} has no nonce", message_type)))?
            .to_string();

        if let (Some(identity), Some(handler)) = (&identity_key, &self.certificates_handler) {
            if !self.sessions.has_session(identity) {
                self.certificates.register(identity, handler.clone());
                self.certificates.set_owner(identity, &key);
            }
        }

        let (handle, mut pending) = Handle::new(ctx.clone());
        let correlation = CorrelationKey::NonGeneral(key.clone());
        self.registry().register_non_general(&key, handle);

        if let Err(e) = self.peer.handle_incoming_message(ctx, message) {
            self.registry().cancel(&correlation, pending.generation());
            return Err(engine_failure(e));
        }

        match pending.try_take() {
            Some(result) => {
                let response = result?;
                if response.status().is_success() {
                    info!(request = %ctx.id, %message_type, "handshake message answered");
                    self.events.publish(BridgeEvent::HandshakeCompleted {
                        message_type: message_type.to_string(),
                        identity_key: identity_key.as_ref().map(IdentityKey::to_hex),
                    });
                }
                Ok(response)
            }
            None => {
                self.registry().cancel(&correlation, pending.generation());
                if message_type == MessageType::CertificateResponse {
                    debug!(request = %ctx.id, "certificate response accepted without a reply");
                    Ok(json_response(StatusCode::OK, &json!({"status": "ok"})))
                } else {
                    Err(Error::Internal(format!(
                        "authentication engine did not answer {}",
                        message_type
                    )))
                }
            }
        }
    }

    fn handle_general(&self, ctx: &RequestContext, message: ProtocolMessage) -> Result<Outcome> {
        let request_id = *message
            .request_id()
            .ok_or_else(|| Error::MalformedMessage("general message has no request id".to_string()))?;
        let identity_key = message
            .identity_key
            .clone()
            .ok_or_else(|| Error::Authentication("general message has no identity key".to_string()))?;

        let (handle, mut pending) = Handle::new(ctx.clone());
        let correlation = CorrelationKey::General(request_id.to_base64());
        self.registry().register_general(&request_id.to_base64(), handle)?;

        let processed = self.peer.handle_incoming_message(ctx, message);
        let verified = self.verified.remove(&ctx.id).map(|(_, key)| key);
        if let Err(e) = processed {
            self.registry().cancel(&correlation, pending.generation());
            return Err(engine_failure(e));
        }
        if verified.as_ref() != Some(&identity_key) {
            if let Some(result) = pending.try_take() {
                debug!(request = %ctx.id, "engine answered an unverified general message");
                return result.map(Outcome::Respond);
            }
            self.registry().cancel(&correlation, pending.generation());
            return Err(Error::Authentication(format!(
                "general message from {} was not verified",
                identity_key
            )));
        }

        info!(request = %ctx.id, %identity_key, %request_id, "general message authenticated");
        self.events.publish(BridgeEvent::GeneralAuthenticated {
            identity_key: identity_key.to_hex(),
            request_id: request_id.to_base64(),
        });

        let reply = GeneralReply {
            request_id,
            identity_key: identity_key.clone(),
            pending,
        };
        let admitted = self
            .authenticated_info(ctx, &identity_key)
            .and_then(|auth| self.run_gate(ctx, &auth).map(|gate| (auth, gate)));

        match admitted {
            Ok((auth, GateResult::Pass(payment))) => Ok(Outcome::Proceed(Admission {
                auth,
                payment,
                context: ctx.clone(),
                reply: Some(reply),
            })),
            Ok((_, GateResult::Challenge(challenge))) => self
                .sign_response(ctx, reply, challenge.to_response())
                .map(Outcome::Respond),
            Err(e) => {
                let response = self.error_response(ctx, &e);
                self.sign_response(ctx, reply, response).map(Outcome::Respond)
            }
        }
    }

    /// Wait for pending certificates, then build the request's auth info and
    /// record the session.
    fn authenticated_info(&self, ctx: &RequestContext, identity_key: &IdentityKey) -> Result<AuthInfo> {
        self.await_certificates(identity_key)?;

        let session = self.peer.get_authenticated_session(ctx, identity_key, false);
        if session.as_ref().is_some_and(|s| !s.is_authenticated) {
            return Err(Error::Authentication(format!(
                "session for {} is not authenticated",
                identity_key
            )));
        }
        let mut certificates = session.map(|s| s.certificates).unwrap_or_default();
        if certificates.is_empty() {
            if let Some(record) = self.sessions.get_session(identity_key) {
                certificates = record.certificates;
            }
        }

        if self.sessions.has_session(identity_key) {
            self.sessions.update_session(
                identity_key,
                SessionUpdate {
                    is_authenticated: Some(true),
                    certificates: (!certificates.is_empty()).then(|| certificates.clone()),
                },
            )?;
        } else {
            let mut record = SessionRecord::new(identity_key.clone(), true);
            record.certificates = certificates.clone();
            self.sessions.create_session(record)?;
        }
        Ok(AuthInfo::authenticated(identity_key.clone(), certificates))
    }

    /// Block until a pending certificate exchange for `identity_key` resolves.
    fn await_certificates(&self, identity_key: &IdentityKey) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Result<usize>>();
        let queued = self.certificates.queue_continuation(
            identity_key,
            Box::new(move |outcome| {
                let _ = tx.send(outcome.map(<[Certificate]>::len));
            }),
        );
        if !queued {
            return Ok(());
        }

        let wait = self.config.certificate_wait();
        debug!(%identity_key, ?wait, "waiting for certificates");
        match rx.recv_timeout(wait) {
            Ok(Ok(count)) => {
                debug!(%identity_key, count, "certificates arrived");
                Ok(())
            }
            Ok(Err(failure)) => {
                debug!(%identity_key, error = %failure, "certificate exchange failed");
                Err(failure)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "no certificates from {} within {:?}",
                identity_key, wait
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::MissingCertificates(format!(
                "certificate exchange with {} failed",
                identity_key
            ))),
        }
    }

    fn run_gate(&self, ctx: &RequestContext, auth: &AuthInfo) -> Result<GateResult> {
        let Some(gate) = &self.payment else {
            return Ok(GateResult::Pass(None));
        };
        match gate.process(ctx, auth)? {
            PaymentOutcome::Proceed(record) => Ok(GateResult::Pass(Some(record))),
            PaymentOutcome::Challenge(challenge) => Ok(GateResult::Challenge(challenge)),
        }
    }

    /// Frame `response`, have the engine sign it, and collect the result.
    fn sign_response(
        &self,
        ctx: &RequestContext,
        mut reply: GeneralReply,
        response: BridgeResponse,
    ) -> Result<BridgeResponse> {
        let correlation = CorrelationKey::General(reply.request_id.to_base64());
        let mut frame = ResponseFrame::new(reply.request_id, response.status().as_u16());
        for (name, value) in response.headers() {
            if is_auth_header(name.as_str()) {
                continue;
            }
            match value.to_str() {
                Ok(value) => frame = frame.with_header(name.as_str(), value),
                Err(_) => warn!(header = %name, "dropping non-text header from signed response"),
            }
        }
        if !response.body().is_empty() {
            frame = frame.with_body(response.body().to_vec());
        }

        if let Err(e) = self.peer.to_peer(ctx, frame.encode(), &reply.identity_key) {
            self.registry().cancel(&correlation, reply.pending.generation());
            return Err(e);
        }
        match reply.pending.try_take() {
            Some(result) => result,
            None => {
                self.registry().cancel(&correlation, reply.pending.generation());
                Err(Error::Internal(
                    "authentication engine did not deliver the signed response".to_string(),
                ))
            }
        }
    }

    fn error_response(&self, ctx: &RequestContext, e: &Error) -> BridgeResponse {
        match e.severity() {
            ErrorSeverity::Critical => {
                error!(request = %ctx.id, path = %ctx.path, code = %e.code(), error = %e, "request failed")
            }
            ErrorSeverity::Warning => {
                warn!(request = %ctx.id, path = %ctx.path, code = %e.code(), error = %e, "request failed")
            }
            ErrorSeverity::Info => {
                info!(request = %ctx.id, path = %ctx.path, code = %e.code(), error = %e, "request failed")
            }
        }
        e.to_response()
    }
}

fn is_handshake_endpoint(ctx: &RequestContext) -> bool {
    ctx.method == Method::POST && ctx.path == WELL_KNOWN_AUTH_PATH
}

/// Engine failures surface as authentication failures, except bridge-side
/// correlation and timeout errors.
fn engine_failure(e: Error) -> Error {
    match e {
        Error::Correlation(_) | Error::Timeout(_) | Error::Authentication(_) => e,
        other => Error::Authentication(other.to_string()),
    }
}

fn store_certificates(
    sessions: &dyn SessionStore,
    identity_key: &IdentityKey,
    certificates: &[Certificate],
) -> Result<()> {
    if sessions.has_session(identity_key) {
        sessions.update_session(
            identity_key,
            SessionUpdate {
                is_authenticated: None,
                certificates: Some(certificates.to_vec()),
            },
        )
    } else {
        let mut record = SessionRecord::new(identity_key.clone(), false);
        record.certificates = certificates.to_vec();
        sessions.create_session(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::path_price;
    use crate::session::InMemorySessionStore;
    use crate::test_utils::{identity_key, ScriptedPeer, ScriptedWallet};
    use bsv_auth_msg::headers::*;
    use bsv_auth_msg::RequestedCertificateSet;
    use bytes::Bytes;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        peer: Arc<ScriptedPeer>,
        sessions: Arc<InMemorySessionStore>,
        coordinator: TransportCoordinator,
    }

    fn fixture(config: BridgeConfig) -> Fixture {
        let transport = Arc::new(HttpTransport::new(config.handle_ttl()));
        let peer = Arc::new(ScriptedPeer::detached(identity_key(0xee)));
        peer.attach(transport.clone());
        let sessions = Arc::new(InMemorySessionStore::default());
        let coordinator =
            TransportCoordinator::new(config, transport, peer.clone(), sessions.clone()).unwrap();
        Fixture {
            peer,
            sessions,
            coordinator,
        }
    }

    fn with_gate(f: Fixture) -> Fixture {
        let gate = PaymentGate::builder()
            .wallet(Arc::new(ScriptedWallet::accepting()))
            .price_fn(Arc::new(path_price))
            .events(f.coordinator.events().clone())
            .build()
            .unwrap();
        Fixture {
            coordinator: f.coordinator.with_payment_gate(gate),
            ..f
        }
    }

    fn initial_request(client: &IdentityKey, nonce: &str) -> BridgeRequest {
        let body = json!({
            "version": AUTH_VERSION,
            "messageType": "initialRequest",
            "identityKey": client.to_hex(),
            "initialNonce": nonce,
        });
        http::Request::builder()
            .method(Method::POST)
            .uri(WELL_KNOWN_AUTH_PATH)
            .header("content-type", "application/json")
            .body(Bytes::from(body.to_string()))
            .unwrap()
    }

    fn general_request(client: &IdentityKey, path: &str, request_id: RequestId) -> http::request::Builder {
        http::Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HEADER_VERSION, AUTH_VERSION)
            .header(HEADER_IDENTITY_KEY, client.to_hex())
            .header(HEADER_NONCE, "client-nonce")
            .header(HEADER_YOUR_NONCE, "server-nonce")
            .header(HEADER_SIGNATURE, "3044")
            .header(HEADER_REQUEST_ID, request_id.to_base64())
    }

    fn respond(outcome: Outcome) -> BridgeResponse {
        match outcome {
            Outcome::Respond(response) => response,
            Outcome::Proceed(admission) => panic!("unexpected admission {:?}", admission.auth),
        }
    }

    fn admit(outcome: Outcome) -> Admission {
        match outcome {
            Outcome::Proceed(admission) => admission,
            Outcome::Respond(response) => panic!("unexpected response {}", response.status()),
        }
    }

    fn body(response: &BridgeResponse) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[test]
    fn test_handshake_over_json_body() {
        let f = fixture(BridgeConfig::default());
        let mut events = f.coordinator.events().subscribe();
        let client = identity_key(1);

        let response = respond(f.coordinator.handle_request(initial_request(&client, "c-nonce")));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HEADER_MESSAGE_TYPE], "initialResponse");
        assert_eq!(response.headers()[HEADER_YOUR_NONCE], "c-nonce");
        assert_eq!(body(&response)["yourNonce"], "c-nonce");
        assert!(f.coordinator.registry().is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            BridgeEvent::HandshakeCompleted { .. }
        ));
    }

    #[test]
    fn test_configured_certificate_request_reaches_initial_response() {
        let requested = RequestedCertificateSet {
            certifiers: vec![identity_key(7).to_hex()],
            types: [("age".to_string(), vec!["over18".to_string()])]
                .into_iter()
                .collect(),
        };
        let f = fixture(BridgeConfig {
            requested_certificates: Some(requested.clone()),
            ..Default::default()
        });

        let response = respond(
            f.coordinator
                .handle_request(initial_request(&identity_key(1), "c-nonce")),
        );
        assert_eq!(response.status(), StatusCode::OK);
        let header: RequestedCertificateSet = serde_json::from_str(
            response.headers()[HEADER_REQUESTED_CERTIFICATES].to_str().unwrap(),
        )
        .unwrap();
        assert_eq!(header, requested);
        assert_eq!(
            body(&response)["requestedCertificates"]["certifiers"][0],
            identity_key(7).to_hex()
        );
    }

    #[test]
    fn test_silent_engine_is_internal_error() {
        let f = fixture(BridgeConfig::default());
        f.peer.set_silent_handshake(true);
        let response = respond(
            f.coordinator
                .handle_request(initial_request(&identity_key(1), "c-nonce")),
        );
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response)["code"], "ERR_INTERNAL");
        assert!(f.coordinator.registry().is_empty());
    }

    #[test]
    fn test_malformed_handshake() {
        let f = fixture(BridgeConfig::default());
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(WELL_KNOWN_AUTH_PATH)
            .body(Bytes::from_static(b"{\"messageType\":\"nope\"}"))
            .unwrap();
        let response = respond(f.coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&response)["code"], "ERR_INVALID_AUTH");
    }

    #[test]
    fn test_unauthenticated_policy() {
        let f = fixture(BridgeConfig::default());
        let request = http::Request::get("/data").body(Bytes::new()).unwrap();
        let response = respond(f.coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body(&response);
        assert_eq!(json["code"], "UNAUTHORIZED");
        assert_eq!(json["description"], "Mutual-authentication failed!");

        let f = with_gate(fixture(BridgeConfig {
            allow_unauthenticated: true,
            ..Default::default()
        }));
        let request = http::Request::get("/free/data").body(Bytes::new()).unwrap();
        let admission = admit(f.coordinator.handle_request(request));
        assert!(!admission.auth.is_authenticated);
        assert!(!admission.is_signed());
        assert_eq!(admission.payment.as_ref().map(|p| p.satoshis_paid), Some(0));

        let request = http::Request::get("/protected/data").body(Bytes::new()).unwrap();
        let response = respond(f.coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&response)["code"], "ERR_AUTHENTICATION_REQUIRED");
    }

    #[test]
    fn test_general_request_is_signed() {
        let f = fixture(BridgeConfig::default());
        let client = identity_key(1);
        respond(f.coordinator.handle_request(initial_request(&client, "c-nonce")));

        let request_id = RequestId::new([9u8; 32]);
        let request = general_request(&client, "/data", request_id)
            .body(Bytes::new())
            .unwrap();
        let admission = admit(f.coordinator.handle_request(request));
        assert!(admission.is_signed());
        assert_eq!(admission.auth.identity_key.as_ref(), Some(&client));
        assert!(f.sessions.has_session(&client));

        let mut app = BridgeResponse::new(Bytes::from_static(b"hello"));
        app.headers_mut()
            .insert("x-app", http::HeaderValue::from_static("1"));
        let response = f.coordinator.complete(admission, app);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"hello");
        assert_eq!(response.headers()["x-app"], "1");
        assert_eq!(response.headers()[HEADER_REQUEST_ID], request_id.to_base64().as_str());
        assert_eq!(
            response.headers()[HEADER_IDENTITY_KEY],
            f.peer.server_key().to_hex().as_str()
        );
        assert!(f.coordinator.registry().is_empty());
    }

    #[test]
    fn test_general_without_session_is_unauthorized() {
        let f = fixture(BridgeConfig::default());
        let request = general_request(&identity_key(3), "/data", RequestId::new([1u8; 32]))
            .body(Bytes::new())
            .unwrap();
        let response = respond(f.coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(f.coordinator.registry().is_empty());
    }

    #[test]
    fn test_payment_challenge_then_accept() {
        let f = with_gate(fixture(BridgeConfig::default()));
        let client = identity_key(1);
        respond(f.coordinator.handle_request(initial_request(&client, "c-nonce")));

        let request = general_request(&client, "/protected/doc", RequestId::new([2u8; 32]))
            .body(Bytes::new())
            .unwrap();
        let response = respond(f.coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(response.headers()[HEADER_PAYMENT_SATOSHIS_REQUIRED], "500");
        assert!(response.headers().contains_key(HEADER_SIGNATURE));
        let challenge = body(&response);
        assert_eq!(challenge["satoshisRequired"], 500);

        let payment = json!({
            "derivationPrefix": challenge["derivationPrefix"],
            "nonce": challenge["nonce"],
            "transaction": "AQID",
        });
        let request = general_request(&client, "/protected/doc", RequestId::new([3u8; 32]))
            .header(HEADER_PAYMENT, payment.to_string())
            .body(Bytes::new())
            .unwrap();
        let admission = admit(f.coordinator.handle_request(request));
        assert_eq!(admission.payment.as_ref().map(|p| p.satoshis_paid), Some(500));
        let response = f
            .coordinator
            .complete(admission, BridgeResponse::new(Bytes::from_static(b"{}")));
        assert_eq!(response.headers()[HEADER_PAYMENT_SATOSHIS_PAID], "500");
    }

    #[test]
    fn test_duplicate_request_id() {
        let f = fixture(BridgeConfig::default());
        let client = identity_key(1);
        respond(f.coordinator.handle_request(initial_request(&client, "c-nonce")));

        let request_id = RequestId::new([5u8; 32]);
        let first = admit(
            f.coordinator.handle_request(
                general_request(&client, "/a", request_id)
                    .body(Bytes::new())
                    .unwrap(),
            ),
        );
        let response = respond(
            f.coordinator.handle_request(
                general_request(&client, "/b", request_id)
                    .body(Bytes::new())
                    .unwrap(),
            ),
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&response)["code"], "ERR_DUPLICATE_REQUEST_ID");

        let response = f.coordinator.complete(first, BridgeResponse::new(Bytes::new()));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_certificate_exchange_updates_session() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let f = fixture(BridgeConfig::default());
        let coordinator = f.coordinator.with_certificates_callback(Arc::new(move |_, certificates| {
            counter.fetch_add(certificates.len(), Ordering::SeqCst);
            Ok(())
        }));
        let client = identity_key(1);

        respond(coordinator.handle_request(initial_request(&client, "c-nonce")));
        assert_eq!(coordinator.certificates().len(), 1);

        let body = json!({
            "version": AUTH_VERSION,
            "messageType": "certificateResponse",
            "identityKey": client.to_hex(),
            "nonce": "cert-nonce",
            "yourNonce": "server-nonce",
            "certificates": [{"type": "age", "subject": client.to_hex()}],
            "signature": [1, 2, 3],
        });
        let request = http::Request::post(WELL_KNOWN_AUTH_PATH)
            .body(Bytes::from(body.to_string()))
            .unwrap();
        let response = respond(coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(coordinator.certificates().is_empty());
        assert_eq!(f.peer.certificate_listener_count(), 0);
        assert_eq!(
            f.sessions.get_session(&client).map(|s| s.certificates.len()),
            Some(1)
        );
    }

    #[test]
    fn test_empty_certificates_rejected() {
        let f = fixture(BridgeConfig::default());
        let coordinator = f.coordinator.with_certificates_callback(Arc::new(|_, _| Ok(())));
        let client = identity_key(1);
        respond(coordinator.handle_request(initial_request(&client, "c-nonce")));

        let body = json!({
            "version": AUTH_VERSION,
            "messageType": "certificateResponse",
            "identityKey": client.to_hex(),
            "nonce": "cert-nonce",
            "certificates": [],
            "signature": [1],
        });
        let request = http::Request::post(WELL_KNOWN_AUTH_PATH)
            .body(Bytes::from(body.to_string()))
            .unwrap();
        let response = respond(coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            serde_json::from_slice::<Value>(response.body()).unwrap()["code"],
            "ERR_MISSING_CERTIFICATES"
        );
        assert!(coordinator.certificates().is_empty());
    }

    #[test]
    fn test_general_waits_for_certificates() {
        let f = fixture(BridgeConfig {
            certificate_wait_secs: 5,
            ..Default::default()
        });
        let coordinator = Arc::new(
            f.coordinator
                .with_certificates_callback(Arc::new(|_, _| Ok(()))),
        );
        let client = identity_key(1);
        respond(coordinator.handle_request(initial_request(&client, "c-nonce")));

        let waiting = {
            let coordinator = coordinator.clone();
            let client = client.clone();
            std::thread::spawn(move || {
                let request = general_request(&client, "/data", RequestId::new([7u8; 32]))
                    .body(Bytes::new())
                    .unwrap();
                match coordinator.handle_request(request) {
                    Outcome::Proceed(admission) => admission.auth.certificates.len(),
                    Outcome::Respond(response) => panic!("unexpected {}", response.status()),
                }
            })
        };

        // let the request reach its wait before certificates arrive
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.registry().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        f.peer
            .deliver_certificates(&client, &[Certificate::new("age", client.to_hex())]);

        assert_eq!(waiting.join().unwrap(), 1);
    }

    #[test]
    fn test_certificates_alone_do_not_authenticate_session() {
        let f = fixture(BridgeConfig::default());
        let coordinator = f
            .coordinator
            .with_certificates_callback(Arc::new(|_, _| Ok(())));
        let client = identity_key(1);
        respond(coordinator.handle_request(initial_request(&client, "c-nonce")));

        f.peer
            .deliver_certificates(&client, &[Certificate::new("age", client.to_hex())]);
        let record = f.sessions.get_session(&client).unwrap();
        assert!(!record.is_authenticated);
        assert_eq!(record.certificates.len(), 1);

        let request = general_request(&client, "/data", RequestId::new([3u8; 32]))
            .body(Bytes::new())
            .unwrap();
        let admission = admit(coordinator.handle_request(request));
        assert_eq!(admission.auth.certificates.len(), 1);
        assert!(f.sessions.get_session(&client).unwrap().is_authenticated);
    }

    #[test]
    fn test_expired_listener_times_out_waiting_request() {
        let f = fixture(BridgeConfig {
            certificate_wait_secs: 30,
            ..Default::default()
        });
        let coordinator = Arc::new(
            f.coordinator
                .with_certificates_callback(Arc::new(|_, _| Ok(()))),
        );
        let client = identity_key(1);
        respond(coordinator.handle_request(initial_request(&client, "c-nonce")));

        let waiting = {
            let coordinator = coordinator.clone();
            let client = client.clone();
            std::thread::spawn(move || {
                let request = general_request(&client, "/data", RequestId::new([6u8; 32]))
                    .body(Bytes::new())
                    .unwrap();
                respond(coordinator.handle_request(request))
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.registry().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        let expired = coordinator
            .certificates()
            .sweep_expired(Instant::now() + Duration::from_secs(301));
        assert_eq!(expired, 1);

        let response = waiting.join().unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response)["code"], "ERR_TIMEOUT");
    }

    #[test]
    fn test_certificate_wait_times_out() {
        let f = fixture(BridgeConfig {
            certificate_wait_secs: 0,
            ..Default::default()
        });
        let coordinator = f
            .coordinator
            .with_certificates_callback(Arc::new(|_, _| Ok(())));
        let client = identity_key(1);
        respond(coordinator.handle_request(initial_request(&client, "c-nonce")));

        let request = general_request(&client, "/data", RequestId::new([8u8; 32]))
            .body(Bytes::new())
            .unwrap();
        let response = respond(coordinator.handle_request(request));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response)["code"], "ERR_TIMEOUT");
        assert!(coordinator.registry().is_empty());
    }

    #[test]
    fn test_sweep_reports_expired_state() {
        let f = with_gate(fixture(BridgeConfig::default()));
        let mut events = f.coordinator.events().subscribe();
        let client = identity_key(1);
        respond(f.coordinator.handle_request(initial_request(&client, "c-nonce")));
        let request = general_request(&client, "/other", RequestId::new([4u8; 32]))
            .body(Bytes::new())
            .unwrap();
        respond(f.coordinator.handle_request(request));

        let (handle, _pending) = Handle::new(RequestContext::new(Method::GET, "/stale"));
        f.coordinator.registry().register_non_general("stale", handle);

        assert_eq!(f.coordinator.sweep(Instant::now()).total(), 0);
        let report = f.coordinator.sweep(Instant::now() + Duration::from_secs(301));
        assert_eq!(report.handles, 1);
        assert_eq!(report.nonces, 1);
        while let Ok(event) = events.try_recv() {
            if let BridgeEvent::Expired { handles, .. } = event {
                assert_eq!(handles, 1);
                return;
            }
        }
        panic!("no expiry event published");
    }
}
