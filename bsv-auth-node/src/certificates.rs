//! Certificate listener management.
//!
//! Each identity with an outstanding certificate exchange has exactly one
//! registration, which moves through a small state machine:
//!
//! ```text
//!                    CertificatesAccepted
//!   AwaitingCertificates ───────────────▶ Resolved
//!          │
//!          │ CertificatesRejected | Cancelled | Expired
//!          ▼
//!        Failed
//! ```
//!
//! All transitions go through [`PendingAuthState::transition`]. A registration
//! is removed from the map before it transitions, so each one resolves at most
//! once and its continuations run at most once. Continuations see the failure
//! that ended a failed exchange.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bsv_auth_msg::{Certificate, IdentityKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{BridgeEvent, EventBus};
use crate::peer::{ListenerId, Peer};
use crate::registry::HandleRegistry;

/// Host callback run when an identity's certificates are accepted.
pub type CertificatesHandler = Arc<dyn Fn(&IdentityKey, &[Certificate]) -> Result<()> + Send + Sync>;

/// Deferred step waiting on an identity's certificates. Gets the accepted
/// certificates, or the error the exchange failed with.
pub type Continuation = Box<dyn FnOnce(Result<&[Certificate]>) + Send + Sync>;

// ----------------------------------------------------------------------------
// State machine
// ----------------------------------------------------------------------------

/// State of a pending authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingAuthState {
    AwaitingCertificates,
    Resolved,
    Failed,
}

impl fmt::Display for PendingAuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingAuthState::AwaitingCertificates => write!(f, "AwaitingCertificates"),
            PendingAuthState::Resolved => write!(f, "Resolved"),
            PendingAuthState::Failed => write!(f, "Failed"),
        }
    }
}

/// Events that drive a pending authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAuthEvent {
    CertificatesAccepted,
    CertificatesRejected,
    Cancelled,
    Expired,
}

impl PendingAuthState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PendingAuthState::AwaitingCertificates)
    }

    /// The only legal transitions leave `AwaitingCertificates`.
    pub fn transition(self, event: PendingAuthEvent) -> Result<PendingAuthState> {
        match (self, event) {
            (PendingAuthState::AwaitingCertificates, PendingAuthEvent::CertificatesAccepted) => {
                Ok(PendingAuthState::Resolved)
            }
            (PendingAuthState::AwaitingCertificates, _) => Ok(PendingAuthState::Failed),
            (state, event) => Err(Error::Internal(format!(
                "invalid transition from {} on {:?}",
                state, event
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Registrations
// ----------------------------------------------------------------------------

struct Registration {
    listener_id: ListenerId,
    state: PendingAuthState,
    handler: CertificatesHandler,
    continuations: Vec<Continuation>,
    /// Nonce of the handshake handle that reports a failed exchange.
    owner: Option<String>,
    registered_at: Instant,
}

impl Registration {
    fn advance(&mut self, identity_key: &IdentityKey, event: PendingAuthEvent) -> bool {
        match self.state.transition(event) {
            Ok(next) => {
                debug!(%identity_key, from = %self.state, to = %next, "pending authentication transition");
                self.state = next;
                true
            }
            Err(e) => {
                error!(%identity_key, error = %e, "rejected pending authentication transition");
                false
            }
        }
    }

    fn fail_continuations(&mut self, failure: impl Fn() -> Error) {
        for continuation in self.continuations.drain(..) {
            continuation(Err(failure()));
        }
    }
}

/// Checks that a delivery carries at least one well-formed certificate.
pub fn validate_certificates(certificates: &[Certificate]) -> std::result::Result<(), String> {
    if certificates.is_empty() {
        return Err("No certificates provided".to_string());
    }
    match certificates.iter().position(|c| !c.has_minimal_shape()) {
        Some(index) => Err(format!("certificate {} is missing type or subject", index)),
        None => Ok(()),
    }
}

struct ListenerInner {
    peer: Arc<dyn Peer>,
    registry: Arc<HandleRegistry>,
    registrations: DashMap<IdentityKey, Registration>,
    ttl: Duration,
    events: EventBus,
}

impl ListenerInner {
    fn deliver(&self, expected: &IdentityKey, sender: &IdentityKey, certificates: &[Certificate]) {
        if sender != expected {
            debug!(%expected, %sender, "ignoring certificates from another identity");
            return;
        }
        let Some((_, mut registration)) = self.registrations.remove(expected) else {
            debug!(identity_key = %expected, "certificates arrived with no registration");
            return;
        };
        self.peer
            .stop_listening_for_certificates_received(registration.listener_id);

        match validate_certificates(certificates) {
            Ok(()) => {
                if !registration.advance(expected, PendingAuthEvent::CertificatesAccepted) {
                    return;
                }
                info!(identity_key = %expected, count = certificates.len(), "certificates received");
                if let Err(e) = (registration.handler)(expected, certificates) {
                    error!(identity_key = %expected, error = %e, "certificate callback failed");
                }
                self.events.publish(BridgeEvent::CertificatesReceived {
                    identity_key: expected.to_hex(),
                    count: certificates.len(),
                });
                for continuation in registration.continuations.drain(..) {
                    continuation(Ok(certificates));
                }
            }
            Err(reason) => {
                registration.advance(expected, PendingAuthEvent::CertificatesRejected);
                warn!(identity_key = %expected, %reason, "certificate delivery rejected");
                self.events.publish(BridgeEvent::CertificatesRejected {
                    identity_key: expected.to_hex(),
                    reason: reason.clone(),
                });
                let failure = || Error::MissingCertificates(reason.clone());
                registration.fail_continuations(failure);
                self.fail_owner(registration.owner.as_deref(), failure());
            }
        }
    }

    /// Write an error to the handshake handle that owns a failed exchange.
    fn fail_owner(&self, owner: Option<&str>, failure: Error) {
        let Some(owner) = owner else {
            return;
        };
        match self.registry.resolve_non_general(owner) {
            Ok(handle) => {
                handle.respond(Ok(failure.to_response()));
            }
            Err(e) => debug!(owner, error = %e, "owning handle already resolved"),
        }
    }
}

/// Registers and tears down per-identity certificate listeners.
#[derive(Clone)]
pub struct CertificateListenerManager {
    inner: Arc<ListenerInner>,
}

impl CertificateListenerManager {
    pub fn new(
        peer: Arc<dyn Peer>,
        registry: Arc<HandleRegistry>,
        ttl: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                peer,
                registry,
                registrations: DashMap::new(),
                ttl,
                events,
            }),
        }
    }

    /// Listen for certificates from `identity_key`. Registering an identity
    /// that already has a registration returns its existing listener id.
    pub fn register(&self, identity_key: &IdentityKey, handler: CertificatesHandler) -> ListenerId {
        match self.inner.registrations.entry(identity_key.clone()) {
            Entry::Occupied(entry) => entry.get().listener_id,
            Entry::Vacant(entry) => {
                let weak: Weak<ListenerInner> = Arc::downgrade(&self.inner);
                let expected = identity_key.clone();
                let listener_id =
                    self.inner
                        .peer
                        .listen_for_certificates_received(Box::new(move |sender, certificates| {
                            if let Some(inner) = weak.upgrade() {
                                inner.deliver(&expected, sender, certificates);
                            }
                        }));
                debug!(%identity_key, listener_id, "certificate listener registered");
                entry.insert(Registration {
                    listener_id,
                    state: PendingAuthState::AwaitingCertificates,
                    handler,
                    continuations: Vec::new(),
                    owner: None,
                    registered_at: Instant::now(),
                });
                listener_id
            }
        }
    }

    /// Point failure reports at the handshake handle registered under `nonce`.
    pub fn set_owner(&self, identity_key: &IdentityKey, nonce: &str) -> bool {
        match self.inner.registrations.get_mut(identity_key) {
            Some(mut registration) => {
                registration.owner = Some(nonce.to_string());
                true
            }
            None => false,
        }
    }

    /// Queue a step to run once the identity's exchange resolves either way.
    /// Returns false, without queueing, when nothing is pending.
    pub fn queue_continuation(&self, identity_key: &IdentityKey, continuation: Continuation) -> bool {
        match self.inner.registrations.get_mut(identity_key) {
            Some(mut registration) => {
                registration.continuations.push(continuation);
                true
            }
            None => false,
        }
    }

    /// Entry point for the engine's certificate callback.
    pub fn deliver(&self, expected: &IdentityKey, sender: &IdentityKey, certificates: &[Certificate]) {
        self.inner.deliver(expected, sender, certificates);
    }

    /// Tear down a registration. Its continuations fail with
    /// `MissingCertificates`.
    pub fn cancel(&self, identity_key: &IdentityKey) -> bool {
        let Some((_, mut registration)) = self.inner.registrations.remove(identity_key) else {
            return false;
        };
        registration.advance(identity_key, PendingAuthEvent::Cancelled);
        registration.fail_continuations(|| {
            Error::MissingCertificates(format!(
                "certificate exchange with {} was cancelled",
                identity_key
            ))
        });
        self.inner
            .peer
            .stop_listening_for_certificates_received(registration.listener_id);
        true
    }

    /// Expire registrations older than the TTL. Their owners and
    /// continuations get a timeout.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let ttl = self.inner.ttl;
        let keys: Vec<IdentityKey> = self
            .inner
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for key in keys {
            let removed = self.inner.registrations.remove_if(&key, |_, registration| {
                now.saturating_duration_since(registration.registered_at) >= ttl
            });
            if let Some((_, mut registration)) = removed {
                expired += 1;
                registration.advance(&key, PendingAuthEvent::Expired);
                warn!(identity_key = %key, "certificate listener expired");
                self.inner
                    .peer
                    .stop_listening_for_certificates_received(registration.listener_id);
                let failure =
                    || Error::Timeout(format!("no certificates from {} within {:?}", key, ttl));
                registration.fail_continuations(failure);
                self.inner.fail_owner(registration.owner.as_deref(), failure());
            }
        }
        expired
    }

    pub fn state(&self, identity_key: &IdentityKey) -> Option<PendingAuthState> {
        self.inner
            .registrations
            .get(identity_key)
            .map(|registration| registration.state)
    }

    pub fn listener_id(&self, identity_key: &IdentityKey) -> Option<ListenerId> {
        self.inner
            .registrations
            .get(identity_key)
            .map(|registration| registration.listener_id)
    }

    pub fn len(&self) -> usize {
        self.inner.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::error::ErrorCode;
    use crate::registry::Handle;
    use crate::test_utils::{identity_key, ScriptedPeer};
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Fixture {
        peer: Arc<ScriptedPeer>,
        registry: Arc<HandleRegistry>,
        manager: CertificateListenerManager,
        handled: Arc<AtomicUsize>,
        handler: CertificatesHandler,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(HandleRegistry::new(Duration::from_secs(30)));
        let peer = Arc::new(ScriptedPeer::detached(identity_key(0xee)));
        let manager = CertificateListenerManager::new(
            peer.clone(),
            registry.clone(),
            Duration::from_secs(60),
            EventBus::new(),
        );
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: CertificatesHandler = Arc::new(move |_, certificates| {
            counter.fetch_add(certificates.len(), Ordering::SeqCst);
            Ok(())
        });
        Fixture {
            peer,
            registry,
            manager,
            handled,
            handler,
        }
    }

    #[test]
    fn test_transitions() {
        use PendingAuthEvent::*;
        use PendingAuthState::*;

        assert_eq!(AwaitingCertificates.transition(CertificatesAccepted).unwrap(), Resolved);
        for event in [CertificatesRejected, Cancelled, Expired] {
            assert_eq!(AwaitingCertificates.transition(event).unwrap(), Failed);
        }
        for state in [Resolved, Failed] {
            assert!(state.is_terminal());
            assert!(state.transition(CertificatesAccepted).is_err());
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let f = fixture();
        let alice = identity_key(1);
        let first = f.manager.register(&alice, f.handler.clone());
        let second = f.manager.register(&alice, f.handler.clone());
        assert_eq!(first, second);
        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.peer.certificate_listener_count(), 1);
        assert_eq!(
            f.manager.state(&alice),
            Some(PendingAuthState::AwaitingCertificates)
        );
    }

    #[test]
    fn test_mismatched_sender_is_ignored() {
        let f = fixture();
        let alice = identity_key(1);
        let mallory = identity_key(2);
        let listener = f.manager.register(&alice, f.handler.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        assert!(f.manager.queue_continuation(
            &alice,
            Box::new(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            })
        ));

        f.peer
            .deliver_certificates(&mallory, &[Certificate::new("age", "02aa")]);

        assert_eq!(f.manager.listener_id(&alice), Some(listener));
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(f.peer.certificate_listener_count(), 1);
    }

    #[test]
    fn test_accepted_delivery_runs_continuations_once() {
        let f = fixture();
        let alice = identity_key(1);
        f.manager.register(&alice, f.handler.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            f.manager.queue_continuation(
                &alice,
                Box::new(move |outcome| {
                    seen.lock().unwrap().push(outcome.unwrap().len());
                }),
            );
        }

        let certificates = vec![Certificate::new("age", "02aa"), Certificate::new("kyc", "02aa")];
        f.peer.deliver_certificates(&alice, &certificates);
        f.peer.deliver_certificates(&alice, &certificates);

        assert_eq!(*seen.lock().unwrap(), vec![2, 2]);
        assert_eq!(f.handled.load(Ordering::SeqCst), 2);
        assert!(f.manager.is_empty());
        assert_eq!(f.peer.certificate_listener_count(), 0);
        assert!(!f.manager.queue_continuation(&alice, Box::new(|_| {})));
    }

    #[test]
    fn test_rejected_delivery_fails_owner() {
        let f = fixture();
        let alice = identity_key(1);
        f.manager.register(&alice, f.handler.clone());

        let (handle, mut pending) = Handle::new(RequestContext::new(Method::POST, "/.well-known/bsv/auth"));
        f.registry.register_non_general("owner-nonce", handle);
        assert!(f.manager.set_owner(&alice, "owner-nonce"));

        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        f.manager.queue_continuation(
            &alice,
            Box::new(move |outcome| {
                sink.lock().unwrap().push(outcome.unwrap_err().code());
            }),
        );

        f.peer.deliver_certificates(&alice, &[]);

        assert_eq!(*failures.lock().unwrap(), vec![ErrorCode::MissingCertificates]);
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
        assert!(f.manager.is_empty());
        let response = pending.try_take().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["code"], "ERR_MISSING_CERTIFICATES");
        assert_eq!(body["description"], "No certificates provided");
    }

    #[test]
    fn test_shape_validation() {
        assert!(validate_certificates(&[Certificate::new("age", "02aa")]).is_ok());
        assert!(validate_certificates(&[]).is_err());
        let err = validate_certificates(&[Certificate::new("age", "02aa"), Certificate::new("", "02aa")])
            .unwrap_err();
        assert!(err.contains("certificate 1"));
    }

    #[test]
    fn test_callback_failure_is_isolated() {
        let f = fixture();
        let alice = identity_key(1);
        let failing: CertificatesHandler =
            Arc::new(|_, _| Err(Error::Internal("storage offline".to_string())));
        f.manager.register(&alice, failing);

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        f.manager.queue_continuation(
            &alice,
            Box::new(move |outcome| {
                assert!(outcome.is_ok());
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        );
        f.peer
            .deliver_certificates(&alice, &[Certificate::new("age", "02aa")]);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(f.manager.is_empty());
        assert_eq!(f.peer.certificate_listener_count(), 0);
    }

    #[test]
    fn test_cancel_and_sweep() {
        let f = fixture();
        let alice = identity_key(1);
        let bob = identity_key(2);
        f.manager.register(&alice, f.handler.clone());
        f.manager.register(&bob, f.handler.clone());

        let failures = Arc::new(Mutex::new(Vec::new()));
        for key in [&alice, &bob] {
            let sink = failures.clone();
            f.manager.queue_continuation(
                key,
                Box::new(move |outcome| {
                    sink.lock().unwrap().push(outcome.unwrap_err().code());
                }),
            );
        }

        assert!(f.manager.cancel(&alice));
        assert!(!f.manager.cancel(&alice));
        assert_eq!(*failures.lock().unwrap(), vec![ErrorCode::MissingCertificates]);

        let (handle, mut pending) = Handle::new(RequestContext::new(Method::POST, "/.well-known/bsv/auth"));
        f.registry.register_non_general("bob-nonce", handle);
        f.manager.set_owner(&bob, "bob-nonce");

        assert_eq!(f.manager.sweep_expired(Instant::now()), 0);
        assert_eq!(
            f.manager.sweep_expired(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert!(f.manager.is_empty());
        assert_eq!(f.peer.certificate_listener_count(), 0);
        let response = pending.try_take().unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["code"], "ERR_TIMEOUT");
        assert_eq!(
            *failures.lock().unwrap(),
            vec![ErrorCode::MissingCertificates, ErrorCode::Timeout]
        );
    }
}
