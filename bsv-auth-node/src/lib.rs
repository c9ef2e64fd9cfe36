//! # BSV Auth Transport Bridge
//!
//! This crate bridges one-shot HTTP request/response handling and the
//! peer-style, callback-driven BRC-103/104 mutual authentication engine, and
//! runs the HTTP 402 payment flow for authenticated requests.
//!
//! ## Architecture
//!
//! - **Transport Coordinator** ([`TransportCoordinator`]): entry point per
//!   request; classifies it, drives the engine, and decides whether the
//!   application runs
//! - **Handle Registry** ([`registry::HandleRegistry`]): pending HTTP
//!   responses keyed by nonce or request id, with a TTL sweep
//! - **HTTP Transport** ([`HttpTransport`]): the [`Transport`] the engine
//!   answers through; turns protocol messages into HTTP responses
//! - **Certificate Listener Manager**
//!   ([`certificates::CertificateListenerManager`]): per-identity certificate
//!   exchanges and the requests waiting on them
//! - **Payment Gate** ([`PaymentGate`]): pricing, 402 challenges, and payment
//!   verification through the [`Wallet`]
//! - **Event Bus** ([`EventBus`]): broadcast of protocol milestones
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bsv_auth_node::{
//!     BridgeConfig, HttpTransport, InMemorySessionStore, Outcome, Peer, PaymentGate,
//!     TransportCoordinator, Wallet,
//! };
//!
//! fn build(
//!     make_peer: impl FnOnce(Arc<HttpTransport>) -> Arc<dyn Peer>,
//!     wallet: Arc<dyn Wallet>,
//! ) -> bsv_auth_node::Result<TransportCoordinator> {
//!     let config = BridgeConfig::default();
//!     let transport = Arc::new(HttpTransport::new(config.handle_ttl()));
//!     let peer = make_peer(transport.clone());
//!     let sessions = Arc::new(InMemorySessionStore::new(config.session_max_age()));
//!     let coordinator = TransportCoordinator::new(config, transport, peer, sessions)?;
//!
//!     let gate = PaymentGate::builder()
//!         .wallet(wallet)
//!         .price_fn(Arc::new(bsv_auth_node::payment::path_price))
//!         .nonce_ttl(coordinator.config().nonce_ttl())
//!         .events(coordinator.events().clone())
//!         .build()?;
//!     Ok(coordinator.with_payment_gate(gate))
//! }
//!
//! fn serve(coordinator: &TransportCoordinator, request: bsv_auth_node::BridgeRequest) -> bsv_auth_node::BridgeResponse {
//!     match coordinator.handle_request(request) {
//!         Outcome::Respond(response) => response,
//!         Outcome::Proceed(admission) => {
//!             let app_response = http::Response::new(bytes::Bytes::from_static(b"{\"ok\":true}"));
//!             coordinator.complete(admission, app_response)
//!         }
//!     }
//! }
//! ```

pub mod certificates;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod nonce;
pub mod payment;
pub mod peer;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::BridgeConfig;
pub use context::{AuthInfo, BridgeRequest, BridgeResponse, RequestContext};
pub use coordinator::{Admission, Outcome, SweepReport, TransportCoordinator};
pub use error::{Error, ErrorCode, Result};
pub use event::{BridgeEvent, EventBus};
pub use payment::{PaymentGate, PaymentRecord, PriceFn};
pub use peer::{Peer, PeerSession, Transport};
pub use session::{InMemorySessionStore, SessionRecord, SessionStore};
pub use transport::HttpTransport;
pub use wallet::Wallet;
