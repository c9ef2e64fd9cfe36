//! Event handling for the transport bridge
//!
//! The bridge publishes a [`BridgeEvent`] at each protocol milestone. Hosts can
//! subscribe with [`EventBus::subscribe`] to drive audit logs or metrics.

use tokio::sync::broadcast;

/// Event types that can be emitted by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A handshake message was answered by the authentication engine
    HandshakeCompleted {
        /// Wire name of the inbound message type
        message_type: String,
        /// Sender identity key, if it was given
        identity_key: Option<String>,
    },
    /// A general request passed signature verification
    GeneralAuthenticated {
        identity_key: String,
        request_id: String,
    },
    /// Certificates were delivered and accepted for an identity
    CertificatesReceived { identity_key: String, count: usize },
    /// A certificate delivery failed validation
    CertificatesRejected { identity_key: String, reason: String },
    /// A 402 challenge was issued
    PaymentChallenged { path: String, satoshis: u64 },
    /// A payment was internalized by the wallet
    PaymentAccepted {
        identity_key: String,
        satoshis_paid: u64,
        transaction_id: Option<String>,
    },
    /// A payment failed verification or was rejected
    PaymentFailed { path: String, code: String },
    /// A sweep expired pending state
    Expired {
        handles: usize,
        listeners: usize,
        nonces: usize,
        sessions: usize,
    },
}

/// Event bus for publishing and subscribing to bridge events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        // Create a channel with capacity for 100 events
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Get a receiver for bridge events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Events published with no subscriber are dropped.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.sender.send(event);
    }
}
