//! Event logging for the bridge HTTP server.
//!
//! The [`EventLogger`] subscribes to the coordinator's [`EventBus`] and writes
//! every [`BridgeEvent`] to the tracing pipeline, either as plain fields or
//! as one JSON document per event.

use bsv_auth_node::{BridgeEvent, EventBus};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Logs bridge events until the bus closes.
pub struct EventLogger {
    structured: bool,
}

impl EventLogger {
    pub fn new(structured: bool) -> Self {
        Self { structured }
    }

    /// Whether events are written as JSON documents.
    pub fn is_structured(&self) -> bool {
        self.structured
    }

    /// Spawn the logging task on the current runtime.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => self.log(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn log(&self, event: &BridgeEvent) {
        if self.structured {
            info!(target: "bsv_auth_http::event", "{}", event_json(event));
        } else {
            info!(target: "bsv_auth_http::event", event = event_name(event), "{:?}", event);
        }
    }
}

/// Short name of an event.
pub fn event_name(event: &BridgeEvent) -> &'static str {
    match event {
        BridgeEvent::HandshakeCompleted { .. } => "handshake_completed",
        BridgeEvent::GeneralAuthenticated { .. } => "general_authenticated",
        BridgeEvent::CertificatesReceived { .. } => "certificates_received",
        BridgeEvent::CertificatesRejected { .. } => "certificates_rejected",
        BridgeEvent::PaymentChallenged { .. } => "payment_challenged",
        BridgeEvent::PaymentAccepted { .. } => "payment_accepted",
        BridgeEvent::PaymentFailed { .. } => "payment_failed",
        BridgeEvent::Expired { .. } => "expired",
    }
}

/// JSON form of an event, stamped with the current time.
pub fn event_json(event: &BridgeEvent) -> Value {
    let details = match event {
        BridgeEvent::HandshakeCompleted {
            message_type,
            identity_key,
        } => json!({ "messageType": message_type, "identityKey": identity_key }),
        BridgeEvent::GeneralAuthenticated {
            identity_key,
            request_id,
        } => json!({ "identityKey": identity_key, "requestId": request_id }),
        BridgeEvent::CertificatesReceived {
            identity_key,
            count,
        } => json!({ "identityKey": identity_key, "count": count }),
        BridgeEvent::CertificatesRejected {
            identity_key,
            reason,
        } => json!({ "identityKey": identity_key, "reason": reason }),
        BridgeEvent::PaymentChallenged { path, satoshis } => {
            json!({ "path": path, "satoshis": satoshis })
        }
        BridgeEvent::PaymentAccepted {
            identity_key,
            satoshis_paid,
            transaction_id,
        } => json!({
            "identityKey": identity_key,
            "satoshisPaid": satoshis_paid,
            "transactionId": transaction_id,
        }),
        BridgeEvent::PaymentFailed { path, code } => json!({ "path": path, "code": code }),
        BridgeEvent::Expired {
            handles,
            listeners,
            nonces,
            sessions,
        } => json!({
            "handles": handles,
            "listeners": listeners,
            "nonces": nonces,
            "sessions": sessions,
        }),
    };
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "event": event_name(event),
        "details": details,
    })
}
