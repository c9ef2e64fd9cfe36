//! Outbound side of the bridge: turns engine messages into HTTP responses.

use std::sync::Arc;
use std::time::Duration;

use bsv_auth_msg::{codec, MessageKind, ProtocolMessage, ResponseFrame};
use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, StatusCode};
use tracing::{debug, error};

use crate::context::{BridgeResponse, RequestContext};
use crate::error::{Error, Result};
use crate::peer::Transport;
use crate::registry::HandleRegistry;

/// [`Transport`] that resolves pending handles with HTTP responses.
pub struct HttpTransport {
    registry: Arc<HandleRegistry>,
}

impl HttpTransport {
    pub fn new(handle_ttl: Duration) -> Self {
        Self {
            registry: Arc::new(HandleRegistry::new(handle_ttl)),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Handshake replies: the JSON message as body plus the auth headers.
    fn handshake_response(message: &ProtocolMessage) -> Result<BridgeResponse> {
        let body = codec::encode_json(message)?;
        let mut response = BridgeResponse::new(Bytes::from(body));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        append_auth_headers(headers, message)?;
        Ok(response)
    }

    /// General replies: status, headers and body unpacked from the frame,
    /// then the auth headers of the signed envelope.
    fn general_response(message: &ProtocolMessage, frame: ResponseFrame) -> Result<BridgeResponse> {
        let status = StatusCode::from_u16(frame.status)
            .map_err(|e| Error::MalformedMessage(format!("frame status {}: {}", frame.status, e)))?;
        let mut response = BridgeResponse::new(Bytes::from(frame.body.unwrap_or_default()));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &frame.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::MalformedMessage(format!("frame header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::MalformedMessage(format!("frame header value: {}", e)))?;
            headers.append(name, value);
        }
        append_auth_headers(headers, message)?;
        Ok(response)
    }
}

fn append_auth_headers(headers: &mut http::HeaderMap, message: &ProtocolMessage) -> Result<()> {
    for (name, value) in codec::encode(message)? {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::MalformedMessage(format!("{}: {}", name, e)))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(())
}

impl Transport for HttpTransport {
    fn send(&self, ctx: &RequestContext, message: ProtocolMessage) -> Result<()> {
        let outcome = match &message.kind {
            MessageKind::General {
                request_id,
                payload,
            } => {
                let frame = ResponseFrame::decode(payload)?;
                if frame.request_id != *request_id {
                    return Err(Error::MalformedMessage(format!(
                        "frame request id {} does not match message request id {}",
                        frame.request_id, request_id
                    )));
                }
                let key = request_id.to_base64();
                let response = Self::general_response(&message, frame)?;
                self.registry
                    .resolve_general(&key)
                    .map(|handle| (key, handle, response))
            }
            _ => {
                let key = message.your_nonce.clone().ok_or_else(|| {
                    Error::MalformedMessage(format!(
                        "{} reply has no your-nonce",
                        message.message_type()
                    ))
                })?;
                let response = Self::handshake_response(&message)?;
                self.registry
                    .resolve_non_general(&key)
                    .map(|handle| (key, handle, response))
            }
        };

        match outcome {
            Ok((key, handle, response)) => {
                debug!(
                    request = %ctx.id,
                    key,
                    message_type = %message.message_type(),
                    status = %response.status(),
                    "resolving pending response"
                );
                if !handle.respond(Ok(response)) {
                    debug!(key, "request gave up before the response arrived");
                }
                Ok(())
            }
            Err(e) => {
                error!(request = %ctx.id, message_type = %message.message_type(), error = %e, "cannot correlate outbound message");
                Err(e)
            }
        }
    }
}
