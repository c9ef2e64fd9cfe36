//! Request handlers for the bridge HTTP server.
//!
//! Every request except the health check goes through the
//! [`TransportCoordinator`]. Bridge processing is blocking, so it runs on
//! tokio's blocking pool.

use std::convert::Infallible;
use std::sync::Arc;

use bsv_auth_node::{
    AuthInfo, BridgeRequest, BridgeResponse, Outcome, PaymentRecord, RequestContext,
    TransportCoordinator,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info};
use warp::http::{HeaderMap, Method, Request, Response, StatusCode};
use warp::hyper::Body;
use warp::path::FullPath;
use warp::reply::json;
use warp::Reply;

use crate::error::Error;

/// An admitted request as the application sees it.
#[derive(Debug)]
pub struct AppRequest {
    pub context: RequestContext,
    pub auth: AuthInfo,
    pub payment: Option<PaymentRecord>,
    pub body: Bytes,
}

/// The application behind the bridge.
pub trait Application: Send + Sync {
    fn handle(&self, request: AppRequest) -> BridgeResponse;
}

impl<F> Application for F
where
    F: Fn(AppRequest) -> BridgeResponse + Send + Sync,
{
    fn handle(&self, request: AppRequest) -> BridgeResponse {
        self(request)
    }
}

/// Response structure for health checks.
#[derive(Serialize)]
struct HealthResponse {
    /// Status of the server, always "ok" when reachable
    status: String,
    /// Current version of the bsv-auth-http package
    version: String,
}

/// Handler for health check requests. Bypasses authentication and payment.
pub async fn handle_health_check() -> std::result::Result<impl Reply, Infallible> {
    debug!("Health check request received");
    Ok(json(&HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Handler for every request routed through the bridge.
pub async fn handle_bridge(
    method: Method,
    path: FullPath,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    coordinator: Arc<TransportCoordinator>,
    app: Arc<dyn Application>,
) -> std::result::Result<warp::reply::Response, Infallible> {
    let uri = if query.is_empty() {
        path.as_str().to_string()
    } else {
        format!("{}?{}", path.as_str(), query)
    };
    let mut request = match Request::builder().method(method).uri(uri.as_str()).body(body) {
        Ok(request) => request,
        Err(e) => {
            error!(uri, error = %e, "Failed to rebuild request");
            return Ok(Error::Http(e.to_string()).to_response());
        }
    };
    *request.headers_mut() = headers;

    let result = tokio::task::spawn_blocking(move || process(&coordinator, app.as_ref(), request)).await;
    match result {
        Ok(response) => Ok(into_reply(response)),
        Err(e) => {
            error!(uri, error = %e, "Bridge worker failed");
            Ok(Error::from(e).to_response())
        }
    }
}

/// Run one request through the bridge and, when admitted, the application.
pub fn process(
    coordinator: &TransportCoordinator,
    app: &dyn Application,
    request: BridgeRequest,
) -> BridgeResponse {
    let body = request.body().clone();
    match coordinator.handle_request(request) {
        Outcome::Respond(response) => {
            debug!(status = %response.status(), "Bridge answered the request");
            response
        }
        Outcome::Proceed(admission) => {
            let app_request = AppRequest {
                context: admission.context.clone(),
                auth: admission.auth.clone(),
                payment: admission.payment.clone(),
                body,
            };
            info!(
                path = %app_request.context.path,
                identity_key = %app_request.auth.identity_label(),
                "Request admitted"
            );
            let response = app.handle(app_request);
            coordinator.complete(admission, response)
        }
    }
}

fn into_reply(response: BridgeResponse) -> warp::reply::Response {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::from(body))
}

/// JSON response with the given status, for applications.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> BridgeResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = BridgeResponse::new(Bytes::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                warp::http::header::CONTENT_TYPE,
                warp::http::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => bsv_auth_node::Error::Internal(e.to_string()).to_response(),
    }
}
