//! HTTP server hosting the transport bridge.
//!
//! The server exposes:
//!
//! - `GET /health` for monitoring, outside authentication and payment
//! - every other method and path, including `POST /.well-known/bsv/auth`,
//!   through the [`TransportCoordinator`]
//!
//! A background task sweeps expired bridge state on a fixed interval. The
//! server is built using the Warp web framework and provides graceful
//! shutdown capabilities.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bsv_auth_node::TransportCoordinator;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warp::{Filter, Rejection, Reply};

use crate::config::BridgeHttpConfig;
use crate::error::{Error, Result};
use crate::handler::{handle_bridge, handle_health_check, Application};

/// Bridge HTTP server.
pub struct BridgeHttpServer {
    /// Server configuration.
    config: BridgeHttpConfig,

    /// The bridge every request goes through.
    coordinator: Arc<TransportCoordinator>,

    /// The application admitted requests are handed to.
    app: Arc<dyn Application>,

    /// Shutdown channel for graceful server termination.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Address actually bound, once started.
    local_addr: Option<SocketAddr>,

    /// Sweeper and event logger tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHttpServer {
    pub fn new(
        config: BridgeHttpConfig,
        coordinator: TransportCoordinator,
        app: Arc<dyn Application>,
    ) -> Self {
        Self {
            config,
            coordinator: Arc::new(coordinator),
            app,
            shutdown_tx: None,
            local_addr: None,
            tasks: Vec::new(),
        }
    }

    /// Starts the HTTP server, the sweeper and, if configured, the event
    /// logger. The server runs until [`BridgeHttpServer::stop`] is called.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr: SocketAddr = self
            .config
            .server_addr()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

        let routes = routes(
            self.coordinator.clone(),
            self.app.clone(),
            self.config.max_body_bytes,
        );

        let (tx, rx) = oneshot::channel::<()>();
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async move {
                rx.await.ok();
                info!("Shutting down bridge HTTP server");
            })
            .map_err(|e| Error::Http(e.to_string()))?;
        self.shutdown_tx = Some(tx);
        self.local_addr = Some(bound);

        tokio::spawn(server);
        self.tasks.push(spawn_sweeper(
            self.coordinator.clone(),
            self.config.sweep_interval(),
        ));
        if let Some(logger) = self.config.event_logger() {
            self.tasks.push(logger.spawn(self.coordinator.events()));
        }

        info!("Bridge HTTP server started on {}", bound);
        Ok(bound)
    }

    /// Sends the shutdown signal and stops the background tasks.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("Sent shutdown signal to bridge HTTP server");
        } else {
            warn!("Bridge HTTP server is not running");
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    pub fn coordinator(&self) -> &Arc<TransportCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &BridgeHttpConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// All server routes.
pub fn routes(
    coordinator: Arc<TransportCoordinator>,
    app: Arc<dyn Application>,
    max_body_bytes: u64,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(handle_health_check);

    let raw_query = warp::query::raw()
        .or(warp::any().map(String::new))
        .unify();

    let bridge_route = warp::method()
        .and(warp::path::full())
        .and(raw_query)
        .and(warp::header::headers_cloned())
        .and(body_limit(max_body_bytes))
        .and(with_coordinator(coordinator))
        .and(with_app(app))
        .and_then(handle_bridge);

    health_route
        .or(bridge_route)
        .with(warp::log("bsv_auth_http"))
        .recover(handle_rejection)
}

/// Helper function to provide the coordinator to route handlers.
fn with_coordinator(
    coordinator: Arc<TransportCoordinator>,
) -> impl Filter<Extract = (Arc<TransportCoordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

fn with_app(
    app: Arc<dyn Application>,
) -> impl Filter<Extract = (Arc<dyn Application>,), Error = Infallible> + Clone {
    warp::any().map(move || app.clone())
}

#[derive(Debug)]
struct BodyTooLarge;

impl warp::reject::Reject for BodyTooLarge {}

#[derive(Debug)]
struct BodyUnreadable;

impl warp::reject::Reject for BodyUnreadable {}

/// Extracts the request body, capped at `max_body_bytes`.
///
/// A declared `Content-Length` over the limit is rejected before any read.
/// Bodies without one, such as chunked uploads, are counted as they stream
/// in and rejected once they pass the limit.
fn body_limit(max_body_bytes: u64) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and_then(move |length: Option<u64>| async move {
            match length {
                Some(length) if length > max_body_bytes => {
                    Err(warp::reject::custom(BodyTooLarge))
                }
                _ => Ok(()),
            }
        })
        .untuple_one()
        .and(warp::body::stream())
        .and_then(move |stream| read_capped(stream, max_body_bytes))
}

async fn read_capped<S, B>(
    stream: S,
    max_body_bytes: u64,
) -> std::result::Result<Bytes, Rejection>
where
    S: Stream<Item = std::result::Result<B, warp::Error>>,
    B: Buf,
{
    futures::pin_mut!(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.try_next().await.map_err(|e| {
        debug!(error = %e, "Failed to read request body");
        warp::reject::custom(BodyUnreadable)
    })? {
        if (body.len() + chunk.remaining()) as u64 > max_body_bytes {
            return Err(warp::reject::custom(BodyTooLarge));
        }
        body.put(chunk);
    }
    Ok(body.freeze())
}

fn spawn_sweeper(
    coordinator: Arc<TransportCoordinator>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let report = coordinator.sweep(Instant::now());
            if report.total() > 0 {
                debug!(?report, "Sweep expired bridge state");
            }
        }
    })
}

/// Handler for rejections.
async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (code, description, status) = if err.is_not_found() {
        ("ERR_NOT_FOUND", "Not Found", warp::http::StatusCode::NOT_FOUND)
    } else if err.find::<BodyTooLarge>().is_some()
        || err.find::<warp::reject::PayloadTooLarge>().is_some()
    {
        (
            "ERR_PAYLOAD_TOO_LARGE",
            "Payload too large",
            warp::http::StatusCode::PAYLOAD_TOO_LARGE,
        )
    } else if err.find::<BodyUnreadable>().is_some() {
        (
            "ERR_INVALID_BODY",
            "Request body could not be read",
            warp::http::StatusCode::BAD_REQUEST,
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            "ERR_INTERNAL",
            "Internal Server Error",
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "status": "error",
            "code": code,
            "description": description,
        })),
        status,
    ))
}
