//! Warp HTTP server for the BSV auth transport bridge.
//!
//! This crate puts a [`bsv_auth_node::TransportCoordinator`] in front of an
//! application. Every request except the health check is classified by the
//! coordinator: handshake traffic is answered by the authentication engine,
//! general requests are verified, optionally charged through the 402 payment
//! flow, handed to the [`Application`], and their responses signed on the
//! way out.
//!
//! # Endpoints
//!
//! - `GET /health`: liveness, no authentication
//! - `POST /.well-known/bsv/auth`: handshake and certificate messages
//! - anything else: the application, behind authentication and payment
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bsv_auth_http::{json_response, AppRequest, BridgeHttpConfig, BridgeHttpServer};
//! use bsv_auth_node::TransportCoordinator;
//! use warp::http::StatusCode;
//!
//! async fn run(coordinator: TransportCoordinator) -> Result<(), Box<dyn std::error::Error>> {
//!     let app = |request: AppRequest| {
//!         json_response(
//!             StatusCode::OK,
//!             &serde_json::json!({ "hello": request.auth.identity_label() }),
//!         )
//!     };
//!
//!     let mut server = BridgeHttpServer::new(BridgeHttpConfig::default(), coordinator, Arc::new(app));
//!     let addr = server.start().await?;
//!     println!("listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod server;

pub use config::BridgeHttpConfig;
pub use error::{Error, Result};
pub use event::EventLogger;
pub use handler::{json_response, AppRequest, Application};
pub use server::{routes, BridgeHttpServer};
