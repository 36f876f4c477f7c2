//! `relaybank-api` – JSON control API for the relay bank.
//!
//! Boots a small HTTP/1.1 server (default port `8080`) in front of a shared
//! [`SwitchEngine`](relaybank_kernel::SwitchEngine):
//!
//! | Route | Action |
//! |---|---|
//! | `POST /api/relay` | drive one channel by id |
//! | `POST /api/input` | break-before-make source changeover in a group |
//! | `POST /api/output` | drive an output by its 1-based number |
//! | `GET /api/status` | snapshot of every channel and active source |
//! | `POST /api/emergency-off` | force every channel off |
//! | `GET /api/health` | lock-free liveness and bank layout |
//!
//! Errors are returned as `{"error": …, "kind": …}` where `kind` is the
//! stable [`RelayError::kind`](relaybank_types::RelayError::kind) string.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaybank_api::ApiServer;
//! use relaybank_hal::{default_bank, ChannelRegistry, SimLineDriver};
//! use relaybank_kernel::SwitchEngine;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = ChannelRegistry::new(default_bank()).unwrap();
//!     let engine = Arc::new(SwitchEngine::new(registry, Box::new(SimLineDriver::new())));
//!     engine.initialize().unwrap();
//!     ApiServer::new(engine).run().await.expect("api server failed");
//! }
//! ```

pub mod http;
pub mod routes;
pub mod server;

pub use server::{ApiServer, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT};
