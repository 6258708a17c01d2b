//! Modelgate - run a model wrapper's routes on a background async server
//!
//! This library turns a synchronous model front door into a thin proxy:
//! - Launches the background application server once per process
//! - Rewrites selected front door routes to forward to it over loopback HTTP
//! - Falls back to the original handler whenever forwarding fails
//! - Ships a template backend with prediction, remote relay and API docs
//!
//! Activation is an explicit object with three entry points (already built
//! application, factory hook, wrapped constructor), all idempotent.

pub mod activation;
pub mod backend;
pub mod config;
pub mod docs;
pub mod error;
pub mod forward;
pub mod frontdoor;
pub mod launcher;
pub mod model_app;
pub mod predict;
pub mod relay;
pub mod request;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
