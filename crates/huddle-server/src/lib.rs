//! # huddle-server
//!
//! WebSocket and REST front end for the Huddle conversation engine.
//!
//! - **handlers** - shared state, router and server entry points
//! - **client** - per-connection read and write actors
//! - **api** - REST routes and error responses
//! - **auth** - bearer token and internal secret extractors
//! - **config** - TOML and environment configuration
//! - **metrics** - Prometheus instrumentation

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_router, run_server, serve, AppState};
