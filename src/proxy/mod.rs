//! Client-facing proxy
//!
//! This module provides the listener, per-request method dispatch, header
//! filtering and the composition of request and stream backends.

pub mod forward;
pub mod handler;
pub mod headers;
pub mod instance;
pub mod server;

pub use forward::Forwarder;
pub use handler::ProxyHandler;
pub use headers::{HeaderPolicy, DEFAULT_USER_AGENT};
pub use instance::ProxyInstance;
pub use server::ProxyServer;
