//! Lambda Proxy - forward HTTP/HTTPS proxy backed by remote functions
//!
//! Each proxied request is fulfilled by one of a rotating set of remote
//! functions so that outbound traffic leaves from many network identities.
//!
//! ## Features
//!
//! - Short-lived, long-lived and hybrid dispatch under a shared concurrency ceiling
//! - Out-of-band retrieval of large response bodies from S3 or a message queue
//! - CONNECT tunnelling, either plain or with local TLS interception
//! - Direct-dial mode for running without remote functions

pub mod backend;
pub mod config;
pub mod error;
pub mod mitm;
pub mod models;
pub mod proxy;
pub mod stats;
pub mod transport;
pub mod workers;

pub use config::Config;
pub use error::{ProxyError, Result};
