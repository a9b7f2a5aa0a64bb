//! TLS interception for CONNECT tunnels
//!
//! Clients must trust the local CA. Each intercepted host gets a leaf
//! certificate issued on first use and cached for the life of the process.

mod ca;
mod cache;
mod intercept;

pub use ca::CertificateAuthority;
pub use cache::CertCache;
pub use intercept::InterceptingStreamBackend;
