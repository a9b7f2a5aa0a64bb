//! Header filtering between client and upstream

use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::HeaderMap;
use rand::seq::SliceRandom;

/// Fallback User-Agent when no pool entry is available
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/61.0.3163.100 Safari/537.36";

const USER_AGENTS: &[&str] = &[
    DEFAULT_USER_AGENT,
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:120.0) Gecko/20100101 Firefox/120.0",
];

/// Stripped from client requests before they go upstream
const FILTERED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "upgrade-insecure-requests",
];

/// Stripped from upstream responses before they reach the client
const FILTERED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Copy)]
pub struct HeaderPolicy {
    override_user_agent: bool,
}

impl HeaderPolicy {
    pub fn new(override_user_agent: bool) -> Self {
        Self {
            override_user_agent,
        }
    }

    /// Headers to send upstream for a client request
    pub fn outbound(&self, headers: &HeaderMap) -> HeaderMap {
        let mut filtered = filter(headers, FILTERED_REQUEST_HEADERS);
        if self.override_user_agent {
            filtered.insert(USER_AGENT, random_user_agent());
        }
        filtered
    }

    /// Headers to return to the client for an upstream response
    pub fn inbound(&self, headers: &HeaderMap) -> HeaderMap {
        filter(headers, FILTERED_RESPONSE_HEADERS)
    }
}

/// Copy `headers` minus the fixed set and anything the `Connection` header names
fn filter(headers: &HeaderMap, fixed: &[&str]) -> HeaderMap {
    let named: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if fixed.contains(&name.as_str()) || named.contains(name) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn random_user_agent() -> HeaderValue {
    let agent = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(DEFAULT_USER_AGENT);
    HeaderValue::from_static(agent)
}
