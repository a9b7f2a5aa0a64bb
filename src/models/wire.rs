//! JSON exchanged with remote functions
//!
//! Request: `{"method", "url", "headers", "body64"?}`.
//! Response: `{"statusCode", "headers"}` plus exactly one of `content64`
//! (inline body), `objectKey` (object-store reference) or `messageId`
//! (queue reference). A response with none of the three has an empty body.
//!
//! Header objects keep the order the headers arrived in.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::models::{ProxyRequest, ProxyResponse};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body64: Option<String>,
}

impl WorkerRequest {
    pub fn from_request(request: &ProxyRequest) -> Self {
        Self {
            method: request.method().as_str().to_string(),
            url: request.url().to_string(),
            headers: headers_to_map(request.headers()),
            body64: request.body().map(|b| BASE64.encode(b)),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProxyError::Internal(format!("failed to encode worker request: {}", e)))
    }
}

/// Out-of-band location of a body too large for the invocation response.
/// Valid for a single resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LargePayloadReference {
    ObjectKey(String),
    MessageId(String),
}

impl LargePayloadReference {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ObjectKey(_) => "object",
            Self::MessageId(_) => "message",
        }
    }
}

/// Where the body of a worker response lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyLocation {
    Inline(Bytes),
    Reference(LargePayloadReference),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl WorkerResponse {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| ProxyError::Upstream(format!("malformed worker response: {}", e)))
    }

    pub fn body_location(&self) -> Result<BodyLocation> {
        match (&self.content64, &self.object_key, &self.message_id) {
            (Some(content), None, None) => BASE64
                .decode(content)
                .map(|b| BodyLocation::Inline(Bytes::from(b)))
                .map_err(|e| ProxyError::Upstream(format!("malformed worker body: {}", e))),
            (None, Some(key), None) => Ok(BodyLocation::Reference(
                LargePayloadReference::ObjectKey(key.clone()),
            )),
            (None, None, Some(id)) => Ok(BodyLocation::Reference(
                LargePayloadReference::MessageId(id.clone()),
            )),
            (None, None, None) => Ok(BodyLocation::Inline(Bytes::new())),
            _ => Err(ProxyError::Upstream(
                "worker response carries more than one body".to_string(),
            )),
        }
    }

    /// Build the proxy response once the body has been resolved
    pub fn into_response(self, body: Bytes) -> Result<ProxyResponse> {
        let status = StatusCode::from_u16(self.status_code).map_err(|_| {
            ProxyError::Upstream(format!("invalid worker status code {}", self.status_code))
        })?;
        Ok(ProxyResponse::new(status, map_to_headers(&self.headers)?, body))
    }
}

/// Flatten a header map in order; repeated headers are joined with ", ".
/// Values that are not visible ASCII are decoded as UTF-8.
pub fn headers_to_map(headers: &HeaderMap) -> IndexMap<String, String> {
    let mut map: IndexMap<String, String> = IndexMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    map
}

fn map_to_headers(map: &IndexMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(map.len());
    for (name, value) in map {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::Upstream(format!("invalid worker header name {}", name)))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| ProxyError::Upstream(format!("invalid worker header value for {}", name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use url::Url;

    #[test]
    fn test_worker_request_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        let request = ProxyRequest::new(
            Method::POST,
            Url::parse("http://example.com/form").unwrap(),
            headers,
            Some(Bytes::from_static(b"hello")),
        )
        .unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&WorkerRequest::from_request(&request).to_bytes().unwrap())
                .unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["url"], "http://example.com/form");
        assert_eq!(json["headers"]["x-tag"], "a, b");
        assert_eq!(json["body64"], "aGVsbG8=");
    }

    #[test]
    fn test_header_order_survives_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("zeta", HeaderValue::from_static("1"));
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let request = ProxyRequest::new(
            Method::GET,
            Url::parse("http://example.com/").unwrap(),
            headers,
            None,
        )
        .unwrap();

        let raw = WorkerRequest::from_request(&request).to_bytes().unwrap();
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(
            text.contains(r#""headers":{"zeta":"1","host":"example.com","accept":"*/*"}"#),
            "header order lost: {}",
            text
        );

        let raw = br#"{"statusCode":200,"headers":{"x-b":"2","content-type":"text/plain","x-a":"1"}}"#;
        let resp = WorkerResponse::from_slice(raw).unwrap();
        let resp = resp.into_response(Bytes::new()).unwrap();
        let names: Vec<&str> = resp.headers().keys().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["x-b", "content-type", "x-a"]);
    }

    #[test]
    fn test_non_ascii_header_values_are_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("x-name", HeaderValue::from_bytes("café".as_bytes()).unwrap());
        let map = headers_to_map(&headers);
        assert_eq!(map["x-name"], "café");

        let raw = r#"{"statusCode":200,"headers":{"x-name":"café"}}"#;
        let resp = WorkerResponse::from_slice(raw.as_bytes())
            .unwrap()
            .into_response(Bytes::new())
            .unwrap();
        assert_eq!(resp.headers()["x-name"].as_bytes(), "café".as_bytes());
    }

    #[test]
    fn test_inline_response() {
        let raw = br#"{"statusCode":201,"headers":{"content-type":"text/plain"},"content64":"aGk="}"#;
        let resp = WorkerResponse::from_slice(raw).unwrap();
        let BodyLocation::Inline(body) = resp.body_location().unwrap() else {
            panic!("expected inline body");
        };
        let resp = resp.into_response(body).unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(resp.body().as_ref(), b"hi");
    }

    #[test]
    fn test_reference_responses() {
        let resp = WorkerResponse::from_slice(br#"{"statusCode":200,"objectKey":"bodies/1"}"#)
            .unwrap();
        assert_eq!(
            resp.body_location().unwrap(),
            BodyLocation::Reference(LargePayloadReference::ObjectKey("bodies/1".to_string()))
        );

        let resp =
            WorkerResponse::from_slice(br#"{"statusCode":200,"messageId":"m-7"}"#).unwrap();
        assert_eq!(
            resp.body_location().unwrap(),
            BodyLocation::Reference(LargePayloadReference::MessageId("m-7".to_string()))
        );
    }

    #[test]
    fn test_ambiguous_or_malformed_responses_are_upstream_errors() {
        let resp = WorkerResponse::from_slice(
            br#"{"statusCode":200,"content64":"aGk=","objectKey":"k"}"#,
        )
        .unwrap();
        assert!(matches!(
            resp.body_location(),
            Err(ProxyError::Upstream(_))
        ));

        assert!(matches!(
            WorkerResponse::from_slice(b"not json"),
            Err(ProxyError::Upstream(_))
        ));

        let resp = WorkerResponse::from_slice(br#"{"statusCode":42}"#).unwrap();
        assert!(resp.into_response(Bytes::new()).is_err());
    }
}
