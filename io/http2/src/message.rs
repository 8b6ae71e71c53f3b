//! Request and response messages.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::body::{Body, RequestBody};
use crate::connection::PushHandler;
use crate::frame::StreamId;
use crate::hpack::HeaderField;

/// Header list in wire order. Names are lower-case.
pub type Headers = Vec<(String, String)>;

/// Hop-by-hop headers that have no meaning in HTTP/2 (RFC 7540 Section
/// 8.1.2.2).
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// An HTTP request to send on a stream.
pub struct Request {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Headers,
    pub body: RequestBody,
    /// Overrides the connection's default response timeout.
    pub timeout: Option<Duration>,
    /// Receives PUSH_PROMISEs associated with this request.
    pub push_handler: Option<Arc<dyn PushHandler>>,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        scheme: impl Into<String>,
        authority: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            scheme: scheme.into(),
            authority: authority.into(),
            path: path.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
            push_handler: None,
        }
    }

    pub fn get(scheme: &str, authority: &str, path: &str) -> Self {
        Self::new("GET", scheme, authority, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn push_handler(mut self, handler: Arc<dyn PushHandler>) -> Self {
        self.push_handler = Some(handler);
        self
    }

    /// The header list as sent: pseudo-headers first, then user headers
    /// lower-cased with connection-specific ones dropped.
    pub(crate) fn header_fields(&self) -> Vec<HeaderField> {
        let mut fields = Vec::with_capacity(4 + self.headers.len());
        fields.push(HeaderField::new(":method", self.method.as_bytes()));
        fields.push(HeaderField::new(":scheme", self.scheme.as_bytes()));
        fields.push(HeaderField::new(":authority", self.authority.as_bytes()));
        fields.push(HeaderField::new(":path", self.path.as_bytes()));
        fields.extend(request_headers(&self.headers));
        fields
    }
}

/// Lower-case user headers and drop the ones HTTP/2 forbids. `te` survives
/// only as `te: trailers`.
pub(crate) fn request_headers(headers: &Headers) -> impl Iterator<Item = HeaderField> + '_ {
    headers.iter().filter_map(|(name, value)| {
        let name = name.to_ascii_lowercase();
        if name.starts_with(':') || CONNECTION_SPECIFIC.contains(&name.as_str()) {
            return None;
        }
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            return None;
        }
        Some(HeaderField::new(name, value.as_bytes()))
    })
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("authority", &self.authority)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A response header block and its body.
#[derive(Debug)]
pub struct Response {
    pub stream_id: StreamId,
    pub status: u16,
    pub headers: Headers,
    /// Empty for informational (1xx) responses.
    pub body: Body,
}

impl Response {
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// First value of a header, by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// The request a server promised to answer with a pushed stream.
#[derive(Debug, Clone)]
pub struct PushPromise {
    pub parent: StreamId,
    pub promised: StreamId,
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Headers,
}

impl PushPromise {
    pub(crate) fn from_fields(parent: StreamId, promised: StreamId, fields: Headers) -> Self {
        let mut promise = Self {
            parent,
            promised,
            method: String::new(),
            scheme: String::new(),
            authority: String::new(),
            path: String::new(),
            headers: Vec::new(),
        };
        for (name, value) in fields {
            match name.as_str() {
                ":method" => promise.method = value,
                ":scheme" => promise.scheme = value,
                ":authority" => promise.authority = value,
                ":path" => promise.path = value,
                _ => promise.headers.push((name, value)),
            }
        }
        promise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields_order_and_filtering() {
        let request = Request::get("https", "example.com", "/index.html")
            .header("Accept", "*/*")
            .header("Connection", "keep-alive")
            .header("Host", "example.com")
            .header("TE", "gzip")
            .header("te", "trailers")
            .header("X-Trace", "1");

        let fields = request.header_fields();
        let names: Vec<&[u8]> = fields.iter().map(|f| f.name.as_slice()).collect();
        assert_eq!(
            names,
            vec![
                &b":method"[..],
                b":scheme",
                b":authority",
                b":path",
                b"accept",
                b"te",
                b"x-trace",
            ]
        );
        assert_eq!(fields[5].value, b"trailers".to_vec());
    }

    #[test]
    fn test_response_helpers() {
        let response = Response {
            stream_id: StreamId::new(1),
            status: 103,
            headers: vec![("link".into(), "</style.css>".into())],
            body: Body::empty(),
        };
        assert!(response.is_informational());
        assert_eq!(response.header("link"), Some("</style.css>"));
        assert_eq!(response.header("missing"), None);
    }

    #[test]
    fn test_push_promise_fields() {
        let promise = PushPromise::from_fields(
            StreamId::new(1),
            StreamId::new(2),
            vec![
                (":method".into(), "GET".into()),
                (":path".into(), "/style.css".into()),
                ("accept".into(), "text/css".into()),
            ],
        );
        assert_eq!(promise.method, "GET");
        assert_eq!(promise.path, "/style.css");
        assert_eq!(promise.headers.len(), 1);
    }
}
