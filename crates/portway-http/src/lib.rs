//! HTTP/1.1 request parsing and upstream re-serialization.
//!
//! The parser consumes exactly one request from a buffered byte source:
//! request line, CONNECT short-circuit, headers, destination
//! resolution, then a Content-Length-bounded body. Chunked transfer
//! encoding is not interpreted here; bodies without a Content-Length
//! are treated as empty.

mod request_parser;
mod upstream_request;

pub use request_parser::parse_request;

use thiserror::Error;

/// Upper bound on a buffered request body.
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// An immutable-after-parse HTTP/1.1 request.
///
/// Header names are lowercased; duplicates keep their first position
/// with the last value winning. `host` is lowercased and `port` is the
/// resolved destination port (from an absolute-form target, the Host
/// header, or the CONNECT target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub host: String,
    pub port: u16,
    pub is_connect: bool,
}

impl ParsedRequest {
    /// Looks up a header by its lowercased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    /// Serializes the request for the upstream origin, rewriting an
    /// absolute-form target to origin-form and capitalizing header
    /// names.
    pub fn serialize_for_upstream(&self) -> Vec<u8> {
        upstream_request::serialize(self)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("connection closed before a full request was received")]
    UnexpectedEof,
    #[error("request head was not valid UTF-8")]
    InvalidEncoding,
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),
    #[error("invalid CONNECT target: {0:?}")]
    InvalidConnectTarget(String),
    #[error("invalid absolute-form request target: {0:?}")]
    InvalidAbsoluteUri(String),
    #[error("missing Host header")]
    MissingHostHeader,
    #[error("invalid Host header: {0:?}")]
    InvalidHostHeader(String),
    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),
    #[error("request body of {0} bytes exceeds the {MAX_REQUEST_BODY_BYTES}-byte limit")]
    BodyTooLarge(usize),
    #[error("failed to read request: {0}")]
    Io(#[from] std::io::Error),
}
