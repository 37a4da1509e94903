use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BridgeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
    Trace,
    Propfind,
    Proppatch,
    Mkcol,
    Copy,
    Move,
    Lock,
    Unlock,
    Report,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Propfind => "PROPFIND",
            Method::Proppatch => "PROPPATCH",
            Method::Mkcol => "MKCOL",
            Method::Copy => "COPY",
            Method::Move => "MOVE",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
            Method::Report => "REPORT",
            Method::Patch => "PATCH",
        }
    }
}

/// Status codes the bridge accepts from applications. Anything outside
/// the assigned registry is rejected before it reaches the transport.
pub fn status_is_valid(status: u16) -> bool {
    matches!(
        status,
        100..=102
            | 200..=208
            | 226
            | 300..=308
            | 400..=418
            | 421..=426
            | 428
            | 429
            | 431
            | 451
            | 500..=508
            | 510
            | 511
    )
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uri {
    pub path: String,
    pub query: String,
}

impl Uri {
    // The query slice keeps the `?` so callers can tell an empty query
    // apart from a missing one. No percent-decoding happens here.
    pub fn split(uri: &str) -> Uri {
        match uri.find('?') {
            Some(q) => Uri {
                path: uri[..q].to_string(),
                query: uri[q..].to_string(),
            },
            None => Uri {
                path: uri.to_string(),
                query: String::new(),
            },
        }
    }
}

/// ASCII-only case-insensitive header name comparison. Non-ASCII bytes
/// compare identically; empty names never match.
pub fn header_match(a: &str, b: &str) -> bool {
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

/// A blocking request-body byte source. `read` returns `Ok(0)` at EOF.
pub trait InputStream: Send {
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize>;

    /// The declared body length, if the transport announced one.
    fn content_length(&self) -> Option<u64>;
}

pub struct NullInputStream;

impl InputStream for NullInputStream {
    fn read(&mut self, _dest: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn content_length(&self) -> Option<u64> {
        Some(0)
    }
}

/// Serves a fixed buffer; used by the stdio test mode and by tests.
pub struct StringInputStream {
    data: Vec<u8>,
    cursor: usize,
}

impl StringInputStream {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        StringInputStream {
            data: data.into(),
            cursor: 0,
        }
    }
}

impl InputStream for StringInputStream {
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        let to_read = (self.data.len() - self.cursor).min(dest.len());
        dest[..to_read].copy_from_slice(&self.data[self.cursor..self.cursor + to_read]);
        self.cursor += to_read;
        Ok(to_read)
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

pub struct HttpRequest {
    pub remote_addr: String,
    pub script_name: String,
    pub server_name: String,
    pub server_port: String,
    pub protocol: String,
    pub scheme: String,
    pub method: Method,
    pub uri: Uri,
    /// Ordered pairs, duplicates permitted. Values stay raw bytes so
    /// Latin-1 round-tripping into the interpreter is lossless.
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Option<Box<dyn InputStream>>,
}

impl HttpRequest {
    pub fn find_header(&self, header_name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(name, _)| header_match(name, header_name))
            .map(|(_, value)| value.as_slice())
    }
}

#[derive(Clone, Debug, Default)]
pub struct HttpResponse {
    /// 0 until start_response sets it.
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Extracted from the Content-Length header; never forwarded as a
    /// header itself.
    pub content_length: Option<u64>,
}

/// Per-request status → headers → body emitter. Implementations enforce
/// the ordering; callers must check `headers_sent` before deciding
/// whether to emit headers.
pub trait Responder: Send {
    fn send_headers(&mut self, response: HttpResponse) -> Result<(), BridgeError>;
    fn send_body(&mut self, data: &[u8]) -> Result<(), BridgeError>;
    fn headers_sent(&self) -> bool;
}

/// One responder exists per request, but it is visible both to the
/// gateway loop and to the start_response callable living inside the
/// interpreter, so it travels behind a shared lock.
pub type SharedResponder = Arc<Mutex<dyn Responder>>;

/// Request processor invoked once per accepted request.
pub trait RequestHandler {
    fn process(
        &mut self,
        request: HttpRequest,
        responder: SharedResponder,
    ) -> Result<(), BridgeError>;
}
