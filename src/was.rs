use std::io;
use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use crate::error::BridgeError;
use crate::headers::is_hop_by_hop;
use crate::http::{
    header_match, status_is_valid, HttpRequest, HttpResponse, InputStream, Method, RequestHandler,
    Responder, SharedResponder, Uri,
};

/// Contract required from the WAS framing library. The control channel
/// enforces the order status -> headers -> length -> body -> end/abort;
/// a conformant implementation surfaces read outcomes with the signed
/// return convention documented on `read`.
pub trait WasTransport: Send {
    /// Block until the proxy submits the next request; `None` means the
    /// command channel is closed and the worker should exit.
    fn accept(&mut self) -> Option<String>;

    /// `None` for a method the protocol does not recognize.
    fn method(&mut self) -> Option<Method>;

    fn script_name(&mut self) -> Option<String>;
    fn path_info(&mut self) -> Option<String>;
    fn query_string(&mut self) -> Option<String>;
    fn remote_host(&mut self) -> Option<String>;
    fn request_headers(&mut self) -> Vec<(String, Vec<u8>)>;

    fn has_body(&mut self) -> bool;

    /// Declared number of body bytes not yet read; negative if unknown.
    fn input_remaining(&mut self) -> i64;

    /// Blocking body read. 0 is EOF, -1 a system error with errno set,
    /// -2 a protocol error on the data channel.
    fn read(&mut self, dest: &mut [u8]) -> isize;

    fn status(&mut self, status: u16) -> bool;
    fn set_header(&mut self, name: &str, value: &[u8]) -> bool;
    fn set_length(&mut self, length: u64) -> bool;
    fn write(&mut self, data: &[u8]) -> bool;
    fn end(&mut self) -> bool;
    fn abort(&mut self) -> bool;
}

/// Request-body stream on top of the transport. This goes through the
/// transport's own read so the framing library keeps its input
/// accounting, instead of reading the data fd directly.
struct WasInputStream<T: WasTransport> {
    was: Arc<Mutex<T>>,
    declared: u64,
}

impl<T: WasTransport> InputStream for WasInputStream<T> {
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        let n = self.was.lock().read(dest);
        match n {
            -1 => Err(io::Error::last_os_error()),
            n if n < 0 => Err(io::Error::new(
                io::ErrorKind::Other,
                "Error in was_simple_read",
            )),
            n => Ok(n as usize),
        }
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.declared)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponderState {
    Pending,
    HeadersSent,
    Closed,
    Aborted,
}

/// Emits one response onto the transport. Create a separate responder
/// for each request.
pub struct WasResponder<T: WasTransport> {
    was: Arc<Mutex<T>>,
    state: ResponderState,
    content_length_left: Option<u64>,
    ended: bool,
}

impl<T: WasTransport> WasResponder<T> {
    fn new(was: Arc<Mutex<T>>) -> Self {
        WasResponder {
            was,
            state: ResponderState::Pending,
            content_length_left: None,
            ended: false,
        }
    }

    fn content_length_left(&self) -> Option<u64> {
        self.content_length_left
    }

    /// Closes the request on the transport unless a zero-length
    /// response already did. Returns false if the transport refused.
    fn finish(&mut self) -> bool {
        if self.ended {
            return true;
        }
        self.ended = true;
        self.was.lock().end()
    }
}

impl<T: WasTransport> Responder for WasResponder<T> {
    fn send_headers(&mut self, response: HttpResponse) -> Result<(), BridgeError> {
        match self.state {
            ResponderState::Pending => {}
            ResponderState::Aborted => {
                return Err(BridgeError::Transport("responder already aborted"))
            }
            _ => return Err(BridgeError::Transport("headers already sent")),
        }

        if !status_is_valid(response.status) {
            self.state = ResponderState::Aborted;
            return Err(BridgeError::InvalidStatus(response.status));
        }

        if !self.was.lock().status(response.status) {
            self.state = ResponderState::Aborted;
            return Err(BridgeError::Transport("Error in was_simple_status"));
        }

        let mut content_length = response.content_length;

        for (name, value) in &response.headers {
            if header_match(name, "Content-Length") {
                // Normally extracted by start_response already; direct
                // handlers may still deliver it as a plain header.
                if content_length.is_none() {
                    match std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
                        Some(n) => content_length = Some(n),
                        None => warn!(
                            "Could not parse Content-Length response header: '{}'",
                            String::from_utf8_lossy(value)
                        ),
                    }
                }
                continue;
            }
            if is_hop_by_hop(name) {
                if header_match(name, "Transfer-Encoding")
                    && value.windows(7).any(|w| w.eq_ignore_ascii_case(b"chunked"))
                {
                    warn!("Chunked response transfer encoding is not implemented");
                }
                continue;
            }
            if !self.was.lock().set_header(name, value) {
                self.state = ResponderState::Aborted;
                return Err(BridgeError::Transport("was_simple_set_header_n failed"));
            }
        }

        self.content_length_left = content_length;

        match content_length {
            Some(0) => {
                // PEP 3333 allows early headers only for Content-Length
                // zero; nothing follows, so close the request now.
                let ended = self.was.lock().end();
                self.ended = true;
                if !ended {
                    self.state = ResponderState::Aborted;
                    return Err(BridgeError::Transport("was_simple_end failed"));
                }
                self.state = ResponderState::Closed;
            }
            Some(n) => {
                // The transport state machine only accepts the length
                // once status and headers are out.
                if !self.was.lock().set_length(n) {
                    self.state = ResponderState::Aborted;
                    return Err(BridgeError::Transport("was_simple_set_length failed"));
                }
                self.state = ResponderState::HeadersSent;
            }
            None => self.state = ResponderState::HeadersSent,
        }

        Ok(())
    }

    fn send_body(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        match self.state {
            ResponderState::HeadersSent | ResponderState::Closed => {}
            ResponderState::Pending => {
                return Err(BridgeError::Transport("headers not sent yet"))
            }
            ResponderState::Aborted => {
                return Err(BridgeError::Transport("responder already aborted"))
            }
        }

        let remaining = self.content_length_left;
        let (to_write, overflow) = match remaining {
            Some(left) if (data.len() as u64) > left => (left as usize, true),
            _ => (data.len(), false),
        };

        if to_write > 0 {
            if !self.was.lock().write(&data[..to_write]) {
                self.state = ResponderState::Aborted;
                return Err(BridgeError::Transport("was_simple_write failed"));
            }
            if let Some(left) = self.content_length_left.as_mut() {
                *left -= to_write as u64;
                if *left == 0 {
                    self.state = ResponderState::Closed;
                }
            }
        }

        if overflow {
            let remaining = remaining.unwrap_or(0);
            warn!(
                "Response body overflow: {} bytes submitted, {} bytes left; write capped",
                data.len(),
                remaining
            );
            self.state = ResponderState::Aborted;
            return Err(BridgeError::BodyOverflow {
                attempted: data.len(),
                remaining,
            });
        }

        Ok(())
    }

    fn headers_sent(&self) -> bool {
        matches!(
            self.state,
            ResponderState::HeadersSent | ResponderState::Closed
        )
    }
}

/// Owns the per-process WAS channel and runs the accept loop.
pub struct Was<T: WasTransport> {
    transport: Arc<Mutex<T>>,
}

impl<T: WasTransport + 'static> Was<T> {
    pub fn new(transport: T) -> Self {
        Was {
            transport: Arc::new(Mutex::new(transport)),
        }
    }

    // Intent: serve requests until the proxy closes the command channel.
    // Result: every accepted request is answered or aborted; the loop
    // never propagates per-request failures.
    pub fn run(&self, handler: &mut dyn RequestHandler) {
        loop {
            let uri = self.transport.lock().accept();
            match uri {
                Some(uri) => self.process_request(handler, &uri),
                None => return,
            }
        }
    }

    fn process_request(&self, handler: &mut dyn RequestHandler, uri: &str) {
        let (method, script_name, path_info, query_string, remote_host, header_pairs) = {
            let mut was = self.transport.lock();
            let Some(method) = was.method() else {
                error!("Invalid method");
                if !was.status(405) {
                    error!("Error in was_simple_status");
                }
                if !was.end() {
                    error!("Error in was_simple_end");
                }
                return;
            };
            (
                method,
                was.script_name(),
                was.path_info(),
                was.query_string(),
                was.remote_host(),
                was.request_headers(),
            )
        };

        // The proxy hands us ip:port; only the address part goes into
        // the request record.
        let remote_addr = remote_host
            .as_deref()
            .map(|host| host[..host.find(':').unwrap_or(host.len())].to_string())
            .unwrap_or_default();

        let mut scheme = "http".to_string();
        let mut server_name = String::new();
        let mut server_port = String::new();
        let mut headers = Vec::with_capacity(header_pairs.len());
        for (name, value) in header_pairs {
            if header_match(&name, "X-CM4all-HTTPS") && value == b"on" {
                scheme = "https".to_string();
            }
            if header_match(&name, "Host") {
                let host = String::from_utf8_lossy(&value);
                match host.split_once(':') {
                    Some((name_part, port_part)) => {
                        server_name = name_part.to_string();
                        server_port = port_part.to_string();
                    }
                    None => server_name = host.into_owned(),
                }
            }
            headers.push((name, value));
        }
        if server_port.is_empty() {
            server_port = if scheme == "https" { "443" } else { "80" }.to_string();
        }

        let parsed_uri = Uri::split(uri);
        let uri = Uri {
            path: path_info.unwrap_or(parsed_uri.path),
            query: query_string.unwrap_or(parsed_uri.query),
        };

        let body: Option<Box<dyn InputStream>> = if self.transport.lock().has_body() {
            let remaining = self.transport.lock().input_remaining();
            if remaining < 0 {
                error!("Request body length unknown");
                if !self.transport.lock().abort() {
                    error!("Error in was_simple_abort");
                }
                return;
            }
            Some(Box::new(WasInputStream {
                was: self.transport.clone(),
                declared: remaining as u64,
            }))
        } else {
            None
        };

        let request = HttpRequest {
            remote_addr,
            script_name: script_name.unwrap_or_default(),
            server_name,
            server_port,
            protocol: "HTTP/1.1".to_string(),
            scheme,
            method,
            uri,
            headers,
            body,
        };

        let responder = Arc::new(Mutex::new(WasResponder::new(self.transport.clone())));
        let shared: SharedResponder = responder.clone();

        match handler.process(request, shared) {
            Ok(()) => {
                let mut responder = responder.lock();
                if let Some(left) = responder.content_length_left() {
                    if left > 0 {
                        // The transport notices the short body itself and
                        // sends PREMATURE on the next accept turn.
                        warn!("Response truncated, {left} declared body bytes never sent");
                    }
                }
                if !responder.finish() {
                    error!("Error in was_simple_end");
                }
            }
            Err(err) => {
                // Control-channel failures land here too; abort is a
                // no-op when the channel is already dead and accept
                // will terminate the loop on the next turn.
                error!("Exception handling request: {err}");
                if !self.transport.lock().abort() {
                    error!("Error in was_simple_abort");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct ScriptedTransport {
        uris: Vec<String>,
        method: Option<Method>,
        script_name: Option<String>,
        path_info: Option<String>,
        query_string: Option<String>,
        remote_host: Option<String>,
        headers: Vec<(String, Vec<u8>)>,
        body: Vec<u8>,
        body_cursor: usize,
        has_body: bool,
        input_remaining: i64,
        read_result: Option<isize>,

        status: Option<u16>,
        sent_headers: Vec<(String, Vec<u8>)>,
        length: Option<u64>,
        written: Vec<u8>,
        ended: bool,
        aborted: bool,
    }

    impl WasTransport for ScriptedTransport {
        fn accept(&mut self) -> Option<String> {
            if self.uris.is_empty() {
                None
            } else {
                Some(self.uris.remove(0))
            }
        }

        fn method(&mut self) -> Option<Method> {
            self.method
        }

        fn script_name(&mut self) -> Option<String> {
            self.script_name.clone()
        }

        fn path_info(&mut self) -> Option<String> {
            self.path_info.clone()
        }

        fn query_string(&mut self) -> Option<String> {
            self.query_string.clone()
        }

        fn remote_host(&mut self) -> Option<String> {
            self.remote_host.clone()
        }

        fn request_headers(&mut self) -> Vec<(String, Vec<u8>)> {
            self.headers.clone()
        }

        fn has_body(&mut self) -> bool {
            self.has_body
        }

        fn input_remaining(&mut self) -> i64 {
            self.input_remaining
        }

        fn read(&mut self, dest: &mut [u8]) -> isize {
            if let Some(forced) = self.read_result {
                return forced;
            }
            let to_read = (self.body.len() - self.body_cursor).min(dest.len());
            dest[..to_read].copy_from_slice(&self.body[self.body_cursor..self.body_cursor + to_read]);
            self.body_cursor += to_read;
            to_read as isize
        }

        fn status(&mut self, status: u16) -> bool {
            self.status = Some(status);
            true
        }

        fn set_header(&mut self, name: &str, value: &[u8]) -> bool {
            self.sent_headers.push((name.to_string(), value.to_vec()));
            true
        }

        fn set_length(&mut self, length: u64) -> bool {
            self.length = Some(length);
            true
        }

        fn write(&mut self, data: &[u8]) -> bool {
            self.written.extend_from_slice(data);
            true
        }

        fn end(&mut self) -> bool {
            self.ended = true;
            true
        }

        fn abort(&mut self) -> bool {
            self.aborted = true;
            true
        }
    }

    fn shared(transport: ScriptedTransport) -> Arc<Mutex<ScriptedTransport>> {
        Arc::new(Mutex::new(transport))
    }

    fn response(status: u16, headers: &[(&str, &[u8])], content_length: Option<u64>) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_vec()))
                .collect(),
            content_length,
        }
    }

    #[test]
    fn responder_emits_status_headers_length_body() {
        let was = shared(ScriptedTransport::default());
        let mut responder = WasResponder::new(was.clone());

        responder
            .send_headers(response(200, &[("Content-Type", &b"text/plain"[..])], Some(5)))
            .unwrap();
        assert!(responder.headers_sent());
        responder.send_body(b"hel").unwrap();
        responder.send_body(b"lo").unwrap();
        assert!(responder.finish());

        let was = was.lock();
        assert_eq!(was.status, Some(200));
        assert_eq!(
            was.sent_headers,
            vec![("Content-Type".to_string(), b"text/plain".to_vec())]
        );
        assert_eq!(was.length, Some(5));
        assert_eq!(was.written, b"hello");
        assert!(was.ended);
    }

    #[test]
    fn responder_rejects_unrecognized_status() {
        let was = shared(ScriptedTransport::default());
        let mut responder = WasResponder::new(was.clone());
        let err = responder.send_headers(response(999, &[], None)).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidStatus(999)));
        assert_eq!(was.lock().status, None);
    }

    #[test]
    fn zero_length_response_ends_immediately() {
        let was = shared(ScriptedTransport::default());
        let mut responder = WasResponder::new(was.clone());

        responder.send_headers(response(204, &[], Some(0))).unwrap();
        assert!(was.lock().ended);
        assert_eq!(was.lock().length, None);

        // The request is closed; any body bytes are an overflow.
        let err = responder.send_body(b"late").unwrap_err();
        assert!(matches!(err, BridgeError::BodyOverflow { .. }));
        assert!(was.lock().written.is_empty());
    }

    #[test]
    fn oversize_body_is_capped_and_rejected() {
        let was = shared(ScriptedTransport::default());
        let mut responder = WasResponder::new(was.clone());

        responder.send_headers(response(200, &[], Some(4))).unwrap();
        let err = responder.send_body(b"toolong").unwrap_err();
        match err {
            BridgeError::BodyOverflow { attempted, remaining } => {
                assert_eq!(attempted, 7);
                assert_eq!(remaining, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(was.lock().written, b"tool");
    }

    #[test]
    fn unknown_length_streams_without_set_length() {
        let was = shared(ScriptedTransport::default());
        let mut responder = WasResponder::new(was.clone());

        responder.send_headers(response(200, &[], None)).unwrap();
        responder.send_body(b"first ").unwrap();
        responder.send_body(b"second").unwrap();
        assert!(responder.finish());

        let was = was.lock();
        assert_eq!(was.length, None);
        assert_eq!(was.written, b"first second");
        assert!(was.ended);
    }

    #[test]
    fn content_length_and_hop_by_hop_headers_are_not_forwarded() {
        let was = shared(ScriptedTransport::default());
        let mut responder = WasResponder::new(was.clone());

        responder
            .send_headers(response(
                200,
                &[
                    ("Content-Length", &b"3"[..]),
                    ("Connection", &b"close"[..]),
                    ("Transfer-Encoding", &b"chunked"[..]),
                    ("X-Ok", &b"yes"[..]),
                ],
                None,
            ))
            .unwrap();

        let was = was.lock();
        assert_eq!(was.length, Some(3));
        let names: Vec<&str> = was.sent_headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["X-Ok"]);
    }

    struct RecordingHandler {
        calls: usize,
        last_request: Option<(Method, String, String, String, String, String, Option<u64>)>,
        fail: bool,
    }

    impl RequestHandler for RecordingHandler {
        fn process(
            &mut self,
            mut request: HttpRequest,
            responder: SharedResponder,
        ) -> Result<(), BridgeError> {
            self.calls += 1;
            let declared = request.body.take().and_then(|b| b.content_length());
            self.last_request = Some((
                request.method,
                request.uri.path.clone(),
                request.uri.query.clone(),
                request.scheme.clone(),
                request.server_name.clone(),
                request.server_port.clone(),
                declared,
            ));
            if self.fail {
                return Err(BridgeError::Python("boom".to_string()));
            }
            responder.lock().send_headers(HttpResponse {
                status: 200,
                headers: Vec::new(),
                content_length: Some(0),
            })
        }
    }

    fn handler() -> RecordingHandler {
        RecordingHandler {
            calls: 0,
            last_request: None,
            fail: false,
        }
    }

    #[test]
    fn invalid_method_short_circuits_with_405() {
        let transport = ScriptedTransport {
            uris: vec!["/".to_string()],
            method: None,
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = handler();
        was.run(&mut handler);

        assert_eq!(handler.calls, 0);
        let transport = was.transport.lock();
        assert_eq!(transport.status, Some(405));
        assert!(transport.ended);
    }

    #[test]
    fn request_fields_come_from_transport_and_uri_fallback() {
        let transport = ScriptedTransport {
            uris: vec!["/fallback/path?from=uri".to_string()],
            method: Some(Method::Get),
            remote_host: Some("192.0.2.7:49152".to_string()),
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = handler();
        was.run(&mut handler);

        assert_eq!(handler.calls, 1);
        let (method, path, query, scheme, name, port, declared) =
            handler.last_request.take().unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(path, "/fallback/path");
        assert_eq!(query, "?from=uri");
        assert_eq!(scheme, "http");
        assert_eq!(name, "");
        assert_eq!(port, "80");
        assert_eq!(declared, None);
    }

    #[test]
    fn https_and_host_snooping_populate_request() {
        let transport = ScriptedTransport {
            uris: vec!["/".to_string()],
            method: Some(Method::Get),
            path_info: Some("/".to_string()),
            query_string: Some(String::new()),
            headers: vec![
                ("Host".to_string(), b"example.com:8443".to_vec()),
                ("X-CM4all-HTTPS".to_string(), b"on".to_vec()),
            ],
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = handler();
        was.run(&mut handler);

        let (_, _, _, scheme, name, port, _) = handler.last_request.take().unwrap();
        assert_eq!(scheme, "https");
        assert_eq!(name, "example.com");
        assert_eq!(port, "8443");
    }

    #[test]
    fn https_without_host_port_defaults_to_443() {
        let transport = ScriptedTransport {
            uris: vec!["/".to_string()],
            method: Some(Method::Get),
            headers: vec![
                ("X-CM4all-HTTPS".to_string(), b"on".to_vec()),
                ("Host".to_string(), b"example.com".to_vec()),
            ],
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = handler();
        was.run(&mut handler);

        let (_, _, _, scheme, name, port, _) = handler.last_request.take().unwrap();
        assert_eq!(scheme, "https");
        assert_eq!(name, "example.com");
        assert_eq!(port, "443");
    }

    #[test]
    fn declared_body_length_reaches_the_stream() {
        let transport = ScriptedTransport {
            uris: vec!["/".to_string()],
            method: Some(Method::Put),
            has_body: true,
            input_remaining: 16,
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = handler();
        was.run(&mut handler);

        let (_, _, _, _, _, _, declared) = handler.last_request.take().unwrap();
        assert_eq!(declared, Some(16));
    }

    #[test]
    fn unknown_body_length_aborts_before_the_handler() {
        let transport = ScriptedTransport {
            uris: vec!["/".to_string()],
            method: Some(Method::Put),
            has_body: true,
            input_remaining: -1,
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = handler();
        was.run(&mut handler);

        assert_eq!(handler.calls, 0);
        assert!(was.transport.lock().aborted);
    }

    #[test]
    fn handler_failure_aborts_and_loop_continues() {
        let transport = ScriptedTransport {
            uris: vec!["/a".to_string(), "/b".to_string()],
            method: Some(Method::Get),
            ..Default::default()
        };
        let was = Was::new(transport);
        let mut handler = RecordingHandler {
            calls: 0,
            last_request: None,
            fail: true,
        };
        was.run(&mut handler);

        assert_eq!(handler.calls, 2);
        assert!(was.transport.lock().aborted);
    }

    #[test]
    fn input_stream_maps_transport_read_errors() {
        let was = shared(ScriptedTransport {
            read_result: Some(-2),
            ..Default::default()
        });
        let mut stream = WasInputStream {
            was: was.clone(),
            declared: 4,
        };
        let mut buf = [0_u8; 4];
        assert!(stream.read(&mut buf).is_err());
        assert_eq!(stream.content_length(), Some(4));

        was.lock().read_result = Some(-1);
        assert!(stream.read(&mut buf).is_err());

        was.lock().read_result = None;
        was.lock().body = b"data".to_vec();
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
