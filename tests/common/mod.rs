//! Scripted WAS transport double. Requests are queued up front; every
//! operation the bridge performs on the response side is recorded as an
//! event, so tests can assert on the exact channel conversation.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use python_was::http::Method;
use python_was::was::WasTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    Status(u16),
    Header(String, Vec<u8>),
    Length(u64),
    Write(Vec<u8>),
    End,
    Abort,
}

pub struct MockRequest {
    pub uri: String,
    pub method: Option<Method>,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub remote_host: Option<String>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the declared body length; used to script the
    /// unknown-length (negative) case.
    pub input_remaining: Option<i64>,
}

#[allow(dead_code)]
impl MockRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        MockRequest {
            uri: uri.to_string(),
            method: Some(method),
            script_name: None,
            path_info: None,
            query_string: None,
            remote_host: None,
            headers: Vec::new(),
            body: None,
            input_remaining: None,
        }
    }

    pub fn get(uri: &str) -> Self {
        Self::new(Method::Get, uri)
    }

    pub fn with_header(mut self, name: &str, value: &[u8]) -> Self {
        self.headers.push((name.to_string(), value.to_vec()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: &[u8]) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.as_bytes().to_vec()));
        self.headers.push((
            "Content-Length".to_string(),
            body.len().to_string().into_bytes(),
        ));
        self.body = Some(body.to_vec());
        self
    }
}

struct MockState {
    pending: VecDeque<MockRequest>,
    current: Option<MockRequest>,
    body_cursor: usize,
    read_calls: usize,
    events: Vec<Emitted>,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new(requests: Vec<MockRequest>) -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                pending: requests.into(),
                current: None,
                body_cursor: 0,
                read_calls: 0,
                events: Vec::new(),
            })),
        }
    }

    pub fn events(&self) -> Vec<Emitted> {
        self.state.lock().events.clone()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Emitted::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn status(&self) -> Option<u16> {
        self.statuses().first().copied()
    }

    pub fn sent_headers(&self) -> Vec<(String, Vec<u8>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Emitted::Header(name, value) => Some((name, value)),
                _ => None,
            })
            .collect()
    }

    pub fn length(&self) -> Option<u64> {
        self.events().into_iter().find_map(|event| match event {
            Emitted::Length(length) => Some(length),
            _ => None,
        })
    }

    pub fn written(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Emitted::Write(data) => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn ended(&self) -> bool {
        self.events().contains(&Emitted::End)
    }

    pub fn aborted(&self) -> bool {
        self.events().contains(&Emitted::Abort)
    }

    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }
}

impl WasTransport for MockTransport {
    fn accept(&mut self) -> Option<String> {
        let mut state = self.state.lock();
        let request = state.pending.pop_front()?;
        let uri = request.uri.clone();
        state.current = Some(request);
        state.body_cursor = 0;
        Some(uri)
    }

    fn method(&mut self) -> Option<Method> {
        self.state.lock().current.as_ref().and_then(|r| r.method)
    }

    fn script_name(&mut self) -> Option<String> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|r| r.script_name.clone())
    }

    fn path_info(&mut self) -> Option<String> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|r| r.path_info.clone())
    }

    fn query_string(&mut self) -> Option<String> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|r| r.query_string.clone())
    }

    fn remote_host(&mut self) -> Option<String> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|r| r.remote_host.clone())
    }

    fn request_headers(&mut self) -> Vec<(String, Vec<u8>)> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|r| r.headers.clone())
            .unwrap_or_default()
    }

    fn has_body(&mut self) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|r| r.body.is_some())
            .unwrap_or(false)
    }

    fn input_remaining(&mut self) -> i64 {
        let state = self.state.lock();
        let Some(current) = state.current.as_ref() else {
            return -1;
        };
        match current.input_remaining {
            Some(forced) => forced,
            None => current.body.as_ref().map(|b| b.len() as i64).unwrap_or(-1),
        }
    }

    fn read(&mut self, dest: &mut [u8]) -> isize {
        let mut state = self.state.lock();
        state.read_calls += 1;
        let cursor = state.body_cursor;
        let Some(body) = state.current.as_ref().and_then(|r| r.body.as_ref()) else {
            return 0;
        };
        let to_read = (body.len() - cursor).min(dest.len());
        dest[..to_read].copy_from_slice(&body[cursor..cursor + to_read]);
        state.body_cursor += to_read;
        to_read as isize
    }

    fn status(&mut self, status: u16) -> bool {
        self.state.lock().events.push(Emitted::Status(status));
        true
    }

    fn set_header(&mut self, name: &str, value: &[u8]) -> bool {
        self.state
            .lock()
            .events
            .push(Emitted::Header(name.to_string(), value.to_vec()));
        true
    }

    fn set_length(&mut self, length: u64) -> bool {
        self.state.lock().events.push(Emitted::Length(length));
        true
    }

    fn write(&mut self, data: &[u8]) -> bool {
        self.state.lock().events.push(Emitted::Write(data.to_vec()));
        true
    }

    fn end(&mut self) -> bool {
        self.state.lock().events.push(Emitted::End);
        true
    }

    fn abort(&mut self) -> bool {
        self.state.lock().events.push(Emitted::Abort);
        true
    }
}
