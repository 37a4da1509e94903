//! The PEP 3333 side of the bridge: environ construction, the
//! start_response callable, the application-visible body object, and
//! consumption of the response iterable.
//!
//! WSGI spec: https://peps.python.org/pep-3333/

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use pyo3::exceptions::{
    PyAssertionError, PyIOError, PyRuntimeError, PyTypeError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList, PyString, PyTuple, PyType};

use crate::error::BridgeError;
use crate::headers::{is_hop_by_hop, is_valid_header_name, is_valid_header_value, translate_header};
use crate::http::{
    header_match, status_is_valid, HttpRequest, HttpResponse, InputStream, NullInputStream,
    RequestHandler, SharedResponder,
};
use crate::python::{chunk_bytes, from_native_string, import_module, native_string, surface_error};

const SERVER_SOFTWARE: &str = "python-was/0.1";
const READ_CHUNK: usize = 4096;

fn read_error(err: io::Error) -> PyErr {
    PyIOError::new_err(format!("Error reading request body: {err}"))
}

/// File-like object handed to the application as `wsgi.input`. Owns the
/// request body stream; the stream is released when the interpreter
/// collects this object.
///
/// Per the io module contract: read(size=-1) reads up to size bytes,
/// negative size reads until EOF. readline/readlines/iteration are not
/// used by Flask/Werkzeug and stay unimplemented.
#[pyclass(module = "python_was")]
pub struct WsgiInput {
    stream: Box<dyn InputStream>,
}

impl WsgiInput {
    pub fn new(stream: Box<dyn InputStream>) -> Self {
        WsgiInput { stream }
    }
}

#[pymethods]
impl WsgiInput {
    #[pyo3(signature = (size = -1))]
    fn read<'py>(&mut self, py: Python<'py>, size: i64) -> PyResult<&'py PyBytes> {
        if size == 0 {
            return Ok(PyBytes::new(py, b""));
        }

        if size > 0 {
            let mut buf = vec![0_u8; size as usize];
            let n = self.stream.read(&mut buf).map_err(read_error)?;
            buf.truncate(n);
            return Ok(PyBytes::new(py, &buf));
        }

        let mut collected = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            let n = self.stream.read(&mut chunk).map_err(read_error)?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        Ok(PyBytes::new(py, &collected))
    }

    #[pyo3(signature = (_size = -1))]
    fn readline(&self, py: Python<'_>, _size: i64) -> PyResult<PyObject> {
        debug_assert!(false, "WsgiInput.readline is not implemented");
        Ok(py.None())
    }

    #[pyo3(signature = (_hint = -1))]
    fn readlines(&self, py: Python<'_>, _hint: i64) -> PyResult<PyObject> {
        debug_assert!(false, "WsgiInput.readlines is not implemented");
        Ok(py.None())
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(&self) -> Option<PyObject> {
        debug_assert!(false, "WsgiInput line iteration is not implemented");
        None
    }
}

struct ResponseContext {
    response: HttpResponse,
    responder: SharedResponder,
}

impl ResponseContext {
    // Take the accumulated response for emission while keeping the
    // status sentinel, so a later start_response call without exc_info
    // still raises.
    fn take_response(&mut self) -> HttpResponse {
        let status = self.response.status;
        std::mem::replace(
            &mut self.response,
            HttpResponse {
                status,
                ..HttpResponse::default()
            },
        )
    }
}

type ContextSlot = Arc<Mutex<Option<ResponseContext>>>;

/// The callable passed to the application as `start_response`. It holds
/// a revocable slot rather than anything borrowed, because applications
/// may keep the callable alive past the request (closures, middleware).
#[pyclass(module = "python_was")]
pub struct StartResponse {
    ctx: ContextSlot,
}

#[pymethods]
impl StartResponse {
    #[pyo3(signature = (status, headers, exc_info = None))]
    fn __call__(&self, status: &str, headers: &PyList, exc_info: Option<&PyAny>) -> PyResult<()> {
        let exc_value = match exc_info {
            Some(obj) if !obj.is_none() => Some(validate_exc_info(obj)?),
            _ => None,
        };

        let mut slot = self.ctx.lock();
        let ctx = slot.as_mut().ok_or_else(|| {
            PyRuntimeError::new_err("Cannot call start_response after WSGI application has returned")
        })?;

        // More than one call is legal if and only if exc_info is given.
        if let Some(exc_value) = exc_value {
            if ctx.responder.lock().headers_sent() {
                // Headers are out; PEP 3333 says re-raise.
                return Err(PyErr::from_value(exc_value));
            }
            // Not out yet: the replacement response wins.
            ctx.response = HttpResponse::default();
        } else if ctx.response.status != 0 {
            return Err(PyAssertionError::new_err(
                "start_response must not be called more than once without exc_info",
            ));
        }

        // Only the digits before the first space matter; the reason
        // phrase never crosses the bridge.
        let digits = match status.find(' ') {
            Some(space) => &status[..space],
            None => status,
        };
        let code: u16 = digits
            .parse()
            .map_err(|_| PyValueError::new_err(format!("Could not parse status code '{status}'")))?;
        if !status_is_valid(code) {
            return Err(PyValueError::new_err(format!("Invalid HTTP Status '{code}'")));
        }
        ctx.response.status = code;

        // PEP 3333: check the headers while the application is still
        // running, so errors surface inside the app.
        for item in headers {
            let type_error = || PyTypeError::new_err("headers must be list of tuples (str, str)");
            let pair = item.downcast::<PyTuple>().map_err(|_| type_error())?;
            if pair.len() != 2 {
                return Err(type_error());
            }
            let name_obj = pair.get_item(0)?.downcast::<PyString>().map_err(|_| type_error())?;
            let value_obj = pair.get_item(1)?.downcast::<PyString>().map_err(|_| type_error())?;

            let name = name_obj.to_str()?;
            if !is_valid_header_name(name.as_bytes()) {
                return Err(PyValueError::new_err(format!("Invalid header name '{name}'")));
            }
            let is_content_length = header_match(name, "Content-Length");
            if !is_content_length && is_hop_by_hop(name) {
                return Err(PyValueError::new_err(format!(
                    "Hop-by-hop header '{name}' is not allowed"
                )));
            }

            let value = from_native_string(value_obj)?;
            if !is_valid_header_value(&value) {
                return Err(PyValueError::new_err(format!(
                    "Invalid header value '{}'",
                    String::from_utf8_lossy(&value)
                )));
            }

            if is_content_length {
                let parsed = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|text| text.parse::<u64>().ok());
                match parsed {
                    Some(n) => ctx.response.content_length = Some(n),
                    None => {
                        return Err(PyValueError::new_err(format!(
                            "Could not parse Content-Length header: '{}'",
                            String::from_utf8_lossy(&value)
                        )))
                    }
                }
                // Content-Length never goes onto the channel as a header.
                continue;
            }

            ctx.response.headers.push((name.to_string(), value));
        }

        // "response headers must not be sent until there is actual body
        // data available ... The only possible exception to this rule is
        // if the response headers explicitly include a Content-Length of
        // zero."
        if ctx.response.content_length == Some(0) {
            let response = ctx.take_response();
            if let Err(err) = ctx.responder.lock().send_headers(response) {
                return Err(PyRuntimeError::new_err(err.to_string()));
            }
        }

        Ok(())
    }
}

fn validate_exc_info(obj: &PyAny) -> PyResult<&PyAny> {
    let invalid = || PyTypeError::new_err("Invalid exc_info argument");
    let tuple = obj.downcast::<PyTuple>().map_err(|_| invalid())?;
    if tuple.len() != 3 {
        return Err(invalid());
    }
    let exc_type = tuple.get_item(0)?.downcast::<PyType>().map_err(|_| invalid())?;
    let exc_value = tuple.get_item(1)?;
    if !exc_type.is_subclass_of::<pyo3::exceptions::PyBaseException>()?
        || !exc_value.is_instance(exc_type)?
    {
        return Err(invalid());
    }
    Ok(exc_value)
}

// Intent: resolve the hosted application the way the Flask CLI would.
// Result: module and attribute names fall back to the documented pairs,
// and coroutine objects are rejected because ASGI is unsupported.
pub fn find_app(
    py: Python<'_>,
    module_name: Option<&str>,
    app_name: Option<&str>,
) -> Result<Py<PyAny>, BridgeError> {
    const MODULE_FALLBACK: [&str; 2] = ["app", "wsgi"];
    const APP_FALLBACK: [&str; 2] = ["app", "application"];

    let module = if let Some(name) = module_name {
        import_module(py, name).map_err(|err| surface_error(py, err))?
    } else {
        // Dropping the PyErr clears the pending exception before the
        // next attempt.
        MODULE_FALLBACK
            .iter()
            .find_map(|name| import_module(py, name).ok())
            .ok_or_else(|| {
                BridgeError::Python("Could not import module 'app' or 'wsgi'".to_string())
            })?
    };

    let app = if let Some(name) = app_name {
        module.getattr(name).map_err(|_| {
            BridgeError::Python(format!("Could not find object '{name}' in module"))
        })?
    } else {
        APP_FALLBACK
            .iter()
            .find_map(|name| match module.getattr(*name) {
                Ok(attr) if attr.is_callable() => Some(attr),
                _ => None,
            })
            .ok_or_else(|| {
                BridgeError::Python(
                    "Could not find object 'app' or 'application' in module".to_string(),
                )
            })?
    };

    let is_coroutine: bool = py
        .import("inspect")
        .and_then(|inspect| inspect.call_method1("iscoroutine", (app,)))
        .and_then(|result| result.extract())
        .map_err(|err| surface_error(py, err))?;
    if is_coroutine {
        return Err(BridgeError::Python(
            "Application is a coroutine. ASGI is not supported yet.".to_string(),
        ));
    }

    Ok(app.into_py(py))
}

fn build_environ<'py>(
    py: Python<'py>,
    request: &HttpRequest,
    content_length: Option<u64>,
    input: WsgiInput,
) -> PyResult<&'py PyDict> {
    // All keys and values are native strings; only body data is bytes.
    let environ = PyDict::new(py);

    environ.set_item("REMOTE_ADDR", native_string(py, request.remote_addr.as_bytes()))?;
    environ.set_item("REQUEST_METHOD", request.method.as_str())?;
    environ.set_item("SCRIPT_NAME", native_string(py, request.script_name.as_bytes()))?;
    environ.set_item("PATH_INFO", native_string(py, request.uri.path.as_bytes()))?;
    environ.set_item("QUERY_STRING", native_string(py, request.uri.query.as_bytes()))?;

    let content_type = request.find_header("Content-Type").unwrap_or(b"");
    environ.set_item("CONTENT_TYPE", native_string(py, content_type))?;
    // Like the headers, a native string; empty when there is no body.
    let content_length = content_length.map(|n| n.to_string()).unwrap_or_default();
    environ.set_item("CONTENT_LENGTH", native_string(py, content_length.as_bytes()))?;

    environ.set_item("SERVER_NAME", native_string(py, request.server_name.as_bytes()))?;
    environ.set_item("SERVER_PORT", native_string(py, request.server_port.as_bytes()))?;
    environ.set_item("SERVER_PROTOCOL", native_string(py, request.protocol.as_bytes()))?;
    environ.set_item("SERVER_SOFTWARE", SERVER_SOFTWARE)?;
    // mod_ssl convention.
    environ.set_item("HTTPS", if request.scheme == "https" { "on" } else { "" })?;

    environ.set_item("wsgi.version", (1, 0))?;
    environ.set_item("wsgi.url_scheme", native_string(py, request.scheme.as_bytes()))?;
    environ.set_item("wsgi.input", Py::new(py, input)?)?;
    // stderr is captured by the front-end proxy and forwarded to its
    // logging sink.
    environ.set_item("wsgi.errors", py.import("sys")?.getattr("stderr")?)?;
    environ.set_item("wsgi.multithread", false)?;
    environ.set_item("wsgi.multiprocess", true)?;
    environ.set_item("wsgi.run_once", false)?;
    // https://gist.github.com/mitsuhiko/5721547
    // wsgi.input signals EOF at the end of the body instead of being
    // mapped to a socket. That permits chunked request bodies and lets
    // Werkzeug skip its own Content-Length guard around the stream.
    environ.set_item("wsgi.input_terminated", true)?;

    for (name, value) in &request.headers {
        if header_match(name, "Content-Type") || header_match(name, "Content-Length") {
            continue;
        }
        environ.set_item(translate_header(name), native_string(py, value))?;
    }

    Ok(environ)
}

/// Bridges canonical requests into the hosted WSGI application.
pub struct WsgiHandler {
    app: Py<PyAny>,
}

impl WsgiHandler {
    pub fn new(app: Py<PyAny>) -> Self {
        WsgiHandler { app }
    }
}

impl RequestHandler for WsgiHandler {
    // Intent: run one request through the PEP 3333 contract.
    // Result: headers are deferred until body data exists, the iterable
    // is closed on every path, and the start_response context is
    // revoked before this returns.
    fn process(
        &mut self,
        mut request: HttpRequest,
        responder: SharedResponder,
    ) -> Result<(), BridgeError> {
        Python::with_gil(|py| {
            let (stream, content_length): (Box<dyn InputStream>, Option<u64>) =
                match request.body.take() {
                    Some(stream) => {
                        let declared = stream.content_length();
                        (stream, declared)
                    }
                    None => (Box::new(NullInputStream), None),
                };

            let environ = build_environ(py, &request, content_length, WsgiInput::new(stream))
                .map_err(|err| surface_error(py, err))?;

            let ctx: ContextSlot = Arc::new(Mutex::new(Some(ResponseContext {
                response: HttpResponse::default(),
                responder: responder.clone(),
            })));
            let start_response = Py::new(py, StartResponse { ctx: ctx.clone() })
                .map_err(|err| surface_error(py, err))?;

            let outcome = drive_application(
                py,
                self.app.as_ref(py),
                environ,
                start_response.as_ref(py),
                &ctx,
                &responder,
            );

            // Revoke the context so a retained start_response fails
            // cleanly instead of touching a finished request.
            *ctx.lock() = None;

            outcome
        })
    }
}

fn drive_application(
    py: Python<'_>,
    app: &PyAny,
    environ: &PyDict,
    start_response: &PyAny,
    ctx: &ContextSlot,
    responder: &SharedResponder,
) -> Result<(), BridgeError> {
    let result = app
        .call1((environ, start_response))
        .map_err(|err| surface_error(py, err))?;

    let iterated = consume_iterable(py, result, ctx, responder);

    // close() runs whether or not iteration succeeded.
    let closed = close_iterable(py, result);

    iterated?;
    closed
}

fn consume_iterable(
    py: Python<'_>,
    result: &PyAny,
    ctx: &ContextSlot,
    responder: &SharedResponder,
) -> Result<(), BridgeError> {
    let iterator = result.iter().map_err(|err| surface_error(py, err))?;

    for item in iterator {
        let item = item.map_err(|err| surface_error(py, err))?;
        // The application must have invoked start_response before the
        // iterable yields its first body bytes; the first iteration is
        // the earliest point where that can be checked.
        ensure_headers_sent(ctx)?;
        let chunk = chunk_bytes(item).map_err(|err| surface_error(py, err))?;
        responder.lock().send_body(chunk)?;
    }

    // The iterable may have been empty.
    ensure_headers_sent(ctx)
}

fn ensure_headers_sent(ctx: &ContextSlot) -> Result<(), BridgeError> {
    let mut slot = ctx.lock();
    let context = slot
        .as_mut()
        .expect("start_response context revoked while the request is live");
    if context.responder.lock().headers_sent() {
        return Ok(());
    }
    if context.response.status == 0 {
        return Err(BridgeError::StartResponseNotCalled);
    }
    let response = context.take_response();
    let result = context.responder.lock().send_headers(response);
    result
}

fn close_iterable(py: Python<'_>, result: &PyAny) -> Result<(), BridgeError> {
    match result.hasattr("close") {
        Ok(true) => result
            .call_method0("close")
            .map(|_| ())
            .map_err(|err| surface_error(py, err)),
        Ok(false) => Ok(()),
        Err(err) => Err(surface_error(py, err)),
    }
}
