//! Helpers on top of pyo3 for the pieces the bridge needs beyond plain
//! object handles: Latin-1 native strings (PEP 3333 "A Note on String
//! Types"), byte extraction, exception stringification, and sys.path
//! manipulation.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyList, PyString};

use crate::error::BridgeError;

/// Build a native string from raw bytes by decoding as Latin-1, so any
/// byte sequence round-trips losslessly through the interpreter.
pub fn native_string<'py>(py: Python<'py>, bytes: &[u8]) -> &'py PyString {
    let decoded: String = bytes.iter().map(|&byte| byte as char).collect();
    PyString::new(py, &decoded)
}

/// Convert a native string back to raw bytes. Every code point must fit
/// in 0..=255; anything else cannot have come over the wire.
pub fn from_native_string(value: &PyString) -> PyResult<Vec<u8>> {
    let text = value.to_str()?;
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code_point = ch as u32;
        if code_point > 0xFF {
            return Err(PyValueError::new_err(format!(
                "String '{text}' cannot be encoded as Latin-1. Code point U+{code_point:04X} is out of range."
            )));
        }
        bytes.push(code_point as u8);
    }
    Ok(bytes)
}

/// Body chunks must be bytes; strings are tolerated and encoded as
/// UTF-8, matching what the interpreter would hand a file object.
pub fn chunk_bytes(item: &PyAny) -> PyResult<&[u8]> {
    if let Ok(bytes) = item.downcast::<PyBytes>() {
        return Ok(bytes.as_bytes());
    }
    if let Ok(text) = item.downcast::<PyString>() {
        return Ok(text.to_str()?.as_bytes());
    }
    Err(PyValueError::new_err(
        "response body items must be bytes or string",
    ))
}

/// String form of a Python exception value, with a fallback when the
/// value itself cannot be stringified.
pub fn error_message(py: Python<'_>, err: &PyErr) -> String {
    let value = err.value(py);
    match value.str() {
        Ok(text) => {
            let message = text.to_string_lossy();
            if message.is_empty() {
                err.to_string()
            } else {
                message.into_owned()
            }
        }
        Err(_) => "Cannot convert Python exception to string".to_string(),
    }
}

/// Log the exception with its traceback and turn it into a bridge
/// error. Stderr is captured by the front-end proxy.
pub fn surface_error(py: Python<'_>, err: PyErr) -> BridgeError {
    let message = error_message(py, &err);
    err.print(py);
    BridgeError::Python(message)
}

/// Append a directory to the interpreter's module search path. Paths
/// come from the filesystem, so they are UTF-8 here, not Latin-1.
pub fn add_sys_path(py: Python<'_>, path: &str) -> PyResult<()> {
    let sys = py.import("sys")?;
    let sys_path = sys.getattr("path")?.downcast::<PyList>()?;
    sys_path.append(PyString::new(py, path))?;
    Ok(())
}

/// Import a module, keeping the Python exception available to the
/// caller for fallback handling.
pub fn import_module<'py>(py: Python<'py>, name: &str) -> PyResult<&'py PyModule> {
    py.import(name)
}
