//! Binding to the system WAS framing library (libcm4all-was-simple).
//! The library owns the control/data channel state machine; this module
//! only maps its C surface onto the `WasTransport` contract.

use std::ffi::CStr;

use libc::{c_char, c_uint, c_void, size_t, ssize_t};

use crate::http::Method;
use crate::was::WasTransport;

#[repr(C)]
struct was_simple {
    _opaque: [u8; 0],
}

#[repr(C)]
struct was_simple_iterator {
    _opaque: [u8; 0],
}

#[repr(C)]
struct was_simple_pair {
    name: *const c_char,
    value: *const c_char,
}

#[link(name = "cm4all-was-simple")]
extern "C" {
    fn was_simple_new() -> *mut was_simple;
    fn was_simple_free(was: *mut was_simple);
    fn was_simple_accept(was: *mut was_simple) -> *const c_char;
    fn was_simple_get_method(was: *mut was_simple) -> c_uint;
    fn was_simple_get_script_name(was: *mut was_simple) -> *const c_char;
    fn was_simple_get_path_info(was: *mut was_simple) -> *const c_char;
    fn was_simple_get_query_string(was: *mut was_simple) -> *const c_char;
    fn was_simple_get_remote_host(was: *mut was_simple) -> *const c_char;
    fn was_simple_get_header_iterator(was: *mut was_simple) -> *mut was_simple_iterator;
    fn was_simple_iterator_next(iterator: *mut was_simple_iterator) -> *const was_simple_pair;
    fn was_simple_iterator_free(iterator: *mut was_simple_iterator);
    fn was_simple_has_body(was: *mut was_simple) -> bool;
    fn was_simple_input_remaining(was: *mut was_simple) -> i64;
    fn was_simple_read(was: *mut was_simple, buffer: *mut c_void, length: size_t) -> ssize_t;
    fn was_simple_status(was: *mut was_simple, status: c_uint) -> bool;
    fn was_simple_set_header_n(
        was: *mut was_simple,
        name: *const c_char,
        name_length: size_t,
        value: *const c_char,
        value_length: size_t,
    ) -> bool;
    fn was_simple_set_length(was: *mut was_simple, length: u64) -> bool;
    fn was_simple_write(was: *mut was_simple, data: *const c_void, length: size_t) -> bool;
    fn was_simple_end(was: *mut was_simple) -> bool;
    fn was_simple_abort(was: *mut was_simple) -> bool;
}

/// The numeric method values of the control channel. Everything else is
/// reported as invalid.
fn method_from_wire(raw: c_uint) -> Option<Method> {
    Some(match raw {
        1 => Method::Get,
        2 => Method::Post,
        3 => Method::Head,
        4 => Method::Put,
        5 => Method::Delete,
        6 => Method::Options,
        7 => Method::Trace,
        8 => Method::Propfind,
        9 => Method::Proppatch,
        10 => Method::Mkcol,
        11 => Method::Copy,
        12 => Method::Move,
        13 => Method::Lock,
        14 => Method::Unlock,
        15 => Method::Report,
        16 => Method::Patch,
        _ => return None,
    })
}

unsafe fn owned_string(raw: *const c_char) -> Option<String> {
    if raw.is_null() {
        None
    } else {
        Some(CStr::from_ptr(raw).to_string_lossy().into_owned())
    }
}

/// Owned handle to the per-process WAS channel.
pub struct WasSimple {
    raw: *mut was_simple,
}

// The handle stays inside one Arc<Mutex<_>> and only one request uses
// it at a time; the raw pointer never leaves this wrapper.
unsafe impl Send for WasSimple {}

impl WasSimple {
    pub fn new() -> Option<Self> {
        let raw = unsafe { was_simple_new() };
        if raw.is_null() {
            None
        } else {
            Some(WasSimple { raw })
        }
    }
}

impl Drop for WasSimple {
    fn drop(&mut self) {
        unsafe { was_simple_free(self.raw) };
    }
}

impl WasTransport for WasSimple {
    fn accept(&mut self) -> Option<String> {
        unsafe { owned_string(was_simple_accept(self.raw)) }
    }

    fn method(&mut self) -> Option<Method> {
        method_from_wire(unsafe { was_simple_get_method(self.raw) })
    }

    fn script_name(&mut self) -> Option<String> {
        unsafe { owned_string(was_simple_get_script_name(self.raw)) }
    }

    fn path_info(&mut self) -> Option<String> {
        unsafe { owned_string(was_simple_get_path_info(self.raw)) }
    }

    fn query_string(&mut self) -> Option<String> {
        unsafe { owned_string(was_simple_get_query_string(self.raw)) }
    }

    fn remote_host(&mut self) -> Option<String> {
        unsafe { owned_string(was_simple_get_remote_host(self.raw)) }
    }

    fn request_headers(&mut self) -> Vec<(String, Vec<u8>)> {
        let mut headers = Vec::new();
        unsafe {
            let iterator = was_simple_get_header_iterator(self.raw);
            if iterator.is_null() {
                return headers;
            }
            loop {
                let pair = was_simple_iterator_next(iterator);
                if pair.is_null() {
                    break;
                }
                let name = CStr::from_ptr((*pair).name).to_string_lossy().into_owned();
                let value = CStr::from_ptr((*pair).value).to_bytes().to_vec();
                headers.push((name, value));
            }
            was_simple_iterator_free(iterator);
        }
        headers
    }

    fn has_body(&mut self) -> bool {
        unsafe { was_simple_has_body(self.raw) }
    }

    fn input_remaining(&mut self) -> i64 {
        unsafe { was_simple_input_remaining(self.raw) }
    }

    fn read(&mut self, dest: &mut [u8]) -> isize {
        unsafe { was_simple_read(self.raw, dest.as_mut_ptr() as *mut c_void, dest.len()) as isize }
    }

    fn status(&mut self, status: u16) -> bool {
        unsafe { was_simple_status(self.raw, c_uint::from(status)) }
    }

    fn set_header(&mut self, name: &str, value: &[u8]) -> bool {
        unsafe {
            was_simple_set_header_n(
                self.raw,
                name.as_ptr() as *const c_char,
                name.len(),
                value.as_ptr() as *const c_char,
                value.len(),
            )
        }
    }

    fn set_length(&mut self, length: u64) -> bool {
        unsafe { was_simple_set_length(self.raw, length) }
    }

    fn write(&mut self, data: &[u8]) -> bool {
        unsafe { was_simple_write(self.raw, data.as_ptr() as *const c_void, data.len()) }
    }

    fn end(&mut self) -> bool {
        unsafe { was_simple_end(self.raw) }
    }

    fn abort(&mut self) -> bool {
        unsafe { was_simple_abort(self.raw) }
    }
}
