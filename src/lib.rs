//! Bridge between the Web Application Socket protocol spoken by the
//! front-end proxy and a WSGI application hosted in an embedded Python
//! interpreter. One process, one channel, one request at a time.

pub mod error;
pub mod headers;
pub mod http;
pub mod python;
pub mod was;
#[cfg(feature = "was-simple")]
pub mod was_simple;
pub mod wsgi;

pub use error::BridgeError;
pub use http::{HttpRequest, HttpResponse, RequestHandler, Responder, SharedResponder};
pub use was::{Was, WasTransport};
pub use wsgi::{find_app, WsgiHandler};
