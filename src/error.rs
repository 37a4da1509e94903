use std::fmt;
use std::io;

/// Errors surfaced while bridging a request between WAS and WSGI.
///
/// `Python` carries the stringified exception from the embedded
/// interpreter. Everything else originates on the Rust side of the
/// bridge; all variants are per-request and never terminate the worker.
#[derive(Debug)]
pub enum BridgeError {
    /// The embedded interpreter raised; the message is the string form
    /// of the exception value.
    Python(String),

    /// A WAS control-channel operation reported failure, or the
    /// responder was driven outside its state machine.
    Transport(&'static str),

    /// The application supplied a status code outside the recognized
    /// HTTP set.
    InvalidStatus(u16),

    /// More body bytes were submitted than the declared Content-Length
    /// allows.
    BodyOverflow { attempted: usize, remaining: u64 },

    /// The application yielded body data (or finished) without ever
    /// calling start_response.
    StartResponseNotCalled,

    Io(io::Error),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Python(message) => write!(f, "{message}"),
            BridgeError::Transport(message) => write!(f, "{message}"),
            BridgeError::InvalidStatus(status) => {
                write!(f, "Invalid HTTP response status: {status}")
            }
            BridgeError::BodyOverflow { attempted, remaining } => write!(
                f,
                "Attempting to send {attempted} bytes, but only {remaining} bytes left to send"
            ),
            BridgeError::StartResponseNotCalled => write!(
                f,
                "start_response must be called before the WSGI application yields the first body string"
            ),
            BridgeError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::Io(err)
    }
}
