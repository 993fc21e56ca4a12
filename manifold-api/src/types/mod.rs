//! Defines fundamental types used throughout the Manifold codebase.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Enumerates all the errors that can be reported in Manifold. Plugin
/// authors should try to map handler errors into one of these values.
/// If no current value is appropriate, a new one could be added
/// (requiring a new release of this crate) but make sure the new error
/// code is generic enough that it may be useful for other plugins. For
/// instance, don't add an error value that is specific to Modbus. Add
/// a more general value and use the associated description string to
/// explain the details.

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// Returned whenever a resource cannot be found.
    NotFound,

    /// A device id or alias is already registered.
    AlreadyExists(String),

    /// Reported when the peer of a communication channel has closed
    /// its handle.
    MissingPeer(String),

    /// A type mismatch is preventing the operation from continuing.
    TypeError,

    /// An invalid value was provided.
    InvArgument(String),

    /// The targeted device's handler doesn't support the requested
    /// operation.
    UnsupportedCommand(String),

    /// An error returned verbatim from a plugin-supplied handler.
    Handler(String),

    /// A dynamic registration policy wasn't satisfied.
    PolicyViolation(String),

    /// An operation didn't complete in a timely fashion.
    Timeout,

    /// A bad parameter was given in a configuration or a
    /// configuration was missing a required parameter.
    Config(String),

    /// There was a problem parsing a string. The associated string
    /// will describe how the parsing failed.
    Parse(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "item not found"),
            Error::AlreadyExists(v) => {
                write!(f, "{} is already registered", &v)
            }
            Error::MissingPeer(detail) => {
                write!(f, "{} is missing peer", detail)
            }
            Error::TypeError => write!(f, "incorrect type"),
            Error::InvArgument(v) => write!(f, "{}", &v),
            Error::UnsupportedCommand(v) => {
                write!(f, "unsupported command: {}", &v)
            }
            Error::Handler(v) => write!(f, "handler error: {}", &v),
            Error::PolicyViolation(v) => {
                write!(f, "policy violation: {}", &v)
            }
            Error::Timeout => write!(f, "timeout"),
            Error::Config(v) => write!(f, "config error: {}", &v),
            Error::Parse(v) => write!(f, "parse error: {}", &v),
        }
    }
}

// Defining these trait implementations allows any code that sends
// requests over an `mpsc` channel and expects the reply in a
// `oneshot` to easily translate the channel errors into a Manifold
// error.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::MissingPeer(String::from("request channel is closed"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::MissingPeer(String::from("request dropped"))
    }
}

/// Collects errors from a multi-step validation pass so every problem
/// can be reported at once, instead of one per failed startup.
#[derive(Debug, Default)]
pub struct MultiError(Vec<Error>);

impl MultiError {
    pub fn new() -> Self {
        MultiError(vec![])
    }

    /// Adds an error to the collection.
    pub fn push(&mut self, e: Error) {
        self.0.push(e)
    }

    /// Records the error value of a result, passing `Ok` values
    /// through.
    pub fn absorb<T>(&mut self, result: super::Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.0.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Consumes the collector. Returns `Ok(())` if no errors were
    /// recorded, otherwise a single `Config` error describing every
    /// recorded issue.
    pub fn into_result(self) -> super::Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!("{}", &self)))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.0.len())?;
        for e in &self.0 {
            write!(f, "\n * {}", e)?
        }
        Ok(())
    }
}

/// The boxed stream type streaming operations traffic in.
pub type DataStream<T> =
    std::pin::Pin<Box<dyn tokio_stream::Stream<Item = T> + Send>>;

pub mod tag;
pub mod template;
pub mod transaction;
pub mod value;

mod reading;
mod write;

pub use reading::{ReadContext, Reading, Unit};
pub use write::WriteData;
