//! Failure classification for the `exception_type` label

use std::borrow::Cow;
use std::convert::Infallible;

/// Exception type recorded when the inner service panics
pub const PANIC: &str = "panic";

/// Exception type recorded when the request future is dropped before it
/// settles (client disconnect, timeout, shutdown)
pub const CANCELLED: &str = "cancelled";

/// Exception type recorded when the response body fails while streaming
pub const BODY_ERROR: &str = "body_error";

/// Kind tag of a failure returned by an instrumented service
///
/// The returned value becomes a label, so it should come from a small fixed
/// set (enum variant names, error kinds) and never contain request data.
pub trait ExceptionType {
    fn exception_type(&self) -> Cow<'_, str>;
}

impl ExceptionType for Infallible {
    fn exception_type(&self) -> Cow<'_, str> {
        match *self {}
    }
}

impl ExceptionType for std::io::Error {
    fn exception_type(&self) -> Cow<'_, str> {
        Cow::Owned(format!("{:?}", self.kind()))
    }
}

impl ExceptionType for tower::BoxError {
    fn exception_type(&self) -> Cow<'_, str> {
        match self.downcast_ref::<std::io::Error>() {
            Some(err) => err.exception_type(),
            None => Cow::Borrowed("BoxError"),
        }
    }
}
