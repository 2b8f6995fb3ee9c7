//! The regdecode errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// The definitions stream ended in the middle of a value.
    #[fail(display = "unexpected end of definitions stream")]
    Eof,

    /// Malformed definitions stream.
    #[fail(display = "definitions: {}", _0)]
    Defs(String),

    /// I2C errors.
    #[fail(display = "I2C: {}", _0)]
    I2c(String),

    /// Memory device errors.
    #[fail(display = "memory device: {}", _0)]
    Mem(String),
}

/// Implement Fail by hand instead of deriving it so that the `Context` type
/// stays under our control: any foreign error can be converted into this one
/// with a specific kind by calling `context` on the result.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(ErrorKind::General),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
