//! Error types for the luaw bridge

use std::os::raw::c_int;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while marshalling values or calling across the boundary.
///
/// Kind mismatches (`TypeMismatch`, `BadArgument`) carry the kind that was
/// expected; see [`Error::expected_kind`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Stack slot present but of the wrong kind (or absent: `got` is `no value`/`nil`)
    #[error("{expected} expected, got {got}")]
    TypeMismatch {
        /// Kind tag of the requested host type
        expected: String,
        /// Kind found in the slot
        got: String,
    },

    /// Argument marshalling failed inside a native call
    #[error("bad argument #{position} ({cause})")]
    BadArgument {
        /// 1-based stack position of the argument (the receiver is #1 for methods).
        ///
        /// Raised into a script, the message is renumbered by the interpreter
        /// for `obj:method(...)` calls, so there the first argument after the
        /// receiver reads as #1.
        position: c_int,
        /// Underlying codec failure
        cause: Box<Error>,
    },

    /// Script raised an error while running
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Script failed to compile
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Host function panicked
    #[error("native function panicked: {0}")]
    Panic(String),

    /// A native value was pushed before its type was registered
    #[error("type '{0}' is not registered")]
    UnregisteredType(&'static str),

    /// Two different Rust types were registered under the same name
    #[error("type name '{name}' is already registered for another Rust type")]
    TypeConflict {
        /// Conflicting registered name
        name: &'static str,
    },

    /// A native object was borrowed while a conflicting borrow was active,
    /// e.g. a script re-entering an object whose `&mut` method is running
    #[error("{0} object is already borrowed")]
    AlreadyBorrowed(&'static str),

    /// Key cannot index a table (nil, NaN) or a name contains NUL
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The owning interpreter has been closed
    #[error("interpreter has been closed")]
    StateClosed,

    /// A handle was used from a thread other than the interpreter's
    #[error("handle used outside the interpreter's thread")]
    WrongThread,

    /// The bridge was not initialised on this interpreter
    #[error("bridge is not initialised on this interpreter")]
    NotInitialized,

    /// A handle was pushed into an interpreter other than its owner
    #[error("handle belongs to another interpreter")]
    ForeignHandle,

    /// The interpreter stack cannot grow any further
    #[error("stack overflow ({0} more slots requested)")]
    StackOverflow(c_int),

    /// Error reported by host code
    #[error("{0}")]
    External(String),
}

impl Error {
    /// Build a mismatch error for a requested kind.
    pub fn mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Wrap any displayable host error.
    pub fn external(err: impl std::fmt::Display) -> Self {
        Error::External(err.to_string())
    }

    /// Kind tag that was expected, for kind-mismatch errors.
    pub fn expected_kind(&self) -> Option<&str> {
        match self {
            Error::TypeMismatch { expected, .. } => Some(expected),
            Error::BadArgument { cause, .. } => cause.expected_kind(),
            _ => None,
        }
    }

    /// Argument position, for argument errors.
    pub fn position(&self) -> Option<c_int> {
        match self {
            Error::BadArgument { position, .. } => Some(*position),
            _ => None,
        }
    }

    pub(crate) fn at_argument(self, position: c_int) -> Self {
        match self {
            Error::BadArgument { .. } => self,
            cause => Error::BadArgument {
                position,
                cause: Box::new(cause),
            },
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::External(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::External(s.to_string())
    }
}
