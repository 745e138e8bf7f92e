//! Provides [InterpretationError], the error that most things return, and [Fault], the error
//! raised inside the virtual machine while bytecode is running.
use thiserror::Error;

/// Any error that can occur during interpretation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InterpretationError {
    /// A compile-time error, such as a syntax error, or a name error.
    #[error("compile-time error")]
    CompileError,
    /// A runtime error, such as a type error or a division by zero.
    #[error("runtime error")]
    RuntimeError,
}

/// A runtime error that has not been reported yet.
///
/// Faults travel up through `?` until they reach [crate::vm::VM::interpret], where the message is
/// printed together with a stack trace and turned into [InterpretationError::RuntimeError].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct Fault {
    message: String,
}

impl Fault {
    /// Creates a fault with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Fault {
            message: message.into(),
        }
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Fault> for InterpretationError {
    fn from(_: Fault) -> Self {
        InterpretationError::RuntimeError
    }
}

/// Shorthand for returning a [Fault] with a formatted message.
///
/// ```
/// # use joker::error::Fault;
/// fn check(n: i32) -> Result<i32, Fault> {
///     if n < 0 {
///         joker::fault!("expected a positive number, found {n}");
///     }
///     Ok(n)
/// }
/// assert_eq!("expected a positive number, found -1", check(-1).unwrap_err().message());
/// ```
#[macro_export]
macro_rules! fault {
    ($($arg:tt)*) => {
        return Err($crate::error::Fault::new(format!($($arg)*)))
    };
}
