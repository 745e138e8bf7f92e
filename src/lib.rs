//! Joker: a small, statically-flavoured scripting language, compiled to bytecode and run on a
//! stack-based virtual machine with a mark-sweep garbage collector.
//!
//! ```
//! use joker::prelude::*;
//!
//! let mut vm = VM::default();
//! vm.capture_output();
//! vm.interpret("println(1 + 2);").unwrap();
//! assert_eq!("3\n", vm.take_output());
//! ```

pub mod builtin;
pub mod chunk;
pub mod compiler;
pub mod config;
pub mod debug;
pub mod error;
pub mod gc;
pub mod native;
pub mod object;
pub mod operator;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;
pub mod with_try_from_u8;

/// The result of compiling and running a program.
pub type Result<T> = std::result::Result<T, error::InterpretationError>;

/// Re-exports common items.
pub mod prelude {
    pub use crate::builtin::{NativeMethod, TypeSpec};
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::config::Config;
    pub use crate::error::{Fault, InterpretationError};
    pub use crate::native::Arity;
    pub use crate::value::Value;
    pub use crate::vm::{Fallible, VM};
}
