#![allow(clippy::return_self_not_must_use)]

pub mod address;
pub mod ast;
pub mod builtins;
pub mod checkpoint;
pub mod config;
pub mod env;
pub mod error;
pub mod eval;
pub mod external;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod require;
pub mod value;

pub use address::{AddressHandler, AddressRequest, DispatchContext, HandlerError, HandlerReply};
pub use checkpoint::{Ack, CancelFlag, Checkpoint, ProgressObserver};
pub use config::Config;
pub use error::{ErrorCategory, RexxDiagnostic, RexxError, RexxResult};
pub use interpreter::{Interpreter, RunOutcome};
pub use require::{Library, LibraryCache, LibraryDescriptor};
pub use value::Value;
