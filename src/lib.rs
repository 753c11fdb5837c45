/*!
 * Runtime C compilation and host/C symbol binding
 *
 * C source is compiled in memory with libtcc and linked into the running process. Symbols of
 * the compiled code are then exposed to the host as live typed views and callable functions,
 * and host closures can be handed to C as plain function pointers.
 *
 * ```no_run
 * use cinline::{CodeGenerator, CompilerState, Type, Value, c_function};
 *
 * let square = c_function(&Type::int(), "square", &[(Type::int(), "v")], "  return v * v;")?;
 * let mut gen = CodeGenerator::new();
 * gen.add_declaration(&square)?;
 *
 * let mut state = CompilerState::from_env()?;
 * state.compile(&gen.code()?)?;
 * state.relocate()?;
 * gen.bind_state(&state)?;
 * assert_eq!(square.call(&[Value::Int(7)])?, Value::Int(49));
 * # Ok::<(), cinline::Error>(())
 * ```
 */

#[macro_use]
extern crate log;

pub mod types;
pub mod declarator;
pub mod error;
pub mod config;
pub mod tcc;
pub mod state;
pub mod value;
pub mod function;
pub mod inline;

mod codegen;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::function::{Callback, NativeFunction, PendingCall};
pub use crate::inline::{c_callable, c_function, c_struct, Bound, CFunction, CodeGenerator, Declaration, PendingSymbol, SymbolMap};
pub use crate::state::{CompilerState, Stage};
pub use crate::types::{FunctionType, Struct, StructRef, Type, TypeRef};
pub use crate::value::{Handle, Value};

// vim: ft=rust
