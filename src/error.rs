use thiserror::Error;

/// Errors raised while configuring, compiling, or binding C code
#[derive(Error, Debug)]
pub enum Error {
	#[error("{operation} failed: {argument}")]
	Config { operation: &'static str, argument: String },

	#[error("compilation failed: {}", .diagnostics.join("; "))]
	Compile { diagnostics: Vec<String> },

	#[error("relocation failed: {}", .diagnostics.join("; "))]
	Relocate { diagnostics: Vec<String> },

	#[error("symbol not found: {name}")]
	SymbolNotFound { name: String },

	#[error("unknown C name for type {type_name}")]
	UnknownTypeName { type_name: String },

	#[error("{type_name} is not allowed as a return type")]
	InvalidReturnType { type_name: String },

	#[error("C function \"{name}\" must be compiled and bound before usage")]
	NotBound { name: String },

	#[error("cannot add declaration: {what}")]
	IllegalDeclaration { what: String },

	#[error("{operation} is not allowed while the state is {stage}")]
	InvalidState { operation: &'static str, stage: &'static str },

	#[error("another compiler state is still in flight")]
	StateInFlight,

	#[error("struct {name:?} already has a fixed layout")]
	StructFinalized { name: String },

	#[error("type {type_name} has no known size")]
	IncompleteType { type_name: String },

	#[error("unsupported signature for {name}: {reason}")]
	UnsupportedSignature { name: String, reason: String },

	#[error("cannot use {found} as {expected}")]
	TypeMismatch { expected: String, found: String },

	#[error("failed to load {path}: {reason}")]
	LibraryLoad { path: String, reason: String },

	#[error("call to {name} did not complete")]
	CallFailed { name: String },

	#[error("JIT code generation failed: {0}")]
	Jit(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = ::std::result::Result<T, Error>;
