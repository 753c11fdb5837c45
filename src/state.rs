//! Compiler state lifecycle
//!
//! A `CompilerState` moves through configuration, a single compile, and a single relocation.
//! After that its symbols can be resolved into live handles and callable functions. The
//! compiled image (engine context, installed callbacks, call worker) is shared by everything
//! resolved from it and is torn down when the last of those is dropped.
use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_void;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::unsync::OnceCell;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::function::{Callback, NativeFunction, Worker};
use crate::tcc::{Backend, TccBackend, TccLibrary};
use crate::types::{FunctionType, Type, TypeRef};
use crate::value::{Handle, Value};

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum Stage
{
	Created,
	Configured,
	Compiled,
	Relocated,
	Failed,
}
impl Stage
{
	pub fn name(&self) -> &'static str
	{
		match *self
		{
		Stage::Created => "created",
		Stage::Configured => "configured",
		Stage::Compiled => "compiled",
		Stage::Relocated => "relocated",
		Stage::Failed => "failed",
		}
	}
}

// Set while some state is between creation and relocation: the engine's global state can't
// handle two compilations at once
static IN_FLIGHT: AtomicBool = AtomicBool::new(false);

struct InFlight(());
impl InFlight
{
	fn acquire() -> Result<InFlight>
	{
		match IN_FLIGHT.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
		{
		Ok(_) => Ok(InFlight(())),
		Err(_) => Err(Error::StateInFlight),
		}
	}
}
impl Drop for InFlight
{
	fn drop(&mut self)
	{
		IN_FLIGHT.store(false, Ordering::SeqCst);
	}
}

/// Compiled code and everything that must live as long as it
pub(crate) struct Image
{
	backend: RefCell<Box<dyn Backend>>,
	callbacks: RefCell<Vec<Rc<Callback>>>,
	worker: OnceCell<Worker>,
}
impl Image
{
	pub(crate) fn worker(&self) -> Result<&Worker>
	{
		self.worker.get_or_try_init(Worker::spawn)
	}
	fn keep(&self, cb: Rc<Callback>)
	{
		self.callbacks.borrow_mut().push(cb);
	}
}
impl Drop for Image
{
	fn drop(&mut self)
	{
		// Pending calls finish before the code goes away
		self.worker.take();
		debug!("dropping image ({} callbacks)", self.callbacks.borrow().len());
	}
}

pub struct CompilerState
{
	image: Rc<Image>,
	stage: Stage,
	in_flight: Option<InFlight>,
	has_input: bool,
}

impl CompilerState
{
	/// State using libtcc with the default configuration
	pub fn new() -> Result<CompilerState>
	{
		CompilerState::with_config(&Config::default())
	}
	/// State configured from the environment (see `Config::from_env`)
	pub fn from_env() -> Result<CompilerState>
	{
		CompilerState::with_config(&Config::from_env())
	}
	pub fn with_config(config: &Config) -> Result<CompilerState>
	{
		let in_flight = InFlight::acquire()?;
		let lib = TccLibrary::load(&config.library_file())?;
		let backend = TccBackend::new(lib)?;
		let mut rv = CompilerState::from_parts(Box::new(backend), in_flight);
		rv.apply(config)?;
		Ok(rv)
	}
	/// State over an arbitrary engine
	pub fn with_backend(backend: Box<dyn Backend>) -> Result<CompilerState>
	{
		let in_flight = InFlight::acquire()?;
		Ok(CompilerState::from_parts(backend, in_flight))
	}

	fn from_parts(backend: Box<dyn Backend>, in_flight: InFlight) -> CompilerState
	{
		CompilerState {
			image: Rc::new(Image {
				backend: RefCell::new(backend),
				callbacks: RefCell::new(Vec::new()),
				worker: OnceCell::new(),
				}),
			stage: Stage::Created,
			in_flight: Some(in_flight),
			has_input: false,
			}
	}

	fn apply(&mut self, config: &Config) -> Result<()>
	{
		// The runtime library path has to be known before anything else
		if let Some(ref p) = config.lib_path {
			self.set_lib_path(p)?;
		}
		if let Some(ref o) = config.options {
			self.set_options(o)?;
		}
		for p in &config.include_paths {
			self.add_include_path(p)?;
		}
		for p in &config.sysinclude_paths {
			self.add_sysinclude_path(p)?;
		}
		for p in &config.library_paths {
			self.add_library_path(p)?;
		}
		for l in &config.libraries {
			self.add_library(l)?;
		}
		for (name, value) in &config.defines {
			self.define_symbol(name, value.as_ref().map(|v| &v[..]))?;
		}
		Ok( () )
	}

	pub fn stage(&self) -> Stage
	{
		self.stage
	}

	// -- Configuration --

	pub fn set_lib_path(&mut self, path: &Path) -> Result<()>
	{
		let p = self.configure("set_lib_path", path_cstring("set_lib_path", path)?)?;
		self.backend().set_lib_path(&p);
		Ok( () )
	}
	pub fn set_options(&mut self, options: &str) -> Result<()>
	{
		let o = self.configure("set_options", c_string("set_options", options)?)?;
		self.backend().set_options(&o);
		let diagnostics = self.backend().take_diagnostics();
		if diagnostics.is_empty() {
			Ok( () )
		}
		else {
			warn!("set_options({}): {:?}", options, diagnostics);
			Err(Error::Config { operation: "set_options", argument: options.to_owned() })
		}
	}
	pub fn add_include_path(&mut self, path: &Path) -> Result<()>
	{
		let p = self.configure("add_include_path", path_cstring("add_include_path", path)?)?;
		let ok = self.backend().add_include_path(&p);
		self.check_config(ok, "add_include_path", &path.display().to_string())
	}
	pub fn add_sysinclude_path(&mut self, path: &Path) -> Result<()>
	{
		let p = self.configure("add_sysinclude_path", path_cstring("add_sysinclude_path", path)?)?;
		let ok = self.backend().add_sysinclude_path(&p);
		self.check_config(ok, "add_sysinclude_path", &path.display().to_string())
	}
	pub fn define_symbol(&mut self, name: &str, value: Option<&str>) -> Result<()>
	{
		let n = self.configure("define_symbol", c_string("define_symbol", name)?)?;
		let v = match value
			{
			Some(v) => Some(c_string("define_symbol", v)?),
			None => None,
			};
		self.backend().define_symbol(&n, v.as_ref().map(|v| v.as_c_str()));
		Ok( () )
	}
	pub fn undefine_symbol(&mut self, name: &str) -> Result<()>
	{
		let n = self.configure("undefine_symbol", c_string("undefine_symbol", name)?)?;
		self.backend().undefine_symbol(&n);
		Ok( () )
	}
	pub fn add_library_path(&mut self, path: &Path) -> Result<()>
	{
		let p = self.configure("add_library_path", path_cstring("add_library_path", path)?)?;
		let ok = self.backend().add_library_path(&p);
		self.check_config(ok, "add_library_path", &path.display().to_string())
	}
	pub fn add_library(&mut self, name: &str) -> Result<()>
	{
		let n = self.configure("add_library", c_string("add_library", name)?)?;
		let ok = self.backend().add_library(&n);
		self.check_config(ok, "add_library", name)
	}
	/// Add a C source, object, or library file to the program
	pub fn add_file(&mut self, path: &Path) -> Result<()>
	{
		let p = self.configure("add_file", path_cstring("add_file", path)?)?;
		let ok = self.backend().add_file(&p);
		self.check_config(ok, "add_file", &path.display().to_string())?;
		self.has_input = true;
		Ok( () )
	}

	/// Expose host memory or code to compiled C under `name`
	///
	/// # Safety
	/// `address` must stay valid for as long as compiled code may use it
	pub unsafe fn add_symbol(&mut self, name: &str, address: *const c_void) -> Result<()>
	{
		match self.stage
		{
		Stage::Created | Stage::Configured | Stage::Compiled => {},
		s => return Err(Error::InvalidState { operation: "add_symbol", stage: s.name() }),
		}
		let n = c_string("add_symbol", name)?;
		let ok = self.backend().add_symbol(&n, address);
		self.check_config(ok, "add_symbol", name)
	}
	/// Expose a host callback to compiled C as the function `name`
	pub fn add_callback(&mut self, name: &str, callback: Rc<Callback>) -> Result<()>
	{
		unsafe { self.add_symbol(name, callback.address() as *const c_void)? };
		self.image.keep(callback);
		Ok( () )
	}

	// -- Compilation --

	/// Compile a translation unit. Only one compile per state.
	pub fn compile(&mut self, source: &str) -> Result<()>
	{
		match self.stage
		{
		Stage::Created | Stage::Configured => {},
		s => return Err(Error::InvalidState { operation: "compile", stage: s.name() }),
		}
		debug!("compile: {} bytes", source.len());
		trace!("{}", source);
		let src = match CString::new(source)
			{
			Ok(s) => s,
			Err(_) => {
				self.fail();
				return Err(Error::Compile { diagnostics: vec!["source contains a NUL byte".to_owned()] });
				},
			};
		let (ok, diagnostics) = {
			let mut be = self.backend();
			let ok = be.compile_string(&src);
			(ok, be.take_diagnostics())
			};
		if ok {
			self.stage = Stage::Compiled;
			Ok( () )
		}
		else {
			self.fail();
			Err(Error::Compile { diagnostics: diagnostics })
		}
	}

	/// Link and place the compiled code in memory. After this, symbols can be resolved.
	pub fn relocate(&mut self) -> Result<()>
	{
		match self.stage
		{
		Stage::Compiled => {},
		Stage::Configured if self.has_input => {},
		s => return Err(Error::InvalidState { operation: "relocate", stage: s.name() }),
		}
		let (ok, diagnostics) = {
			let mut be = self.backend();
			let ok = be.relocate();
			(ok, be.take_diagnostics())
			};
		if ok {
			debug!("relocated");
			self.stage = Stage::Relocated;
			self.in_flight = None;
			Ok( () )
		}
		else {
			self.fail();
			Err(Error::Relocate { diagnostics: diagnostics })
		}
	}

	/// Link and run `main` with the given arguments (`args[0]` is the program name)
	///
	/// libtcc reports a failed link as status -1 with diagnostics, which fails the state.
	pub fn run(&mut self, args: &[&str]) -> Result<i32>
	{
		match self.stage
		{
		Stage::Created | Stage::Configured | Stage::Compiled => {},
		s => return Err(Error::InvalidState { operation: "run", stage: s.name() }),
		}
		let argv = args.iter()
			.map(|a| c_string("run", a))
			.collect::<Result<Vec<_>>>()?;
		let (rv, diagnostics) = {
			let mut be = self.backend();
			let rv = be.run(&argv);
			(rv, be.take_diagnostics())
			};
		if rv == -1 && !diagnostics.is_empty() {
			self.fail();
			return Err(Error::Relocate { diagnostics: diagnostics });
		}
		debug!("run: exit status {} ({} diagnostics)", rv, diagnostics.len());
		self.stage = Stage::Relocated;
		self.in_flight = None;
		Ok(rv)
	}

	// -- Symbols --

	pub fn symbol_address(&self, name: &str) -> Result<NonNull<u8>>
	{
		if self.stage != Stage::Relocated {
			return Err(Error::InvalidState { operation: "symbol lookup", stage: self.stage.name() });
		}
		let n = CString::new(name).map_err(|_| Error::SymbolNotFound { name: name.to_owned() })?;
		self.image.backend.borrow().get_symbol(&n)
			.ok_or_else(|| Error::SymbolNotFound { name: name.to_owned() })
	}

	/// Live view of the symbol `name`, interpreted as `ty`
	pub fn resolve_symbol(&self, name: &str, ty: &TypeRef) -> Result<Handle>
	{
		let addr = self.symbol_address(name)?;
		trace!("resolve {}: {:?} @ {:p}", name, ty, addr);
		Ok(Handle::new(name, addr, ty.clone(), self.image.clone()))
	}

	pub fn resolve_function(&self, name: &str, ty: &FunctionType) -> Result<NativeFunction>
	{
		let addr = self.symbol_address(name)?;
		NativeFunction::new(name, addr, ty, self.image.clone())
	}

	/// Callable view of `name` with unnamed arguments of the given types
	pub fn get_function(&self, name: &str, ret: &TypeRef, args: &[TypeRef]) -> Result<NativeFunction>
	{
		self.resolve_function(name, &FunctionType::unnamed(ret.clone(), args))
	}

	/// Overwrite the scalar `name`
	pub fn set_symbol<V: Into<Value>>(&self, name: &str, ty: &TypeRef, value: V) -> Result<()>
	{
		self.resolve_symbol(name, ty)?.set(value)
	}

	/// Point the function pointer variable `name` at a host callback
	pub fn set_function(&self, name: &str, callback: Rc<Callback>) -> Result<()>
	{
		let h = self.resolve_symbol(name, &Type::pointer_to(&Type::void()))?;
		h.set(Value::Pointer(callback.address() as usize))?;
		self.image.keep(callback);
		Ok( () )
	}

	// -- Helpers --

	fn backend(&self) -> ::std::cell::RefMut<Box<dyn Backend>>
	{
		self.image.backend.borrow_mut()
	}

	fn configure<T>(&mut self, operation: &'static str, v: T) -> Result<T>
	{
		match self.stage
		{
		Stage::Created | Stage::Configured => {
			self.stage = Stage::Configured;
			Ok(v)
			},
		s => Err(Error::InvalidState { operation: operation, stage: s.name() }),
		}
	}

	fn check_config(&mut self, ok: bool, operation: &'static str, argument: &str) -> Result<()>
	{
		let diagnostics = self.backend().take_diagnostics();
		if ok {
			Ok( () )
		}
		else {
			debug!("{}({}) failed: {:?}", operation, argument, diagnostics);
			Err(Error::Config { operation: operation, argument: argument.to_owned() })
		}
	}

	fn fail(&mut self)
	{
		self.stage = Stage::Failed;
		self.in_flight = None;
	}
}

fn c_string(operation: &'static str, s: &str) -> Result<CString>
{
	CString::new(s).map_err(|_| Error::Config { operation: operation, argument: s.to_owned() })
}

fn path_cstring(operation: &'static str, path: &Path) -> Result<CString>
{
	match path.to_str()
	{
	Some(s) => c_string(operation, s),
	None => Err(Error::Config { operation: operation, argument: path.display().to_string() }),
	}
}

#[cfg(test)]
pub(crate) mod testing
{
	//! An in-process stand-in for the engine
	use super::*;
	use std::cell::Cell;
	use std::ffi::CStr;
	use std::collections::HashMap;

	static SERIAL: ::parking_lot::Mutex<()> = ::parking_lot::const_mutex(());

	/// States are process-exclusive until relocated, tests creating them take turns
	pub(crate) fn serial() -> ::parking_lot::MutexGuard<'static, ()>
	{
		SERIAL.lock()
	}

	/// Shared view of what the mock has seen
	#[derive(Default)]
	pub(crate) struct Recorder
	{
		pub source: RefCell<String>,
		pub lookups: Cell<usize>,
		pub defines: RefCell<Vec<(String, Option<String>)>>,
	}

	#[derive(Default)]
	pub(crate) struct MockBackend
	{
		pub symbols: HashMap<String, usize>,
		/// Compilation (or `set_options`) fails when the source contains this
		pub reject: Option<String>,
		/// Linking fails with this diagnostic, in both `relocate` and `run`
		pub unresolved: Option<String>,
		pub seen: Rc<Recorder>,
		diagnostics: Vec<String>,
	}
	impl MockBackend
	{
		pub(crate) fn with_symbol<T>(mut self, name: &str, ptr: *const T) -> Self
		{
			self.symbols.insert(name.to_owned(), ptr as usize);
			self
		}
	}
	impl Backend for MockBackend
	{
		fn set_lib_path(&mut self, _: &CStr) {}
		fn set_options(&mut self, options: &CStr)
		{
			let options = options.to_string_lossy();
			if let Some(ref r) = self.reject {
				if options.contains(&r[..]) {
					self.diagnostics.push(format!("invalid option -- '{}'", options));
				}
			}
		}
		fn add_include_path(&mut self, _: &CStr) -> bool { true }
		fn add_sysinclude_path(&mut self, _: &CStr) -> bool { true }
		fn define_symbol(&mut self, name: &CStr, value: Option<&CStr>)
		{
			let v = value.map(|v| v.to_string_lossy().into_owned());
			self.seen.defines.borrow_mut().push( (name.to_string_lossy().into_owned(), v) );
		}
		fn undefine_symbol(&mut self, _: &CStr) {}
		fn add_library_path(&mut self, _: &CStr) -> bool { true }
		fn add_library(&mut self, _: &CStr) -> bool { true }
		fn add_file(&mut self, path: &CStr) -> bool
		{
			let exists = Path::new(&*path.to_string_lossy()).exists();
			if !exists {
				self.diagnostics.push(format!("file '{}' not found", path.to_string_lossy()));
			}
			exists
		}
		fn add_symbol(&mut self, name: &CStr, address: *const c_void) -> bool
		{
			self.symbols.insert(name.to_string_lossy().into_owned(), address as usize);
			true
		}
		fn compile_string(&mut self, source: &CStr) -> bool
		{
			let source = source.to_string_lossy().into_owned();
			let ok = match self.reject
				{
				Some(ref r) => !source.contains(&r[..]),
				None => true,
				};
			if !ok {
				self.diagnostics.push("<string>:1: error: rejected".to_owned());
			}
			*self.seen.source.borrow_mut() = source;
			ok
		}
		fn relocate(&mut self) -> bool
		{
			match self.unresolved
			{
			Some(ref name) => {
				self.diagnostics.push(format!("undefined symbol '{}'", name));
				false
				},
			None => true,
			}
		}
		fn get_symbol(&self, name: &CStr) -> Option<NonNull<u8>>
		{
			self.seen.lookups.set(self.seen.lookups.get() + 1);
			self.symbols.get(&*name.to_string_lossy()).and_then(|&a| NonNull::new(a as *mut u8))
		}
		fn run(&mut self, argv: &[CString]) -> i32
		{
			if !self.relocate() {
				return -1;
			}
			argv.len() as i32
		}
		fn take_diagnostics(&mut self) -> Vec<String>
		{
			::std::mem::replace(&mut self.diagnostics, Vec::new())
		}
	}
}
