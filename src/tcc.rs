//! The compiler engine
//!
//! `Backend` is the narrow set of engine operations the compiler state drives. `TccBackend`
//! implements it over libtcc, loaded at runtime.
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::ptr::NonNull;

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

/// Engine operations. Configuration calls report success as a `bool`, diagnostics are collected
/// separately and drained with `take_diagnostics`.
pub trait Backend
{
	fn set_lib_path(&mut self, path: &CStr);
	fn set_options(&mut self, options: &CStr);
	fn add_include_path(&mut self, path: &CStr) -> bool;
	fn add_sysinclude_path(&mut self, path: &CStr) -> bool;
	fn define_symbol(&mut self, name: &CStr, value: Option<&CStr>);
	fn undefine_symbol(&mut self, name: &CStr);
	fn add_library_path(&mut self, path: &CStr) -> bool;
	fn add_library(&mut self, name: &CStr) -> bool;
	fn add_file(&mut self, path: &CStr) -> bool;
	/// Make `address` visible to compiled code as `name`
	fn add_symbol(&mut self, name: &CStr, address: *const c_void) -> bool;

	fn compile_string(&mut self, source: &CStr) -> bool;
	fn relocate(&mut self) -> bool;
	fn get_symbol(&self, name: &CStr) -> Option<NonNull<u8>>;
	/// Link and run `main`, returning its exit status
	fn run(&mut self, argv: &[CString]) -> i32;

	fn take_diagnostics(&mut self) -> Vec<String>;
}

#[repr(C)]
pub struct TCCState
{
	_private: [u8; 0],
}

const TCC_OUTPUT_MEMORY: c_int = 1;
const TCC_RELOCATE_AUTO: usize = 1;

type ErrorFunc = extern "C" fn(*mut c_void, *const c_char);

struct Api
{
	new: unsafe extern "C" fn() -> *mut TCCState,
	delete: unsafe extern "C" fn(*mut TCCState),
	set_lib_path: unsafe extern "C" fn(*mut TCCState, *const c_char),
	set_error_func: unsafe extern "C" fn(*mut TCCState, *mut c_void, ErrorFunc),
	set_options: unsafe extern "C" fn(*mut TCCState, *const c_char),
	add_include_path: unsafe extern "C" fn(*mut TCCState, *const c_char) -> c_int,
	add_sysinclude_path: unsafe extern "C" fn(*mut TCCState, *const c_char) -> c_int,
	define_symbol: unsafe extern "C" fn(*mut TCCState, *const c_char, *const c_char),
	undefine_symbol: unsafe extern "C" fn(*mut TCCState, *const c_char),
	add_file: unsafe extern "C" fn(*mut TCCState, *const c_char) -> c_int,
	compile_string: unsafe extern "C" fn(*mut TCCState, *const c_char) -> c_int,
	set_output_type: unsafe extern "C" fn(*mut TCCState, c_int) -> c_int,
	add_library_path: unsafe extern "C" fn(*mut TCCState, *const c_char) -> c_int,
	add_library: unsafe extern "C" fn(*mut TCCState, *const c_char) -> c_int,
	add_symbol: unsafe extern "C" fn(*mut TCCState, *const c_char, *const c_void) -> c_int,
	run: unsafe extern "C" fn(*mut TCCState, c_int, *mut *mut c_char) -> c_int,
	relocate: unsafe extern "C" fn(*mut TCCState, *mut c_void) -> c_int,
	get_symbol: unsafe extern "C" fn(*mut TCCState, *const c_char) -> *mut c_void,
}

/// A loaded libtcc
pub struct TccLibrary
{
	path: String,
	api: Api,
	_lib: libloading::Library,
}

static LIBRARY: OnceCell<TccLibrary> = OnceCell::new();

impl TccLibrary
{
	/// Load libtcc from `path`. The first successful load is kept for the life of the process.
	pub fn load(path: &Path) -> Result<&'static TccLibrary>
	{
		let lib = LIBRARY.get_or_try_init(|| TccLibrary::open(path))?;
		if Path::new(&lib.path) != path {
			debug!("libtcc already loaded from {}, ignoring {}", lib.path, path.display());
		}
		Ok(lib)
	}

	pub fn path(&self) -> &str
	{
		&self.path
	}

	fn open(path: &Path) -> Result<TccLibrary>
	{
		let path_s = path.display().to_string();
		debug!("loading {}", path_s);
		unsafe {
			let lib = libloading::Library::new(path)
				.map_err(|e| Error::LibraryLoad { path: path_s.clone(), reason: e.to_string() })?;
			let api = Api {
				new: symbol(&lib, &path_s, b"tcc_new\0")?,
				delete: symbol(&lib, &path_s, b"tcc_delete\0")?,
				set_lib_path: symbol(&lib, &path_s, b"tcc_set_lib_path\0")?,
				set_error_func: symbol(&lib, &path_s, b"tcc_set_error_func\0")?,
				set_options: symbol(&lib, &path_s, b"tcc_set_options\0")?,
				add_include_path: symbol(&lib, &path_s, b"tcc_add_include_path\0")?,
				add_sysinclude_path: symbol(&lib, &path_s, b"tcc_add_sysinclude_path\0")?,
				define_symbol: symbol(&lib, &path_s, b"tcc_define_symbol\0")?,
				undefine_symbol: symbol(&lib, &path_s, b"tcc_undefine_symbol\0")?,
				add_file: symbol(&lib, &path_s, b"tcc_add_file\0")?,
				compile_string: symbol(&lib, &path_s, b"tcc_compile_string\0")?,
				set_output_type: symbol(&lib, &path_s, b"tcc_set_output_type\0")?,
				add_library_path: symbol(&lib, &path_s, b"tcc_add_library_path\0")?,
				add_library: symbol(&lib, &path_s, b"tcc_add_library\0")?,
				add_symbol: symbol(&lib, &path_s, b"tcc_add_symbol\0")?,
				run: symbol(&lib, &path_s, b"tcc_run\0")?,
				relocate: symbol(&lib, &path_s, b"tcc_relocate\0")?,
				get_symbol: symbol(&lib, &path_s, b"tcc_get_symbol\0")?,
				};
			Ok(TccLibrary { path: path_s, api: api, _lib: lib })
		}
	}
}

unsafe fn symbol<T: Copy>(lib: &libloading::Library, path: &str, name: &[u8]) -> Result<T>
{
	let sym: libloading::Symbol<T> = lib.get(name)
		.map_err(|e| Error::LibraryLoad { path: path.to_owned(), reason: e.to_string() })?;
	Ok(*sym)
}

/// One libtcc compilation context
pub struct TccBackend
{
	lib: &'static TccLibrary,
	state: NonNull<TCCState>,
	/// Owned, handed to libtcc as the error callback's opaque pointer
	diagnostics: *mut Vec<String>,
	output_set: bool,
}

impl TccBackend
{
	pub fn new(lib: &'static TccLibrary) -> Result<TccBackend>
	{
		let state = NonNull::new(unsafe { (lib.api.new)() })
			.ok_or_else(|| Error::LibraryLoad { path: lib.path.clone(), reason: "tcc_new failed".to_owned() })?;
		let diagnostics = Box::into_raw(Box::new(Vec::new()));
		unsafe { (lib.api.set_error_func)(state.as_ptr(), diagnostics as *mut c_void, collect_diagnostic) };
		Ok(TccBackend { lib: lib, state: state, diagnostics: diagnostics, output_set: false })
	}

	fn s(&self) -> *mut TCCState
	{
		self.state.as_ptr()
	}

	// libtcc reads the runtime library path when the output type is set, so that waits for
	// the first operation that needs it
	fn prepare(&mut self)
	{
		if !self.output_set {
			unsafe { (self.lib.api.set_output_type)(self.s(), TCC_OUTPUT_MEMORY) };
			self.output_set = true;
		}
	}
}

impl Drop for TccBackend
{
	fn drop(&mut self)
	{
		debug!("tcc_delete({:p})", self.state);
		unsafe {
			(self.lib.api.delete)(self.s());
			drop(Box::from_raw(self.diagnostics));
		}
	}
}

extern "C" fn collect_diagnostic(opaque: *mut c_void, msg: *const c_char)
{
	if opaque.is_null() || msg.is_null() {
		return ;
	}
	let msg = unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned();
	warn!("tcc: {}", msg);
	unsafe { (*(opaque as *mut Vec<String>)).push(msg) };
}

impl Backend for TccBackend
{
	fn set_lib_path(&mut self, path: &CStr)
	{
		unsafe { (self.lib.api.set_lib_path)(self.s(), path.as_ptr()) }
	}
	fn set_options(&mut self, options: &CStr)
	{
		unsafe { (self.lib.api.set_options)(self.s(), options.as_ptr()) }
	}
	fn add_include_path(&mut self, path: &CStr) -> bool
	{
		unsafe { (self.lib.api.add_include_path)(self.s(), path.as_ptr()) == 0 }
	}
	fn add_sysinclude_path(&mut self, path: &CStr) -> bool
	{
		unsafe { (self.lib.api.add_sysinclude_path)(self.s(), path.as_ptr()) == 0 }
	}
	fn define_symbol(&mut self, name: &CStr, value: Option<&CStr>)
	{
		let value = value.map(|v| v.as_ptr()).unwrap_or(::std::ptr::null());
		unsafe { (self.lib.api.define_symbol)(self.s(), name.as_ptr(), value) }
	}
	fn undefine_symbol(&mut self, name: &CStr)
	{
		unsafe { (self.lib.api.undefine_symbol)(self.s(), name.as_ptr()) }
	}
	fn add_library_path(&mut self, path: &CStr) -> bool
	{
		unsafe { (self.lib.api.add_library_path)(self.s(), path.as_ptr()) == 0 }
	}
	fn add_library(&mut self, name: &CStr) -> bool
	{
		self.prepare();
		unsafe { (self.lib.api.add_library)(self.s(), name.as_ptr()) == 0 }
	}
	fn add_file(&mut self, path: &CStr) -> bool
	{
		self.prepare();
		unsafe { (self.lib.api.add_file)(self.s(), path.as_ptr()) == 0 }
	}
	fn add_symbol(&mut self, name: &CStr, address: *const c_void) -> bool
	{
		unsafe { (self.lib.api.add_symbol)(self.s(), name.as_ptr(), address) == 0 }
	}

	fn compile_string(&mut self, source: &CStr) -> bool
	{
		self.prepare();
		unsafe { (self.lib.api.compile_string)(self.s(), source.as_ptr()) == 0 }
	}
	fn relocate(&mut self) -> bool
	{
		self.prepare();
		unsafe { (self.lib.api.relocate)(self.s(), TCC_RELOCATE_AUTO as *mut c_void) >= 0 }
	}
	fn get_symbol(&self, name: &CStr) -> Option<NonNull<u8>>
	{
		NonNull::new(unsafe { (self.lib.api.get_symbol)(self.s(), name.as_ptr()) } as *mut u8)
	}
	fn run(&mut self, argv: &[CString]) -> i32
	{
		self.prepare();
		let mut ptrs: Vec<*mut c_char> = argv.iter().map(|a| a.as_ptr() as *mut c_char).collect();
		let argc = ptrs.len() as c_int;
		ptrs.push(::std::ptr::null_mut());
		unsafe { (self.lib.api.run)(self.s(), argc, ptrs.as_mut_ptr()) }
	}

	fn take_diagnostics(&mut self) -> Vec<String>
	{
		::std::mem::replace(unsafe { &mut *self.diagnostics }, Vec::new())
	}
}
