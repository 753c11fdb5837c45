//! Compiler state configuration
use std::path::PathBuf;

/// Everything applied to a fresh compiler state before any code is compiled
#[derive(Debug,Clone,Default)]
pub struct Config
{
	/// libtcc shared object (default: `default_library_name()` on the loader search path)
	pub library: Option<PathBuf>,
	/// Directory holding `libtcc1.a` and tcc's own headers
	pub lib_path: Option<PathBuf>,
	pub include_paths: Vec<PathBuf>,
	pub sysinclude_paths: Vec<PathBuf>,
	pub library_paths: Vec<PathBuf>,
	pub libraries: Vec<String>,
	/// `(name, value)` preprocessor definitions
	pub defines: Vec<(String, Option<String>)>,
	/// Raw command-line style options (e.g. `"-Wall -O2"`)
	pub options: Option<String>,
}

impl Config
{
	/// Defaults, overridden by `CINLINE_LIBTCC`, `CINLINE_TCC_DIR`, `CINLINE_INCLUDE_PATH` and
	/// `CINLINE_LIBRARY_PATH` (the latter two are path lists)
	pub fn from_env() -> Config
	{
		let mut rv = Config::default();
		if let Some(v) = ::std::env::var_os("CINLINE_LIBTCC") {
			rv.library = Some(PathBuf::from(v));
		}
		if let Some(v) = ::std::env::var_os("CINLINE_TCC_DIR") {
			rv.lib_path = Some(PathBuf::from(v));
		}
		if let Some(v) = ::std::env::var_os("CINLINE_INCLUDE_PATH") {
			rv.include_paths.extend(::std::env::split_paths(&v));
		}
		if let Some(v) = ::std::env::var_os("CINLINE_LIBRARY_PATH") {
			rv.library_paths.extend(::std::env::split_paths(&v));
		}
		debug!("config from environment: {:?}", rv);
		rv
	}

	/// Add a `-D` style definition (`NAME` or `NAME=VALUE`)
	pub fn define(&mut self, def: &str) -> &mut Self
	{
		let mut it = def.splitn(2, '=');
		let name = it.next().unwrap_or("").to_owned();
		let value = it.next().map(|v| v.to_owned());
		self.defines.push( (name, value) );
		self
	}

	pub fn library_file(&self) -> PathBuf
	{
		self.library.clone().unwrap_or_else(default_library_name)
	}
}

/// File name of libtcc on the host platform
pub fn default_library_name() -> PathBuf
{
	use target_lexicon::{OperatingSystem, Triple};
	let name = match Triple::host().operating_system
		{
		OperatingSystem::Windows => "libtcc.dll",
		_ if cfg!(target_vendor = "apple") => "libtcc.dylib",
		_ => "libtcc.so",
		};
	PathBuf::from(name)
}
