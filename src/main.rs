/*!
 * Compile a C file in memory and run it
 */
#[macro_use]
extern crate log;
extern crate env_logger;

use cinline::{CompilerState, Config};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Options
{
	#[structopt(parse(from_os_str))]
	input: ::std::path::PathBuf,

	/// Arguments passed to the program's `main`
	args: Vec<String>,

	#[structopt(short="I",parse(from_os_str))]
	include_dirs: Vec<::std::path::PathBuf>,

	#[structopt(short="L",parse(from_os_str))]
	library_dirs: Vec<::std::path::PathBuf>,

	#[structopt(short="l")]
	libraries: Vec<String>,

	/// `-D FOO=bar`
	#[structopt(short="D")]
	defines: Vec<String>,

	/// libtcc shared object to load
	#[structopt(long="libtcc",parse(from_os_str))]
	libtcc: Option<::std::path::PathBuf>,

	/// Directory holding libtcc1.a and tcc's headers
	#[structopt(short="B",parse(from_os_str))]
	tcc_dir: Option<::std::path::PathBuf>,
}

fn main()
{
	env_logger::init();

	// 1. Parse command line arguments
	let args = Options::from_args();

	let mut config = Config::from_env();
	config.include_paths.extend(args.include_dirs);
	config.library_paths.extend(args.library_dirs);
	config.libraries.extend(args.libraries);
	for d in &args.defines {
		config.define(d);
	}
	if args.libtcc.is_some() {
		config.library = args.libtcc;
	}
	if args.tcc_dir.is_some() {
		config.lib_path = args.tcc_dir;
	}

	match run(&config, &args.input, &args.args)
	{
	Err(e) => {
		error!("{}", e);
		eprintln!("{}: {}", args.input.display(), e);
		::std::process::exit(1);
		},
	Ok(status) => ::std::process::exit(status),
	}
}

fn run(config: &Config, input: &::std::path::Path, args: &[String]) -> cinline::Result<i32>
{
	let mut state = CompilerState::with_config(config)?;
	state.add_file(input)?;

	let name = input.display().to_string();
	let mut argv = vec![&name[..]];
	argv.extend(args.iter().map(|a| &a[..]));
	debug!("running {:?}", argv);
	state.run(&argv)
}

// vim: ft=rust
