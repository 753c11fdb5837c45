//! CompilerState against the real libtcc
//!
//! Skipped when libtcc can't be loaded (set `CINLINE_LIBTCC` and `CINLINE_TCC_DIR` to point at
//! a build).
use cinline::types::{IntClass, Signedness};
use cinline::{CompilerState, Error, Stage, Type, Value};

static SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

fn new_state() -> Option<CompilerState>
{
	let _ = env_logger::builder().is_test(true).try_init();
	match CompilerState::from_env()
	{
	Ok(s) => Some(s),
	Err(Error::LibraryLoad { path, reason }) => {
		eprintln!("skipping, libtcc not available ({}: {})", path, reason);
		None
		},
	Err(e) => panic!("creating state: {}", e),
	}
}

macro_rules! state_or_skip {
	() => {
		match new_state()
		{
		Some(s) => s,
		None => return,
		}
	};
}

#[test]
fn run_main()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	state.compile("int main(int argc, char **argv) { return argc == 2 ? 123 : 1; }").unwrap();
	assert_eq!(state.run(&["prog", "arg"]).unwrap(), 123);
	assert_eq!(state.stage(), Stage::Relocated);
}

#[test]
fn resolve_and_set()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	state.compile("int x = 123;").unwrap();
	state.relocate().unwrap();
	let x = state.resolve_symbol("x", &Type::int()).unwrap();
	assert_eq!(x.get().unwrap(), Value::Int(123));
	state.set_symbol("x", &Type::int(), 999).unwrap();
	assert_eq!(state.resolve_symbol("x", &Type::int()).unwrap().get().unwrap(), Value::Int(999));
	match state.resolve_symbol("y", &Type::int())
	{
	Err(Error::SymbolNotFound { name }) => assert_eq!(name, "y"),
	r => panic!("unexpected {:?}", r),
	}
}

#[test]
fn scalar_round_trip()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	state.compile("\
		signed char c = -5;
		unsigned short us = 65535;
		unsigned int u = 4000000000u;
		long long ll = -1234567890123ll;
		float f = 1.5f;
		double d = -2.25;
		_Bool b = 1;
		").unwrap();
	state.relocate().unwrap();
	let check = |name: &str, ty: &str, v: Value| {
		let h = state.resolve_symbol(name, &Type::parse(ty).unwrap()).unwrap();
		assert_eq!(h.get().unwrap(), v, "{}", name);
	};
	check("c", "signed char", Value::Int(-5));
	check("us", "unsigned short", Value::UInt(65535));
	check("u", "unsigned int", Value::UInt(4000000000));
	check("ll", "long long", Value::Int(-1234567890123));
	check("f", "float", Value::Float(1.5));
	check("d", "double", Value::Double(-2.25));
	check("b", "_Bool", Value::Bool(true));
}

#[test]
fn functions()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	state.compile("\
		int test(int a) { return a + 1; }
		double scale(double v, unsigned char k) { return v * k; }
		").unwrap();
	state.relocate().unwrap();
	let test = state.get_function("test", &Type::int(), &[Type::int()]).unwrap();
	assert_eq!(test.call(&[Value::Int(41)]).unwrap(), Value::Int(42));
	let scale = state.get_function("scale", &Type::double(),
		&[Type::double(), Type::integer(IntClass::Char(Some(Signedness::Unsigned)))]).unwrap();
	assert_eq!(scale.call(&[Value::Double(0.5), Value::UInt(3)]).unwrap(), Value::Double(1.5));

	let pending = test.call_async(&[Value::Int(1)]).unwrap();
	assert_eq!(pending.wait().unwrap(), Value::Int(2));
}

#[test]
fn callback_through_pointer()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	state.compile("\
		int (*cb)(int, int) = 0;
		int use_cb(void) { return cb(23, 42); }
		").unwrap();
	state.relocate().unwrap();
	let ft = cinline::FunctionType::unnamed(Type::int(), &[Type::int(), Type::int()]);
	let cb = std::rc::Rc::new(cinline::Callback::new("cb", &ft, |a| {
		Value::Int(a[0].as_i64().unwrap() + a[1].as_i64().unwrap())
		}).unwrap());
	state.set_function("cb", cb).unwrap();
	let f = state.get_function("use_cb", &Type::int(), &[]).unwrap();
	assert_eq!(f.call(&[]).unwrap(), Value::Int(65));
}

#[test]
fn compile_error()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	match state.compile("int x = ;")
	{
	Err(Error::Compile { diagnostics }) => assert!(!diagnostics.is_empty()),
	r => panic!("unexpected {:?}", r),
	}
	assert_eq!(state.stage(), Stage::Failed);
}

#[test]
fn missing_file()
{
	let _g = SERIAL.lock();
	let mut state = state_or_skip!();
	match state.add_file(std::path::Path::new("/nonexistent/file.c"))
	{
	Err(Error::Config { operation, argument }) => {
		assert_eq!(operation, "add_file");
		assert_eq!(argument, "/nonexistent/file.c");
		},
	r => panic!("unexpected {:?}", r),
	}
}

#[test]
fn one_state_in_flight()
{
	let _g = SERIAL.lock();
	let mut first = state_or_skip!();
	match CompilerState::from_env()
	{
	Err(Error::StateInFlight) => {},
	r => panic!("unexpected {:?}", r.map(|s| s.stage())),
	}
	first.compile("int v;").unwrap();
	first.relocate().unwrap();
	let _second = CompilerState::from_env().unwrap();
}
