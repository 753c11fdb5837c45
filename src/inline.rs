//! Inline C code generation
//!
//! Declarations carry C text, a forward declaration, and the symbols the host wants back once
//! the code is compiled. A `CodeGenerator` assembles them into one translation unit and, after
//! relocation, binds every pending symbol.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use once_cell::unsync::OnceCell;

use crate::declarator;
use crate::error::{Error, Result};
use crate::function::{Callback, NativeFunction, PendingCall};
use crate::state::{CompilerState, Stage};
use crate::types::{FunctionType, StructRef, TypeRef};
use crate::value::{Handle, Value};

/// Body text of a declaration
pub enum Code
{
	Text(String),
	/// Definition of a named struct, produced from its layout when the code is emitted
	Struct(StructRef),
}
impl Code
{
	fn render(&self) -> Result<String>
	{
		match *self
		{
		Code::Text(ref s) => Ok(s.clone()),
		Code::Struct(ref sr) => declarator::struct_definition(sr),
		}
	}
}

/// A symbol to bind once the code is relocated
pub enum PendingSymbol
{
	/// Resolved into a live `Handle`
	Value(String, TypeRef),
	/// Resolved into a `NativeFunction`
	Function(String, FunctionType),
	/// A host function stored into the C function pointer of that name
	Callback(String, Rc<Callback>),
}
impl PendingSymbol
{
	pub fn name(&self) -> &str
	{
		match *self
		{
		PendingSymbol::Value(ref n, _) => n,
		PendingSymbol::Function(ref n, _) => n,
		PendingSymbol::Callback(ref n, _) => n,
		}
	}
}

/// A bound symbol
#[derive(Clone,Debug)]
pub enum Bound
{
	Value(Handle),
	Function(NativeFunction),
}
impl Bound
{
	pub fn as_value(&self) -> Option<&Handle>
	{
		match *self
		{
		Bound::Value(ref h) => Some(h),
		_ => None,
		}
	}
	pub fn as_function(&self) -> Option<&NativeFunction>
	{
		match *self
		{
		Bound::Function(ref f) => Some(f),
		_ => None,
		}
	}
}

/// All symbols bound by a generator, by name
#[derive(Default,Debug)]
pub struct SymbolMap
{
	symbols: HashMap<String, Bound>,
}
impl SymbolMap
{
	pub fn get(&self, name: &str) -> Option<&Bound>
	{
		self.symbols.get(name)
	}
	pub fn value(&self, name: &str) -> Result<&Handle>
	{
		self.get(name).and_then(|b| b.as_value())
			.ok_or_else(|| Error::SymbolNotFound { name: name.to_owned() })
	}
	pub fn function(&self, name: &str) -> Result<&NativeFunction>
	{
		self.get(name).and_then(|b| b.as_function())
			.ok_or_else(|| Error::SymbolNotFound { name: name.to_owned() })
	}
	pub fn len(&self) -> usize
	{
		self.symbols.len()
	}
	pub fn is_empty(&self) -> bool
	{
		self.symbols.is_empty()
	}
	pub fn names(&self) -> impl Iterator<Item=&str>
	{
		self.symbols.keys().map(|k| &k[..])
	}
}

pub struct Declaration
{
	code: Code,
	forward: String,
	symbols: Vec<PendingSymbol>,
	resolved: RefCell<HashMap<String, Bound>>,
}

impl Declaration
{
	pub fn new(code: &str, forward: &str, symbols: Vec<PendingSymbol>) -> Declaration
	{
		Declaration::from_code(Code::Text(code.to_owned()), forward, symbols)
	}
	/// Code-only declaration, e.g. for `add_top_declaration`
	pub fn text(code: &str) -> Declaration
	{
		Declaration::new(code, "", Vec::new())
	}
	pub fn from_code(code: Code, forward: &str, symbols: Vec<PendingSymbol>) -> Declaration
	{
		Declaration {
			code: code,
			forward: forward.to_owned(),
			symbols: symbols,
			resolved: RefCell::new(HashMap::new()),
			}
	}

	/// Forward declaration and (deferred) definition of a named struct
	pub fn for_struct(sr: &StructRef) -> Result<Declaration>
	{
		if sr.borrow().name == "" {
			return Err(Error::IllegalDeclaration { what: "struct has no C name (use c_struct)".to_owned() });
		}
		let forward = declarator::struct_forward(sr)?;
		Ok(Declaration::from_code(Code::Struct(sr.clone()), &forward, Vec::new()))
	}

	pub fn code(&self) -> Result<String>
	{
		self.code.render()
	}
	pub fn forward(&self) -> &str
	{
		&self.forward
	}
	pub fn symbols(&self) -> &[PendingSymbol]
	{
		&self.symbols
	}
	/// A symbol of this declaration, once bound
	pub fn resolved(&self, name: &str) -> Option<Bound>
	{
		self.resolved.borrow().get(name).cloned()
	}
}

/// Anything `CodeGenerator::add_declaration` accepts
pub trait IntoDeclaration
{
	fn into_declaration(self) -> Result<Rc<Declaration>>;
}
impl IntoDeclaration for Declaration
{
	fn into_declaration(self) -> Result<Rc<Declaration>>
	{
		Ok(Rc::new(self))
	}
}
impl IntoDeclaration for Rc<Declaration>
{
	fn into_declaration(self) -> Result<Rc<Declaration>>
	{
		Ok(self)
	}
}
impl<'a> IntoDeclaration for &'a CFunction
{
	fn into_declaration(self) -> Result<Rc<Declaration>>
	{
		Ok(self.declaration.clone())
	}
}
impl<'a> IntoDeclaration for &'a StructRef
{
	fn into_declaration(self) -> Result<Rc<Declaration>>
	{
		Declaration::for_struct(self).map(Rc::new)
	}
}

#[derive(Default)]
pub struct CodeGenerator
{
	top: Vec<Rc<Declaration>>,
	parts: Vec<Rc<Declaration>>,
	symbols: OnceCell<Rc<SymbolMap>>,
}

impl CodeGenerator
{
	pub fn new() -> CodeGenerator
	{
		CodeGenerator::default()
	}

	/// Headers and typedefs used by most inline code
	pub fn load_basic_types(&mut self)
	{
		self.top.push(Rc::new(Declaration::text("#include <stddef.h>\n#include <stdint.h>\n#include <stdbool.h>")));
		self.top.push(Rc::new(Declaration::text(BASIC_TYPEDEFS)));
	}

	/// Append to the top section. Only the declaration's code is used.
	pub fn add_top_declaration<D: IntoDeclaration>(&mut self, decl: D) -> Result<()>
	{
		self.top.push(decl.into_declaration()?);
		Ok( () )
	}

	/// Append a declaration. Output order is add order.
	pub fn add_declaration<D: IntoDeclaration>(&mut self, decl: D) -> Result<()>
	{
		let decl = decl.into_declaration()?;
		trace!("add_declaration: {:?}", decl.forward);
		self.parts.push(decl);
		Ok( () )
	}

	pub fn declarations(&self) -> &[Rc<Declaration>]
	{
		&self.parts
	}

	/// The full translation unit
	pub fn code(&self) -> Result<String>
	{
		let mut top = Vec::with_capacity(self.top.len());
		for d in &self.top {
			top.push(d.code()?);
		}
		let forward: Vec<&str> = self.parts.iter().map(|d| d.forward()).collect();
		let mut code = Vec::with_capacity(self.parts.len());
		for d in &self.parts {
			code.push(d.code()?);
		}
		Ok(format!("/* top */\n{}\n\n/* forward */\n{}\n\n/* code */\n{}\n",
			top.join("\n"), forward.join("\n"), code.join("\n")))
	}

	/// `code()` with each line prefixed by its zero-padded number
	pub fn code_with_line_numbers(&self) -> Result<String>
	{
		let code = self.code()?;
		let lines: Vec<&str> = code.split('\n').collect();
		let width = lines.len().to_string().len();
		Ok(lines.iter().enumerate()
			.map(|(i, l)| format!("{:0w$}: {}", i + 1, l, w = width))
			.collect::<Vec<_>>()
			.join("\n"))
	}

	/// Bind every pending symbol against a relocated state
	///
	/// The first successful call resolves, later calls return the same map.
	pub fn bind_state(&self, state: &CompilerState) -> Result<Rc<SymbolMap>>
	{
		self.symbols.get_or_try_init(|| self.bind(state)).map(|m| m.clone())
	}

	/// Resolves everything first. Declarations and callback slots are only touched once every
	/// symbol was found.
	fn bind(&self, state: &CompilerState) -> Result<Rc<SymbolMap>>
	{
		if state.stage() != Stage::Relocated {
			return Err(Error::InvalidState { operation: "bind_state", stage: state.stage().name() });
		}
		let mut resolved = Vec::new();
		let mut callbacks = Vec::new();
		for decl in &self.parts
		{
			for sym in &decl.symbols
			{
				let bound = match *sym
					{
					PendingSymbol::Callback(ref name, ref cb) => {
						state.symbol_address(name)?;
						callbacks.push( (name, cb) );
						continue ;
						},
					PendingSymbol::Value(ref name, ref ty) => Bound::Value(state.resolve_symbol(name, ty)?),
					PendingSymbol::Function(ref name, ref ft) => Bound::Function(state.resolve_function(name, ft)?),
					};
				resolved.push( (decl, sym.name(), bound) );
			}
		}

		for (name, cb) in callbacks
		{
			debug!("bind callback {}", name);
			state.set_function(name, cb.clone())?;
		}
		let mut all = SymbolMap::default();
		for (decl, name, bound) in resolved
		{
			debug!("bind {}", name);
			decl.resolved.borrow_mut().insert(name.to_owned(), bound.clone());
			all.symbols.insert(name.to_owned(), bound);
		}
		Ok(Rc::new(all))
	}
}

const BASIC_TYPEDEFS: &str = "\
typedef int8_t int8;
typedef int16_t int16;
typedef int32_t int32;
typedef int64_t int64;
typedef uint8_t uint8;
typedef uint16_t uint16;
typedef uint32_t uint32;
typedef uint64_t uint64;
typedef void* Object;
typedef char* CString;
typedef unsigned char byte;
typedef unsigned char uchar;
typedef unsigned short ushort;
typedef unsigned int uint;
typedef unsigned long ulong;
typedef long long longlong;
typedef unsigned long long ulonglong;";

/// Host-side proxy of a C function defined with `c_function`
pub struct CFunction
{
	name: String,
	declaration: Rc<Declaration>,
}

impl CFunction
{
	pub fn name(&self) -> &str
	{
		&self.name
	}
	pub fn declaration(&self) -> &Rc<Declaration>
	{
		&self.declaration
	}
	pub fn is_bound(&self) -> bool
	{
		self.bound().is_ok()
	}

	pub fn call(&self, args: &[Value]) -> Result<Value>
	{
		self.bound()?.call(args)
	}
	pub fn call_async(&self, args: &[Value]) -> Result<PendingCall>
	{
		self.bound()?.call_async(args)
	}

	fn bound(&self) -> Result<NativeFunction>
	{
		match self.declaration.resolved(&self.name)
		{
		Some(Bound::Function(f)) => Ok(f),
		_ => Err(Error::NotBound { name: self.name.clone() }),
		}
	}
}

/// Define a C function, callable from the host once its generator is bound
pub fn c_function(ret: &TypeRef, name: &str, args: &[(TypeRef, &str)], body: &str) -> Result<CFunction>
{
	let args: Vec<(TypeRef, String)> = args.iter().map(|(t, n)| (t.clone(), n.to_string())).collect();
	let header = declarator::declare_function_header(ret, name, &args, false, false)?;
	let ft = FunctionType::new(ret.clone(), args);
	let declaration = Declaration::new(
		&format!("{}\n{{\n{}\n}}\n", header, body),
		&format!("{};", header),
		vec![PendingSymbol::Function(name.to_owned(), ft)],
		);
	Ok(CFunction { name: name.to_owned(), declaration: Rc::new(declaration) })
}

/// Declare a C function pointer `name`, set to host function `f` at bind time
pub fn c_callable<F>(ret: &TypeRef, name: &str, args: &[TypeRef], f: F) -> Result<Declaration>
where
	F: Fn(&[Value]) -> Value + Send + Sync + 'static
{
	let ft = FunctionType::unnamed(ret.clone(), args);
	let forward = declarator::declare_function_header(ret, name, &ft.args, false, true)?;
	let callback = Rc::new(Callback::new(name, &ft, f)?);
	Ok(Declaration::new("", &format!("{} = 0;", forward), vec![PendingSymbol::Callback(name.to_owned(), callback)]))
}

/// Give a struct its C name, so it can be referenced from and added to generated code
pub fn c_struct(name: &str, sr: &StructRef) -> StructRef
{
	sr.borrow_mut().name = name.to_owned();
	sr.clone()
}
