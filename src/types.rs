//! C types
//!
//! The descriptor model shared by declaration synthesis and symbol resolution. Sizes and
//! alignments follow the host C ABI.

use std::rc::Rc;
use std::cell::RefCell;

use crate::error::{Error, Result};

#[derive(PartialEq)]
pub struct Type
{
	pub basetype: BaseType,
	pub qualifiers: Qualifiers,
}

#[derive(PartialEq,Clone)]	/* Debug impl is manual */
pub enum BaseType
{
	Void,
	Bool,
	Struct(StructRef),
	Float(FloatClass),
	Integer(IntClass),

	Pointer(TypeRef),
	Array(TypeRef, ArraySize),
	Function(FunctionType),
}
#[derive(Clone,Copy,PartialEq,Debug)]
pub enum ArraySize
{
	None,
	Fixed(u64),
}

/// Boolean signedness
#[derive(Debug,PartialEq,Eq,Hash,Clone,Copy)]
pub enum Signedness
{
	Signed,
	Unsigned,
}
pub use self::Signedness::*;
impl Signedness {
	pub fn is_unsigned(&self) -> bool { *self == Signedness::Unsigned }
}
/// Qualifiers on a type (const, volatile, restrict)
// NOTE: `const volatile` is valid and has meaning (code can't change it, but hardware could)
#[derive(PartialEq,Clone,Default)]
pub struct Qualifiers {
	v: u8,
}
impl Qualifiers {
	pub fn new() -> Self { Qualifiers { v: 0 } }

	pub fn set_const(&mut self) -> &mut Self { self.v |= 1; self }
	pub fn set_volatile(&mut self) -> &mut Self { self.v |= 2; self }
	pub fn set_restrict(&mut self) -> &mut Self { self.v |= 4; self }

	pub fn is_const(&self) -> bool { self.v & 1 != 0 }
	pub fn is_volatile(&self) -> bool { self.v & 2 != 0 }
	pub fn is_restrict(&self) -> bool { self.v & 4 != 0 }
	pub fn is_empty(&self) -> bool { self.v == 0 }

	pub fn merge_from(&mut self, other: &Qualifiers) {
		self.v |= other.v;
	}
}
impl ::std::fmt::Debug for Qualifiers {
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
		write!(f, "{}{}{}",
			if self.is_const() { "const " } else { "" },
			if self.is_volatile() { "volatile " } else { "" },
			if self.is_restrict() { "restrict " } else { "" },
			)
	}
}

/// Various integer types
#[derive(Debug,PartialEq,Clone,Copy)]
pub enum IntClass
{
	/// Fixed-size type (`intN_t`/`uintN_t`)
	Bits(Signedness,u8),
	/// `char` (three variants: char, signed char, and unsigned char)
	Char(Option<Signedness>),
	/// `[un]signed short [int]`
	Short(Signedness),
	/// `[un]signed int`
	Int(Signedness),
	/// `[un]signed long [int]`
	Long(Signedness),
	/// `[un]signed long long [int]`
	LongLong(Signedness),
}
impl IntClass {
	pub fn char() -> Self { IntClass::Char(None) }
	pub const fn int() -> Self { IntClass::Int(Signed) }

	pub fn signedness(&self) -> Signedness {
		match *self
		{
		IntClass::Bits(s,_) => s,
		// Plain `char` signedness is target-defined
		IntClass::Char(None) => if ::std::os::raw::c_char::MIN == 0 { Unsigned } else { Signed },
		IntClass::Char(Some(s)) => s,
		IntClass::Short(s) | IntClass::Int(s) | IntClass::Long(s) | IntClass::LongLong(s) => s,
		}
	}
	pub fn size(&self) -> usize {
		use std::mem::size_of;
		use std::os::raw;
		match *self
		{
		IntClass::Bits(_,b) => b as usize / 8,
		IntClass::Char(_) => 1,
		IntClass::Short(_) => size_of::<raw::c_short>(),
		IntClass::Int(_) => size_of::<raw::c_int>(),
		IntClass::Long(_) => size_of::<raw::c_long>(),
		IntClass::LongLong(_) => size_of::<raw::c_longlong>(),
		}
	}
	/// Size and alignment, which differ for 64-bit integers on some 32-bit ABIs
	pub fn layout(&self) -> Layout {
		use std::os::raw;
		match *self
		{
		IntClass::Bits(_,8) | IntClass::Char(_) => Layout::of::<raw::c_char>(),
		IntClass::Bits(_,16) | IntClass::Short(_) => Layout::of::<raw::c_short>(),
		IntClass::Bits(_,32) => Layout::of::<i32>(),
		IntClass::Bits(_,_) => Layout::of::<i64>(),
		IntClass::Int(_) => Layout::of::<raw::c_int>(),
		IntClass::Long(_) => Layout::of::<raw::c_long>(),
		IntClass::LongLong(_) => Layout::of::<raw::c_longlong>(),
		}
	}
}

#[derive(Debug,PartialEq,Clone,Copy)]
pub enum FloatClass
{
	Float,
	Double,
	LongDouble,
}
impl FloatClass {
	pub fn layout(&self) -> Layout {
		match *self
		{
		FloatClass::Float => Layout::of::<f32>(),
		FloatClass::Double => Layout::of::<f64>(),
		FloatClass::LongDouble => long_double_layout(),
		}
	}
}

/// `long double` is the one scalar Rust has no type for
fn long_double_layout() -> Layout
{
	use target_lexicon::{Architecture, OperatingSystem, Triple};
	let host = Triple::host();
	let is_windows = host.operating_system == OperatingSystem::Windows;
	let is_darwin = cfg!(target_vendor = "apple");
	match host.architecture
	{
	Architecture::X86_64 if !is_windows => Layout { size: 16, align: 16 },
	Architecture::Aarch64(_) if !is_windows && !is_darwin => Layout { size: 16, align: 16 },
	Architecture::X86_32(_) if !is_windows => Layout { size: 12, align: 4 },
	_ => Layout::of::<f64>(),
	}
}

/// Size and alignment of a type, in bytes
#[derive(Debug,PartialEq,Clone,Copy)]
pub struct Layout
{
	pub size: usize,
	pub align: usize,
}
impl Layout
{
	pub fn of<T>() -> Layout {
		Layout { size: ::std::mem::size_of::<T>(), align: ::std::mem::align_of::<T>() }
	}
}

fn align_up(v: usize, align: usize) -> usize
{
	(v + align - 1) / align * align
}

pub type TypeRef = Rc<Type>;
pub type StructRef = Rc<RefCell<Struct>>;

/// A function signature. Arguments with an empty name are unnamed.
#[derive(Clone,PartialEq)]
pub struct FunctionType
{
	pub ret: TypeRef,
	pub args: Vec<(TypeRef,String)>,
	pub variadic: bool,
}
impl FunctionType
{
	pub fn new(ret: TypeRef, args: Vec<(TypeRef,String)>) -> Self
	{
		FunctionType { ret: ret, args: args, variadic: false }
	}
	/// Signature with unnamed arguments
	pub fn unnamed(ret: TypeRef, args: &[TypeRef]) -> Self
	{
		FunctionType::new(ret, args.iter().map(|t| (t.clone(), String::new())).collect())
	}
	pub fn arg_types(&self) -> impl Iterator<Item=&TypeRef>
	{
		self.args.iter().map(|a| &a.0)
	}
}
impl ::std::fmt::Debug for FunctionType
{
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		write!(f, "Fcn({:?}, {:?}{})", self.ret, self.args, if self.variadic { ", ..." } else { "" })
	}
}

#[derive(Debug,PartialEq,Clone)]
pub struct Field
{
	pub name: String,
	pub ty: TypeRef,
	pub offset: usize,
}

/// A struct. An empty name means it hasn't been named yet, and can't be referenced from C.
#[derive(Debug)]
pub struct Struct
{
	pub name: String,
	items: Vec<Field>,
	/// Set once the layout is fixed
	layout: Option<Layout>,
	/// Size and alignment imposed by `with_layout`
	explicit: Option<Layout>,
}

/// Structs compare by tag, unnamed ones by identity
impl PartialEq for Struct
{
	fn eq(&self, other: &Struct) -> bool
	{
		if self.name == "" || other.name == "" {
			::std::ptr::eq(self, other)
		}
		else {
			self.name == other.name
		}
	}
}

impl ::std::fmt::Debug for Type
{
	fn fmt(&self, fmt: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		write!(fmt, "{:?}{:?}", self.qualifiers, self.basetype)
	}
}

impl ::std::fmt::Debug for BaseType
{
	fn fmt(&self, fmt: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		match self
		{
		&BaseType::Void => write!(fmt, "void"),
		&BaseType::Bool => write!(fmt, "_Bool"),
		// Only the name, structs may refer to themselves through pointers
		&BaseType::Struct(ref sr) => match sr.try_borrow()
			{
			Ok(s) => write!(fmt, "struct {:?}", s.name),
			Err(_) => write!(fmt, "struct <busy>"),
			},
		&BaseType::Float(ref fc) => write!(fmt, "{:?}", fc),
		&BaseType::Integer(ref ic) => write!(fmt, "{:?}", ic),

		&BaseType::Array(ref typeref, ref size) => write!(fmt, "{:?}{}", typeref, size),
		&BaseType::Pointer(ref typeref) => write!(fmt, "*{:?}", typeref),
		&BaseType::Function(ref ft) => write!(fmt, "{:?}", ft),
		}
	}
}

impl ::std::fmt::Display for ArraySize
{
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		match self
		{
		&ArraySize::None => f.write_str("[]"),
		&ArraySize::Fixed(v) => write!(f, "[{}]", v),
		}
	}
}

impl Type
{
	pub fn new_ref_bare(basetype: BaseType) -> TypeRef
	{
		Type::new_ref(basetype, Qualifiers::new())
	}
	pub fn new_ref(basetype: BaseType, qualifiers: Qualifiers) -> TypeRef
	{
		Rc::new(Type {
			basetype: basetype,
			qualifiers: qualifiers,
			})
	}

	pub fn void() -> TypeRef { Type::new_ref_bare(BaseType::Void) }
	pub fn bool() -> TypeRef { Type::new_ref_bare(BaseType::Bool) }
	pub fn int() -> TypeRef { Type::integer(IntClass::int()) }
	pub fn char() -> TypeRef { Type::integer(IntClass::char()) }
	pub fn float() -> TypeRef { Type::new_ref_bare(BaseType::Float(FloatClass::Float)) }
	pub fn double() -> TypeRef { Type::new_ref_bare(BaseType::Float(FloatClass::Double)) }
	pub fn integer(ic: IntClass) -> TypeRef { Type::new_ref_bare(BaseType::Integer(ic)) }

	pub fn pointer_to(inner: &TypeRef) -> TypeRef
	{
		Type::new_ref_bare(BaseType::Pointer(inner.clone()))
	}
	pub fn array_of(inner: &TypeRef, count: u64) -> TypeRef
	{
		Type::new_ref_bare(BaseType::Array(inner.clone(), ArraySize::Fixed(count)))
	}
	pub fn unsized_array_of(inner: &TypeRef) -> TypeRef
	{
		Type::new_ref_bare(BaseType::Array(inner.clone(), ArraySize::None))
	}
	pub fn function(ft: FunctionType) -> TypeRef
	{
		Type::new_ref_bare(BaseType::Function(ft))
	}
	pub fn structure(sr: &StructRef) -> TypeRef
	{
		Type::new_ref_bare(BaseType::Struct(sr.clone()))
	}

	/// Copy of this type with extra qualifiers
	pub fn qualified(&self, qualifiers: &Qualifiers) -> TypeRef
	{
		let mut q = self.qualifiers.clone();
		q.merge_from(qualifiers);
		Type::new_ref(self.basetype.clone(), q)
	}

	/// Parse a scalar type name, optionally followed by `*`s (e.g. `"unsigned int"`, `"char *"`)
	///
	/// Accepts the C spellings, the `<stdint.h>` names and the short aliases declared by
	/// `CodeGenerator::load_basic_types`.
	pub fn parse(name: &str) -> Result<TypeRef>
	{
		let name = name.trim();
		if name.ends_with('*') {
			let inner = Type::parse(&name[.. name.len()-1])?;
			return Ok(Type::pointer_to(&inner));
		}
		let mut words: Vec<&str> = name.split_whitespace().collect();
		// `short int`, `unsigned long int` etc. are the same without the `int`
		if words.len() > 1 && words.last() == Some(&"int") && words.iter().any(|w| *w == "short" || *w == "long") {
			words.pop();
		}
		let bt = match &words[..]
			{
			["void"] => BaseType::Void,
			["_Bool"] | ["bool"] => BaseType::Bool,
			["float"] => BaseType::Float(FloatClass::Float),
			["double"] => BaseType::Float(FloatClass::Double),
			["long", "double"] => BaseType::Float(FloatClass::LongDouble),
			["char"] => BaseType::Integer(IntClass::Char(None)),
			["signed", "char"] => BaseType::Integer(IntClass::Char(Some(Signed))),
			["unsigned", "char"] | ["uchar"] | ["byte"] => BaseType::Integer(IntClass::Char(Some(Unsigned))),
			["short"] | ["signed", "short"] => BaseType::Integer(IntClass::Short(Signed)),
			["unsigned", "short"] | ["ushort"] => BaseType::Integer(IntClass::Short(Unsigned)),
			["int"] | ["signed"] | ["signed", "int"] => BaseType::Integer(IntClass::Int(Signed)),
			["unsigned"] | ["unsigned", "int"] | ["uint"] => BaseType::Integer(IntClass::Int(Unsigned)),
			["long"] | ["signed", "long"] => BaseType::Integer(IntClass::Long(Signed)),
			["unsigned", "long"] | ["ulong"] => BaseType::Integer(IntClass::Long(Unsigned)),
			["long", "long"] | ["signed", "long", "long"] | ["longlong"] => BaseType::Integer(IntClass::LongLong(Signed)),
			["unsigned", "long", "long"] | ["ulonglong"] => BaseType::Integer(IntClass::LongLong(Unsigned)),
			[w] => match parse_fixed_int(w)
				{
				Some(ic) => BaseType::Integer(ic),
				None => return Err(Error::UnknownTypeName { type_name: name.to_owned() }),
				},
			_ => return Err(Error::UnknownTypeName { type_name: name.to_owned() }),
			};
		Ok(Type::new_ref_bare(bt))
	}

	/// Size and alignment. Fixes the layout of any struct reached by value.
	pub fn layout(&self) -> Result<Layout>
	{
		Ok(match self.basetype
		{
		BaseType::Void => return Err(Error::IncompleteType { type_name: "void".to_owned() }),
		BaseType::Bool => Layout { size: 1, align: 1 },
		BaseType::Integer(ref ic) => ic.layout(),
		BaseType::Float(ref fc) => fc.layout(),
		BaseType::Pointer(_) => Layout::of::<*const u8>(),
		BaseType::Array(ref inner, ArraySize::Fixed(n)) => {
			let l = inner.layout()?;
			let size = <usize as ::std::convert::TryFrom<u64>>::try_from(n).ok()
				.and_then(|n| l.size.checked_mul(n))
				.ok_or_else(|| Error::IncompleteType { type_name: format!("{:?}", self) })?;
			Layout { size: size, align: l.align }
			},
		BaseType::Array(_, ArraySize::None) => return Err(Error::IncompleteType { type_name: format!("{:?}", self) }),
		BaseType::Function(_) => return Err(Error::IncompleteType { type_name: format!("{:?}", self) }),
		BaseType::Struct(ref sr) => {
			let mut s = sr.try_borrow_mut()
				.map_err(|_| Error::IncompleteType { type_name: format!("{:?}", self) })?;
			s.finalize()?
			},
		})
	}
	pub fn size(&self) -> Result<usize>
	{
		Ok(self.layout()?.size)
	}

	pub fn is_void(&self) -> bool
	{
		match self.basetype
		{
		BaseType::Void => true,
		_ => false,
		}
	}
}

fn parse_fixed_int(name: &str) -> Option<IntClass>
{
	let name = if name.ends_with("_t") { &name[..name.len()-2] } else { name };
	let (s, bits) = if name.starts_with("uint") {
			(Unsigned, &name[4..])
		}
		else if name.starts_with("int") {
			(Signed, &name[3..])
		}
		else {
			return None;
		};
	match bits
	{
	"8" | "16" | "32" | "64" => Some(IntClass::Bits(s, bits.parse().ok()?)),
	_ => None,
	}
}

impl Struct
{
	pub fn new_ref(name: &str) -> StructRef
	{
		Rc::new( RefCell::new(Struct {
			name: name.to_string(),
			items: Vec::new(),
			layout: None,
			explicit: None,
			}) )
	}
	/// A struct mirroring an existing layout: fields may be listed in any order
	pub fn with_layout(name: &str, items: Vec<Field>, size: usize, align: usize) -> StructRef
	{
		Rc::new( RefCell::new(Struct {
			name: name.to_string(),
			items: items,
			layout: None,
			explicit: Some(Layout { size: size, align: align }),
			}) )
	}

	pub fn is_finalized(&self) -> bool
	{
		self.layout.is_some()
	}

	/// Append a field using the natural C layout
	pub fn add_field(&mut self, name: &str, ty: TypeRef) -> Result<()>
	{
		if self.is_finalized() || self.explicit.is_some() {
			return Err(Error::StructFinalized { name: self.name.clone() });
		}
		self.items.push(Field { name: name.to_owned(), ty: ty, offset: 0 });
		Ok( () )
	}

	/// Fix the layout (computing offsets for naturally laid out structs)
	pub fn finalize(&mut self) -> Result<Layout>
	{
		if let Some(l) = self.layout {
			return Ok(l);
		}
		let layout = match self.explicit
			{
			Some(l) => l,
			None => {
				let mut ofs = 0;
				let mut align = 1;
				for f in &mut self.items
				{
					let l = f.ty.layout()?;
					ofs = align_up(ofs, l.align);
					f.offset = ofs;
					ofs += l.size;
					align = ::std::cmp::max(align, l.align);
				}
				Layout { size: align_up(ofs, align), align: align }
				},
			};
		debug!("finalize struct {:?}: {:?}", self.name, layout);
		self.layout = Some(layout);
		Ok(layout)
	}

	/// Fields sorted by ascending offset (finalizes the struct)
	pub fn fields_by_offset(&mut self) -> Result<Vec<Field>>
	{
		self.finalize()?;
		let mut items = self.items.clone();
		// Stable: zero-sized members keep their relative order
		items.sort_by_key(|f| f.offset);
		Ok(items)
	}
	pub fn field(&mut self, name: &str) -> Result<Field>
	{
		self.finalize()?;
		self.items.iter()
			.find(|f| f.name == name)
			.cloned()
			.ok_or_else(|| Error::SymbolNotFound { name: format!("{}.{}", self.name, name) })
	}
}

// vim: ft=rust

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parse_scalar_names()
	{
		assert_eq!(*Type::parse("int").unwrap(), *Type::int());
		assert_eq!(*Type::parse("unsigned long long int").unwrap(), *Type::integer(IntClass::LongLong(Unsigned)));
		assert_eq!(*Type::parse("uint8").unwrap(), *Type::integer(IntClass::Bits(Unsigned, 8)));
		assert_eq!(*Type::parse("int32_t").unwrap(), *Type::integer(IntClass::Bits(Signed, 32)));
		assert_eq!(*Type::parse("char **").unwrap(), *Type::pointer_to(&Type::pointer_to(&Type::char())));
		match Type::parse("struct foo")
		{
		Err(Error::UnknownTypeName { type_name }) => assert_eq!(type_name, "struct foo"),
		r => panic!("unexpected {:?}", r.map(|_| ())),
		}
	}

	#[test]
	fn natural_struct_layout()
	{
		let s = Struct::new_ref("s");
		s.borrow_mut().add_field("c", Type::char()).unwrap();
		s.borrow_mut().add_field("d", Type::double()).unwrap();
		s.borrow_mut().add_field("i", Type::integer(IntClass::Bits(Signed, 32))).unwrap();
		let l = Type::structure(&s).layout().unwrap();
		assert_eq!(l, Layout { size: 24, align: 8 });
		assert_eq!(s.borrow_mut().field("i").unwrap().offset, 16);

		let late = s.borrow_mut().add_field("late", Type::int());
		match late
		{
		Err(Error::StructFinalized { name }) => assert_eq!(name, "s"),
		r => panic!("unexpected {:?}", r),
		}
	}

	#[test]
	fn integer_alignment_follows_c()
	{
		use std::mem::align_of;
		use std::os::raw;
		let ll = Type::integer(IntClass::LongLong(Signed)).layout().unwrap();
		assert_eq!(ll.align, align_of::<raw::c_longlong>());
		let i64_ = Type::integer(IntClass::Bits(Signed, 64)).layout().unwrap();
		assert_eq!(i64_, Layout { size: 8, align: align_of::<i64>() });

		let s = Struct::new_ref("s");
		s.borrow_mut().add_field("c", Type::char()).unwrap();
		s.borrow_mut().add_field("v", Type::integer(IntClass::Bits(Unsigned, 64))).unwrap();
		Type::structure(&s).layout().unwrap();
		assert_eq!(s.borrow_mut().field("v").unwrap().offset, align_of::<u64>());
	}

	#[test]
	fn oversized_array()
	{
		let t = Type::array_of(&Type::array_of(&Type::double(), 1u64 << 40), 1u64 << 40);
		match t.layout()
		{
		Err(Error::IncompleteType { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
	}

	#[test]
	fn array_layout()
	{
		let t = Type::array_of(&Type::array_of(&Type::integer(IntClass::Bits(Unsigned, 16)), 3), 2);
		assert_eq!(t.layout().unwrap(), Layout { size: 12, align: 2 });
		assert!(Type::unsized_array_of(&Type::int()).layout().is_err());
		assert!(Type::void().layout().is_err());
	}

	#[test]
	fn self_referencing_struct()
	{
		let node = Struct::new_ref("node");
		node.borrow_mut().add_field("value", Type::int()).unwrap();
		let ptr = Type::pointer_to(&Type::structure(&node));
		node.borrow_mut().add_field("next", ptr).unwrap();
		let l = Type::structure(&node).layout().unwrap();
		assert_eq!(l.align, ::std::mem::align_of::<*const u8>());
	}
}
