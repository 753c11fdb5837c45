//! C declaration synthesis
//!
//! Declarators are built from a postfix token list: walking the type from the outside in
//! yields `*` (prefix) and `[N]`/`(args)` (postfix) tokens, ending at the base type name.
//! Folding the tokens around the declared name then only needs parentheses where a postfix
//! token follows a prefix one (pointer-to-array vs array-of-pointers).
use crate::error::{Error, Result};
use crate::types::{BaseType, FunctionType, StructRef, Type, TypeRef, Qualifiers};

enum Token
{
	Prefix(String),
	Postfix(String),
}

/// Declaration of `name` with type `ty` (e.g. `int (*name)[3]`). An empty name gives an abstract
/// declarator suitable for unnamed parameters.
pub fn declare_variable(name: &str, ty: &Type) -> Result<String>
{
	let mut tokens = Vec::new();
	let base = postfix(&mut tokens, ty)?;

	let mut s = name.to_owned();
	let mut after_prefix = false;
	for t in tokens
	{
		match t
		{
		Token::Prefix(p) => {
			s = p + &s;
			after_prefix = true;
			},
		Token::Postfix(p) => {
			if after_prefix {
				s = format!("({})", s);
			}
			s += &p;
			after_prefix = false;
			},
		}
	}
	let rv = format!("{} {}", base, s);
	trace!("declare_variable({:?}, {:?}) = {:?}", name, ty, rv.trim_end());
	Ok(rv.trim_end().to_owned())
}

/// Function header `<ret> name(<args>)`, or a function pointer `<ret> (*name)(<args>)`
pub fn declare_function_header(ret: &TypeRef, name: &str, args: &[(TypeRef,String)], variadic: bool, as_pointer: bool) -> Result<String>
{
	let ft = FunctionType {
		ret: ret.clone(),
		args: args.to_vec(),
		variadic: variadic,
		};
	let ty = Type::function(ft);
	if as_pointer {
		declare_variable(name, &Type::pointer_to(&ty))
	}
	else {
		declare_variable(name, &ty)
	}
}

/// `struct __attribute__((aligned(A))) Name { ... };` with members in offset order
pub fn struct_definition(sr: &StructRef) -> Result<String>
{
	let (name, align, fields) = {
		let mut s = sr.borrow_mut();
		let fields = s.fields_by_offset()?;
		let layout = s.finalize()?;
		(s.name.clone(), layout.align, fields)
		};
	if name == "" {
		return Err(Error::UnknownTypeName { type_name: "struct { ... }".to_owned() });
	}
	let mut members = Vec::with_capacity(fields.len());
	for f in &fields
	{
		members.push(format!("  {};", declare_variable(&f.name, &f.ty)?));
	}
	Ok(format!("struct __attribute__((aligned({}))) {} {{\n{}\n}};", align, name, members.join("\n")))
}

/// Forward declaration of a named struct
pub fn struct_forward(sr: &StructRef) -> Result<String>
{
	Ok(format!("{};", struct_name(sr)?))
}

fn struct_name(sr: &StructRef) -> Result<String>
{
	let s = sr.borrow();
	if s.name == "" {
		return Err(Error::UnknownTypeName { type_name: "struct { ... }".to_owned() });
	}
	Ok(format!("struct {}", s.name))
}

// Collects tokens from outermost to innermost, returns the base type name
fn postfix(res: &mut Vec<Token>, ty: &Type) -> Result<String>
{
	match ty.basetype
	{
	BaseType::Pointer(ref inner) => {
		res.push(Token::Prefix(format!("*{}", qualifiers(&ty.qualifiers))));
		postfix(res, inner)
		},
	BaseType::Array(ref inner, ref size) => {
		res.push(Token::Postfix(size.to_string()));
		postfix(res, inner)
		},
	BaseType::Function(ref ft) => {
		check_return_type(&ft.ret)?;
		res.push(Token::Postfix(argument_list(ft)?));
		postfix(res, &ft.ret)
		},
	_ => Ok(format!("{}{}", qualifiers(&ty.qualifiers), base_name(ty)?)),
	}
}

fn check_return_type(ret: &Type) -> Result<()>
{
	match ret.basetype
	{
	BaseType::Array(..) | BaseType::Function(..) => Err(Error::InvalidReturnType { type_name: format!("{:?}", ret) }),
	BaseType::Struct(ref sr) if sr.borrow().name == "" => Err(Error::InvalidReturnType { type_name: format!("{:?}", ret) }),
	_ => Ok( () ),
	}
}

fn argument_list(ft: &FunctionType) -> Result<String>
{
	let mut args = Vec::with_capacity(ft.args.len() + 1);
	for (aty, aname) in &ft.args
	{
		args.push(declare_variable(aname, aty)?);
	}
	if ft.variadic {
		args.push("...".to_owned());
	}
	Ok(format!("({})", args.join(", ")))
}

fn base_name(ty: &Type) -> Result<String>
{
	use crate::types::{FloatClass, IntClass};
	use crate::types::Signedness::*;
	Ok(match ty.basetype
	{
	BaseType::Void => "void".to_owned(),
	BaseType::Bool => "_Bool".to_owned(),
	BaseType::Struct(ref sr) => struct_name(sr)?,
	BaseType::Integer(ref ic) => match *ic
		{
		IntClass::Bits(s,b) => format!("{}int{}_t", if s.is_unsigned() { "u" } else { "" }, b),
		IntClass::Char(s) => format!("{}char", match s { None => "", Some(Signed) => "signed ", Some(Unsigned) => "unsigned " }),
		IntClass::Short(s) => format!("{}short", if s.is_unsigned() { "unsigned " } else { "" }),
		IntClass::Int(s) => format!("{}int", if s.is_unsigned() { "unsigned " } else { "" }),
		IntClass::Long(s) => format!("{}long", if s.is_unsigned() { "unsigned " } else { "" }),
		IntClass::LongLong(s) => format!("{}long long", if s.is_unsigned() { "unsigned " } else { "" }),
		},
	BaseType::Float(ref fc) => match *fc
		{
		FloatClass::Float => "float".to_owned(),
		FloatClass::Double => "double".to_owned(),
		FloatClass::LongDouble => "long double".to_owned(),
		},
	BaseType::Pointer(..) | BaseType::Array(..) | BaseType::Function(..) => unreachable!("derived type {:?} as base", ty),
	})
}

fn qualifiers(q: &Qualifiers) -> String
{
	let mut rv = String::new();
	if q.is_const() {
		rv += "const ";
	}
	if q.is_volatile() {
		rv += "volatile ";
	}
	if q.is_restrict() {
		rv += "restrict ";
	}
	rv
}

// vim: ft=rust

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::types::{Field, Struct, IntClass, Signedness};

	fn int() -> TypeRef { Type::int() }
	fn ptr(t: &TypeRef) -> TypeRef { Type::pointer_to(t) }
	fn arr(t: &TypeRef, n: u64) -> TypeRef { Type::array_of(t, n) }

	#[test]
	fn scalars()
	{
		assert_eq!(declare_variable("x", &int()).unwrap(), "int x");
		assert_eq!(declare_variable("x", &Type::integer(IntClass::LongLong(Signedness::Unsigned))).unwrap(), "unsigned long long x");
		assert_eq!(declare_variable("", &Type::double()).unwrap(), "double");
		let mut q = Qualifiers::new();
		q.set_const();
		assert_eq!(declare_variable("s", &ptr(&Type::char().qualified(&q))).unwrap(), "const char *s");
		assert_eq!(declare_variable("p", &ptr(&int()).qualified(&q)).unwrap(), "int *const p");
	}

	#[test]
	fn pointer_array_nesting()
	{
		// array of pointers vs pointer to array
		assert_eq!(declare_variable("x", &arr(&ptr(&int()), 3)).unwrap(), "int *x[3]");
		assert_eq!(declare_variable("p", &ptr(&arr(&int(), 3))).unwrap(), "int (*p)[3]");
		assert_eq!(declare_variable("", &ptr(&arr(&int(), 3))).unwrap(), "int (*)[3]");
		// depth 3
		assert_eq!(declare_variable("p", &ptr(&arr(&ptr(&int()), 3))).unwrap(), "int *(*p)[3]");
		assert_eq!(declare_variable("x", &arr(&ptr(&arr(&int(), 4)), 2)).unwrap(), "int (*x[2])[4]");
		assert_eq!(declare_variable("q", &ptr(&ptr(&arr(&Type::char(), 8)))).unwrap(), "char (**q)[8]");
		assert_eq!(declare_variable("m", &arr(&arr(&int(), 3), 2)).unwrap(), "int m[2][3]");
		assert_eq!(declare_variable("u", &Type::unsized_array_of(&ptr(&int()))).unwrap(), "int *u[]");
	}

	#[test]
	fn function_headers()
	{
		let args = vec![(int(), "a".to_owned()), (int(), "b".to_owned())];
		assert_eq!(declare_function_header(&int(), "add", &args, false, false).unwrap(), "int add(int a, int b)");
		assert_eq!(declare_function_header(&int(), "add", &args, false, true).unwrap(), "int (*add)(int a, int b)");
		let unnamed = vec![(int(), String::new()), (ptr(&Type::char()), String::new())];
		assert_eq!(declare_function_header(&Type::void(), "f", &unnamed, true, false).unwrap(), "void f(int, char *, ...)");
		assert_eq!(declare_function_header(&ptr(&int()), "g", &[], false, false).unwrap(), "int *g()");

		// function pointer returning a pointer to an array
		let ft = crate::types::FunctionType::new(ptr(&arr(&int(), 3)), vec![]);
		assert_eq!(declare_variable("f", &ptr(&Type::function(ft))).unwrap(), "int (*(*f)())[3]");
	}

	#[test]
	fn invalid_return_types()
	{
		match declare_function_header(&arr(&int(), 2), "f", &[], false, false)
		{
		Err(Error::InvalidReturnType { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
		let anon = Type::structure(&Struct::new_ref(""));
		match declare_function_header(&anon, "f", &[], false, false)
		{
		Err(Error::InvalidReturnType { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
		match declare_variable("v", &anon)
		{
		Err(Error::UnknownTypeName { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
	}

	#[test]
	fn struct_members_by_offset()
	{
		// Listed out of order, as a foreign layout might be
		let s = Struct::with_layout("Pair", vec![
			Field { name: "second".to_owned(), ty: Type::double(), offset: 8 },
			Field { name: "first".to_owned(), ty: int(), offset: 0 },
			Field { name: "tail".to_owned(), ty: arr(&ptr(&Type::char()), 2), offset: 16 },
			], 32, 8);
		assert_eq!(struct_definition(&s).unwrap(),
			"struct __attribute__((aligned(8))) Pair {\n  int first;\n  double second;\n  char *tail[2];\n};");
		assert_eq!(struct_forward(&s).unwrap(), "struct Pair;");
		assert_eq!(declare_variable("p", &ptr(&Type::structure(&s))).unwrap(), "struct Pair *p");
	}

	#[test]
	fn self_referencing_struct_definition()
	{
		let node = Struct::new_ref("node");
		node.borrow_mut().add_field("next", ptr(&Type::structure(&node))).unwrap();
		node.borrow_mut().add_field("value", int()).unwrap();
		let def = struct_definition(&node).unwrap();
		assert!(def.contains("  struct node *next;\n  int value;\n"), "{}", def);
	}
}
