//! Native call glue
//!
//! Host code calls into compiled C through an *adapter*: a stub taking the target address and
//! a buffer of 8-byte argument slots. Compiled C calls host closures through a *trampoline*: a
//! stub with the exact C signature that spills its arguments into slots and hands them to a
//! dispatch function.

mod cranelift;

pub use self::cranelift::{Adapter, Trampoline};

use crate::error::{Error, Result};
use crate::types::{BaseType, FunctionType, Signedness, Type};

/// Size of one argument/return slot
pub const SLOT_SIZE: usize = 8;

/// How a C scalar is passed
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash)]
pub enum AbiType
{
	Void,
	Bool,
	/// Integer of the given byte width
	Int(u8, Signedness),
	Float,
	Double,
	Pointer,
}
impl AbiType
{
	/// `None` for types that can't be passed in a register (aggregates, `long double`)
	pub fn of(ty: &Type) -> Option<AbiType>
	{
		use crate::types::FloatClass;
		match ty.basetype
		{
		BaseType::Void => Some(AbiType::Void),
		BaseType::Bool => Some(AbiType::Bool),
		BaseType::Integer(ref ic) => Some(AbiType::Int(ic.size() as u8, ic.signedness())),
		BaseType::Float(FloatClass::Float) => Some(AbiType::Float),
		BaseType::Float(FloatClass::Double) => Some(AbiType::Double),
		BaseType::Float(FloatClass::LongDouble) => None,
		BaseType::Pointer(_) => Some(AbiType::Pointer),
		BaseType::Array(..) | BaseType::Struct(_) | BaseType::Function(_) => None,
		}
	}
}

#[derive(Debug,Clone,PartialEq,Eq,Hash)]
pub struct AbiSignature
{
	pub ret: AbiType,
	pub args: Vec<AbiType>,
}
impl AbiSignature
{
	pub fn of(name: &str, ft: &FunctionType) -> Result<AbiSignature>
	{
		let unsupported = |reason: String| Error::UnsupportedSignature { name: name.to_owned(), reason: reason };
		if ft.variadic {
			return Err(unsupported("variadic functions can't be bound".to_owned()));
		}
		let ret = AbiType::of(&ft.ret)
			.ok_or_else(|| unsupported(format!("return type {:?}", ft.ret)))?;
		let mut args = Vec::with_capacity(ft.args.len());
		for (aty, aname) in &ft.args
		{
			match AbiType::of(aty)
			{
			Some(AbiType::Void) | None => return Err(unsupported(format!("argument {:?} of type {:?}", aname, aty))),
			Some(a) => args.push(a),
			}
		}
		Ok(AbiSignature { ret: ret, args: args })
	}
}
