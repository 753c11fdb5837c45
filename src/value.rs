//! Host-side values and live views of compiled memory
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::codegen::AbiType;
use crate::error::{Error, Result};
use crate::function::NativeFunction;
use crate::state::Image;
use crate::types::{ArraySize, BaseType, TypeRef};

/// A C scalar, as seen from the host
#[derive(Debug,Clone,Copy,PartialEq)]
pub enum Value
{
	Void,
	Bool(bool),
	Int(i64),
	UInt(u64),
	Float(f32),
	Double(f64),
	Pointer(usize),
}

impl Value
{
	pub fn is_void(&self) -> bool
	{
		*self == Value::Void
	}

	pub fn as_bool(&self) -> Option<bool>
	{
		match *self
		{
		Value::Bool(b) => Some(b),
		Value::Int(v) => Some(v != 0),
		Value::UInt(v) => Some(v != 0),
		Value::Pointer(p) => Some(p != 0),
		_ => None,
		}
	}
	pub fn as_i64(&self) -> Option<i64>
	{
		self.integer_bits().map(|v| v as i64)
	}
	pub fn as_u64(&self) -> Option<u64>
	{
		self.integer_bits()
	}
	pub fn as_f64(&self) -> Option<f64>
	{
		match *self
		{
		Value::Float(v) => Some(v as f64),
		Value::Double(v) => Some(v),
		Value::Int(v) => Some(v as f64),
		Value::UInt(v) => Some(v as f64),
		_ => None,
		}
	}
	pub fn as_pointer(&self) -> Option<usize>
	{
		match *self
		{
		Value::Pointer(p) => Some(p),
		Value::Int(v) => Some(v as usize),
		Value::UInt(v) => Some(v as usize),
		_ => None,
		}
	}

	fn integer_bits(&self) -> Option<u64>
	{
		match *self
		{
		Value::Bool(b) => Some(b as u64),
		Value::Int(v) => Some(v as u64),
		Value::UInt(v) => Some(v),
		Value::Pointer(p) => Some(p as u64),
		_ => None,
		}
	}

	/// Read a value of the given class from (possibly unaligned) memory
	pub(crate) unsafe fn load(abi: AbiType, ptr: *const u8) -> Value
	{
		use std::ptr::read_unaligned as rd;
		use crate::types::Signedness::*;
		match abi
		{
		AbiType::Void => Value::Void,
		AbiType::Bool => Value::Bool(rd(ptr) != 0),
		AbiType::Int(1, Signed) => Value::Int(rd(ptr as *const i8) as i64),
		AbiType::Int(1, Unsigned) => Value::UInt(rd(ptr) as u64),
		AbiType::Int(2, Signed) => Value::Int(rd(ptr as *const i16) as i64),
		AbiType::Int(2, Unsigned) => Value::UInt(rd(ptr as *const u16) as u64),
		AbiType::Int(4, Signed) => Value::Int(rd(ptr as *const i32) as i64),
		AbiType::Int(4, Unsigned) => Value::UInt(rd(ptr as *const u32) as u64),
		AbiType::Int(_, Signed) => Value::Int(rd(ptr as *const i64)),
		AbiType::Int(_, Unsigned) => Value::UInt(rd(ptr as *const u64)),
		AbiType::Float => Value::Float(rd(ptr as *const f32)),
		AbiType::Double => Value::Double(rd(ptr as *const f64)),
		AbiType::Pointer => Value::Pointer(rd(ptr as *const usize)),
		}
	}

	/// Write this value to memory as the given class. Integers are truncated to the width.
	pub(crate) unsafe fn store(&self, abi: AbiType, ptr: *mut u8) -> Result<()>
	{
		use std::ptr::write_unaligned as wr;
		let mismatch = || Error::TypeMismatch { expected: format!("{:?}", abi), found: format!("{:?}", self) };
		match abi
		{
		AbiType::Void => {},
		AbiType::Bool => wr(ptr, self.as_bool().ok_or_else(mismatch)? as u8),
		AbiType::Int(n, _) => {
			let bits = self.integer_bits().ok_or_else(mismatch)?;
			match n
			{
			1 => wr(ptr, bits as u8),
			2 => wr(ptr as *mut u16, bits as u16),
			4 => wr(ptr as *mut u32, bits as u32),
			_ => wr(ptr as *mut u64, bits),
			}
			},
		AbiType::Float => wr(ptr as *mut f32, self.as_f64().ok_or_else(mismatch)? as f32),
		AbiType::Double => wr(ptr as *mut f64, self.as_f64().ok_or_else(mismatch)?),
		AbiType::Pointer => wr(ptr as *mut usize, self.as_pointer().ok_or_else(mismatch)?),
		}
		Ok( () )
	}
}

macro_rules! value_from {
	($($t:ty => $variant:ident as $as:ty,)*) => {
		$(
		impl From<$t> for Value {
			fn from(v: $t) -> Value { Value::$variant(v as $as) }
		}
		)*
	};
}
value_from! {
	i8 => Int as i64,
	i16 => Int as i64,
	i32 => Int as i64,
	i64 => Int as i64,
	isize => Int as i64,
	u8 => UInt as u64,
	u16 => UInt as u64,
	u32 => UInt as u64,
	u64 => UInt as u64,
	usize => UInt as u64,
	f32 => Float as f32,
	f64 => Double as f64,
}
impl From<bool> for Value
{
	fn from(v: bool) -> Value { Value::Bool(v) }
}
impl<T> From<*const T> for Value
{
	fn from(v: *const T) -> Value { Value::Pointer(v as usize) }
}
impl<T> From<*mut T> for Value
{
	fn from(v: *mut T) -> Value { Value::Pointer(v as usize) }
}
impl From<()> for Value
{
	fn from(_: ()) -> Value { Value::Void }
}

/// A typed view of memory owned by a relocated image
///
/// Reads and writes go straight to the compiled program's storage. The image stays alive for as
/// long as any handle into it does.
#[derive(Clone)]
pub struct Handle
{
	name: String,
	ptr: NonNull<u8>,
	ty: TypeRef,
	image: Rc<Image>,
}

impl ::std::fmt::Debug for Handle
{
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		write!(f, "Handle({} @ {:p}: {:?})", self.name, self.ptr, self.ty)
	}
}

impl Handle
{
	pub(crate) fn new(name: &str, ptr: NonNull<u8>, ty: TypeRef, image: Rc<Image>) -> Handle
	{
		Handle { name: name.to_owned(), ptr: ptr, ty: ty, image: image }
	}

	/// Symbol-relative path used in diagnostics (e.g. `points[2].x`)
	pub fn name(&self) -> &str
	{
		&self.name
	}
	pub fn address(&self) -> *mut u8
	{
		self.ptr.as_ptr()
	}
	pub fn ty(&self) -> &TypeRef
	{
		&self.ty
	}
	pub fn size(&self) -> Result<usize>
	{
		self.ty.size()
	}

	/// Current value of a scalar
	pub fn get(&self) -> Result<Value>
	{
		let abi = self.scalar()?;
		Ok(unsafe { Value::load(abi, self.ptr.as_ptr()) })
	}

	/// Overwrite a scalar in place
	pub fn set<V: Into<Value>>(&self, value: V) -> Result<()>
	{
		let abi = self.scalar()?;
		let value = value.into();
		trace!("set {} = {:?}", self.name, value);
		unsafe { value.store(abi, self.ptr.as_ptr()) }
	}

	/// Member of a struct
	pub fn field(&self, name: &str) -> Result<Handle>
	{
		let f = match self.ty.basetype
			{
			BaseType::Struct(ref sr) => sr.borrow_mut().field(name)?,
			_ => return Err(self.mismatch("struct")),
			};
		Ok(self.derive(format!("{}.{}", self.name, name), f.offset, f.ty))
	}

	/// Element of an array (bounds checked when the length is known)
	pub fn index(&self, idx: usize) -> Result<Handle>
	{
		let (inner, size) = match self.ty.basetype
			{
			BaseType::Array(ref inner, size) => (inner.clone(), size),
			_ => return Err(self.mismatch("array")),
			};
		if let ArraySize::Fixed(n) = size {
			if idx as u64 >= n {
				return Err(Error::SymbolNotFound { name: format!("{}[{}]", self.name, idx) });
			}
		}
		let stride = inner.size()?;
		Ok(self.derive(format!("{}[{}]", self.name, idx), idx * stride, inner))
	}

	/// Target of a pointer, `None` when it is null
	pub fn pointee(&self) -> Result<Option<Handle>>
	{
		let inner = match self.ty.basetype
			{
			BaseType::Pointer(ref inner) => inner.clone(),
			_ => return Err(self.mismatch("pointer")),
			};
		let addr = unsafe { ::std::ptr::read_unaligned(self.ptr.as_ptr() as *const usize) };
		Ok(NonNull::new(addr as *mut u8).map(|p| Handle::new(&format!("*{}", self.name), p, inner, self.image.clone())))
	}

	/// Contents of a `char *`, `None` when it is null
	pub fn get_string(&self) -> Result<Option<String>>
	{
		match self.ty.basetype
		{
		BaseType::Pointer(ref inner) => match inner.basetype
			{
			BaseType::Integer(crate::types::IntClass::Char(_)) => {},
			_ => return Err(self.mismatch("char *")),
			},
		_ => return Err(self.mismatch("char *")),
		}
		let addr = unsafe { ::std::ptr::read_unaligned(self.ptr.as_ptr() as *const *const c_char) };
		if addr.is_null() {
			return Ok(None);
		}
		Ok(Some(unsafe { CStr::from_ptr(addr) }.to_string_lossy().into_owned()))
	}

	/// Copy of the raw bytes
	pub fn to_bytes(&self) -> Result<Vec<u8>>
	{
		let size = self.size()?;
		Ok(unsafe { ::std::slice::from_raw_parts(self.ptr.as_ptr(), size) }.to_vec())
	}

	/// Overwrite the raw bytes, `bytes` must be exactly the size of the type
	pub fn copy_from(&self, bytes: &[u8]) -> Result<()>
	{
		let size = self.size()?;
		if bytes.len() != size {
			return Err(Error::TypeMismatch { expected: format!("{} bytes", size), found: format!("{} bytes", bytes.len()) });
		}
		unsafe { ::std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), size) };
		Ok( () )
	}

	/// Callable view of a function symbol
	pub fn function(&self) -> Result<NativeFunction>
	{
		match self.ty.basetype
		{
		BaseType::Function(ref ft) => NativeFunction::new(&self.name, self.ptr, ft, self.image.clone()),
		_ => Err(self.mismatch("function")),
		}
	}

	fn scalar(&self) -> Result<AbiType>
	{
		match AbiType::of(&self.ty)
		{
		Some(AbiType::Void) | None => Err(self.mismatch("scalar")),
		Some(abi) => Ok(abi),
		}
	}

	fn derive(&self, name: String, offset: usize, ty: TypeRef) -> Handle
	{
		// SAFETY: Offsets come from the layout of the type this handle points at
		let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
		Handle { name: name, ptr: ptr, ty: ty, image: self.image.clone() }
	}

	fn mismatch(&self, expected: &str) -> Error
	{
		Error::TypeMismatch { expected: expected.to_owned(), found: format!("{} ({:?})", self.name, self.ty) }
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::state::CompilerState;
	use crate::state::testing::{serial, MockBackend};
	use crate::types::{Signed, Type, Unsigned};

	fn relocated(be: MockBackend) -> CompilerState
	{
		let mut s = CompilerState::with_backend(Box::new(be)).unwrap();
		s.compile("").unwrap();
		s.relocate().unwrap();
		s
	}

	fn expect_mismatch<T: ::std::fmt::Debug>(r: Result<T>)
	{
		match r
		{
		Err(Error::TypeMismatch { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
	}

	#[test]
	fn load_store_widths()
	{
		let mut buf = [0xAAu8; 8];
		unsafe {
			Value::Int(-2).store(AbiType::Int(2, Signed), buf.as_mut_ptr()).unwrap();
			assert_eq!(&buf[..3], &[0xFE, 0xFF, 0xAA]);
			assert_eq!(Value::load(AbiType::Int(2, Signed), buf.as_ptr()), Value::Int(-2));
			assert_eq!(Value::load(AbiType::Int(2, Unsigned), buf.as_ptr()), Value::UInt(0xFFFE));

			Value::Int(3).store(AbiType::Double, buf.as_mut_ptr().add(1)).unwrap();
			assert_eq!(Value::load(AbiType::Double, buf.as_ptr().add(1)), Value::Double(3.0));

			Value::Bool(true).store(AbiType::Int(4, Unsigned), buf.as_mut_ptr()).unwrap();
			assert_eq!(Value::load(AbiType::Bool, buf.as_ptr()), Value::Bool(true));
		}
	}

	#[test]
	fn mismatched_store()
	{
		let mut buf = [0u8; 8];
		match unsafe { Value::Double(1.5).store(AbiType::Int(4, Signed), buf.as_mut_ptr()) }
		{
		Err(Error::TypeMismatch { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
		match unsafe { Value::Float(1.5).store(AbiType::Pointer, buf.as_mut_ptr()) }
		{
		Err(Error::TypeMismatch { .. }) => {},
		r => panic!("unexpected {:?}", r),
		}
	}

	#[test]
	fn conversions()
	{
		assert_eq!(Value::from(5u8), Value::UInt(5));
		assert_eq!(Value::from(-5i32).as_i64(), Some(-5));
		assert_eq!(Value::from(1.25f32).as_f64(), Some(1.25));
		assert_eq!(Value::Pointer(16).as_u64(), Some(16));
		assert_eq!(Value::Double(1.0).as_i64(), None);
		assert!(Value::from(()).is_void());
	}

	#[test]
	fn pointer_views()
	{
		let _g = serial();
		let mut target: i32 = 41;
		let mut p: *mut i32 = &mut target;
		let mut null: *mut i32 = ::std::ptr::null_mut();
		let be = MockBackend::default()
			.with_symbol("p", &mut p as *mut *mut i32)
			.with_symbol("null", &mut null as *mut *mut i32);
		let s = relocated(be);
		let int_ptr = Type::pointer_to(&Type::int());

		let h = s.resolve_symbol("p", &int_ptr).unwrap().pointee().unwrap().unwrap();
		assert_eq!(h.name(), "*p");
		assert_eq!(h.get().unwrap(), Value::Int(41));
		h.set(42).unwrap();
		assert!(s.resolve_symbol("null", &int_ptr).unwrap().pointee().unwrap().is_none());
		expect_mismatch(s.resolve_symbol("p", &Type::int()).unwrap().pointee());
		drop(h);
		assert_eq!(target, 42);
	}

	#[test]
	fn strings()
	{
		let _g = serial();
		let text = b"hello\0";
		let mut msg: *const u8 = text.as_ptr();
		let mut none: *const u8 = ::std::ptr::null();
		let be = MockBackend::default()
			.with_symbol("msg", &mut msg as *mut *const u8)
			.with_symbol("none", &mut none as *mut *const u8);
		let s = relocated(be);
		let char_ptr = Type::pointer_to(&Type::char());

		assert_eq!(s.resolve_symbol("msg", &char_ptr).unwrap().get_string().unwrap(), Some("hello".to_owned()));
		assert_eq!(s.resolve_symbol("none", &char_ptr).unwrap().get_string().unwrap(), None);
		expect_mismatch(s.resolve_symbol("msg", &Type::pointer_to(&Type::int())).unwrap().get_string());
		expect_mismatch(s.resolve_symbol("msg", &Type::int()).unwrap().get_string());
	}

	#[test]
	fn raw_bytes()
	{
		let _g = serial();
		let mut raw: [u8; 4] = [1, 2, 3, 4];
		let s = relocated(MockBackend::default().with_symbol("raw", raw.as_mut_ptr()));
		let h = s.resolve_symbol("raw", &Type::array_of(&Type::char(), 4)).unwrap();

		assert_eq!(h.to_bytes().unwrap(), vec![1, 2, 3, 4]);
		h.copy_from(&[9, 8, 7, 6]).unwrap();
		match h.copy_from(&[1, 2])
		{
		Err(Error::TypeMismatch { expected, found }) => {
			assert_eq!(expected, "4 bytes");
			assert_eq!(found, "2 bytes");
			},
		r => panic!("unexpected {:?}", r),
		}
		// Unsized types have no byte view
		assert!(s.resolve_symbol("raw", &Type::unsized_array_of(&Type::char())).unwrap().to_bytes().is_err());
		drop(h);
		drop(s);
		assert_eq!(raw, [9, 8, 7, 6]);
	}
}
