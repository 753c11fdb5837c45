
use cranelift_codegen::ir;
use cranelift_codegen::ir::types as cr_tys;
use cranelift_codegen::ir::{AbiParam, InstBuilder, MemFlags, StackSlotData, StackSlotKind};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Module};
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::collections::hash_map::HashMap;
use std::mem::ManuallyDrop;
use std::os::raw::c_void;

use super::{AbiSignature, AbiType, SLOT_SIZE};
use crate::error::{Error, Result};

/// Receives a trampoline's context pointer, its argument slots, and the return slot
pub type Dispatch = unsafe extern "C" fn(*const c_void, *const u64, *mut u64);

/// Entry point of a compiled `extern "C" fn(target, args, ret)` stub
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub struct Adapter(usize);

struct AdapterCache
{
	module: JITModule,
	entries: HashMap<AbiSignature, usize>,
}

thread_local! {
	// Adapters are handed to other threads (see `function::Worker`), the code must outlive this one
	static ADAPTERS: OnceCell<RefCell<ManuallyDrop<AdapterCache>>> = OnceCell::new();
}

impl Adapter
{
	/// Adapter for `sig`, compiled on first use
	pub fn for_signature(sig: &AbiSignature) -> Result<Adapter>
	{
		ADAPTERS.with(|cell| {
			let cache = cell.get_or_try_init(|| -> Result<_> {
				Ok(RefCell::new(ManuallyDrop::new(AdapterCache {
					module: new_module()?,
					entries: HashMap::new(),
					})))
				})?;
			let mut cache = cache.borrow_mut();
			if let Some(&entry) = cache.entries.get(sig) {
				return Ok(Adapter(entry));
			}
			let entry = compile_adapter(&mut cache.module, sig)? as usize;
			debug!("adapter for {:?} at {:#x}", sig, entry);
			cache.entries.insert(sig.clone(), entry);
			Ok(Adapter(entry))
		})
	}

	/// Call `target` with arguments in `args` (one slot each), storing any result in `ret`
	///
	/// The caller must ensure `target` has the signature this adapter was compiled for.
	pub unsafe fn invoke(&self, target: usize, args: &[u64], ret: &mut u64)
	{
		let f: extern "C" fn(*const u8, *const u64, *mut u64) = ::std::mem::transmute(self.0);
		f(target as *const u8, args.as_ptr(), ret);
	}
}

/// A native-callable stub forwarding to a `Dispatch` function. Owns its code.
pub struct Trampoline
{
	module: Option<JITModule>,
	entry: *const u8,
}
impl Trampoline
{
	pub fn new(sig: &AbiSignature, dispatch: Dispatch, context: *const c_void) -> Result<Trampoline>
	{
		let mut module = new_module()?;
		let ptr_ty = module.target_config().pointer_type();
		let native_sig = native_signature(&module, sig);
		let mut dispatch_sig = module.make_signature();
		for _ in 0 .. 3 {
			dispatch_sig.params.push(AbiParam::new(ptr_ty));
		}

		let id = module.declare_anonymous_function(&native_sig).map_err(jit_error)?;
		let mut ctx = module.make_context();
		ctx.func.signature = native_sig;
		let mut fn_builder_ctx = FunctionBuilderContext::new();
		{
			let mut b = FunctionBuilder::new(&mut ctx.func, &mut fn_builder_ctx);
			let block0 = b.create_block();
			b.append_block_params_for_function_params(block0);
			b.switch_to_block(block0);
			b.seal_block(block0);
			let params = b.block_params(block0).to_vec();

			let nslots = ::std::cmp::max(params.len(), 1);
			let args_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, (nslots * SLOT_SIZE) as u32, 3));
			let ret_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, SLOT_SIZE as u32, 3));
			for (idx, v) in params.iter().enumerate()
			{
				b.ins().stack_store(*v, args_slot, (idx * SLOT_SIZE) as i32);
			}
			let args_ptr = b.ins().stack_addr(ptr_ty, args_slot, 0);
			let ret_ptr = b.ins().stack_addr(ptr_ty, ret_slot, 0);
			let context_v = b.ins().iconst(ptr_ty, context as usize as i64);
			let callee = b.ins().iconst(ptr_ty, dispatch as usize as i64);
			let sigref = b.import_signature(dispatch_sig);
			b.ins().call_indirect(sigref, callee, &[context_v, args_ptr, ret_ptr]);

			if sig.ret == AbiType::Void {
				b.ins().return_(&[]);
			}
			else {
				let rv = b.ins().stack_load(clif_type(sig.ret, ptr_ty), ret_slot, 0);
				b.ins().return_(&[rv]);
			}
			b.finalize();
		}
		module.define_function(id, &mut ctx).map_err(jit_error)?;
		module.clear_context(&mut ctx);
		module.finalize_definitions().map_err(jit_error)?;
		let entry = module.get_finalized_function(id);
		trace!("trampoline for {:?} at {:p}", sig, entry);

		Ok(Trampoline {
			module: Some(module),
			entry: entry,
			})
	}

	pub fn entry(&self) -> *const u8
	{
		self.entry
	}
}
impl Drop for Trampoline
{
	fn drop(&mut self)
	{
		if let Some(module) = self.module.take() {
			// SAFETY: Owners keep the trampoline alive for as long as native code may call it
			unsafe { module.free_memory() };
		}
	}
}

fn jit_error(e: impl ::std::fmt::Display) -> Error
{
	Error::Jit(e.to_string())
}

fn new_module() -> Result<JITModule>
{
	let mut flag_builder = settings::builder();
	flag_builder.set("opt_level", "speed").map_err(jit_error)?;
	flag_builder.set("use_colocated_libcalls", "false").map_err(jit_error)?;
	flag_builder.set("is_pic", "false").map_err(jit_error)?;
	let isa_builder = cranelift_native::builder()
		.map_err(|msg| Error::Jit(format!("host target lookup failed: {}", msg)))?;
	let isa = isa_builder.finish(settings::Flags::new(flag_builder)).map_err(jit_error)?;
	Ok(JITModule::new(JITBuilder::with_isa(isa, default_libcall_names())))
}

fn clif_type(abi: AbiType, ptr_ty: ir::Type) -> ir::Type
{
	match abi
	{
	AbiType::Bool => cr_tys::I8,
	AbiType::Int(1, _) => cr_tys::I8,
	AbiType::Int(2, _) => cr_tys::I16,
	AbiType::Int(4, _) => cr_tys::I32,
	AbiType::Int(_, _) => cr_tys::I64,
	AbiType::Float => cr_tys::F32,
	AbiType::Double => cr_tys::F64,
	AbiType::Pointer => ptr_ty,
	AbiType::Void => panic!("clif_type: void has no value type"),
	}
}

fn abi_param(abi: AbiType, ptr_ty: ir::Type) -> AbiParam
{
	let p = AbiParam::new(clif_type(abi, ptr_ty));
	// C callers don't always widen narrow arguments, so say how they're extended
	match abi
	{
	AbiType::Bool => p.uext(),
	AbiType::Int(n, s) if n < 4 => if s.is_unsigned() { p.uext() } else { p.sext() },
	_ => p,
	}
}

fn native_signature(module: &JITModule, sig: &AbiSignature) -> ir::Signature
{
	let ptr_ty = module.target_config().pointer_type();
	let mut rv = module.make_signature();
	for a in &sig.args
	{
		rv.params.push(abi_param(*a, ptr_ty));
	}
	if sig.ret != AbiType::Void {
		rv.returns.push(abi_param(sig.ret, ptr_ty));
	}
	rv
}

fn compile_adapter(module: &mut JITModule, sig: &AbiSignature) -> Result<*const u8>
{
	let ptr_ty = module.target_config().pointer_type();
	let callee_sig = native_signature(module, sig);
	let mut outer_sig = module.make_signature();
	for _ in 0 .. 3 {
		outer_sig.params.push(AbiParam::new(ptr_ty));
	}

	let id = module.declare_anonymous_function(&outer_sig).map_err(jit_error)?;
	let mut ctx = module.make_context();
	ctx.func.signature = outer_sig;
	let mut fn_builder_ctx = FunctionBuilderContext::new();
	{
		let mut b = FunctionBuilder::new(&mut ctx.func, &mut fn_builder_ctx);
		let block0 = b.create_block();
		b.append_block_params_for_function_params(block0);
		b.switch_to_block(block0);
		b.seal_block(block0);
		let (target, args, ret) = {
			let p = b.block_params(block0);
			(p[0], p[1], p[2])
			};

		let mut values = Vec::with_capacity(sig.args.len());
		for (idx, a) in sig.args.iter().enumerate()
		{
			values.push( b.ins().load(clif_type(*a, ptr_ty), MemFlags::trusted(), args, (idx * SLOT_SIZE) as i32) );
		}
		let sigref = b.import_signature(callee_sig);
		let call = b.ins().call_indirect(sigref, target, &values);
		if sig.ret != AbiType::Void {
			let rv = b.inst_results(call)[0];
			b.ins().store(MemFlags::trusted(), rv, ret, 0);
		}
		b.ins().return_(&[]);
		b.finalize();
	}
	module.define_function(id, &mut ctx).map_err(jit_error)?;
	module.clear_context(&mut ctx);
	module.finalize_definitions().map_err(jit_error)?;
	Ok(module.get_finalized_function(id))
}
