//! Calls across the host/C boundary
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;
use std::thread::JoinHandle;

use crate::codegen::{AbiSignature, AbiType, Adapter, Trampoline, SLOT_SIZE};
use crate::error::{Error, Result};
use crate::state::Image;
use crate::types::FunctionType;
use crate::value::Value;

/// A compiled C function, callable from the host
#[derive(Clone)]
pub struct NativeFunction
{
	name: String,
	address: NonNull<u8>,
	signature: AbiSignature,
	adapter: Adapter,
	image: Rc<Image>,
}

impl ::std::fmt::Debug for NativeFunction
{
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		write!(f, "NativeFunction({} @ {:p}: {:?})", self.name, self.address, self.signature)
	}
}

impl NativeFunction
{
	pub(crate) fn new(name: &str, address: NonNull<u8>, ft: &FunctionType, image: Rc<Image>) -> Result<NativeFunction>
	{
		let signature = AbiSignature::of(name, ft)?;
		let adapter = Adapter::for_signature(&signature)?;
		Ok(NativeFunction {
			name: name.to_owned(),
			address: address,
			signature: signature,
			adapter: adapter,
			image: image,
			})
	}

	pub fn name(&self) -> &str
	{
		&self.name
	}
	pub fn address(&self) -> *const u8
	{
		self.address.as_ptr()
	}

	/// Call on the current thread
	pub fn call(&self, args: &[Value]) -> Result<Value>
	{
		let frame = self.frame(args)?;
		trace!("call {}({:?})", self.name, args);
		Ok(unsafe { frame.invoke() })
	}

	/// Queue a call on the image's worker thread
	///
	/// Calls queued on the same image run one at a time, in submission order.
	pub fn call_async(&self, args: &[Value]) -> Result<PendingCall>
	{
		let frame = self.frame(args)?;
		let worker = self.image.worker()?;
		trace!("call_async {}({:?})", self.name, args);
		let reply = worker.submit(frame)
			.ok_or_else(|| Error::CallFailed { name: self.name.clone() })?;
		Ok(PendingCall {
			name: self.name.clone(),
			reply: reply,
			_image: self.image.clone(),
			})
	}

	fn frame(&self, args: &[Value]) -> Result<CallFrame>
	{
		if args.len() != self.signature.args.len() {
			return Err(Error::TypeMismatch {
				expected: format!("{} arguments to {}", self.signature.args.len(), self.name),
				found: format!("{}", args.len()),
				});
		}
		let mut slots = vec![0u64; args.len()];
		for (slot, (v, abi)) in slots.iter_mut().zip(args.iter().zip(&self.signature.args))
		{
			unsafe { v.store(*abi, slot as *mut u64 as *mut u8)? };
		}
		Ok(CallFrame {
			adapter: self.adapter,
			target: self.address.as_ptr() as usize,
			ret: self.signature.ret,
			slots: slots,
			})
	}
}

/// A fully marshalled call
struct CallFrame
{
	adapter: Adapter,
	target: usize,
	ret: AbiType,
	slots: Vec<u64>,
}
impl CallFrame
{
	unsafe fn invoke(self) -> Value
	{
		let mut ret = 0u64;
		self.adapter.invoke(self.target, &self.slots, &mut ret);
		Value::load(self.ret, &ret as *const u64 as *const u8)
	}
}

struct Job
{
	frame: CallFrame,
	reply: Sender<Value>,
}

/// Serialized call thread owned by an image
pub(crate) struct Worker
{
	jobs: Option<Sender<Job>>,
	thread: Option<JoinHandle<()>>,
}
impl Worker
{
	pub(crate) fn spawn() -> Result<Worker>
	{
		let (jobs, queue) = channel::unbounded::<Job>();
		let thread = ::std::thread::Builder::new()
			.name("cinline-call".to_owned())
			.spawn(move || {
				for job in queue
				{
					// SAFETY: The owning image outlives the worker (it joins on drop)
					let rv = unsafe { job.frame.invoke() };
					let _ = job.reply.send(rv);
				}
				debug!("call worker exiting");
			})?;
		Ok(Worker { jobs: Some(jobs), thread: Some(thread) })
	}

	fn submit(&self, frame: CallFrame) -> Option<Receiver<Value>>
	{
		let (reply, rx) = channel::bounded(1);
		self.jobs.as_ref()?.send(Job { frame: frame, reply: reply }).ok()?;
		Some(rx)
	}
}
impl Drop for Worker
{
	fn drop(&mut self)
	{
		// Closing the queue lets the thread finish what was submitted, then exit
		self.jobs.take();
		if let Some(t) = self.thread.take() {
			if t.join().is_err() {
				error!("call worker panicked");
			}
		}
	}
}

/// Result of `NativeFunction::call_async`
pub struct PendingCall
{
	name: String,
	reply: Receiver<Value>,
	_image: Rc<Image>,
}
impl PendingCall
{
	/// Block until the call completes
	pub fn wait(self) -> Result<Value>
	{
		match self.reply.recv()
		{
		Ok(v) => Ok(v),
		Err(_) => Err(Error::CallFailed { name: self.name }),
		}
	}

	/// The result, if the call has completed
	pub fn try_wait(&self) -> Result<Option<Value>>
	{
		match self.reply.try_recv()
		{
		Ok(v) => Ok(Some(v)),
		Err(TryRecvError::Empty) => Ok(None),
		Err(TryRecvError::Disconnected) => Err(Error::CallFailed { name: self.name.clone() }),
		}
	}
}

struct CallbackTarget
{
	name: String,
	signature: AbiSignature,
	func: Box<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

/// A host closure exposed to C as a plain function pointer
///
/// The pointer is valid for as long as the callback is alive.
pub struct Callback
{
	trampoline: Trampoline,
	target: Box<CallbackTarget>,
}

impl Callback
{
	pub fn new<F>(name: &str, ty: &FunctionType, func: F) -> Result<Callback>
	where
		F: Fn(&[Value]) -> Value + Send + Sync + 'static
	{
		let signature = AbiSignature::of(name, ty)?;
		let target = Box::new(CallbackTarget {
			name: name.to_owned(),
			signature: signature,
			func: Box::new(func),
			});
		let context = &*target as *const CallbackTarget as *const c_void;
		let trampoline = Trampoline::new(&target.signature, dispatch, context)?;
		debug!("callback {} at {:p}", name, trampoline.entry());
		Ok(Callback { trampoline: trampoline, target: target })
	}

	pub fn name(&self) -> &str
	{
		&self.target.name
	}
	/// Native entry point
	pub fn address(&self) -> *const u8
	{
		self.trampoline.entry()
	}
}

impl ::std::fmt::Debug for Callback
{
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result
	{
		write!(f, "Callback({} @ {:p}: {:?})", self.target.name, self.trampoline.entry(), self.target.signature)
	}
}

unsafe extern "C" fn dispatch(context: *const c_void, args: *const u64, ret: *mut u64)
{
	let target = &*(context as *const CallbackTarget);
	let result = panic::catch_unwind(AssertUnwindSafe(|| {
		let values: Vec<Value> = target.signature.args.iter().enumerate()
			.map(|(i, abi)| Value::load(*abi, (args as *const u8).add(i * SLOT_SIZE)))
			.collect();
		(target.func)(&values)
		}));
	match result
	{
	Ok(v) => {
		if let Err(e) = v.store(target.signature.ret, ret as *mut u8) {
			error!("callback {}: {}", target.name, e);
			::std::ptr::write(ret, 0);
		}
		},
	// Unwinding into C is undefined
	Err(_) => {
		error!("callback {} panicked, aborting", target.name);
		::std::process::abort();
		},
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::state::CompilerState;
	use crate::state::testing::{serial, MockBackend};
	use crate::types::Type;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use std::sync::Arc;

	#[test]
	fn callback_roundtrip()
	{
		let calls = Arc::new(AtomicUsize::new(0));
		let c2 = calls.clone();
		let ft = FunctionType::unnamed(Type::int(), &[Type::int(), Type::int()]);
		let cb = Callback::new("add", &ft, move |args| {
			c2.fetch_add(1, Ordering::SeqCst);
			Value::Int(args[0].as_i64().unwrap() + args[1].as_i64().unwrap())
			}).unwrap();
		let f: extern "C" fn(i32, i32) -> i32 = unsafe { ::std::mem::transmute(cb.address()) };
		assert_eq!(f(23, 42), 65);
		assert_eq!(f(-1, 1), 0);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn void_callback()
	{
		let seen = Arc::new(AtomicUsize::new(0));
		let s2 = seen.clone();
		let ft = FunctionType::unnamed(Type::void(), &[Type::pointer_to(&Type::char())]);
		let cb = Callback::new("note", &ft, move |args| {
			s2.store(args[0].as_pointer().unwrap(), Ordering::SeqCst);
			Value::Void
			}).unwrap();
		let f: extern "C" fn(*const u8) = unsafe { ::std::mem::transmute(cb.address()) };
		f(0x1234 as *const u8);
		assert_eq!(seen.load(Ordering::SeqCst), 0x1234);
	}

	#[test]
	fn variadic_callback_rejected()
	{
		let mut ft = FunctionType::unnamed(Type::int(), &[Type::int()]);
		ft.variadic = true;
		match Callback::new("printf", &ft, |_| Value::Void)
		{
		Err(Error::UnsupportedSignature { name, .. }) => assert_eq!(name, "printf"),
		r => panic!("unexpected {:?}", r.map(|_| ())),
		}
	}

	static GATE: AtomicBool = AtomicBool::new(false);

	extern "C" fn gated(v: i32) -> i32
	{
		while !GATE.load(Ordering::SeqCst) {
			::std::thread::yield_now();
		}
		v * 2
	}

	#[test]
	fn try_wait_polls()
	{
		let _g = serial();
		let mut s = CompilerState::with_backend(Box::new(MockBackend::default().with_symbol("gated", gated as *const u8))).unwrap();
		s.compile("").unwrap();
		s.relocate().unwrap();
		let f = s.get_function("gated", &Type::int(), &[Type::int()]).unwrap();

		let pending = f.call_async(&[Value::Int(21)]).unwrap();
		assert_eq!(pending.try_wait().unwrap(), None);
		GATE.store(true, Ordering::SeqCst);
		let v = loop {
			if let Some(v) = pending.try_wait().unwrap() {
				break v;
			}
			::std::thread::yield_now();
			};
		assert_eq!(v, Value::Int(42));
	}
}
