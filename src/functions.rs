//! User-defined SQL functions, aggregates and collations.
//!
//! The engine calls back through plain C function pointers with a `void*`
//! user-data slot, so every host closure registered here is boxed into a
//! wrapper allocation whose raw pointer rides in that slot. The fixed
//! `extern "C"` entry points below recover the wrapper, decode the
//! engine's argument array through the value codec, run the closure, and
//! report the outcome back to the engine. Failures are caught at this
//! boundary: a host error becomes the engine's per-invocation error
//! report, and a panic is never allowed to unwind across the C ABI.
//!
//! Wrapper lifetimes are owned by the engine: registration passes an
//! `xDestroy` destructor, and the engine frees the wrapper exactly once:
//! when the registration is replaced or removed, or when the connection
//! closes.

use std::cmp::Ordering;
use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};

use libsqlite3_sys as ffi;
use tracing::{debug, error};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::value::Value;

/// Per-group state of a user-defined aggregate.
///
/// The engine allocates one opaque context region per invocation group;
/// this layer default-constructs the state there on the group's first row
/// and drops it when the group finishes.
///
/// # Example
///
/// ```rust
/// use litebind::{Aggregate, Connection, Error, Value};
///
/// #[derive(Default)]
/// struct Sum(i64);
///
/// impl Aggregate for Sum {
///     fn step(&mut self, args: &[Value]) -> Result<(), Error> {
///         if let Some(Value::Integer(v)) = args.first() {
///             self.0 += v;
///         }
///         Ok(())
///     }
///
///     fn finalize(&mut self) -> Result<Value, Error> {
///         Ok(Value::Integer(self.0))
///     }
/// }
///
/// let conn = Connection::open_in_memory()?;
/// conn.create_aggregate::<Sum>("mysum", 1)?;
/// # Ok::<(), Error>(())
/// ```
pub trait Aggregate: Default {
    /// Invoked once per input row with that row's argument values.
    ///
    /// # Errors
    /// An error aborts the enclosing query with a step error; the
    /// connection remains usable.
    fn step(&mut self, args: &[Value]) -> Result<()>;

    /// Invoked once at group end; returns the aggregate's result.
    ///
    /// Also invoked on a group that saw no rows at all, in which case the
    /// state is freshly default-constructed.
    ///
    /// # Errors
    /// As [`Aggregate::step`].
    fn finalize(&mut self) -> Result<Value>;
}

type ScalarCallable = Box<dyn FnMut(&[Value]) -> Result<Value>>;

struct ScalarWrapper {
    name: String,
    func: ScalarCallable,
}

struct AggregateWrapper {
    name: String,
}

impl Connection {
    /// Registers a scalar SQL function.
    ///
    /// `arity` is the exact argument count, or `-1` for variable arity.
    /// Declaring a function `deterministic` lets the engine cache and
    /// reorder its calls. A call-time failure inside `func` errors that
    /// one query; the connection survives and later queries are
    /// unaffected.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an unusable name or arity, or the
    /// engine's registration error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use litebind::{Connection, Error, Value};
    ///
    /// let conn = Connection::open_in_memory()?;
    /// conn.create_scalar_function("double", 1, true, |args| {
    ///     let n = match args[0] {
    ///         Value::Integer(n) => n,
    ///         _ => return Err(Error::Conversion("expected an integer".into())),
    ///     };
    ///     Ok(Value::Integer(n * 2))
    /// })?;
    /// # Ok::<(), Error>(())
    /// ```
    pub fn create_scalar_function<F>(
        &self,
        name: &str,
        arity: i32,
        deterministic: bool,
        func: F,
    ) -> Result<()>
    where
        F: FnMut(&[Value]) -> Result<Value> + 'static,
    {
        let c_name = function_name(name)?;
        check_arity(arity)?;
        let wrapper = Box::into_raw(Box::new(ScalarWrapper {
            name: name.to_owned(),
            func: Box::new(func),
        }));
        let mut flags = ffi::SQLITE_UTF8;
        if deterministic {
            flags |= ffi::SQLITE_DETERMINISTIC;
        }
        // SAFETY: the wrapper pointer stays valid until the engine invokes
        // drop_wrapper::<ScalarWrapper> for it; on registration failure it
        // is reclaimed below before the error returns.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                self.handle(),
                c_name.as_ptr(),
                arity as c_int,
                flags,
                wrapper.cast(),
                Some(call_scalar),
                None,
                None,
                Some(drop_wrapper::<ScalarWrapper>),
            )
        };
        if rc != ffi::SQLITE_OK {
            // SAFETY: the engine rejected the registration, so it will
            // never call xDestroy; reclaim the wrapper here.
            drop(unsafe { Box::from_raw(wrapper) });
            return self.check(rc, "create_function");
        }
        debug!(function = name, arity, deterministic, "scalar function registered");
        Ok(())
    }

    /// Removes a previously registered function (scalar or aggregate)
    /// with the given name and arity.
    ///
    /// # Errors
    /// The engine's deregistration error, if any.
    pub fn remove_function(&self, name: &str, arity: i32) -> Result<()> {
        let c_name = function_name(name)?;
        check_arity(arity)?;
        // SAFETY: registering with all-null callbacks unregisters; the
        // engine frees the previous wrapper through its xDestroy.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                self.handle(),
                c_name.as_ptr(),
                arity as c_int,
                ffi::SQLITE_UTF8,
                std::ptr::null_mut(),
                None,
                None,
                None,
                None,
            )
        };
        self.check(rc, "remove_function")
    }

    /// Registers a stateful aggregate function with per-group state `A`.
    ///
    /// `arity` is the exact argument count, or `-1` for variable arity.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an unusable name or arity, or the
    /// engine's registration error.
    pub fn create_aggregate<A: Aggregate + 'static>(&self, name: &str, arity: i32) -> Result<()> {
        let c_name = function_name(name)?;
        check_arity(arity)?;
        let wrapper = Box::into_raw(Box::new(AggregateWrapper {
            name: name.to_owned(),
        }));
        // SAFETY: as in create_scalar_function; the step/final entry
        // points are monomorphized over A.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                self.handle(),
                c_name.as_ptr(),
                arity as c_int,
                ffi::SQLITE_UTF8,
                wrapper.cast(),
                None,
                Some(aggregate_step::<A>),
                Some(aggregate_final::<A>),
                Some(drop_wrapper::<AggregateWrapper>),
            )
        };
        if rc != ffi::SQLITE_OK {
            // SAFETY: rejected registration never reaches xDestroy.
            drop(unsafe { Box::from_raw(wrapper) });
            return self.check(rc, "create_aggregate");
        }
        debug!(function = name, arity, "aggregate registered");
        Ok(())
    }

    /// Registers a collation: a total order over two text values.
    ///
    /// The engine provides no error channel for collations, so the
    /// comparator must not fail; a panic inside it aborts the process
    /// rather than unwinding across the C boundary.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an unusable name, or the engine's
    /// registration error.
    pub fn create_collation<C>(&self, name: &str, compare: C) -> Result<()>
    where
        C: Fn(&str, &str) -> Ordering + 'static,
    {
        let c_name = function_name(name)?;
        let wrapper = Box::into_raw(Box::new(compare));
        // SAFETY: as in create_scalar_function.
        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                self.handle(),
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                wrapper.cast(),
                Some(call_collation::<C>),
                Some(drop_wrapper::<C>),
            )
        };
        if rc != ffi::SQLITE_OK {
            // SAFETY: rejected registration never reaches xDestroy.
            drop(unsafe { Box::from_raw(wrapper) });
            return self.check(rc, "create_collation");
        }
        debug!(collation = name, "collation registered");
        Ok(())
    }

    /// Removes a previously registered collation.
    ///
    /// # Errors
    /// The engine's deregistration error, if any.
    pub fn remove_collation(&self, name: &str) -> Result<()> {
        let c_name = function_name(name)?;
        // SAFETY: a null comparator unregisters; the engine frees the
        // previous wrapper through its xDestroy.
        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                self.handle(),
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                std::ptr::null_mut(),
                None,
                None,
            )
        };
        self.check(rc, "remove_collation")
    }
}

fn function_name(name: &str) -> Result<CString> {
    CString::new(name)
        .map_err(|_| Error::InvalidArgument("function name contains a NUL byte".into()))
}

fn check_arity(arity: i32) -> Result<()> {
    // -1 is the engine's variable-arity marker; 127 its argument limit.
    if (-1..=127).contains(&arity) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "function arity {arity} outside -1..=127"
        )))
    }
}

/// Frees a wrapper allocation handed to the engine as user data. The
/// engine guarantees exactly one invocation per registration.
unsafe extern "C" fn drop_wrapper<T>(wrapper: *mut c_void) {
    drop(Box::from_raw(wrapper.cast::<T>()));
}

/// Decodes the engine-supplied argument array into owned values.
///
/// # Safety
/// `argv` must point to `argc` valid value handles.
unsafe fn decode_args(argc: c_int, argv: *mut *mut ffi::sqlite3_value) -> Result<Vec<Value>> {
    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        args.push(decode_value(*argv.add(i))?);
    }
    Ok(args)
}

/// Decodes one engine value handle into an owned [`Value`].
///
/// # Safety
/// `value` must be a valid protected value handle.
unsafe fn decode_value(value: *mut ffi::sqlite3_value) -> Result<Value> {
    match ffi::sqlite3_value_type(value) {
        ffi::SQLITE_INTEGER => Ok(Value::Integer(ffi::sqlite3_value_int64(value))),
        ffi::SQLITE_FLOAT => Ok(Value::Real(ffi::sqlite3_value_double(value))),
        ffi::SQLITE_TEXT => {
            let ptr = ffi::sqlite3_value_text(value);
            if ptr.is_null() {
                return Ok(Value::Text(String::new()));
            }
            let len = ffi::sqlite3_value_bytes(value) as usize;
            let bytes = std::slice::from_raw_parts(ptr, len);
            Ok(Value::Text(std::str::from_utf8(bytes)?.to_owned()))
        }
        ffi::SQLITE_BLOB => {
            let ptr = ffi::sqlite3_value_blob(value);
            if ptr.is_null() {
                return Ok(Value::Blob(Vec::new()));
            }
            let len = ffi::sqlite3_value_bytes(value) as usize;
            Ok(Value::Blob(
                std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec(),
            ))
        }
        ffi::SQLITE_NULL => Ok(Value::Null),
        other => Err(Error::Conversion(format!(
            "unknown value type tag {other}"
        ))),
    }
}

/// Writes a host value into the engine's result slot for the current
/// invocation.
///
/// # Safety
/// `ctx` must be the context of an in-flight function invocation.
unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
    match value {
        Value::Null => ffi::sqlite3_result_null(ctx),
        Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
        Value::Real(v) => ffi::sqlite3_result_double(ctx, *v),
        Value::Text(v) => {
            let len = match c_int::try_from(v.len()) {
                Ok(len) => len,
                Err(_) => {
                    report_failure(ctx, "<result>", "text result too large");
                    return;
                }
            };
            ffi::sqlite3_result_text(
                ctx,
                v.as_ptr() as *const c_char,
                len,
                ffi::SQLITE_TRANSIENT(),
            );
        }
        Value::Blob(v) => {
            let len = match c_int::try_from(v.len()) {
                Ok(len) => len,
                Err(_) => {
                    report_failure(ctx, "<result>", "blob result too large");
                    return;
                }
            };
            ffi::sqlite3_result_blob(ctx, v.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT());
        }
    }
}

/// Reports a host-level failure through the engine's per-invocation error
/// channel.
///
/// # Safety
/// `ctx` must be the context of an in-flight function invocation.
unsafe fn report_failure(ctx: *mut ffi::sqlite3_context, name: &str, detail: &str) {
    let message = format!("{name}: {detail}");
    ffi::sqlite3_result_error(ctx, message.as_ptr() as *const c_char, message.len() as c_int);
}

unsafe extern "C" fn call_scalar(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let wrapper = ffi::sqlite3_user_data(ctx).cast::<ScalarWrapper>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let args = decode_args(argc, argv)?;
        ((*wrapper).func)(&args)
    }));
    match outcome {
        Ok(Ok(value)) => set_result(ctx, &value),
        Ok(Err(err)) => report_failure(ctx, &(*wrapper).name, &err.to_string()),
        Err(_) => report_failure(ctx, &(*wrapper).name, "panic in user function"),
    }
}

unsafe extern "C" fn aggregate_step<A: Aggregate>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let wrapper = ffi::sqlite3_user_data(ctx).cast::<AggregateWrapper>();
    // The engine hands out a zero-initialized region per invocation group;
    // a pointer to the heap-allocated state lives inside it.
    let region = ffi::sqlite3_aggregate_context(ctx, std::mem::size_of::<*mut A>() as c_int)
        .cast::<*mut A>();
    if region.is_null() {
        ffi::sqlite3_result_error_nomem(ctx);
        return;
    }
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        if (*region).is_null() {
            *region = Box::into_raw(Box::new(A::default()));
        }
        let args = decode_args(argc, argv)?;
        (**region).step(&args)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => report_failure(ctx, &(*wrapper).name, &err.to_string()),
        Err(_) => report_failure(ctx, &(*wrapper).name, "panic in aggregate step"),
    }
}

unsafe extern "C" fn aggregate_final<A: Aggregate>(ctx: *mut ffi::sqlite3_context) {
    let wrapper = ffi::sqlite3_user_data(ctx).cast::<AggregateWrapper>();
    // Passing zero bytes returns the existing region without allocating;
    // null means the group saw no rows at all.
    let region = ffi::sqlite3_aggregate_context(ctx, 0).cast::<*mut A>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut state = if region.is_null() || (*region).is_null() {
            Box::new(A::default())
        } else {
            let state = Box::from_raw(*region);
            *region = std::ptr::null_mut();
            state
        };
        state.finalize()
    }));
    match outcome {
        Ok(Ok(value)) => set_result(ctx, &value),
        Ok(Err(err)) => report_failure(ctx, &(*wrapper).name, &err.to_string()),
        Err(_) => report_failure(ctx, &(*wrapper).name, "panic in aggregate finalize"),
    }
}

/// Builds a byte slice from a possibly-null engine pointer.
///
/// # Safety
/// A non-null `ptr` must be valid for `len` bytes.
unsafe fn raw_slice<'a>(ptr: *const c_void, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize)
    }
}

unsafe extern "C" fn call_collation<C>(
    wrapper: *mut c_void,
    left_len: c_int,
    left: *const c_void,
    right_len: c_int,
    right: *const c_void,
) -> c_int
where
    C: Fn(&str, &str) -> Ordering + 'static,
{
    let compare = &*wrapper.cast::<C>();
    let left = raw_slice(left, left_len);
    let right = raw_slice(right, right_len);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // The engine registered this comparator as UTF-8; fall back to a
        // bytewise order if a value slips through undecodable.
        match (std::str::from_utf8(left), std::str::from_utf8(right)) {
            (Ok(a), Ok(b)) => compare(a, b),
            _ => left.cmp(right),
        }
    }));
    match outcome {
        Ok(Ordering::Less) => -1,
        Ok(Ordering::Equal) => 0,
        Ok(Ordering::Greater) => 1,
        Err(_) => {
            // Collations have no error channel and returning an unstable
            // order would corrupt the engine's sort invariants.
            error!("panic in collation comparator");
            std::process::abort();
        }
    }
}
