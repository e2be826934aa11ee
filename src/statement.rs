//! Prepared statements and parameter binding.
//!
//! A [`Statement`] moves through four states: *empty* (no handle was
//! produced because the SQL was blank or comment-only), *ready* (not yet
//! stepped since the last reset), *stepping* (mid-iteration) and
//! *exhausted*. The one rule callers must respect: after a statement has
//! been stepped, whether by [`Statement::execute`] or by iterating a
//! [`Rows`](crate::Rows), it must be [`reset`](Statement::reset) before
//! it can run again. Re-fetching without a reset is a hard error, because
//! the underlying cursor cannot rewind.

use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::rc::Rc;

use libsqlite3_sys as ffi;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{errcode, errmsg, Error, Result};
use crate::rows::Rows;
use crate::value::{ToSql, Value};

pub(crate) struct InnerStatement {
    conn: Connection,
    handle: Cell<*mut ffi::sqlite3_stmt>,
    sql: String,
    param_count: usize,
    dirty: Cell<bool>,
}

impl InnerStatement {
    fn finalize_handle(&self) -> c_int {
        let handle = self.handle.replace(std::ptr::null_mut());
        if handle.is_null() {
            return ffi::SQLITE_OK;
        }
        // SAFETY: the handle was valid and is nulled out above, so the
        // finalize runs exactly once.
        unsafe { ffi::sqlite3_finalize(handle) }
    }
}

impl Drop for InnerStatement {
    fn drop(&mut self) {
        // sqlite3_finalize repeats the most recent step error, which was
        // already surfaced to the caller; nothing to report here.
        let _ = self.finalize_handle();
    }
}

/// A compiled SQL statement bound to its owning [`Connection`].
///
/// `Statement` is reference-counted: clones share the same underlying
/// handle and bound parameters, and the native finalize runs once when the
/// last clone drops. A statement keeps its connection alive.
///
/// # Example
///
/// ```rust
/// use litebind::Connection;
///
/// let conn = Connection::open_in_memory()?;
/// conn.execute("CREATE TABLE t(x INTEGER)")?;
/// let stmt = conn.prepare("INSERT INTO t(x) VALUES (?1)")?;
/// for x in 0..3 {
///     stmt.bind(1, x)?;
///     stmt.execute()?;
///     stmt.reset()?;
/// }
/// # Ok::<(), litebind::Error>(())
/// ```
#[derive(Clone)]
pub struct Statement {
    inner: Rc<InnerStatement>,
}

impl Statement {
    pub(crate) fn new(conn: Connection, handle: *mut ffi::sqlite3_stmt, sql: &str) -> Statement {
        let param_count = if handle.is_null() {
            0
        } else {
            // SAFETY: the handle is valid until finalize.
            unsafe { ffi::sqlite3_bind_parameter_count(handle) as usize }
        };
        debug!(sql = sql.trim(), params = param_count, empty = handle.is_null(), "statement prepared");
        Statement {
            inner: Rc::new(InnerStatement {
                conn,
                handle: Cell::new(handle),
                sql: sql.to_owned(),
                param_count,
                dirty: Cell::new(false),
            }),
        }
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// True when the prepared text was blank or comment-only and the
    /// engine produced no handle. Empty statements bind nothing, change
    /// nothing and yield an immediately empty result sequence.
    pub fn is_empty(&self) -> bool {
        self.inner.handle.get().is_null()
    }

    /// Number of SQL parameters in this statement.
    pub fn parameter_count(&self) -> usize {
        self.inner.param_count
    }

    /// Resolves a named parameter (including its sigil, e.g. `":id"`) to
    /// its 1-based index. Resolution happens per call; nothing is cached.
    pub fn parameter_index(&self, name: &str) -> Result<Option<usize>> {
        let handle = self.inner.handle.get();
        if handle.is_null() {
            return Ok(None);
        }
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidArgument("parameter name contains a NUL byte".into()))?;
        // SAFETY: the handle is valid and c_name is NUL-terminated.
        let index = unsafe { ffi::sqlite3_bind_parameter_index(handle, c_name.as_ptr()) };
        Ok(if index == 0 { None } else { Some(index as usize) })
    }

    /// Binds `value` to the parameter at 1-based `index`.
    ///
    /// Binding an empty statement is a no-op. Text and blob contents are
    /// copied by the engine at bind time, so no borrow outlives this call.
    ///
    /// # Errors
    /// [`Error::Bind`] when the statement has no parameters or the index
    /// is outside `[1, parameter_count]`.
    pub fn bind<T: ToSql>(&self, index: usize, value: T) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.inner.param_count == 0 {
            return Err(Error::Bind(format!(
                "statement `{}` has no parameters",
                self.inner.sql.trim()
            )));
        }
        if index == 0 || index > self.inner.param_count {
            return Err(Error::Bind(format!(
                "parameter index {index} out of range 1..={}",
                self.inner.param_count
            )));
        }
        let value = value.to_value()?;
        self.bind_value(index, &value)
    }

    /// Binds `value` to the named parameter `name` (sigil included).
    ///
    /// The name is resolved through the engine on every call.
    ///
    /// # Errors
    /// [`Error::Bind`] when the name does not resolve.
    pub fn bind_name<T: ToSql>(&self, name: &str, value: T) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        match self.parameter_index(name)? {
            Some(index) => self.bind(index, value),
            None => Err(Error::Bind(format!("no parameter named `{name}`"))),
        }
    }

    fn bind_value(&self, index: usize, value: &Value) -> Result<()> {
        let handle = self.inner.handle.get();
        let index = index as c_int;
        // SAFETY: the handle is valid and the index was range-checked.
        // Text and blob payloads are handed over with the transient
        // destructor, so the engine copies them before returning.
        let rc = unsafe {
            match value {
                Value::Null => ffi::sqlite3_bind_null(handle, index),
                Value::Integer(v) => ffi::sqlite3_bind_int64(handle, index, *v),
                Value::Real(v) => ffi::sqlite3_bind_double(handle, index, *v),
                Value::Text(v) => ffi::sqlite3_bind_text(
                    handle,
                    index,
                    v.as_ptr() as *const c_char,
                    c_int::try_from(v.len())
                        .map_err(|_| Error::Bind("text value too large to bind".into()))?,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Value::Blob(v) => ffi::sqlite3_bind_blob(
                    handle,
                    index,
                    v.as_ptr().cast(),
                    c_int::try_from(v.len())
                        .map_err(|_| Error::Bind("blob value too large to bind".into()))?,
                    ffi::SQLITE_TRANSIENT(),
                ),
            }
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(Error::Bind(unsafe { errmsg(self.conn().handle()) }))
        }
    }

    /// Clears all bound parameter values back to NULL.
    ///
    /// [`Statement::reset`] deliberately does not do this; bindings
    /// survive a reset so a statement can be re-run with the same values.
    pub fn clear_bindings(&self) -> Result<()> {
        let handle = self.inner.handle.get();
        if handle.is_null() {
            return Ok(());
        }
        // SAFETY: the handle is valid.
        let rc = unsafe { ffi::sqlite3_clear_bindings(handle) };
        self.conn().check(rc, "clear_bindings")
    }

    /// Re-arms the statement so it can be stepped from the beginning.
    ///
    /// Bound parameter values are kept; use [`Statement::clear_bindings`]
    /// to drop them. Resetting after a step failure clears the error
    /// condition.
    pub fn reset(&self) -> Result<()> {
        let handle = self.inner.handle.get();
        if !handle.is_null() {
            // sqlite3_reset returns the most recent step error, which the
            // caller already saw; the reset itself cannot fail.
            // SAFETY: the handle is valid.
            unsafe { ffi::sqlite3_reset(handle) };
        }
        self.inner.dirty.set(false);
        Ok(())
    }

    /// Steps the statement to completion, discarding any rows, and
    /// returns the number of rows changed by it.
    ///
    /// # Errors
    /// [`Error::Step`] on an execution failure, or when the statement has
    /// already run since its last reset.
    pub fn execute(&self) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        self.ensure_fresh()?;
        while self.step()? {}
        Ok(self.conn().changes())
    }

    /// Starts iterating the statement's result rows.
    ///
    /// The returned [`Rows`] is a lazy, forward-only, single-pass
    /// sequence; each row is decoded into an owned snapshot as it is
    /// produced.
    ///
    /// # Errors
    /// [`Error::Step`] when the statement has already run since its last
    /// reset. Re-fetching requires an explicit [`Statement::reset`].
    pub fn query(&self) -> Result<Rows> {
        self.ensure_fresh()?;
        Ok(Rows::new(self.clone()))
    }

    /// Number of columns this statement produces per row.
    pub fn column_count(&self) -> usize {
        let handle = self.inner.handle.get();
        if handle.is_null() {
            0
        } else {
            // SAFETY: the handle is valid.
            unsafe { ffi::sqlite3_column_count(handle) as usize }
        }
    }

    /// Name of the result column at 0-based `index`, as declared by the
    /// query text.
    ///
    /// # Errors
    /// [`Error::Column`] when the index is out of range.
    pub fn column_name(&self, index: usize) -> Result<String> {
        let count = self.column_count();
        if index >= count {
            return Err(Error::Column(format!(
                "column index {index} out of range for {count} columns"
            )));
        }
        let handle = self.inner.handle.get();
        // SAFETY: the handle is valid and the index was range-checked; the
        // name string is engine-owned and copied immediately.
        let name = unsafe { ffi::sqlite3_column_name(handle, index as c_int) };
        if name.is_null() {
            return Err(Error::Column(format!("column {index} has no name")));
        }
        Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    /// Explicitly finalizes the statement.
    ///
    /// A no-op while other clones (or a live [`Rows`](crate::Rows)) still
    /// share the handle; otherwise the handle is released immediately.
    ///
    /// # Errors
    /// [`Error::Close`] when the engine reports a nonzero finalize result.
    pub fn finalize(self) -> Result<()> {
        match Rc::try_unwrap(self.inner) {
            Ok(inner) => {
                let rc = inner.finalize_handle();
                if rc == ffi::SQLITE_OK {
                    Ok(())
                } else {
                    Err(Error::Close {
                        code: rc,
                        message: crate::error::errstr(rc),
                    })
                }
            }
            Err(_shared) => Ok(()),
        }
    }

    /// Advances the statement by one unit. `Ok(true)` means a row is
    /// available for reading; `Ok(false)` means the statement completed.
    pub(crate) fn step(&self) -> Result<bool> {
        let handle = self.inner.handle.get();
        self.inner.dirty.set(true);
        // SAFETY: the handle is valid; empty statements never reach here
        // because their sequences report done without stepping.
        let rc = unsafe { ffi::sqlite3_step(handle) };
        match rc {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            _ => {
                let code = unsafe { errcode(self.conn().handle(), rc) };
                let message = unsafe { errmsg(self.conn().handle()) };
                warn!(code, sql = self.inner.sql.trim(), "statement step failed");
                Err(Error::Step { code, message })
            }
        }
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.inner.dirty.get() {
            return Err(Error::Step {
                code: ffi::SQLITE_MISUSE,
                message: "statement already executed; call reset() before running it again".into(),
            });
        }
        Ok(())
    }

    pub(crate) fn raw_handle(&self) -> *mut ffi::sqlite3_stmt {
        self.inner.handle.get()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.inner.conn
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.inner.sql)
            .field("empty", &self.is_empty())
            .field("dirty", &self.inner.dirty.get())
            .finish()
    }
}
