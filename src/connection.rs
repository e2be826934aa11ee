//! Database connection handling.
//!
//! A [`Connection`] owns exactly one engine handle. Cloning a `Connection`
//! is cheap and shares the handle; the native close runs once, when the
//! last clone (including clones held by live [`Statement`]s) is dropped.

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString};
use std::ops::BitOr;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use libsqlite3_sys as ffi;
use tracing::{debug, error};

use crate::error::{errcode, errmsg, errstr, Error, Result};
use crate::hooks::HookSlots;
use crate::statement::Statement;

/// Flags controlling how a database file is opened.
///
/// The default is read-write with create-if-absent, matching the engine's
/// own default open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(c_int);

impl OpenFlags {
    /// Open the database read-only; fail if it does not exist.
    pub const READ_ONLY: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_READONLY);
    /// Open the database for reading and writing; fail if it does not exist.
    pub const READ_WRITE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_READWRITE);
    /// Create the database if it does not exist. Meaningful only together
    /// with [`OpenFlags::READ_WRITE`].
    pub const CREATE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_CREATE);
    /// Interpret the path as a URI with query-style options.
    pub const URI: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_URI);
    /// Open an in-memory database regardless of the path.
    pub const MEMORY: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_MEMORY);
    /// Request the engine's multi-thread (unlocked) connection mode.
    pub const NO_MUTEX: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_NOMUTEX);
    /// Request the engine's serialized (fully locked) connection mode.
    pub const FULL_MUTEX: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_FULLMUTEX);

    /// Returns the raw engine flag bits.
    pub fn bits(self) -> i32 {
        self.0
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::READ_WRITE | OpenFlags::CREATE
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Schema metadata for one table column, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Declared type from the table definition, if any.
    pub declared_type: Option<String>,
    /// Name of the column's default collation sequence.
    pub collation: Option<String>,
    /// True when the column carries a NOT NULL constraint.
    pub not_null: bool,
    /// True when the column is part of the primary key.
    pub primary_key: bool,
    /// True when the column is an AUTOINCREMENT rowid alias.
    pub auto_increment: bool,
}

pub(crate) struct InnerConnection {
    db: *mut ffi::sqlite3,
    open: Cell<bool>,
    pub(crate) hooks: RefCell<HookSlots>,
}

impl InnerConnection {
    fn close_handle(&self) -> Result<()> {
        if !self.open.get() {
            return Ok(());
        }
        // SAFETY: the handle is valid while `open` is set.
        let rc = unsafe { ffi::sqlite3_close(self.db) };
        if rc == ffi::SQLITE_OK {
            self.open.set(false);
            debug!("connection closed");
            Ok(())
        } else {
            let code = unsafe { errcode(self.db, rc) };
            let message = unsafe { errmsg(self.db) };
            // The handle survives a refused close, but a retry from drop
            // would report the same condition. Leak it instead.
            self.open.set(false);
            Err(Error::Close { code, message })
        }
    }
}

impl Drop for InnerConnection {
    fn drop(&mut self) {
        // Statements hold a strong reference to the connection, so this
        // only runs once every derived handle is already finalized.
        if self.open.get() {
            // SAFETY: the handle is valid while `open` is set.
            let rc = unsafe { ffi::sqlite3_close(self.db) };
            if rc != ffi::SQLITE_OK {
                // There is no caller to report to on this path, and
                // unwinding out of drop is not an option.
                error!(code = rc, "closing connection handle failed during drop");
                std::process::abort();
            }
            self.open.set(false);
        }
        // Hook wrappers are freed after the close: a close that rolls back
        // an open transaction can still fire the rollback hook.
    }
}

/// A handle to an open database.
///
/// `Connection` is a reference-counted value: clones share the same
/// underlying engine handle. It is intentionally `!Send` and `!Sync`;
/// concurrent use of one connection from multiple threads is not supported
/// by this layer. Open separate connections per thread instead.
///
/// # Example
///
/// ```rust
/// use litebind::Connection;
///
/// let conn = Connection::open_in_memory()?;
/// conn.execute("CREATE TABLE t(x INTEGER)")?;
/// # Ok::<(), litebind::Error>(())
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Rc<InnerConnection>,
}

impl Connection {
    /// Opens a database with the default flags (read-write, create).
    ///
    /// `path` may be a filesystem path, the reserved `:memory:` designator,
    /// or the empty string for an anonymous temporary database.
    ///
    /// # Errors
    /// [`Error::Open`] with the engine's code and message when the handle
    /// cannot be established.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
        Connection::open_with_flags(path, OpenFlags::default())
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Connection> {
        Connection::open(":memory:")
    }

    /// Opens a database with explicit [`OpenFlags`].
    ///
    /// # Errors
    /// [`Error::Open`] when the engine cannot establish a handle, or
    /// [`Error::InvalidArgument`] if the path contains a NUL byte.
    pub fn open_with_flags<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Connection> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let c_path = CString::new(path.as_str())
            .map_err(|_| Error::InvalidArgument("database path contains a NUL byte".into()))?;
        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        // SAFETY: c_path is a valid NUL-terminated string and db is a valid
        // out-pointer. A failed open can still allocate a handle, which must
        // be closed before the error is returned.
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags.bits(), ptr::null()) };
        if rc != ffi::SQLITE_OK {
            let err = if db.is_null() {
                Error::Open {
                    code: rc,
                    message: errstr(rc),
                }
            } else {
                let code = unsafe { errcode(db, rc) };
                let message = unsafe { errmsg(db) };
                unsafe { ffi::sqlite3_close(db) };
                Error::Open { code, message }
            };
            return Err(err);
        }
        // SAFETY: db is a valid handle from this point on.
        unsafe { ffi::sqlite3_extended_result_codes(db, 1) };
        debug!(path = %path, flags = flags.bits(), "database opened");
        Ok(Connection {
            inner: Rc::new(InnerConnection {
                db,
                open: Cell::new(true),
                hooks: RefCell::new(HookSlots::default()),
            }),
        })
    }

    pub(crate) fn handle(&self) -> *mut ffi::sqlite3 {
        self.inner.db
    }

    pub(crate) fn hooks(&self) -> &RefCell<HookSlots> {
        &self.inner.hooks
    }

    /// Compiles one semicolon-delimited SQL statement.
    ///
    /// Whitespace- or comment-only text yields an *empty* statement: its
    /// result sequence is permanently empty, its parameter count is zero,
    /// and binding to it is a no-op. Any SQL after the first statement is
    /// ignored; use [`Connection::execute`] for multi-statement scripts.
    ///
    /// # Errors
    /// [`Error::Prepare`] on invalid SQL.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let (stmt, _consumed) = self.prepare_raw(sql)?;
        Ok(Statement::new(self.clone(), stmt, sql))
    }

    /// Runs one or more semicolon-separated statements, discarding any
    /// rows they produce.
    ///
    /// Statements run in order and stop at the first failure. No implicit
    /// transaction wraps the script: statements already applied stay
    /// applied. Callers needing atomicity must wrap the call in an
    /// explicit transaction.
    ///
    /// # Errors
    /// [`Error::Sql`] carrying the engine code, message, and the offending
    /// statement text.
    pub fn execute(&self, sql: &str) -> Result<()> {
        let mut rest = sql;
        while !rest.trim().is_empty() {
            let (stmt, consumed) = self.prepare_raw(rest).map_err(|err| match err {
                Error::Prepare { code, message, sql } => Error::Sql { code, message, sql },
                other => other,
            })?;
            if consumed == 0 {
                break;
            }
            let statement_sql = rest[..consumed].trim();
            let tail = &rest[consumed..];
            if stmt.is_null() {
                rest = tail;
                continue;
            }
            loop {
                // SAFETY: stmt is a valid statement handle until finalized.
                let rc = unsafe { ffi::sqlite3_step(stmt) };
                match rc {
                    ffi::SQLITE_ROW => continue,
                    ffi::SQLITE_DONE => break,
                    _ => {
                        let code = unsafe { errcode(self.handle(), rc) };
                        let message = unsafe { errmsg(self.handle()) };
                        unsafe { ffi::sqlite3_finalize(stmt) };
                        return Err(Error::Sql {
                            code,
                            message,
                            sql: statement_sql.to_owned(),
                        });
                    }
                }
            }
            // SAFETY: stmt was stepped to completion above.
            unsafe { ffi::sqlite3_finalize(stmt) };
            rest = tail;
        }
        Ok(())
    }

    /// Compiles the first statement in `sql`, returning the raw handle
    /// (null for empty input) and the number of bytes consumed.
    pub(crate) fn prepare_raw(&self, sql: &str) -> Result<(*mut ffi::sqlite3_stmt, usize)> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| Error::InvalidArgument("SQL text exceeds the engine's length limit".into()))?;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: the SQL pointer/length pair is valid for the duration of
        // the call and the out-pointers are valid.
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                self.handle(),
                sql.as_ptr() as *const c_char,
                len,
                &mut stmt,
                &mut tail,
            )
        };
        if rc != ffi::SQLITE_OK {
            let code = unsafe { errcode(self.handle(), rc) };
            let message = unsafe { errmsg(self.handle()) };
            // Confine the reported text to the first statement; echoing the
            // whole remaining script buries the offending one. The parser's
            // tail tells how far it got, with a statement split as fallback.
            let consumed = if tail.is_null() {
                0
            } else {
                tail as usize - sql.as_ptr() as usize
            };
            let offending = sql
                .get(..consumed)
                .filter(|parsed| !parsed.trim().is_empty())
                .unwrap_or_else(|| sql.split(';').next().unwrap_or(sql));
            return Err(Error::Prepare {
                code,
                message,
                sql: offending.trim().to_owned(),
            });
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            tail as usize - sql.as_ptr() as usize
        };
        Ok((stmt, consumed))
    }

    /// Begins a deferred transaction.
    ///
    /// Nesting and validity are enforced by the engine; a `BEGIN` inside an
    /// open transaction surfaces as the engine's error.
    pub fn begin(&self) -> Result<()> {
        self.execute("BEGIN")
    }

    /// Commits the current transaction.
    pub fn commit(&self) -> Result<()> {
        self.execute("COMMIT")
    }

    /// Rolls back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK")
    }

    /// Establishes a named savepoint.
    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("SAVEPOINT \"{}\"", escape_ident(name)))
    }

    /// Releases a named savepoint.
    pub fn release(&self, name: &str) -> Result<()> {
        self.execute(&format!("RELEASE \"{}\"", escape_ident(name)))
    }

    /// Rolls back to a named savepoint, keeping the savepoint itself.
    pub fn rollback_to(&self, name: &str) -> Result<()> {
        self.execute(&format!("ROLLBACK TO \"{}\"", escape_ident(name)))
    }

    /// Number of rows changed by the most recent INSERT, UPDATE or DELETE
    /// on this connection.
    pub fn changes(&self) -> usize {
        // SAFETY: the handle is valid while the connection is alive.
        unsafe { ffi::sqlite3_changes(self.handle()) as usize }
    }

    /// Total rows changed since the connection was opened.
    pub fn total_changes(&self) -> usize {
        // SAFETY: as above.
        unsafe { ffi::sqlite3_total_changes(self.handle()) as usize }
    }

    /// Rowid of the most recent successful INSERT on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        // SAFETY: as above.
        unsafe { ffi::sqlite3_last_insert_rowid(self.handle()) }
    }

    /// True when the connection is outside any explicit transaction.
    pub fn is_autocommit(&self) -> bool {
        // SAFETY: as above.
        unsafe { ffi::sqlite3_get_autocommit(self.handle()) != 0 }
    }

    /// Sets the engine's busy handler to sleep-and-retry for up to the
    /// given duration when a table is locked.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let ms = c_int::try_from(timeout.as_millis())
            .map_err(|_| Error::InvalidArgument("busy timeout exceeds i32 milliseconds".into()))?;
        // SAFETY: as above.
        let rc = unsafe { ffi::sqlite3_busy_timeout(self.handle(), ms) };
        self.check(rc, "busy_timeout")
    }

    /// Interrupts any long-running operation in progress on this
    /// connection. The interrupted call fails with an interrupt-class
    /// step error.
    pub fn interrupt(&self) {
        // SAFETY: as above.
        unsafe { ffi::sqlite3_interrupt(self.handle()) }
    }

    /// Reads schema metadata for one column of `table`.
    ///
    /// # Errors
    /// [`Error::Column`] when the table/column pair does not exist.
    pub fn column_metadata(&self, table: &str, column: &str) -> Result<ColumnMetadata> {
        let c_table = CString::new(table)
            .map_err(|_| Error::InvalidArgument("table name contains a NUL byte".into()))?;
        let c_column = CString::new(column)
            .map_err(|_| Error::InvalidArgument("column name contains a NUL byte".into()))?;
        let mut declared_type: *const c_char = ptr::null();
        let mut collation: *const c_char = ptr::null();
        let mut not_null: c_int = 0;
        let mut primary_key: c_int = 0;
        let mut auto_increment: c_int = 0;
        // SAFETY: all pointers are valid for the duration of the call; the
        // returned strings are owned by the engine and copied immediately.
        let rc = unsafe {
            ffi::sqlite3_table_column_metadata(
                self.handle(),
                ptr::null(),
                c_table.as_ptr(),
                c_column.as_ptr(),
                &mut declared_type,
                &mut collation,
                &mut not_null,
                &mut primary_key,
                &mut auto_increment,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(Error::Column(format!(
                "no metadata for {table}.{column}: {}",
                unsafe { errmsg(self.handle()) }
            )));
        }
        let copy = |p: *const c_char| {
            if p.is_null() {
                None
            } else {
                // SAFETY: non-null metadata strings are valid NUL-terminated
                // engine-owned text.
                Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
            }
        };
        Ok(ColumnMetadata {
            declared_type: copy(declared_type),
            collation: copy(collation),
            not_null: not_null != 0,
            primary_key: primary_key != 0,
            auto_increment: auto_increment != 0,
        })
    }

    /// Enables or disables extension loading for this connection.
    pub fn enable_load_extension(&self, enabled: bool) -> Result<()> {
        // SAFETY: the handle is valid while the connection is alive.
        let rc = unsafe { ffi::sqlite3_enable_load_extension(self.handle(), c_int::from(enabled)) };
        self.check(rc, "enable_load_extension")
    }

    /// Loads a shared-library extension into this connection.
    ///
    /// `entry_point` defaults to the engine's derived entry symbol when
    /// `None`. Loading must first be enabled with
    /// [`Connection::enable_load_extension`].
    pub fn load_extension(&self, path: &str, entry_point: Option<&str>) -> Result<()> {
        let c_path = CString::new(path)
            .map_err(|_| Error::InvalidArgument("extension path contains a NUL byte".into()))?;
        let c_entry = match entry_point {
            Some(entry) => Some(CString::new(entry).map_err(|_| {
                Error::InvalidArgument("extension entry point contains a NUL byte".into())
            })?),
            None => None,
        };
        let mut raw_msg: *mut c_char = ptr::null_mut();
        // SAFETY: all pointers are valid; the error message, if any, is
        // engine-allocated and released with sqlite3_free below.
        let rc = unsafe {
            ffi::sqlite3_load_extension(
                self.handle(),
                c_path.as_ptr(),
                c_entry.as_ref().map_or(ptr::null(), |entry| entry.as_ptr()),
                &mut raw_msg,
            )
        };
        if rc == ffi::SQLITE_OK {
            return Ok(());
        }
        let message = if raw_msg.is_null() {
            errstr(rc)
        } else {
            // SAFETY: non-null raw_msg is a valid engine-allocated string.
            let msg = unsafe { CStr::from_ptr(raw_msg) }.to_string_lossy().into_owned();
            unsafe { ffi::sqlite3_free(raw_msg.cast()) };
            msg
        };
        Err(Error::Sql {
            code: rc,
            message,
            sql: path.to_owned(),
        })
    }

    /// Explicitly closes the connection.
    ///
    /// When other clones of this connection (or live statements derived
    /// from it) still exist, this is a no-op; the handle closes when the
    /// last reference drops. When this is the last reference, the close
    /// runs immediately and any engine refusal surfaces here instead of
    /// aborting in drop.
    ///
    /// # Errors
    /// [`Error::Close`] when the engine reports a nonzero result.
    pub fn close(self) -> Result<()> {
        match Rc::try_unwrap(self.inner) {
            Ok(inner) => {
                let result = inner.close_handle();
                drop(inner);
                result
            }
            Err(_shared) => Ok(()),
        }
    }

    pub(crate) fn check(&self, rc: c_int, operation: &'static str) -> Result<()> {
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            let code = unsafe { errcode(self.handle(), rc) };
            let message = unsafe { errmsg(self.handle()) };
            Err(Error::Config {
                operation,
                code,
                message,
            })
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.inner.open.get())
            .field("refs", &Rc::strong_count(&self.inner))
            .finish()
    }
}

fn escape_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}
