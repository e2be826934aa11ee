use std::ffi::CStr;
use std::os::raw::c_int;

use libsqlite3_sys as ffi;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the binding layer.
///
/// Every variant that originates inside the engine carries the numeric
/// result code and the human-readable message captured from the connection
/// at the point of failure, so callers can log or display the failure
/// without re-querying the handle.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine could not establish a connection handle.
    #[error("cannot open database: {message} (code {code})")]
    Open {
        /// Extended engine result code.
        code: i32,
        /// Engine error message at the point of failure.
        message: String,
    },
    /// SQL text failed to compile.
    #[error("cannot prepare statement: {message} (code {code}): `{sql}`")]
    Prepare {
        /// Extended engine result code.
        code: i32,
        /// Engine error message at the point of failure.
        message: String,
        /// The SQL text that failed to compile.
        sql: String,
    },
    /// A statement inside a multi-statement script failed.
    #[error("script execution failed: {message} (code {code}): `{sql}`")]
    Sql {
        /// Extended engine result code.
        code: i32,
        /// Engine error message at the point of failure.
        message: String,
        /// The offending statement text.
        sql: String,
    },
    /// Bad parameter index or name, or a bind on a parameterless statement.
    #[error("bind error: {0}")]
    Bind(String),
    /// Execution-time failure while stepping a statement.
    #[error("step failed: {message} (code {code})")]
    Step {
        /// Extended engine result code.
        code: i32,
        /// Engine error message at the point of failure.
        message: String,
    },
    /// Bad column index or unknown column name on result access.
    #[error("column error: {0}")]
    Column(String),
    /// A dynamic value could not be converted to the requested host type.
    #[error("conversion error: {0}")]
    Conversion(String),
    /// The engine rejected a connection-level configuration or
    /// registration call.
    #[error("{operation} failed: {message} (code {code})")]
    Config {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Extended engine result code.
        code: i32,
        /// Engine error message at the point of failure.
        message: String,
    },
    /// The engine refused to release a handle.
    #[error("close failed: {message} (code {code})")]
    Close {
        /// Extended engine result code.
        code: i32,
        /// Engine error message at the point of failure.
        message: String,
    },
    /// A caller-supplied argument was unusable (e.g. an interior NUL byte
    /// in a name that must cross the C boundary).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Engine-owned text was not valid UTF-8.
    #[error("invalid UTF-8 in engine text: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl Error {
    /// Returns the engine result code for variants that carry one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Open { code, .. }
            | Error::Prepare { code, .. }
            | Error::Sql { code, .. }
            | Error::Step { code, .. }
            | Error::Config { code, .. }
            | Error::Close { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Reads the current error message from an open connection handle.
///
/// # Safety
/// `db` must be a valid connection handle or null.
pub(crate) unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    if db.is_null() {
        return "out of memory".to_owned();
    }
    let msg = ffi::sqlite3_errmsg(db);
    if msg.is_null() {
        return "unknown error".to_owned();
    }
    CStr::from_ptr(msg).to_string_lossy().into_owned()
}

/// Reads the extended result code from an open connection handle, falling
/// back to `rc` when the handle is unavailable.
///
/// # Safety
/// `db` must be a valid connection handle or null.
pub(crate) unsafe fn errcode(db: *mut ffi::sqlite3, rc: c_int) -> i32 {
    if db.is_null() {
        rc
    } else {
        ffi::sqlite3_extended_errcode(db)
    }
}

/// Decodes a bare result code through the engine's static message table.
pub(crate) fn errstr(rc: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a pointer into a static table and
    // accepts any code value.
    unsafe {
        let msg = ffi::sqlite3_errstr(rc);
        if msg.is_null() {
            format!("engine error code {rc}")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}
