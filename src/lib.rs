//! Safe, reference-counted bindings over an embedded SQL database engine.
//!
//! This crate wraps the engine's C handle-based API in ergonomic host
//! types: a [`Connection`] owning a database handle, a [`Statement`]
//! owning a prepared-statement handle, lazy single-pass [`Rows`] over the
//! results, and registration points for user-defined scalar functions,
//! [`Aggregate`]s, collations and lifecycle hooks written in Rust.
//!
//! Handles are shared by reference counting: cloning a `Connection` or a
//! `Statement` is cheap, and the native close/finalize runs exactly once
//! when the last clone drops. Everything is synchronous and
//! single-threaded per connection: each call blocks into the engine and
//! returns before the next one starts.
//!
//! # Example
//!
//! ```rust
//! use litebind::Connection;
//!
//! let conn = Connection::open_in_memory()?;
//! conn.execute(
//!     "CREATE TABLE person(id INTEGER PRIMARY KEY, name TEXT, score REAL)",
//! )?;
//!
//! let insert = conn.prepare("INSERT INTO person(name, score) VALUES (:name, :score)")?;
//! insert.bind_name(":name", "ada")?;
//! insert.bind_name(":score", 9.5)?;
//! insert.execute()?;
//!
//! let select = conn.prepare("SELECT name, score FROM person")?;
//! for row in select.query()? {
//!     let row = row?;
//!     let name: String = row.get_name("name")?;
//!     let score: f64 = row.get_name_or("score", 0.0)?;
//!     println!("{name}: {score}");
//! }
//! # Ok::<(), litebind::Error>(())
//! ```

#![warn(missing_docs)]

use std::ffi::CStr;

use libsqlite3_sys as ffi;

pub mod connection;
pub mod error;
pub mod functions;
pub mod hooks;
pub mod rows;
pub mod statement;
pub mod value;

pub use connection::{ColumnMetadata, Connection, OpenFlags};
pub use error::{Error, Result};
pub use functions::Aggregate;
pub use hooks::Action;
pub use rows::{ColumnData, Row, Rows};
pub use statement::Statement;
pub use value::{FromSql, ToSql, Value};

/// Explicitly initializes the embedded engine's global state.
///
/// Calling this is optional and idempotent; the engine also initializes
/// itself lazily on first use. It exists so embedders can front-load the
/// (one-time) cost and observe its failure.
///
/// # Errors
/// [`Error::Open`] carrying the engine's result code.
pub fn initialize() -> Result<()> {
    // SAFETY: sqlite3_initialize is safe to call from any state and is
    // idempotent.
    let rc = unsafe { ffi::sqlite3_initialize() };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(Error::Open {
            code: rc,
            message: error::errstr(rc),
        })
    }
}

/// Releases the embedded engine's global state.
///
/// Must only be called when every [`Connection`] has been dropped; the
/// engine re-initializes lazily if it is used again afterwards.
///
/// # Errors
/// [`Error::Close`] carrying the engine's result code.
pub fn shutdown() -> Result<()> {
    // SAFETY: callers uphold the no-open-connections requirement; the
    // engine itself rejects an unsafe shutdown with a result code.
    let rc = unsafe { ffi::sqlite3_shutdown() };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(Error::Close {
            code: rc,
            message: error::errstr(rc),
        })
    }
}

/// The embedded engine's version string, e.g. `"3.46.0"`.
pub fn engine_version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a pointer to a static string.
    unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) }
        .to_str()
        .unwrap_or("unknown")
}

/// The embedded engine's numeric version, e.g. `3046000`.
pub fn engine_version_number() -> i32 {
    // SAFETY: no preconditions.
    unsafe { ffi::sqlite3_libversion_number() }
}
