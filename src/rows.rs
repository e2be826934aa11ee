//! Lazy result iteration and row snapshots.
//!
//! [`Rows`] is a forward-only, single-pass view over the rows a stepped
//! statement produces. Each advance decodes the current row into an owned
//! [`Row`] snapshot immediately, because the engine's cell memory only
//! lives until the next step, reset or finalize.

use std::ffi::CStr;
use std::os::raw::c_int;

use libsqlite3_sys as ffi;

use crate::error::{Error, Result};
use crate::statement::Statement;
use crate::value::{FromSql, Value};

/// One decoded result cell: position, declared name and dynamic value.
///
/// The name is the per-query column name reported by the engine, not a
/// resolved schema column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnData {
    index: usize,
    name: String,
    value: Value,
}

impl ColumnData {
    /// Zero-based column position.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declared column name for the query text.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The decoded dynamic value.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// An owned snapshot of one result row.
///
/// Captured at the moment the row was produced and independent of any
/// subsequent step on the statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<ColumnData>,
}

impl Row {
    /// Number of columns in this row.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// All cells of this row in column order.
    pub fn columns(&self) -> &[ColumnData] {
        &self.columns
    }

    /// Declared name of the column at 0-based `index`.
    ///
    /// # Errors
    /// [`Error::Column`] when the index is out of range.
    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.cell(index).map(|cell| cell.name())
    }

    /// The dynamic value at 0-based `index`.
    ///
    /// # Errors
    /// [`Error::Column`] when the index is out of range.
    pub fn value(&self, index: usize) -> Result<&Value> {
        self.cell(index).map(|cell| cell.value())
    }

    /// Converts the value at 0-based `index` to `T`.
    ///
    /// A NULL cell only converts into an `Option` target; use
    /// [`Row::get_or`] to substitute a default instead.
    ///
    /// # Errors
    /// [`Error::Column`] on a bad index, [`Error::Conversion`] on a type
    /// mismatch or an undefaulted NULL.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T> {
        T::from_value(self.value(index)?)
    }

    /// Converts the value in the column named `name` to `T`.
    ///
    /// # Errors
    /// [`Error::Column`] when no column has that name, otherwise as
    /// [`Row::get`].
    pub fn get_name<T: FromSql>(&self, name: &str) -> Result<T> {
        self.get(self.index_of(name)?)
    }

    /// Like [`Row::get`], but yields `default` when the cell is NULL.
    ///
    /// # Errors
    /// [`Error::Column`] on a bad index, [`Error::Conversion`] on a
    /// non-NULL type mismatch.
    pub fn get_or<T: FromSql>(&self, index: usize, default: T) -> Result<T> {
        let value = self.value(index)?;
        if value.is_null() {
            Ok(default)
        } else {
            T::from_value(value)
        }
    }

    /// Like [`Row::get_name`], but yields `default` when the cell is NULL.
    ///
    /// # Errors
    /// As [`Row::get_or`], plus [`Error::Column`] on an unknown name.
    pub fn get_name_or<T: FromSql>(&self, name: &str, default: T) -> Result<T> {
        self.get_or(self.index_of(name)?, default)
    }

    fn cell(&self, index: usize) -> Result<&ColumnData> {
        self.columns.get(index).ok_or_else(|| {
            Error::Column(format!(
                "column index {index} out of range for {} columns",
                self.columns.len()
            ))
        })
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|cell| cell.name == name)
            .ok_or_else(|| Error::Column(format!("no column named `{name}`")))
    }
}

/// The result sequence of a stepped statement.
///
/// `Rows` co-owns its statement, so the statement handle stays alive for
/// as long as the sequence does. Iteration is single-pass: once the
/// sequence reports `None` it stays exhausted, and re-fetching requires
/// resetting the statement and calling
/// [`query`](crate::Statement::query) again.
#[derive(Debug)]
pub struct Rows {
    stmt: Statement,
    done: bool,
}

impl Rows {
    pub(crate) fn new(stmt: Statement) -> Rows {
        let done = stmt.is_empty();
        Rows { stmt, done }
    }

    /// The statement this sequence iterates.
    pub fn statement(&self) -> &Statement {
        &self.stmt
    }

    fn advance(&mut self) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        match self.stmt.step() {
            Ok(true) => Ok(Some(snapshot(&self.stmt)?)),
            Ok(false) => {
                self.done = true;
                Ok(None)
            }
            Err(err) => {
                // A step failure exhausts the sequence; the statement must
                // be reset before it can run again.
                self.done = true;
                Err(err)
            }
        }
    }
}

impl Iterator for Rows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Result<Row>> {
        self.advance().transpose()
    }
}

/// Decodes every column of the statement's current row into an owned
/// [`Row`]. Text and blob cells are copied out of engine memory here,
/// before the next step can invalidate them.
fn snapshot(stmt: &Statement) -> Result<Row> {
    let handle = stmt.raw_handle();
    let count = stmt.column_count();
    let mut columns = Vec::with_capacity(count);
    for index in 0..count {
        let i = index as c_int;
        // SAFETY: the handle is valid, a row is current (the caller just
        // observed SQLITE_ROW) and the index is within the column count.
        let value = unsafe { decode_column(handle, i) }?;
        // SAFETY: as above; the name string is engine-owned and copied.
        let name = unsafe {
            let name = ffi::sqlite3_column_name(handle, i);
            if name.is_null() {
                String::new()
            } else {
                CStr::from_ptr(name).to_string_lossy().into_owned()
            }
        };
        columns.push(ColumnData { index, name, value });
    }
    Ok(Row { columns })
}

/// Reads one cell of the current row, dispatching on the engine's dynamic
/// type tag.
///
/// # Safety
/// `handle` must be a valid statement handle positioned on a row, and
/// `index` must be within the result column count.
unsafe fn decode_column(handle: *mut ffi::sqlite3_stmt, index: c_int) -> Result<Value> {
    match ffi::sqlite3_column_type(handle, index) {
        ffi::SQLITE_INTEGER => Ok(Value::Integer(ffi::sqlite3_column_int64(handle, index))),
        ffi::SQLITE_FLOAT => Ok(Value::Real(ffi::sqlite3_column_double(handle, index))),
        ffi::SQLITE_TEXT => {
            let ptr = ffi::sqlite3_column_text(handle, index);
            if ptr.is_null() {
                return Ok(Value::Text(String::new()));
            }
            let len = ffi::sqlite3_column_bytes(handle, index) as usize;
            let bytes = std::slice::from_raw_parts(ptr, len);
            Ok(Value::Text(std::str::from_utf8(bytes)?.to_owned()))
        }
        ffi::SQLITE_BLOB => {
            let ptr = ffi::sqlite3_column_blob(handle, index);
            if ptr.is_null() {
                return Ok(Value::Blob(Vec::new()));
            }
            let len = ffi::sqlite3_column_bytes(handle, index) as usize;
            Ok(Value::Blob(
                std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec(),
            ))
        }
        ffi::SQLITE_NULL => Ok(Value::Null),
        other => Err(Error::Conversion(format!(
            "unknown column type tag {other}"
        ))),
    }
}
