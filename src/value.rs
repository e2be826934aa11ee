//! The value codec: the bridge between the engine's dynamically typed
//! cells and statically typed host values.
//!
//! Binding goes through [`ToSql`], reading goes through [`FromSql`]. Both
//! directions are conservative: only lossless conversions succeed, and a
//! SQL `NULL` only decodes into an `Option` (or through an explicit
//! caller-supplied default at the row-access layer).

use crate::error::{Error, Result};

/// A dynamically typed SQL value, tagged with one of the engine's five
/// storage classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit IEEE float.
    Real(f64),
    /// UTF-8 text, copied out of engine memory at decode time.
    Text(String),
    /// Raw bytes, copied out of engine memory at decode time.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the storage-class name for this value, as used in error
    /// messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Real(_) => "REAL",
            Value::Text(_) => "TEXT",
            Value::Blob(_) => "BLOB",
        }
    }

    /// True when this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Conversion from a host value into a SQL value, used when binding
/// statement parameters.
///
/// Text and blob contents are bound with the engine's transient-copy
/// destructor, so implementations never need to keep buffers alive past
/// the bind call.
pub trait ToSql {
    /// Converts `self` into a [`Value`].
    ///
    /// # Errors
    /// Returns [`Error::Conversion`] when the host value has no exact SQL
    /// representation (e.g. a `u64` above `i64::MAX`).
    fn to_value(&self) -> Result<Value>;
}

impl ToSql for Value {
    fn to_value(&self) -> Result<Value> {
        Ok(self.clone())
    }
}

impl ToSql for () {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Null)
    }
}

impl ToSql for bool {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Integer(i64::from(*self)))
    }
}

macro_rules! to_sql_integer {
    ($($t:ty),*) => {$(
        impl ToSql for $t {
            fn to_value(&self) -> Result<Value> {
                Ok(Value::Integer(i64::from(*self)))
            }
        }
    )*};
}

to_sql_integer!(i8, i16, i32, i64, u8, u16, u32);

impl ToSql for u64 {
    fn to_value(&self) -> Result<Value> {
        i64::try_from(*self).map(Value::Integer).map_err(|_| {
            Error::Conversion(format!("u64 value {self} exceeds the engine's integer range"))
        })
    }
}

impl ToSql for usize {
    fn to_value(&self) -> Result<Value> {
        i64::try_from(*self).map(Value::Integer).map_err(|_| {
            Error::Conversion(format!("usize value {self} exceeds the engine's integer range"))
        })
    }
}

impl ToSql for f32 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Real(f64::from(*self)))
    }
}

impl ToSql for f64 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Real(*self))
    }
}

impl ToSql for str {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.to_owned()))
    }
}

impl ToSql for String {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.clone()))
    }
}

impl ToSql for [u8] {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Blob(self.to_vec()))
    }
}

impl ToSql for Vec<u8> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Blob(self.clone()))
    }
}

impl<T: ToSql + ?Sized> ToSql for &T {
    fn to_value(&self) -> Result<Value> {
        (**self).to_value()
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_value(&self) -> Result<Value> {
        match self {
            Some(inner) => inner.to_value(),
            None => Ok(Value::Null),
        }
    }
}

/// Conversion from a SQL value into a host value, used when reading
/// result columns and decoding user-function arguments.
pub trait FromSql: Sized {
    /// Converts a [`Value`] into `Self`.
    ///
    /// # Errors
    /// Returns [`Error::Conversion`] on a tag mismatch or when the value
    /// is NULL and `Self` is not an `Option`.
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromSql for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromSql for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(v) => Ok(*v),
            other => Err(mismatch(other, "INTEGER")),
        }
    }
}

macro_rules! from_sql_integer {
    ($($t:ty),*) => {$(
        impl FromSql for $t {
            fn from_value(value: &Value) -> Result<Self> {
                let wide = i64::from_value(value)?;
                <$t>::try_from(wide).map_err(|_| {
                    Error::Conversion(format!(
                        "integer {wide} does not fit in {}",
                        std::any::type_name::<$t>()
                    ))
                })
            }
        }
    )*};
}

from_sql_integer!(i8, i16, i32, u8, u16, u32, u64, usize);

impl FromSql for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Real(v) => Ok(*v),
            // Integer-to-float widening is the one permitted cross-tag read.
            Value::Integer(v) => Ok(*v as f64),
            other => Err(mismatch(other, "REAL")),
        }
    }
}

impl FromSql for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromSql for bool {
    fn from_value(value: &Value) -> Result<Self> {
        i64::from_value(value).map(|v| v != 0)
    }
}

impl FromSql for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v.clone()),
            other => Err(mismatch(other, "TEXT")),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Blob(v) => Ok(v.clone()),
            // Text reads back as its UTF-8 bytes; the engine makes the
            // same coercion for blob reads of text cells.
            Value::Text(v) => Ok(v.clone().into_bytes()),
            other => Err(mismatch(other, "BLOB")),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

fn mismatch(found: &Value, wanted: &'static str) -> Error {
    if found.is_null() {
        Error::Conversion(format!(
            "NULL cannot convert to {wanted}; use an Option target or supply a default"
        ))
    } else {
        Error::Conversion(format!("cannot convert {} to {wanted}", found.type_name()))
    }
}
