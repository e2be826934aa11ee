#![allow(missing_docs)]

use litebind::{Connection, Error, Result, ToSql, Value};
use proptest::prelude::*;

mod support;

fn db() -> Result<Connection> {
    support::init_logging();
    Connection::open_in_memory()
}

/// Binds `value` to `SELECT ?1` and reads the cell back as a dynamic
/// [`Value`]. Everything a round-trip test needs goes through the same
/// bind and decode paths real queries use.
fn echo<T: ToSql>(conn: &Connection, value: T) -> Result<Value> {
    let stmt = conn.prepare("SELECT ?1")?;
    stmt.bind(1, value)?;
    let row = stmt.query()?.next().expect("echo row")?;
    row.get(0)
}

#[test]
fn every_storage_class_round_trips() -> Result<()> {
    let conn = db()?;

    assert_eq!(echo(&conn, ())?, Value::Null);
    assert_eq!(echo(&conn, Option::<String>::None)?, Value::Null);
    assert_eq!(echo(&conn, i64::MIN)?, Value::Integer(i64::MIN));
    assert_eq!(echo(&conn, i64::MAX)?, Value::Integer(i64::MAX));
    assert_eq!(echo(&conn, -1i8)?, Value::Integer(-1));
    assert_eq!(echo(&conn, u32::MAX)?, Value::Integer(4_294_967_295));
    assert_eq!(echo(&conn, 0.1f64)?, Value::Real(0.1));
    assert_eq!(echo(&conn, "héllo")?, Value::Text("héllo".into()));
    assert_eq!(echo(&conn, String::new())?, Value::Text(String::new()));
    assert_eq!(
        echo(&conn, vec![0u8, 255, 7])?,
        Value::Blob(vec![0, 255, 7])
    );
    assert_eq!(echo(&conn, Vec::<u8>::new())?, Value::Blob(Vec::new()));
    Ok(())
}

#[test]
fn booleans_store_as_integers() -> Result<()> {
    let conn = db()?;
    assert_eq!(echo(&conn, true)?, Value::Integer(1));
    assert_eq!(echo(&conn, false)?, Value::Integer(0));

    let stmt = conn.prepare("SELECT ?1")?;
    stmt.bind(1, true)?;
    let row = stmt.query()?.next().expect("bool row")?;
    assert!(row.get::<bool>(0)?, "integer 1 reads back as true");
    Ok(())
}

#[test]
fn u64_above_integer_range_is_rejected_at_bind() -> Result<()> {
    let conn = db()?;
    let stmt = conn.prepare("SELECT ?1")?;

    let err = stmt
        .bind(1, u64::MAX)
        .expect_err("u64::MAX has no exact engine representation");
    assert!(matches!(err, Error::Conversion(_)), "got {err:?}");

    // The failed bind leaves the slot untouched (still NULL).
    let row = stmt.query()?.next().expect("row")?;
    assert!(row.value(0)?.is_null());
    Ok(())
}

#[test]
fn narrowing_reads_are_checked_against_the_stored_value() -> Result<()> {
    let conn = db()?;

    let stmt = conn.prepare("SELECT 300")?;
    let row = stmt.query()?.next().expect("row")?;
    assert!(row.get::<u8>(0).is_err(), "300 does not fit in u8");
    assert_eq!(row.get::<u16>(0)?, 300);
    Ok(())
}

#[test]
fn cross_tag_reads_follow_the_codec_rules() -> Result<()> {
    let conn = db()?;

    // Integer widens to float, never the reverse.
    let stmt = conn.prepare("SELECT 3, 3.5, 'abc'")?;
    let row = stmt.query()?.next().expect("row")?;
    assert_eq!(row.get::<f64>(0)?, 3.0);
    assert!(row.get::<i64>(1).is_err(), "no float-to-integer read");
    assert!(row.get::<i64>(2).is_err(), "no text-to-integer parse");

    // Text cells read back as their UTF-8 bytes when asked for a blob.
    assert_eq!(row.get::<Vec<u8>>(2)?, b"abc".to_vec());
    Ok(())
}

#[test]
fn expressions_report_the_engine_storage_class() -> Result<()> {
    let conn = db()?;

    let stmt = conn.prepare("SELECT 1 + 1, 1.0 + 1, 'a' || 'b', x'0102', NULL")?;
    let row = stmt.query()?.next().expect("row")?;
    assert_eq!(row.value(0)?.type_name(), "INTEGER");
    assert_eq!(row.value(1)?.type_name(), "REAL");
    assert_eq!(row.value(2)?.type_name(), "TEXT");
    assert_eq!(row.value(3)?.type_name(), "BLOB");
    assert_eq!(row.value(4)?.type_name(), "NULL");
    Ok(())
}

proptest! {
    #[test]
    fn integers_round_trip(v in any::<i64>()) {
        let conn = db().unwrap();
        prop_assert_eq!(echo(&conn, v).unwrap(), Value::Integer(v));
    }

    // NaN is excluded: the engine has no NaN representation and stores
    // it as NULL.
    #[test]
    fn floats_round_trip_bit_for_bit(v in any::<f64>().prop_filter("non-NaN", |v| !v.is_nan())) {
        let conn = db().unwrap();
        match echo(&conn, v).unwrap() {
            Value::Real(back) => prop_assert_eq!(back.to_bits(), v.to_bits()),
            other => prop_assert!(false, "expected REAL, got {:?}", other),
        }
    }

    #[test]
    fn text_round_trips(v in ".*") {
        let conn = db().unwrap();
        prop_assert_eq!(echo(&conn, v.as_str()).unwrap(), Value::Text(v));
    }

    #[test]
    fn blobs_round_trip(v in proptest::collection::vec(any::<u8>(), 0..512)) {
        let conn = db().unwrap();
        prop_assert_eq!(echo(&conn, v.as_slice()).unwrap(), Value::Blob(v));
    }
}
