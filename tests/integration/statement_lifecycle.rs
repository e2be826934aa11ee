#![allow(missing_docs)]

use litebind::{Connection, Error, Result};

mod support;

fn db() -> Result<Connection> {
    support::init_logging();
    Connection::open_in_memory()
}

fn numbers_db(n: i64) -> Result<Connection> {
    let conn = db()?;
    conn.execute("CREATE TABLE nums(n INTEGER)")?;
    let insert = conn.prepare("INSERT INTO nums(n) VALUES (?1)")?;
    for i in 0..n {
        insert.bind(1, i)?;
        insert.execute()?;
        insert.reset()?;
    }
    Ok(conn)
}

#[test]
fn single_pass_exhaustion_yields_each_row_once() -> Result<()> {
    let conn = numbers_db(4)?;
    let select = conn.prepare("SELECT n FROM nums ORDER BY n")?;
    let mut rows = select.query()?;
    let mut seen = Vec::new();
    while let Some(row) = rows.next() {
        seen.push(row?.get::<i64>(0)?);
    }
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert!(rows.next().is_none(), "an exhausted sequence stays exhausted");
    Ok(())
}

#[test]
fn refetch_without_reset_is_a_hard_error() -> Result<()> {
    let conn = numbers_db(2)?;
    let select = conn.prepare("SELECT n FROM nums")?;
    for row in select.query()? {
        row?;
    }
    let err = select.query().expect_err("re-fetch needs an explicit reset");
    assert!(matches!(err, Error::Step { .. }), "got {err:?}");
    let err = select.execute().expect_err("execute is gated the same way");
    assert!(matches!(err, Error::Step { .. }), "got {err:?}");
    Ok(())
}

#[test]
fn reset_reproduces_the_same_rows_in_order() -> Result<()> {
    let conn = numbers_db(3)?;
    let select = conn.prepare("SELECT n FROM nums ORDER BY n")?;
    let first: Vec<i64> = select
        .query()?
        .map(|row| row.and_then(|r| r.get::<i64>(0)))
        .collect::<Result<_>>()?;
    select.reset()?;
    let second: Vec<i64> = select
        .query()?
        .map(|row| row.and_then(|r| r.get::<i64>(0)))
        .collect::<Result<_>>()?;
    assert_eq!(first, second, "reset re-arms the sequence from the start");
    Ok(())
}

#[test]
fn reset_keeps_bindings_until_cleared() -> Result<()> {
    let conn = numbers_db(0)?;
    let insert = conn.prepare("INSERT INTO nums(n) VALUES (?1)")?;
    insert.bind(1, 7)?;
    insert.execute()?;
    insert.reset()?;
    // No re-bind: the previous value is still attached.
    insert.execute()?;
    insert.reset()?;
    insert.clear_bindings()?;
    // Cleared parameters bind as NULL.
    insert.execute()?;

    let select = conn.prepare("SELECT n FROM nums ORDER BY rowid")?;
    let values: Vec<Option<i64>> = select
        .query()?
        .map(|row| row.and_then(|r| r.get::<Option<i64>>(0)))
        .collect::<Result<_>>()?;
    assert_eq!(values, vec![Some(7), Some(7), None]);
    Ok(())
}

#[test]
fn empty_statement_is_inert() -> Result<()> {
    let conn = db()?;
    let stmt = conn.prepare("; -- just a comment")?;
    assert!(stmt.is_empty(), "comment-only SQL produces no handle");
    assert_eq!(stmt.parameter_count(), 0);
    assert_eq!(stmt.column_count(), 0);
    stmt.bind(1, 42)?; // no-op by policy
    stmt.bind_name(":x", 42)?;
    assert_eq!(stmt.execute()?, 0, "nothing runs");
    assert!(stmt.query()?.next().is_none(), "sequence is permanently empty");
    // And again: empty statements are exempt from the reset discipline.
    assert!(stmt.query()?.next().is_none());
    stmt.finalize()?;
    Ok(())
}

#[test]
fn bind_errors_for_bad_targets() -> Result<()> {
    let conn = numbers_db(1)?;

    let no_params = conn.prepare("SELECT n FROM nums")?;
    let err = no_params.bind(1, 5).expect_err("statement has no parameters");
    assert!(matches!(err, Error::Bind(_)), "got {err:?}");

    let insert = conn.prepare("INSERT INTO nums(n) VALUES (:n)")?;
    assert_eq!(insert.parameter_count(), 1);
    assert_eq!(insert.parameter_index(":n")?, Some(1));
    assert_eq!(insert.parameter_index(":missing")?, None);

    let err = insert.bind(2, 5).expect_err("index out of range");
    assert!(matches!(err, Error::Bind(_)), "got {err:?}");
    let err = insert.bind(0, 5).expect_err("indexes are 1-based");
    assert!(matches!(err, Error::Bind(_)), "got {err:?}");
    let err = insert
        .bind_name(":missing", 5)
        .expect_err("unknown name does not resolve");
    assert!(matches!(err, Error::Bind(_)), "got {err:?}");
    Ok(())
}

#[test]
fn step_failure_surfaces_and_reset_recovers() -> Result<()> {
    let conn = db()?;
    conn.execute("CREATE TABLE uniq(n INTEGER UNIQUE)")?;
    let insert = conn.prepare("INSERT INTO uniq(n) VALUES (?1)")?;
    insert.bind(1, 1)?;
    insert.execute()?;
    insert.reset()?;

    insert.bind(1, 1)?;
    let err = insert.execute().expect_err("unique constraint violation");
    match &err {
        Error::Step { message, .. } => {
            assert!(message.to_lowercase().contains("unique"), "got: {message}")
        }
        other => panic!("expected Error::Step, got {other:?}"),
    }

    insert.reset()?;
    insert.bind(1, 2)?;
    insert.execute()?;

    let count = conn.prepare("SELECT count(*) FROM uniq")?;
    let row = count.query()?.next().expect("row")?;
    assert_eq!(row.get::<i64>(0)?, 2, "statement is usable after reset");
    Ok(())
}

#[test]
fn invalid_sql_is_a_prepare_error() -> Result<()> {
    let conn = db()?;
    let err = conn.prepare("SELEKT 1").expect_err("bad SQL");
    match &err {
        Error::Prepare { sql, .. } => assert_eq!(sql, "SELEKT 1"),
        other => panic!("expected Error::Prepare, got {other:?}"),
    }
    Ok(())
}

#[test]
fn clones_share_one_handle_released_once() -> Result<()> {
    let conn = db()?;
    conn.execute("CREATE TABLE t(x INTEGER)")?;

    let clone = conn.clone();
    // Explicit close while shared is a no-op; the clone stays usable.
    conn.close()?;
    clone.execute("INSERT INTO t(x) VALUES (1)")?;

    let stmt = clone.prepare("SELECT x FROM t")?;
    let stmt_clone = stmt.clone();
    drop(stmt);
    let row = stmt_clone.query()?.next().expect("row")?;
    assert_eq!(row.get::<i64>(0)?, 1, "clone survives the original's drop");

    // A live statement keeps the connection open past the last explicit
    // connection value.
    drop(clone);
    stmt_clone.reset()?;
    let row = stmt_clone.query()?.next().expect("row")?;
    assert_eq!(row.get::<i64>(0)?, 1);
    Ok(())
}

#[test]
fn statement_reports_columns_and_sql() -> Result<()> {
    let conn = db()?;
    let stmt = conn.prepare("SELECT 1 AS one, 'x' AS name")?;
    assert_eq!(stmt.sql(), "SELECT 1 AS one, 'x' AS name");
    assert_eq!(stmt.column_count(), 2);
    assert_eq!(stmt.column_name(0)?, "one");
    assert_eq!(stmt.column_name(1)?, "name");
    assert!(matches!(stmt.column_name(2), Err(Error::Column(_))));

    let row = stmt.query()?.next().expect("row")?;
    assert_eq!(row.column_name(1)?, "name");
    assert!(matches!(row.get::<i64>(9), Err(Error::Column(_))));
    assert!(matches!(
        row.get_name::<i64>("ghost"),
        Err(Error::Column(_))
    ));
    Ok(())
}
