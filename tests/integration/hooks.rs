#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use litebind::{Action, Connection, Error, Result};

mod support;

fn db() -> Result<Connection> {
    support::init_logging();
    Connection::open_in_memory()
}

#[test]
fn update_hook_sees_every_row_change() -> Result<()> {
    let conn = db()?;
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, x INTEGER)")?;

    let log: Rc<RefCell<Vec<(Action, String, i64)>>> = Rc::default();
    let sink = log.clone();
    conn.update_hook(Some(move |action, _db: &str, table: &str, rowid| {
        sink.borrow_mut().push((action, table.to_owned(), rowid));
    }));

    conn.execute("INSERT INTO t(id, x) VALUES (1, 10)")?;
    conn.execute("UPDATE t SET x = 20 WHERE id = 1")?;
    conn.execute("DELETE FROM t WHERE id = 1")?;

    assert_eq!(
        log.borrow().as_slice(),
        &[
            (Action::Insert, "t".to_owned(), 1),
            (Action::Update, "t".to_owned(), 1),
            (Action::Delete, "t".to_owned(), 1),
        ]
    );

    // Disabling releases the registration; no further events arrive.
    conn.update_hook(None::<fn(Action, &str, &str, i64)>);
    conn.execute("INSERT INTO t(x) VALUES (9)")?;
    assert_eq!(log.borrow().len(), 3, "hook was disabled");
    Ok(())
}

#[test]
fn replacing_the_update_hook_swaps_cleanly() -> Result<()> {
    let conn = db()?;
    conn.execute("CREATE TABLE t(x INTEGER)")?;

    let first = Rc::new(RefCell::new(0u32));
    let second = Rc::new(RefCell::new(0u32));

    let sink = first.clone();
    conn.update_hook(Some(move |_, _: &str, _: &str, _| {
        *sink.borrow_mut() += 1;
    }));
    conn.execute("INSERT INTO t(x) VALUES (1)")?;

    let sink = second.clone();
    conn.update_hook(Some(move |_, _: &str, _: &str, _| {
        *sink.borrow_mut() += 1;
    }));
    conn.execute("INSERT INTO t(x) VALUES (2)")?;

    assert_eq!(*first.borrow(), 1, "only events before the replacement");
    assert_eq!(*second.borrow(), 1, "only events after the replacement");
    Ok(())
}

#[test]
fn commit_hook_can_veto_the_commit() -> Result<()> {
    let conn = db()?;
    conn.execute("CREATE TABLE t(x INTEGER)")?;

    let rolled_back = Rc::new(RefCell::new(false));
    let sink = rolled_back.clone();
    conn.rollback_hook(Some(move || {
        *sink.borrow_mut() = true;
    }));
    conn.commit_hook(Some(|| true)); // veto every commit

    conn.begin()?;
    conn.execute("INSERT INTO t(x) VALUES (1)")?;
    let err = conn.commit().expect_err("commit hook aborts the commit");
    assert!(matches!(err, Error::Sql { .. }), "got {err:?}");
    assert!(conn.is_autocommit(), "transaction is gone after the veto");
    assert!(*rolled_back.borrow(), "abort shows up as a rollback");

    let count = conn.prepare("SELECT count(*) FROM t")?;
    let row = count.query()?.next().expect("row")?;
    assert_eq!(row.get::<i64>(0)?, 0, "vetoed insert is not visible");

    // Allow commits again and verify the connection still works.
    conn.commit_hook(None::<fn() -> bool>);
    conn.begin()?;
    conn.execute("INSERT INTO t(x) VALUES (2)")?;
    conn.commit()?;
    count.reset()?;
    let row = count.query()?.next().expect("row")?;
    assert_eq!(row.get::<i64>(0)?, 1);
    Ok(())
}

#[test]
fn progress_handler_aborts_long_operations() -> Result<()> {
    let conn = db()?;
    conn.execute("CREATE TABLE t(x INTEGER)")?;
    conn.execute(
        "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 2000)
         INSERT INTO t SELECT n FROM seq",
    )?;

    conn.progress_handler(4, Some(|| true)); // abort immediately
    let stmt = conn.prepare("SELECT count(*) FROM t a, t b")?;
    let err = stmt
        .query()?
        .next()
        .expect("aborted query reports an error")
        .expect_err("progress handler interrupts the operation");
    assert!(matches!(err, Error::Step { .. }), "got {err:?}");

    conn.progress_handler(4, None::<fn() -> bool>);
    let stmt = conn.prepare("SELECT count(*) FROM t")?;
    let row = stmt.query()?.next().expect("row")?;
    assert_eq!(row.get::<i64>(0)?, 2000, "connection survives the abort");
    Ok(())
}

#[test]
fn trace_and_profile_observe_statements() -> Result<()> {
    let conn = db()?;

    let traced: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = traced.clone();
    conn.trace(Some(move |sql: &str| {
        sink.borrow_mut().push(sql.to_owned());
    }));

    let profiled: Rc<RefCell<Vec<(String, Duration)>>> = Rc::default();
    let sink = profiled.clone();
    conn.profile(Some(move |sql: &str, elapsed| {
        sink.borrow_mut().push((sql.to_owned(), elapsed));
    }));

    conn.execute("CREATE TABLE t(x INTEGER)")?;
    conn.execute("INSERT INTO t(x) VALUES (1)")?;

    let traced = traced.borrow();
    assert!(
        traced.iter().any(|sql| sql.contains("CREATE TABLE")),
        "trace saw the DDL: {traced:?}"
    );
    let profiled = profiled.borrow();
    assert!(
        profiled.iter().any(|(sql, _)| sql.contains("INSERT")),
        "profile saw the insert: {profiled:?}"
    );

    conn.trace(None::<fn(&str)>);
    conn.profile(None::<fn(&str, Duration)>);
    Ok(())
}

#[test]
fn interrupt_is_safe_with_nothing_in_flight() -> Result<()> {
    let conn = db()?;
    conn.interrupt();
    conn.execute("CREATE TABLE t(x INTEGER)")?;
    Ok(())
}

#[test]
fn busy_timeout_accepts_a_duration() -> Result<()> {
    let conn = db()?;
    conn.busy_timeout(Duration::from_millis(250))?;
    conn.execute("CREATE TABLE t(x INTEGER)")?;
    Ok(())
}
