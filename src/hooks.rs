//! Connection lifecycle hooks: update/commit/rollback notification, the
//! progress handler, and trace/profile callbacks.
//!
//! Unlike SQL functions, the engine offers no destructor parameter for
//! these registrations, so the connection keeps one slot per hook kind
//! and frees the previous wrapper itself when a registration is replaced
//! or disabled. A slot's wrapper lives exactly as long as its
//! registration: the slots drop (after the handle closes) with the
//! connection.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use libsqlite3_sys as ffi;
use tracing::{debug, error};

use crate::connection::Connection;

/// The kind of row change reported to an update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A row was inserted.
    Insert,
    /// A row was deleted.
    Delete,
    /// A row was updated.
    Update,
    /// An operation code this layer does not recognize.
    Unknown(i32),
}

impl Action {
    fn from_code(code: c_int) -> Action {
        match code {
            ffi::SQLITE_INSERT => Action::Insert,
            ffi::SQLITE_DELETE => Action::Delete,
            ffi::SQLITE_UPDATE => Action::Update,
            other => Action::Unknown(other),
        }
    }
}

type UpdateHook = Box<dyn FnMut(Action, &str, &str, i64)>;
type CommitHook = Box<dyn FnMut() -> bool>;
type RollbackHook = Box<dyn FnMut()>;
type ProgressHandler = Box<dyn FnMut() -> bool>;
type TraceFn = Box<dyn FnMut(&str)>;
type ProfileFn = Box<dyn FnMut(&str, Duration)>;

/// One raw wrapper pointer per hook kind; at most one registration each.
#[derive(Default)]
pub(crate) struct HookSlots {
    update: Option<*mut UpdateHook>,
    commit: Option<*mut CommitHook>,
    rollback: Option<*mut RollbackHook>,
    progress: Option<*mut ProgressHandler>,
    trace: Option<*mut TraceFn>,
    profile: Option<*mut ProfileFn>,
}

impl Drop for HookSlots {
    fn drop(&mut self) {
        // SAFETY: each slot pointer came from Box::into_raw and is freed
        // exactly once, here or in the replace path.
        unsafe {
            free_slot(self.update.take());
            free_slot(self.commit.take());
            free_slot(self.rollback.take());
            free_slot(self.progress.take());
            free_slot(self.trace.take());
            free_slot(self.profile.take());
        }
    }
}

unsafe fn free_slot<T>(slot: Option<*mut T>) {
    if let Some(ptr) = slot {
        drop(Box::from_raw(ptr));
    }
}

/// Turns an optional host closure into an optional raw wrapper pointer.
fn into_slot<T>(hook: Option<T>) -> Option<*mut T> {
    hook.map(|hook| Box::into_raw(Box::new(hook)))
}

fn slot_ptr<T>(slot: &Option<*mut T>) -> *mut c_void {
    slot.map_or(ptr::null_mut(), |ptr| ptr.cast())
}

impl Connection {
    /// Registers (or, with `None`, disables) the update hook: invoked for
    /// every row insert, update or delete, with the operation, database
    /// and table names, and the affected rowid.
    ///
    /// At most one update hook is active; a new registration replaces and
    /// frees the previous one.
    pub fn update_hook<F>(&self, hook: Option<F>)
    where
        F: FnMut(Action, &str, &str, i64) + 'static,
    {
        let slot = into_slot(hook.map(|f| Box::new(f) as UpdateHook));
        // SAFETY: the wrapper outlives the registration; the previous
        // wrapper is freed only after the engine stops referencing it.
        unsafe {
            ffi::sqlite3_update_hook(
                self.handle(),
                slot.map(|_| call_update as unsafe extern "C" fn(*mut c_void, c_int, *const c_char, *const c_char, ffi::sqlite3_int64)),
                slot_ptr(&slot),
            );
            free_slot(std::mem::replace(&mut self.hooks().borrow_mut().update, slot));
        }
        debug!(registered = slot.is_some(), "update hook changed");
    }

    /// Registers (or disables) the commit hook. Returning `true` from the
    /// hook aborts the commit, turning it into a rollback.
    pub fn commit_hook<F>(&self, hook: Option<F>)
    where
        F: FnMut() -> bool + 'static,
    {
        let slot = into_slot(hook.map(|f| Box::new(f) as CommitHook));
        // SAFETY: as in update_hook.
        unsafe {
            ffi::sqlite3_commit_hook(
                self.handle(),
                slot.map(|_| call_commit as unsafe extern "C" fn(*mut c_void) -> c_int),
                slot_ptr(&slot),
            );
            free_slot(std::mem::replace(&mut self.hooks().borrow_mut().commit, slot));
        }
        debug!(registered = slot.is_some(), "commit hook changed");
    }

    /// Registers (or disables) the rollback hook, invoked whenever a
    /// transaction rolls back.
    pub fn rollback_hook<F>(&self, hook: Option<F>)
    where
        F: FnMut() + 'static,
    {
        let slot = into_slot(hook.map(|f| Box::new(f) as RollbackHook));
        // SAFETY: as in update_hook.
        unsafe {
            ffi::sqlite3_rollback_hook(
                self.handle(),
                slot.map(|_| call_rollback as unsafe extern "C" fn(*mut c_void)),
                slot_ptr(&slot),
            );
            free_slot(std::mem::replace(&mut self.hooks().borrow_mut().rollback, slot));
        }
        debug!(registered = slot.is_some(), "rollback hook changed");
    }

    /// Registers (or disables) the progress handler, invoked roughly every
    /// `n_ops` virtual-machine operations during long-running calls.
    /// Returning `true` aborts the in-flight operation with an
    /// interrupt-class step error.
    ///
    /// This is the layer's only cancellation mechanism besides
    /// [`Connection::interrupt`].
    pub fn progress_handler<F>(&self, n_ops: i32, handler: Option<F>)
    where
        F: FnMut() -> bool + 'static,
    {
        let slot = into_slot(handler.map(|f| Box::new(f) as ProgressHandler));
        // SAFETY: as in update_hook.
        unsafe {
            ffi::sqlite3_progress_handler(
                self.handle(),
                n_ops as c_int,
                slot.map(|_| call_progress as unsafe extern "C" fn(*mut c_void) -> c_int),
                slot_ptr(&slot),
            );
            free_slot(std::mem::replace(&mut self.hooks().borrow_mut().progress, slot));
        }
        debug!(registered = slot.is_some(), n_ops, "progress handler changed");
    }

    /// Registers (or disables) the trace callback, invoked with the SQL
    /// text of each statement as it begins running.
    pub fn trace<F>(&self, callback: Option<F>)
    where
        F: FnMut(&str) + 'static,
    {
        let slot = into_slot(callback.map(|f| Box::new(f) as TraceFn));
        // SAFETY: as in update_hook.
        unsafe {
            ffi::sqlite3_trace(
                self.handle(),
                slot.map(|_| call_trace as unsafe extern "C" fn(*mut c_void, *const c_char)),
                slot_ptr(&slot),
            );
            free_slot(std::mem::replace(&mut self.hooks().borrow_mut().trace, slot));
        }
        debug!(registered = slot.is_some(), "trace callback changed");
    }

    /// Registers (or disables) the profile callback, invoked with each
    /// statement's SQL text and wall-clock execution time as it finishes.
    pub fn profile<F>(&self, callback: Option<F>)
    where
        F: FnMut(&str, Duration) + 'static,
    {
        let slot = into_slot(callback.map(|f| Box::new(f) as ProfileFn));
        // SAFETY: as in update_hook.
        unsafe {
            ffi::sqlite3_profile(
                self.handle(),
                slot.map(|_| call_profile as unsafe extern "C" fn(*mut c_void, *const c_char, ffi::sqlite3_uint64)),
                slot_ptr(&slot),
            );
            free_slot(std::mem::replace(&mut self.hooks().borrow_mut().profile, slot));
        }
        debug!(registered = slot.is_some(), "profile callback changed");
    }
}

/// Aborts instead of unwinding across the C boundary; hooks have no error
/// channel to report through.
fn hook_panic() -> ! {
    error!("panic in connection hook");
    std::process::abort();
}

unsafe extern "C" fn call_update(
    wrapper: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table_name: *const c_char,
    rowid: ffi::sqlite3_int64,
) {
    let hook = &mut *wrapper.cast::<UpdateHook>();
    let db_name = cstr_or_empty(db_name);
    let table_name = cstr_or_empty(table_name);
    if catch_unwind(AssertUnwindSafe(|| {
        hook(Action::from_code(op), &db_name, &table_name, rowid)
    }))
    .is_err()
    {
        hook_panic();
    }
}

unsafe extern "C" fn call_commit(wrapper: *mut c_void) -> c_int {
    let hook = &mut *wrapper.cast::<CommitHook>();
    match catch_unwind(AssertUnwindSafe(|| hook())) {
        Ok(abort) => c_int::from(abort),
        Err(_) => hook_panic(),
    }
}

unsafe extern "C" fn call_rollback(wrapper: *mut c_void) {
    let hook = &mut *wrapper.cast::<RollbackHook>();
    if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
        hook_panic();
    }
}

unsafe extern "C" fn call_progress(wrapper: *mut c_void) -> c_int {
    let handler = &mut *wrapper.cast::<ProgressHandler>();
    match catch_unwind(AssertUnwindSafe(|| handler())) {
        Ok(abort) => c_int::from(abort),
        Err(_) => hook_panic(),
    }
}

unsafe extern "C" fn call_trace(wrapper: *mut c_void, sql: *const c_char) {
    let callback = &mut *wrapper.cast::<TraceFn>();
    let sql = cstr_or_empty(sql);
    if catch_unwind(AssertUnwindSafe(|| callback(&sql))).is_err() {
        hook_panic();
    }
}

unsafe extern "C" fn call_profile(
    wrapper: *mut c_void,
    sql: *const c_char,
    nanos: ffi::sqlite3_uint64,
) {
    let callback = &mut *wrapper.cast::<ProfileFn>();
    let sql = cstr_or_empty(sql);
    let elapsed = Duration::from_nanos(nanos);
    if catch_unwind(AssertUnwindSafe(|| callback(&sql, elapsed))).is_err() {
        hook_panic();
    }
}

unsafe fn cstr_or_empty(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
