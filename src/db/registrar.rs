//! Per-connection sqlite-vec registration.
//!
//! Installs the `vec0` virtual-table module and the `vec_*` SQL functions
//! on one `rusqlite::Connection`. Nothing is registered process-wide, so
//! other connections in the same process are unaffected.

use std::ffi::{c_char, c_int, CStr};
use std::ptr;

use rusqlite::{ffi, Connection};
use sqlite_vec::sqlite3_vec_init;

use crate::runtime::{Error, Result};

/// Outcome of a successful [`register`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The extension was installed by this call.
    Installed,
    /// `vec_version()` already resolved; nothing was done.
    AlreadyRegistered,
}

type VecInitFn =
    unsafe extern "C" fn(*mut ffi::sqlite3, *mut *mut c_char, *const ffi::sqlite3_api_routines) -> c_int;

/// Owns an error message allocated by SQLite and frees it on drop.
struct SqliteErrMsg(*mut c_char);

impl SqliteErrMsg {
    fn message(&self) -> Option<String> {
        if self.0.is_null() {
            return None;
        }
        // SAFETY: non-null messages from sqlite3_vec_init are NUL-terminated
        // strings from sqlite3_mprintf, alive until we free them.
        Some(unsafe { CStr::from_ptr(self.0) }.to_string_lossy().into_owned())
    }
}

impl Drop for SqliteErrMsg {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: the pointer came from SQLite's allocator and is freed once.
            unsafe { ffi::sqlite3_free(self.0.cast()) };
        }
    }
}

/// Version string reported by the extension on this connection.
pub fn vec_version(conn: &Connection) -> Result<String> {
    Ok(conn.query_row("SELECT vec_version()", [], |row| row.get(0))?)
}

pub fn is_registered(conn: &Connection) -> bool {
    vec_version(conn).is_ok()
}

/// Register sqlite-vec on `conn`. Idempotent.
///
/// A failed registration leaves the connection usable for plain SQL.
pub fn register(conn: &Connection) -> Result<Registration> {
    if let Ok(version) = vec_version(conn) {
        tracing::debug!(%version, "sqlite-vec already registered");
        return Ok(Registration::AlreadyRegistered);
    }

    // SAFETY: sqlite-vec is compiled into this binary against the same
    // SQLite; its entry point has the standard extension-init signature.
    let init: VecInitFn = unsafe { std::mem::transmute(sqlite3_vec_init as *const ()) };

    let mut err: *mut c_char = ptr::null_mut();
    // SAFETY: the handle is valid for the lifetime of `conn`, and `&Connection`
    // is not shared across threads (`Connection: !Sync`).
    let rc = unsafe { init(conn.handle(), &mut err, ptr::null()) };
    let err = SqliteErrMsg(err);

    if rc != ffi::SQLITE_OK {
        let message = err
            .message()
            .unwrap_or_else(|| ffi::Error::new(rc).to_string());
        tracing::error!(rc, %message, "sqlite-vec registration failed");
        return Err(Error::Registration { code: rc, message });
    }

    let version = vec_version(conn)?;
    tracing::debug!(%version, "sqlite-vec registered");
    Ok(Registration::Installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_is_unregistered() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!is_registered(&conn));
        assert!(vec_version(&conn).is_err());
    }

    #[test]
    fn register_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(register(&conn).unwrap(), Registration::Installed);
        assert_eq!(register(&conn).unwrap(), Registration::AlreadyRegistered);
        assert!(vec_version(&conn).unwrap().starts_with('v'));
    }

    #[test]
    fn registration_is_per_connection() {
        let a = Connection::open_in_memory().unwrap();
        let b = Connection::open_in_memory().unwrap();
        register(&a).unwrap();
        assert!(is_registered(&a));
        assert!(!is_registered(&b));
    }

    #[test]
    fn vec0_tables_work_after_registration() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn.execute_batch("CREATE VIRTUAL TABLE v USING vec0(embedding FLOAT[2])")
            .unwrap();
    }

    #[test]
    fn null_error_message_is_none() {
        assert_eq!(SqliteErrMsg(ptr::null_mut()).message(), None);
    }

    #[test]
    fn error_message_is_read_then_freed() {
        // SAFETY: a NUL-terminated format string with no conversions.
        let raw = unsafe { ffi::sqlite3_mprintf(b"vec0 init failed\0".as_ptr().cast()) };
        assert!(!raw.is_null());

        let err = SqliteErrMsg(raw);
        assert_eq!(err.message().as_deref(), Some("vec0 init failed"));
        drop(err);
    }
}
