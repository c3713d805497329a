//! Pool driver interface: per-pool-type mechanics behind the pool manager.
//!
//! A driver knows how to talk to the storage behind one pool type: replica
//! availability, read locations, write allocations and completions. Drivers
//! are registered per pool-type string and looked up by the pool manager.

use std::sync::Arc;

use log::warn;

use crate::errors::DmResult;
use crate::extensible::Extensible;
use crate::inode::Replica;
use crate::poolmanager::{Location, Pool};
use crate::security::SecurityContext;

/// Mechanics of one pool type.
pub trait PoolDriver: Send + std::fmt::Debug {
    /// Adopt the security context all subsequent calls run under.
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>);

    /// Whether the pool currently serves reads (and writes, when asked),
    /// judged from its constituent filesystems' status flags.
    fn is_pool_available(&mut self, pool: &Pool, for_write: bool) -> DmResult<bool>;

    /// Whether this specific replica can be served right now.
    fn is_replica_available(&mut self, replica: &Replica) -> DmResult<bool>;

    /// Build the read location for a chosen replica of a file of
    /// `file_size` bytes, token included.
    fn where_to_read(&mut self, replica: &Replica, file_size: u64) -> DmResult<Location>;

    /// Allocate a write destination in `pool` for the logical name `sfn`:
    /// obtains a put request from the disk-pool daemon and returns the
    /// location carrying the daemon's request id and a write token.
    fn where_to_write(&mut self, pool: &Pool, sfn: &str) -> DmResult<Location>;

    /// Finalize a write with the daemon. Returns the replica row to record,
    /// with the observed physical size in its extra attributes under
    /// `filesize`.
    fn done_writing(&mut self, host: &str, rfn: &str, params: &Extensible) -> DmResult<Replica>;

    /// Release a pending write allocation. Must tolerate repeats.
    fn cancel_write(&mut self, location: &Location) -> DmResult<()>;
}

/// Run a daemon call under the retry policy: transient failures are
/// re-issued with a growing pause, up to `retry_limit` attempts; semantic
/// failures surface immediately.
pub fn with_retries<T>(
    retry_limit: u32,
    what: &str,
    mut call: impl FnMut() -> DmResult<T>,
) -> DmResult<T> {
    let mut attempt = 0;
    loop {
        match call() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < retry_limit.max(1) => {
                attempt += 1;
                warn!("{what} failed ({e}), retry {attempt}/{retry_limit}");
                std::thread::sleep(std::time::Duration::from_millis(50 * u64::from(attempt)));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{DmError, ErrorCode};

    #[test]
    fn test_retries_transient_until_limit() {
        let mut calls = 0;
        let err = with_retries(3, "put", || -> DmResult<()> {
            calls += 1;
            Err(DmError::new(
                ErrorCode::system(libc::ECONNRESET as u32),
                "connection dropped",
            ))
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(err.is_transient());
    }

    #[test]
    fn test_semantic_errors_do_not_retry() {
        let mut calls = 0;
        let _ = with_retries(5, "put", || -> DmResult<()> {
            calls += 1;
            Err(DmError::new(ErrorCode::FORBIDDEN, "denied"))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_success_passes_through() {
        let mut calls = 0;
        let v = with_retries(3, "put", || {
            calls += 1;
            if calls < 2 {
                Err(DmError::new(
                    ErrorCode::system(libc::EAGAIN as u32),
                    "busy",
                ))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(calls, 2);
    }
}
