//! Structured error model.
//!
//! Every failure in the crate is described by a [`DmError`]: a 32-bit code
//! plus a human readable message. The high byte of the code selects the
//! category (user, system, configuration, database), the low bytes carry a
//! POSIX errno or one of the extended codes defined here. The same
//! information is available in status form ([`DmStatus`]) for the C facade;
//! the two shapes convert into each other without loss.

use std::error::Error;
use std::fmt;
use std::io;

/// Result alias used across the crate.
pub type DmResult<T> = Result<T, DmError>;

/// Error categories, stored in the high byte of an [`ErrorCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Client-visible errors, mirroring POSIX errno values.
    User,
    /// POSIX errno values coming from system calls.
    System,
    /// Configuration directives that could not be applied.
    Configuration,
    /// Errors reported by the metadata store.
    Database,
}

impl ErrorCategory {
    const fn shifted(self) -> u32 {
        match self {
            ErrorCategory::User => 0x0000_0000,
            ErrorCategory::System => 0x0100_0000,
            ErrorCategory::Configuration => 0x0200_0000,
            ErrorCategory::Database => 0x0300_0000,
        }
    }
}

/// A 32-bit error code: category in the high byte, errno in the low bytes.
///
/// The named constants cover the codes raised by this crate. Plug-ins may
/// construct further codes from raw errno values through the category
/// constructors.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Build a user-category code from a POSIX errno or extended value.
    pub const fn user(errno: u32) -> ErrorCode {
        ErrorCode(ErrorCategory::User.shifted() | (errno & 0x00ff_ffff))
    }

    /// Build a system-category code from a POSIX errno.
    pub const fn system(errno: u32) -> ErrorCode {
        ErrorCode(ErrorCategory::System.shifted() | (errno & 0x00ff_ffff))
    }

    /// Build a configuration-category code.
    pub const fn configuration(errno: u32) -> ErrorCode {
        ErrorCode(ErrorCategory::Configuration.shifted() | (errno & 0x00ff_ffff))
    }

    /// Build a database-category code.
    pub const fn database(errno: u32) -> ErrorCode {
        ErrorCode(ErrorCategory::Database.shifted() | (errno & 0x00ff_ffff))
    }

    /// Rebuild a code from its raw 32-bit form.
    pub const fn from_raw(raw: u32) -> ErrorCode {
        ErrorCode(raw)
    }

    /// The raw 32-bit form.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The category encoded in the high byte.
    pub fn category(self) -> ErrorCategory {
        match self.0 & 0xff00_0000 {
            0x0100_0000 => ErrorCategory::System,
            0x0200_0000 => ErrorCategory::Configuration,
            0x0300_0000 => ErrorCategory::Database,
            _ => ErrorCategory::User,
        }
    }

    /// The errno part, with the category byte masked out.
    pub const fn errno(self) -> u32 {
        self.0 & 0x00ff_ffff
    }
}

// Extended values, starting above the POSIX errno range.
const ERR_INTERNAL: u32 = 258;
const ERR_NO_SUCH_SYMBOL: u32 = 270;
const ERR_API_VERSION_MISMATCH: u32 = 271;
const ERR_NO_POOL_MANAGER: u32 = 272;
const ERR_NO_CATALOG: u32 = 273;
const ERR_NO_INODE: u32 = 274;
const ERR_NO_AUTHN: u32 = 275;
const ERR_NO_IO: u32 = 276;
const ERR_NO_SECURITY_CONTEXT: u32 = 300;
const ERR_MALFORMED: u32 = 350;
const ERR_UNKNOWN_KEY: u32 = 351;
const ERR_IS_CWD: u32 = 352;
const ERR_NO_COMMENT: u32 = 400;
const ERR_NO_REPLICAS: u32 = 401;
const ERR_NO_SUCH_REPLICA: u32 = 402;
const ERR_NO_SUCH_USER: u32 = 501;
const ERR_NO_SUCH_GROUP: u32 = 502;
const ERR_INVALID_ACL: u32 = 504;
const ERR_UNKNOWN_POOL_TYPE: u32 = 600;
const ERR_NO_SUCH_POOL: u32 = 601;
const ERR_QUERY_FAILED: u32 = 602;

impl ErrorCode {
    /// The path (or inode, or guid) does not resolve to an entry.
    pub const NO_SUCH_FILE: ErrorCode = ErrorCode::user(libc::ENOENT as u32);
    /// The entry already exists.
    pub const EXISTS: ErrorCode = ErrorCode::user(libc::EEXIST as u32);
    /// A non-directory was found where a directory is required.
    pub const NOT_DIRECTORY: ErrorCode = ErrorCode::user(libc::ENOTDIR as u32);
    /// A directory was found where one is not accepted.
    pub const IS_DIRECTORY: ErrorCode = ErrorCode::user(libc::EISDIR as u32);
    /// The caller lacks the required permission.
    pub const FORBIDDEN: ErrorCode = ErrorCode::user(libc::EACCES as u32);
    /// Symlink traversal exceeded the configured limit.
    pub const TOO_MANY_SYMLINKS: ErrorCode = ErrorCode::user(libc::ELOOP as u32);
    /// The operation does not make sense on this entry for this caller.
    pub const BAD_OPERATION: ErrorCode = ErrorCode::user(libc::EPERM as u32);
    /// An argument value is not acceptable.
    pub const INVALID_VALUE: ErrorCode = ErrorCode::user(libc::EINVAL as u32);
    /// The requested functionality is not provided by this implementation.
    pub const NOT_IMPLEMENTED: ErrorCode = ErrorCode::system(libc::ENOSYS as u32);
    /// A pooled resource could not be leased without blocking.
    pub const RESOURCE_UNAVAILABLE: ErrorCode = ErrorCode::system(libc::EBUSY as u32);
    /// Invariant violation inside the crate.
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode::system(ERR_INTERNAL);
    /// `LoadPlugin` could not resolve the plug-in id.
    pub const NO_SUCH_SYMBOL: ErrorCode = ErrorCode::configuration(ERR_NO_SUCH_SYMBOL);
    /// The plug-in was built against an incompatible API version.
    pub const API_VERSION_MISMATCH: ErrorCode = ErrorCode::configuration(ERR_API_VERSION_MISMATCH);
    /// No pool-manager factory is registered.
    pub const NO_POOL_MANAGER: ErrorCode = ErrorCode::configuration(ERR_NO_POOL_MANAGER);
    /// No catalog factory is registered.
    pub const NO_CATALOG: ErrorCode = ErrorCode::configuration(ERR_NO_CATALOG);
    /// No inode-store factory is registered.
    pub const NO_INODE: ErrorCode = ErrorCode::configuration(ERR_NO_INODE);
    /// No authentication factory is registered.
    pub const NO_AUTHN: ErrorCode = ErrorCode::configuration(ERR_NO_AUTHN);
    /// No I/O-driver factory is registered.
    pub const NO_IO: ErrorCode = ErrorCode::configuration(ERR_NO_IO);
    /// An operation that needs credentials ran without a security context.
    pub const NO_SECURITY_CONTEXT: ErrorCode = ErrorCode::user(ERR_NO_SECURITY_CONTEXT);
    /// Malformed input (token, serialized ACL, configuration line).
    pub const MALFORMED: ErrorCode = ErrorCode::user(ERR_MALFORMED);
    /// No registered factory accepted the configuration key.
    pub const UNKNOWN_KEY: ErrorCode = ErrorCode::configuration(ERR_UNKNOWN_KEY);
    /// The entry is the current working directory of this stack.
    pub const IS_CWD: ErrorCode = ErrorCode::user(ERR_IS_CWD);
    /// The entry has no associated comment.
    pub const NO_COMMENT: ErrorCode = ErrorCode::user(ERR_NO_COMMENT);
    /// The file has no replicas.
    pub const NO_REPLICAS: ErrorCode = ErrorCode::user(ERR_NO_REPLICAS);
    /// The replica does not exist.
    pub const NO_SUCH_REPLICA: ErrorCode = ErrorCode::user(ERR_NO_SUCH_REPLICA);
    /// The user does not exist.
    pub const NO_SUCH_USER: ErrorCode = ErrorCode::user(ERR_NO_SUCH_USER);
    /// The group does not exist.
    pub const NO_SUCH_GROUP: ErrorCode = ErrorCode::user(ERR_NO_SUCH_GROUP);
    /// The ACL fails validation.
    pub const INVALID_ACL: ErrorCode = ErrorCode::user(ERR_INVALID_ACL);
    /// No driver is registered for the pool type.
    pub const UNKNOWN_POOL_TYPE: ErrorCode = ErrorCode::user(ERR_UNKNOWN_POOL_TYPE);
    /// The pool does not exist.
    pub const NO_SUCH_POOL: ErrorCode = ErrorCode::user(ERR_NO_SUCH_POOL);
    /// A query against the store or the disk-pool daemon failed.
    pub const QUERY_FAILED: ErrorCode = ErrorCode::database(ERR_QUERY_FAILED);
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({:?}, {})", self.category(), self.errno())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category() {
            ErrorCategory::User => "user",
            ErrorCategory::System => "system",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Database => "database",
        };
        write!(f, "{} error {}", category, self.errno())
    }
}

/// A structured error: code plus message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmError {
    code: ErrorCode,
    message: String,
}

impl DmError {
    /// Build an error from a code and a message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> DmError {
        DmError {
            code,
            message: message.into(),
        }
    }

    /// The error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a retry wrapper may reasonably re-issue the failed call.
    ///
    /// Connection drops and serialization conflicts are transient; semantic
    /// failures (permission, not-found) are not.
    pub fn is_transient(&self) -> bool {
        matches!(self.code.category(), ErrorCategory::System | ErrorCategory::Database)
            && matches!(
                self.code.errno() as i32,
                libc::EAGAIN | libc::ECONNRESET | libc::ECONNREFUSED | libc::ETIMEDOUT | libc::EDEADLK
            )
    }
}

impl fmt::Display for DmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl Error for DmError {}

impl From<io::Error> for DmError {
    fn from(err: io::Error) -> DmError {
        let errno = err.raw_os_error().unwrap_or(libc::EIO) as u32;
        DmError::new(ErrorCode::system(errno), err.to_string())
    }
}

/// Status form of an error, used at the C boundary.
///
/// A `DmStatus` is either success (`code == 0`) or carries the same code and
/// message a [`DmError`] would.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmStatus {
    code: u32,
    message: String,
}

impl DmStatus {
    /// The success status.
    pub fn ok() -> DmStatus {
        DmStatus {
            code: 0,
            message: String::new(),
        }
    }

    /// True when this status reports success.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// The raw code (0 on success).
    pub fn code(&self) -> u32 {
        self.code
    }

    /// The message (empty on success).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Convert back to the error shape; `None` when the status is success.
    pub fn into_error(self) -> Option<DmError> {
        if self.is_ok() {
            None
        } else {
            Some(DmError::new(ErrorCode::from_raw(self.code), self.message))
        }
    }
}

impl From<DmError> for DmStatus {
    fn from(err: DmError) -> DmStatus {
        DmStatus {
            code: err.code.raw(),
            message: err.message,
        }
    }
}

impl<T> From<DmResult<T>> for DmStatus {
    fn from(result: DmResult<T>) -> DmStatus {
        match result {
            Ok(_) => DmStatus::ok(),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_partition() {
        assert_eq!(ErrorCode::NO_SUCH_FILE.category(), ErrorCategory::User);
        assert_eq!(ErrorCode::NO_SUCH_FILE.errno(), libc::ENOENT as u32);
        assert_eq!(ErrorCode::INTERNAL_ERROR.category(), ErrorCategory::System);
        assert_eq!(ErrorCode::UNKNOWN_KEY.category(), ErrorCategory::Configuration);
        assert_eq!(ErrorCode::QUERY_FAILED.category(), ErrorCategory::Database);
    }

    #[test]
    fn test_status_round_trip() {
        let err = DmError::new(ErrorCode::FORBIDDEN, "not enough permissions");
        let status = DmStatus::from(err.clone());
        assert!(!status.is_ok());
        assert_eq!(status.code(), ErrorCode::FORBIDDEN.raw());
        assert_eq!(status.into_error(), Some(err));
    }

    #[test]
    fn test_ok_status_has_no_error() {
        assert!(DmStatus::ok().into_error().is_none());
    }

    #[test]
    fn test_transient_codes() {
        let transient = DmError::new(ErrorCode::system(libc::ECONNRESET as u32), "lost");
        assert!(transient.is_transient());
        let semantic = DmError::new(ErrorCode::FORBIDDEN, "no");
        assert!(!semantic.is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: DmError = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert_eq!(err.code().category(), ErrorCategory::System);
        assert_eq!(err.code().errno(), libc::ENOENT as u32);
    }
}
