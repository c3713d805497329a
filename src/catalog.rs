//! The catalog interface: the namespace as seen through logical paths.
//!
//! All entry points take a path relative to the per-stack working directory;
//! absolute paths start from the filesystem root. Implementations enforce
//! POSIX + ACL semantics on top of an [`InodeStore`](crate::inode::InodeStore).

use std::sync::Arc;

use crate::acl::Acl;
use crate::errors::DmResult;
use crate::extensible::Extensible;
use crate::inode::{DirCursor, ExtendedStat, Replica};
use crate::security::SecurityContext;

/// Namespace operations over logical paths.
pub trait Catalog: Send + std::fmt::Debug {
    /// Adopt the security context all subsequent calls run under.
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>);

    /// Change the working directory for relative paths.
    fn change_dir(&mut self, path: &str) -> DmResult<()>;

    /// The current working directory, if one was set.
    fn get_working_dir(&self) -> Option<String>;

    /// Stat a path, optionally following a terminal symlink.
    fn extended_stat(&mut self, path: &str, follow_sym: bool) -> DmResult<ExtendedStat>;

    /// Stat the logical file owning the replica with this rfn.
    fn extended_stat_by_rfn(&mut self, rfn: &str) -> DmResult<ExtendedStat>;

    /// Whether the caller could access the path with the given
    /// `R_OK|W_OK|X_OK|F_OK` mask. Fails when the file does not exist.
    fn access(&mut self, path: &str, mode: u32) -> DmResult<bool>;

    /// Register a replica for an existing file (write access required, and
    /// the whole path up to the root must be traversable).
    fn add_replica(&mut self, replica: &Replica) -> DmResult<Replica>;

    /// Remove a replica record.
    fn delete_replica(&mut self, replica: &Replica) -> DmResult<()>;

    /// All replicas of a path. Fails `NO_REPLICAS` when there are none.
    fn get_replicas(&mut self, path: &str) -> DmResult<Vec<Replica>>;

    /// Fetch one replica by rfn.
    fn get_replica_by_rfn(&mut self, rfn: &str) -> DmResult<Replica>;

    /// Update a replica record.
    fn update_replica(&mut self, replica: &Replica) -> DmResult<()>;

    /// Create a symlink at `new_path` pointing to `old_path`.
    fn symlink(&mut self, old_path: &str, new_path: &str) -> DmResult<()>;

    /// The target of a symlink.
    fn read_link(&mut self, path: &str) -> DmResult<String>;

    /// Remove a file (never a directory). Files with replicas are refused.
    fn unlink(&mut self, path: &str) -> DmResult<()>;

    /// Create a file, or truncate an existing replica-less one.
    fn create(&mut self, path: &str, mode: u32) -> DmResult<()>;

    /// Set the stack's file creation mask (0777 bits), returning the
    /// previous value.
    fn umask(&mut self, mask: u32) -> u32;

    /// Change permission bits (owner or root only).
    fn set_mode(&mut self, path: &str, mode: u32) -> DmResult<()>;

    /// Change owner and/or group; `None` keeps the current value.
    fn set_owner(
        &mut self,
        path: &str,
        new_uid: Option<u32>,
        new_gid: Option<u32>,
        follow_sym: bool,
    ) -> DmResult<()>;

    /// Set the recorded size of a file.
    fn set_size(&mut self, path: &str, size: u64) -> DmResult<()>;

    /// Set the checksum pair of a file.
    fn set_checksum(&mut self, path: &str, csumtype: &str, csumvalue: &str) -> DmResult<()>;

    /// Replace the ACL (owner or root only).
    fn set_acl(&mut self, path: &str, acl: &Acl) -> DmResult<()>;

    /// Set access/modification times; `None` means "now".
    fn utime(&mut self, path: &str, times: Option<(i64, i64)>) -> DmResult<()>;

    /// Read the comment of an entry.
    fn get_comment(&mut self, path: &str) -> DmResult<String>;

    /// Set the comment of an entry.
    fn set_comment(&mut self, path: &str, comment: &str) -> DmResult<()>;

    /// Assign the external guid (owner or root only).
    fn set_guid(&mut self, path: &str, guid: &str) -> DmResult<()>;

    /// Replace the extended attributes of an entry.
    fn update_xattrs(&mut self, path: &str, attrs: &Extensible) -> DmResult<()>;

    /// Open a directory for reading (read access required; touches atime).
    fn open_dir(&mut self, path: &str) -> DmResult<Box<dyn DirCursor>>;

    /// Create a directory.
    fn make_dir(&mut self, path: &str, mode: u32) -> DmResult<()>;

    /// Rename or move an entry. Renaming over an existing entry requires
    /// matching types and, for directories, emptiness.
    fn rename(&mut self, old_path: &str, new_path: &str) -> DmResult<()>;

    /// Remove an empty directory.
    fn remove_dir(&mut self, path: &str) -> DmResult<()>;
}
