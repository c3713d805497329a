//! Inode-level data model and the low-level store interface.
//!
//! Everything here works on inode ids; no path resolution and no security
//! checks happen at this level. The namespace engine builds both on top.

use serde::{Deserialize, Serialize};

use crate::acl::Acl;
use crate::errors::DmResult;
use crate::extensible::Extensible;

/// Inode id type. Ids are globally unique and never reused.
pub type InodeId = u64;

/// The inode of the filesystem root ("/"). Its parent is 0.
pub const ROOT_INODE: InodeId = 1;

/// Online/migrated state of an entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    /// '-': the data is online.
    #[default]
    Online,
    /// 'm': the data was migrated to offline storage.
    Migrated,
}

impl FileStatus {
    /// The status column character.
    pub fn as_char(self) -> char {
        match self {
            FileStatus::Online => '-',
            FileStatus::Migrated => 'm',
        }
    }
}

/// Full metadata record of a namespace entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedStat {
    /// Inode id.
    pub ino: InodeId,
    /// Parent inode id (0 only for the root).
    pub parent: InodeId,
    /// Entry name within the parent ("/" for the root).
    pub name: String,
    /// External global id, when assigned.
    pub guid: Option<String>,
    /// Mode bits, including the file-type bits.
    pub mode: u32,
    /// Link count: number of entries for directories, 1 for files.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
    /// File size in bytes.
    pub size: u64,
    /// Access time (unix seconds).
    pub atime: i64,
    /// Modification time (unix seconds).
    pub mtime: i64,
    /// Metadata change time (unix seconds).
    pub ctime: i64,
    /// File class.
    pub file_class: u32,
    /// Online/migrated status.
    pub status: FileStatus,
    /// Checksum type, empty when absent.
    pub csumtype: String,
    /// Checksum value, empty when absent.
    pub csumvalue: String,
    /// Access control list (may be empty).
    pub acl: Acl,
    /// Free-form extra attributes.
    pub xattrs: Extensible,
}

impl ExtendedStat {
    /// True for directories.
    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// True for regular files.
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// True for symbolic links.
    pub fn is_link(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// A symbolic link record, paired with an `IFLNK` inode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SymLink {
    /// The link's inode.
    pub ino: InodeId,
    /// The target path.
    pub target: String,
}

/// Availability state of a replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// '-': available.
    #[default]
    Available,
    /// 'P': being populated by an ongoing write.
    BeingPopulated,
    /// 'D': queued for deletion.
    ToBeDeleted,
}

impl ReplicaStatus {
    /// The status column character.
    pub fn as_char(self) -> char {
        match self {
            ReplicaStatus::Available => '-',
            ReplicaStatus::BeingPopulated => 'P',
            ReplicaStatus::ToBeDeleted => 'D',
        }
    }
}

/// Lifetime class of a replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaType {
    /// 'V': may be garbage collected.
    Volatile,
    /// 'P': kept until explicitly deleted.
    #[default]
    Permanent,
}

/// One physical copy of a file's contents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    /// Replica id, assigned by the store.
    pub replica_id: i64,
    /// The regular-file inode this replica belongs to.
    pub fileid: InodeId,
    /// Access counter.
    pub nbaccesses: u64,
    /// Row creation time.
    pub ctime: i64,
    /// Last access time.
    pub atime: i64,
    /// Pin time.
    pub ptime: i64,
    /// Lifetime end.
    pub ltime: i64,
    /// Availability state.
    pub status: ReplicaStatus,
    /// Lifetime class.
    pub rtype: ReplicaType,
    /// Space-token set name recorded at write time, if any.
    pub setname: Option<String>,
    /// Disk server hostname.
    pub server: String,
    /// Replica file name (URL); unique across replicas.
    pub rfn: String,
    /// Pool the replica lives in.
    pub pool: String,
    /// Filesystem within the pool.
    pub filesystem: String,
    /// Free-form extra attributes.
    pub xattrs: Extensible,
}

/// A lazy, single-pass directory cursor.
///
/// Ordering is implementation defined but stable for the life of the cursor,
/// and concurrent namespace mutation never corrupts it.
pub trait DirCursor: Send {
    /// The next entry, or `None` when exhausted.
    fn next_entry(&mut self) -> DmResult<Option<ExtendedStat>>;
}

/// Low-level CRUD over the metadata schema. No security checks here.
///
/// Transactions nest by counter: `begin` increments, `commit` decrements and
/// actually commits at zero, `rollback` discards everything since the
/// outermost `begin`. Multi-statement mutations must run inside a
/// transaction; callers roll back on failure.
pub trait InodeStore: Send {
    /// Open (or nest into) a transaction.
    fn begin(&mut self) -> DmResult<()>;

    /// Close one nesting level, committing at the outermost one. Calling
    /// without a matching `begin` is a protocol error.
    fn commit(&mut self) -> DmResult<()>;

    /// Abort the whole transaction, regardless of nesting depth.
    fn rollback(&mut self) -> DmResult<()>;

    /// Insert a new entry. `f.ino` is ignored; the store assigns the id.
    /// Adjusts the parent's link count and times. Fails `NO_SUCH_FILE` when
    /// the parent does not exist and `EXISTS` on a (parent, name) or guid
    /// collision.
    fn create(&mut self, f: &ExtendedStat) -> DmResult<ExtendedStat>;

    /// Attach the symlink record of an `IFLNK` inode.
    fn symlink(&mut self, ino: InodeId, target: &str) -> DmResult<()>;

    /// Remove an entry: refuses non-empty directories, cascades the symlink,
    /// comment and replica rows, and adjusts the parent's link count.
    fn unlink(&mut self, ino: InodeId) -> DmResult<()>;

    /// Move an entry under a new parent, adjusting both parents' link
    /// counts and the entry's ctime.
    fn move_entry(&mut self, ino: InodeId, new_parent: InodeId) -> DmResult<()>;

    /// Rename an entry in place (same parent), bumping its ctime.
    fn rename_entry(&mut self, ino: InodeId, name: &str) -> DmResult<()>;

    /// Stat by inode id.
    fn extended_stat(&mut self, ino: InodeId) -> DmResult<ExtendedStat>;

    /// Stat by (parent, name).
    fn extended_stat_by_name(&mut self, parent: InodeId, name: &str) -> DmResult<ExtendedStat>;

    /// Stat by guid.
    fn extended_stat_by_guid(&mut self, guid: &str) -> DmResult<ExtendedStat>;

    /// Read the symlink record of an inode.
    fn read_link(&mut self, ino: InodeId) -> DmResult<SymLink>;

    /// Insert a replica; the id in `replica` is ignored and assigned.
    fn add_replica(&mut self, replica: &Replica) -> DmResult<Replica>;

    /// Delete a replica by id.
    fn delete_replica(&mut self, replica_id: i64) -> DmResult<()>;

    /// Fetch one replica by id.
    fn get_replica(&mut self, replica_id: i64) -> DmResult<Replica>;

    /// Fetch one replica by its unique replica file name.
    fn get_replica_by_rfn(&mut self, rfn: &str) -> DmResult<Replica>;

    /// Update a replica row (matched by id).
    fn update_replica(&mut self, replica: &Replica) -> DmResult<()>;

    /// All replicas of a file, possibly none.
    fn get_replicas(&mut self, ino: InodeId) -> DmResult<Vec<Replica>>;

    /// Set access/modification times; `None` means "now" for both.
    fn utime(&mut self, ino: InodeId, times: Option<(i64, i64)>) -> DmResult<()>;

    /// Change ownership, permission bits and/or the ACL in one statement.
    /// `None` keeps the current owner ids; the file-type bits of the stored
    /// mode are preserved.
    fn set_mode(
        &mut self,
        ino: InodeId,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: u32,
        acl: Option<&Acl>,
    ) -> DmResult<()>;

    /// Set the file size.
    fn set_size(&mut self, ino: InodeId, size: u64) -> DmResult<()>;

    /// Set the checksum pair.
    fn set_checksum(&mut self, ino: InodeId, csumtype: &str, csumvalue: &str) -> DmResult<()>;

    /// Set the guid. Fails `EXISTS` when another inode carries it.
    fn set_guid(&mut self, ino: InodeId, guid: &str) -> DmResult<()>;

    /// Read the comment; `NO_COMMENT` when absent.
    fn get_comment(&mut self, ino: InodeId) -> DmResult<String>;

    /// Insert or update the comment.
    fn set_comment(&mut self, ino: InodeId, comment: &str) -> DmResult<()>;

    /// Drop the comment, if any.
    fn delete_comment(&mut self, ino: InodeId) -> DmResult<()>;

    /// Replace the extended attributes.
    fn update_xattrs(&mut self, ino: InodeId, attrs: &Extensible) -> DmResult<()>;

    /// Open a directory cursor over the children of `ino`.
    fn open_dir(&mut self, ino: InodeId) -> DmResult<Box<dyn DirCursor>>;
}

/// Run `f` inside a store transaction, rolling back when it fails.
pub fn in_transaction<T>(
    store: &mut dyn InodeStore,
    f: impl FnOnce(&mut dyn InodeStore) -> DmResult<T>,
) -> DmResult<T> {
    store.begin()?;
    match f(store) {
        Ok(v) => {
            store.commit()?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = store.rollback() {
                log::error!("rollback after '{e}' also failed: {rb}");
            }
            Err(e)
        }
    }
}
