//! Embedded namespace database and the bundled inode store.
//!
//! The `builtin_ns` plug-in keeps the whole metadata schema (file metadata,
//! symlinks, replicas, comments, users, groups, pools, filesystems and the
//! id counters) in an in-process table set, optionally snapshotted to disk.
//! Databases are shared process-wide by name, the way SQL plug-ins share a
//! database server: two factories configured with the same `NsDatabase`
//! value operate on the same tables.
//!
//! Store handles lease a connection from a bounded pool sized by the
//! `PoolSize` directive, and implement counter-nested transactions with
//! snapshot rollback over the shared tables.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::acl::Acl;
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::inode::{
    DirCursor, ExtendedStat, InodeId, InodeStore, Replica, SymLink, ROOT_INODE,
};
use crate::plugin::{
    AuthnFactory, Configurable, InodeFactory, PluginIdCard, PluginManager,
};
use crate::pool_container::{Lease, PoolContainer, PoolElementFactory};
use crate::poolmanager::Pool;
use crate::security::{GroupInfo, UserInfo};

/// Unix seconds now.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Status of a filesystem within a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsStatus {
    /// Serves reads and writes.
    #[default]
    Enabled,
    /// Serves nothing.
    Disabled,
    /// Serves reads only.
    ReadOnly,
}

/// One filesystem row of the `fs` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FsRow {
    /// Owning pool.
    pub pool: String,
    /// Disk server hosting it.
    pub server: String,
    /// Filesystem root path on that server.
    pub fs: String,
    /// Availability status.
    pub status: FsStatus,
    /// Weight for write placement.
    pub weight: u32,
}

/// The whole persisted schema.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct NsTables {
    files: HashMap<InodeId, ExtendedStat>,
    names: HashMap<(InodeId, String), InodeId>,
    guids: HashMap<String, InodeId>,
    links: HashMap<InodeId, String>,
    comments: HashMap<InodeId, String>,
    replicas: BTreeMap<i64, Replica>,
    rfns: HashMap<String, i64>,
    users: HashMap<u32, UserInfo>,
    user_names: HashMap<String, u32>,
    groups: HashMap<u32, GroupInfo>,
    group_names: HashMap<String, u32>,
    unique_uid: u32,
    unique_gid: u32,
    pub(crate) pools: BTreeMap<String, Pool>,
    pub(crate) filesystems: Vec<FsRow>,
    next_fileid: InodeId,
    next_replica_id: i64,
}

impl NsTables {
    fn seeded() -> NsTables {
        let mut tables = NsTables {
            next_fileid: ROOT_INODE + 1,
            next_replica_id: 1,
            unique_uid: 0,
            unique_gid: 0,
            ..Default::default()
        };
        let now = unix_now();
        let root = ExtendedStat {
            ino: ROOT_INODE,
            parent: 0,
            name: "/".to_string(),
            mode: libc::S_IFDIR | 0o755,
            nlink: 0,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        };
        tables.names.insert((0, "/".to_string()), ROOT_INODE);
        tables.files.insert(ROOT_INODE, root);
        tables.users.insert(
            0,
            UserInfo {
                uid: 0,
                name: "root".to_string(),
                ..Default::default()
            },
        );
        tables.user_names.insert("root".to_string(), 0);
        tables.groups.insert(
            0,
            GroupInfo {
                gid: 0,
                name: "root".to_string(),
                ..Default::default()
            },
        );
        tables.group_names.insert("root".to_string(), 0);
        tables
    }

    fn no_such_file(what: impl std::fmt::Display) -> DmError {
        DmError::new(ErrorCode::NO_SUCH_FILE, format!("no such file or directory: {what}"))
    }

    pub(crate) fn stat(&self, ino: InodeId) -> DmResult<ExtendedStat> {
        self.files
            .get(&ino)
            .cloned()
            .ok_or_else(|| Self::no_such_file(format_args!("#{ino}")))
    }

    fn stat_mut(&mut self, ino: InodeId) -> DmResult<&mut ExtendedStat> {
        self.files
            .get_mut(&ino)
            .ok_or_else(|| Self::no_such_file(format_args!("#{ino}")))
    }

    pub(crate) fn stat_by_name(&self, parent: InodeId, name: &str) -> DmResult<ExtendedStat> {
        let ino = self
            .names
            .get(&(parent, name.to_string()))
            .ok_or_else(|| Self::no_such_file(format_args!("{name} under #{parent}")))?;
        self.stat(*ino)
    }

    fn stat_by_guid(&self, guid: &str) -> DmResult<ExtendedStat> {
        let ino = self
            .guids
            .get(guid)
            .ok_or_else(|| Self::no_such_file(format_args!("guid {guid}")))?;
        self.stat(*ino)
    }

    fn touch_parent(&mut self, parent: InodeId, nlink_delta: i32) -> DmResult<()> {
        let now = unix_now();
        let meta = self.stat_mut(parent)?;
        meta.nlink = meta.nlink.saturating_add_signed(nlink_delta);
        meta.mtime = now;
        meta.ctime = now;
        Ok(())
    }

    fn insert_file(&mut self, f: &ExtendedStat) -> DmResult<ExtendedStat> {
        if f.name.is_empty() || f.name.contains('/') {
            return Err(DmError::new(
                ErrorCode::INVALID_VALUE,
                format!("'{}' is not a valid entry name", f.name),
            ));
        }
        let parent = self
            .files
            .get(&f.parent)
            .ok_or_else(|| Self::no_such_file(format_args!("parent #{}", f.parent)))?;
        if !parent.is_directory() {
            return Err(DmError::new(
                ErrorCode::NOT_DIRECTORY,
                format!("#{} is not a directory", f.parent),
            ));
        }
        let key = (f.parent, f.name.clone());
        if self.names.contains_key(&key) {
            return Err(DmError::new(
                ErrorCode::EXISTS,
                format!("{} already exists", f.name),
            ));
        }
        if let Some(guid) = &f.guid {
            if self.guids.contains_key(guid) {
                return Err(DmError::new(
                    ErrorCode::EXISTS,
                    format!("guid {guid} already in use"),
                ));
            }
        }

        let mut meta = f.clone();
        meta.ino = self.next_fileid;
        self.next_fileid += 1;
        let now = unix_now();
        meta.atime = now;
        meta.mtime = now;
        meta.ctime = now;

        self.names.insert(key, meta.ino);
        if let Some(guid) = &meta.guid {
            self.guids.insert(guid.clone(), meta.ino);
        }
        self.files.insert(meta.ino, meta.clone());
        self.touch_parent(meta.parent, 1)?;
        Ok(meta)
    }

    fn remove_file(&mut self, ino: InodeId) -> DmResult<()> {
        let meta = self.stat(ino)?;
        if meta.is_directory() && meta.nlink > 0 {
            return Err(DmError::new(
                ErrorCode::IS_DIRECTORY,
                format!("{} is a directory and not empty", meta.name),
            ));
        }
        self.names.remove(&(meta.parent, meta.name.clone()));
        if let Some(guid) = &meta.guid {
            self.guids.remove(guid);
        }
        self.links.remove(&ino);
        self.comments.remove(&ino);
        let replica_ids: Vec<i64> = self
            .replicas
            .values()
            .filter(|r| r.fileid == ino)
            .map(|r| r.replica_id)
            .collect();
        for rid in replica_ids {
            if let Some(r) = self.replicas.remove(&rid) {
                self.rfns.remove(&r.rfn);
            }
        }
        if meta.is_regular() && meta.size > 0 {
            self.account_dir_usage(meta.parent, -(meta.size as i64));
        }
        self.files.remove(&ino);
        self.touch_parent(meta.parent, -1)?;
        Ok(())
    }

    /// Directory usage accounting: file size deltas propagate to ancestor
    /// directories close enough to the root (`DirspaceReportDepth`).
    fn account_dir_usage(&mut self, first_parent: InodeId, delta: i64) {
        if delta == 0 || DIRSPACE_DEPTH.with_depth(|d| d) == 0 {
            return;
        }
        let mut chain = Vec::new();
        let mut current = first_parent;
        while current != 0 {
            chain.push(current);
            current = match self.files.get(&current) {
                Some(meta) => meta.parent,
                None => break,
            };
        }
        let limit = DIRSPACE_DEPTH.with_depth(|d| d);
        // chain runs child -> root; depth of chain[i] is chain.len()-1-i
        let total = chain.len();
        for (i, ino) in chain.into_iter().enumerate() {
            let depth = total - 1 - i;
            if depth >= limit {
                continue;
            }
            if let Some(meta) = self.files.get_mut(&ino) {
                meta.size = meta.size.saturating_add_signed(delta);
            }
        }
    }

    // --- user/group allocation, shared with the authn backend ---

    pub(crate) fn user_by_name(&self, name: &str) -> DmResult<UserInfo> {
        self.user_names
            .get(name)
            .and_then(|uid| self.users.get(uid))
            .cloned()
            .ok_or_else(|| DmError::new(ErrorCode::NO_SUCH_USER, format!("user {name} not found")))
    }

    pub(crate) fn user_by_uid(&self, uid: u32) -> DmResult<UserInfo> {
        self.users
            .get(&uid)
            .cloned()
            .ok_or_else(|| DmError::new(ErrorCode::NO_SUCH_USER, format!("user #{uid} not found")))
    }

    pub(crate) fn group_by_name(&self, name: &str) -> DmResult<GroupInfo> {
        self.group_names
            .get(name)
            .and_then(|gid| self.groups.get(gid))
            .cloned()
            .ok_or_else(|| {
                DmError::new(ErrorCode::NO_SUCH_GROUP, format!("group {name} not found"))
            })
    }

    pub(crate) fn group_by_gid(&self, gid: u32) -> DmResult<GroupInfo> {
        self.groups
            .get(&gid)
            .cloned()
            .ok_or_else(|| DmError::new(ErrorCode::NO_SUCH_GROUP, format!("group #{gid} not found")))
    }

    pub(crate) fn new_user(&mut self, name: &str, ca: &str) -> DmResult<UserInfo> {
        if self.user_names.contains_key(name) {
            return Err(DmError::new(
                ErrorCode::EXISTS,
                format!("user {name} already exists"),
            ));
        }
        // update the persistent counter, or initialize it on first use
        self.unique_uid += 1;
        let user = UserInfo {
            uid: self.unique_uid,
            name: name.to_string(),
            ca: ca.to_string(),
            banned: false,
            extra: Extensible::new(),
        };
        self.users.insert(user.uid, user.clone());
        self.user_names.insert(name.to_string(), user.uid);
        Ok(user)
    }

    pub(crate) fn new_group(&mut self, name: &str) -> DmResult<GroupInfo> {
        if self.group_names.contains_key(name) {
            return Err(DmError::new(
                ErrorCode::EXISTS,
                format!("group {name} already exists"),
            ));
        }
        self.unique_gid += 1;
        let group = GroupInfo {
            gid: self.unique_gid,
            name: name.to_string(),
            banned: false,
            extra: Extensible::new(),
        };
        self.groups.insert(group.gid, group.clone());
        self.group_names.insert(name.to_string(), group.gid);
        Ok(group)
    }
}

// The dirspace depth is configuration shared by every handle of the
// process; a plain global mirrors the single-valued directive.
struct DirspaceDepth(RwLock<usize>);

impl DirspaceDepth {
    fn with_depth<R>(&self, f: impl FnOnce(usize) -> R) -> R {
        f(*self.0.read())
    }

    fn set(&self, depth: usize) {
        *self.0.write() = depth;
    }
}

static DIRSPACE_DEPTH: DirspaceDepth = DirspaceDepth(RwLock::new(6));

/// A shared embedded database.
pub struct NsDatabase {
    name: String,
    snapshot_path: Option<PathBuf>,
    pub(crate) tables: Arc<Mutex<NsTables>>,
}

impl std::fmt::Debug for NsDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsDatabase").field("name", &self.name).finish()
    }
}

fn database_registry() -> &'static Mutex<HashMap<String, Weak<NsDatabase>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<NsDatabase>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl NsDatabase {
    /// Open (or join) the database named by the `NsDatabase` directive.
    /// Names containing a path separator are snapshot file locations; the
    /// snapshot is loaded when present and rewritten on every commit. Other
    /// names are purely in-memory databases shared by name.
    pub fn open(name: &str) -> DmResult<Arc<NsDatabase>> {
        let mut registry = database_registry().lock();
        if let Some(db) = registry.get(name).and_then(Weak::upgrade) {
            return Ok(db);
        }

        let snapshot_path = if name.contains('/') {
            Some(PathBuf::from(name))
        } else {
            None
        };
        let tables = match &snapshot_path {
            Some(path) if path.exists() => {
                let bytes = fs::read(path)?;
                bincode::deserialize(&bytes).map_err(|e| {
                    DmError::new(
                        ErrorCode::QUERY_FAILED,
                        format!("corrupt database snapshot {}: {e}", path.display()),
                    )
                })?
            }
            _ => NsTables::seeded(),
        };
        let db = Arc::new(NsDatabase {
            name: name.to_string(),
            snapshot_path,
            tables: Arc::new(Mutex::new(tables)),
        });
        registry.insert(name.to_string(), Arc::downgrade(&db));
        Ok(db)
    }

    fn save(&self, tables: &NsTables) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let bytes = match bincode::serialize(tables) {
            Ok(b) => b,
            Err(e) => {
                warn!("can not serialize database snapshot: {e}");
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        let result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
        if let Err(e) = result {
            warn!("can not persist database snapshot {}: {e}", path.display());
        }
    }
}

/// The pooled "connection" to an embedded database. It has no wire, but it
/// makes `PoolSize` govern concurrent handles exactly like a real
/// connection pool would.
#[derive(Debug)]
pub struct NsConnection {
    pub(crate) db: Arc<NsDatabase>,
}

pub(crate) struct NsConnectionFactory {
    pub(crate) db: Arc<NsDatabase>,
}

impl PoolElementFactory for NsConnectionFactory {
    type Element = NsConnection;

    fn create(&self) -> DmResult<NsConnection> {
        Ok(NsConnection {
            db: Arc::clone(&self.db),
        })
    }
}

/// The bundled [`InodeStore`].
pub struct EmbeddedInode {
    session: Lease<NsConnectionFactory>,
    txn_depth: u32,
    txn_guard: Option<ArcMutexGuard<RawMutex, NsTables>>,
    txn_snapshot: Option<NsTables>,
}

impl std::fmt::Debug for EmbeddedInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedInode")
            .field("txn_depth", &self.txn_depth)
            .finish()
    }
}

impl EmbeddedInode {
    pub(crate) fn new(session: Lease<NsConnectionFactory>) -> EmbeddedInode {
        EmbeddedInode {
            session,
            txn_depth: 0,
            txn_guard: None,
            txn_snapshot: None,
        }
    }

    fn db(&self) -> Arc<NsDatabase> {
        Arc::clone(&self.session.db)
    }

    /// Run a read against the tables, honoring an open transaction.
    fn read<R>(&mut self, f: impl FnOnce(&NsTables) -> DmResult<R>) -> DmResult<R> {
        match self.txn_guard.as_ref() {
            Some(guard) => f(guard),
            None => {
                let db = self.db();
                let tables = db.tables.lock();
                f(&tables)
            }
        }
    }

    /// Run a mutation. Outside a transaction the snapshot is persisted
    /// immediately; inside, persistence happens at the outermost commit.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut NsTables) -> DmResult<R>) -> DmResult<R> {
        match self.txn_guard.as_mut() {
            Some(guard) => f(guard),
            None => {
                let db = self.db();
                let mut tables = db.tables.lock();
                let out = f(&mut tables)?;
                db.save(&tables);
                Ok(out)
            }
        }
    }
}

impl InodeStore for EmbeddedInode {
    fn begin(&mut self) -> DmResult<()> {
        if self.txn_depth == 0 {
            let db = self.db();
            let guard = db.tables.lock_arc();
            self.txn_snapshot = Some(NsTables::clone(&guard));
            self.txn_guard = Some(guard);
        }
        self.txn_depth += 1;
        Ok(())
    }

    fn commit(&mut self) -> DmResult<()> {
        if self.txn_depth == 0 {
            return Err(DmError::new(
                ErrorCode::BAD_OPERATION,
                "commit without a matching begin",
            ));
        }
        self.txn_depth -= 1;
        if self.txn_depth == 0 {
            let guard = self.txn_guard.take().expect("transaction guard held");
            self.txn_snapshot = None;
            self.db().save(&guard);
            drop(guard);
            debug!("transaction committed");
        }
        Ok(())
    }

    fn rollback(&mut self) -> DmResult<()> {
        if self.txn_depth == 0 {
            return Err(DmError::new(
                ErrorCode::BAD_OPERATION,
                "rollback without a matching begin",
            ));
        }
        let mut guard = self.txn_guard.take().expect("transaction guard held");
        *guard = self.txn_snapshot.take().expect("transaction snapshot held");
        self.txn_depth = 0;
        drop(guard);
        debug!("transaction rolled back");
        Ok(())
    }

    fn create(&mut self, f: &ExtendedStat) -> DmResult<ExtendedStat> {
        self.mutate(|tables| tables.insert_file(f))
    }

    fn symlink(&mut self, ino: InodeId, target: &str) -> DmResult<()> {
        let target = target.to_string();
        self.mutate(move |tables| {
            let meta = tables.stat(ino)?;
            if !meta.is_link() {
                return Err(DmError::new(
                    ErrorCode::INVALID_VALUE,
                    format!("#{ino} is not a symlink inode"),
                ));
            }
            tables.links.insert(ino, target);
            Ok(())
        })
    }

    fn unlink(&mut self, ino: InodeId) -> DmResult<()> {
        self.mutate(|tables| tables.remove_file(ino))
    }

    fn move_entry(&mut self, ino: InodeId, new_parent: InodeId) -> DmResult<()> {
        self.mutate(|tables| {
            let meta = tables.stat(ino)?;
            if meta.parent == new_parent {
                return Ok(());
            }
            let dest = tables.stat(new_parent)?;
            if !dest.is_directory() {
                return Err(DmError::new(
                    ErrorCode::NOT_DIRECTORY,
                    format!("#{new_parent} is not a directory"),
                ));
            }
            if tables.names.contains_key(&(new_parent, meta.name.clone())) {
                return Err(DmError::new(
                    ErrorCode::EXISTS,
                    format!("{} already exists in the destination", meta.name),
                ));
            }
            tables.names.remove(&(meta.parent, meta.name.clone()));
            tables.names.insert((new_parent, meta.name.clone()), ino);
            let old_parent = meta.parent;
            {
                let entry = tables.stat_mut(ino)?;
                entry.parent = new_parent;
                entry.ctime = unix_now();
            }
            tables.touch_parent(old_parent, -1)?;
            tables.touch_parent(new_parent, 1)?;
            Ok(())
        })
    }

    fn rename_entry(&mut self, ino: InodeId, name: &str) -> DmResult<()> {
        let name = name.to_string();
        self.mutate(move |tables| {
            if name.is_empty() || name.contains('/') {
                return Err(DmError::new(
                    ErrorCode::INVALID_VALUE,
                    format!("'{name}' is not a valid entry name"),
                ));
            }
            let meta = tables.stat(ino)?;
            if meta.name == name {
                return Ok(());
            }
            if tables.names.contains_key(&(meta.parent, name.clone())) {
                return Err(DmError::new(
                    ErrorCode::EXISTS,
                    format!("{name} already exists"),
                ));
            }
            tables.names.remove(&(meta.parent, meta.name.clone()));
            tables.names.insert((meta.parent, name.clone()), ino);
            let entry = tables.stat_mut(ino)?;
            entry.name = name;
            entry.ctime = unix_now();
            Ok(())
        })
    }

    fn extended_stat(&mut self, ino: InodeId) -> DmResult<ExtendedStat> {
        self.read(|tables| tables.stat(ino))
    }

    fn extended_stat_by_name(&mut self, parent: InodeId, name: &str) -> DmResult<ExtendedStat> {
        self.read(|tables| tables.stat_by_name(parent, name))
    }

    fn extended_stat_by_guid(&mut self, guid: &str) -> DmResult<ExtendedStat> {
        self.read(|tables| tables.stat_by_guid(guid))
    }

    fn read_link(&mut self, ino: InodeId) -> DmResult<SymLink> {
        self.read(|tables| {
            tables
                .links
                .get(&ino)
                .map(|target| SymLink {
                    ino,
                    target: target.clone(),
                })
                .ok_or_else(|| {
                    DmError::new(ErrorCode::NO_SUCH_FILE, format!("no symlink for #{ino}"))
                })
        })
    }

    fn add_replica(&mut self, replica: &Replica) -> DmResult<Replica> {
        let replica = replica.clone();
        self.mutate(move |tables| {
            let meta = tables.stat(replica.fileid)?;
            if !meta.is_regular() {
                return Err(DmError::new(
                    ErrorCode::INVALID_VALUE,
                    format!("#{} is not a regular file", replica.fileid),
                ));
            }
            if tables.rfns.contains_key(&replica.rfn) {
                return Err(DmError::new(
                    ErrorCode::EXISTS,
                    format!("replica {} already registered", replica.rfn),
                ));
            }
            let mut row = replica;
            row.replica_id = tables.next_replica_id;
            tables.next_replica_id += 1;
            let now = unix_now();
            row.ctime = now;
            row.atime = now;
            if row.ptime == 0 {
                row.ptime = now;
            }
            tables.rfns.insert(row.rfn.clone(), row.replica_id);
            tables.replicas.insert(row.replica_id, row.clone());
            Ok(row)
        })
    }

    fn delete_replica(&mut self, replica_id: i64) -> DmResult<()> {
        self.mutate(|tables| {
            let row = tables.replicas.remove(&replica_id).ok_or_else(|| {
                DmError::new(
                    ErrorCode::NO_SUCH_REPLICA,
                    format!("replica #{replica_id} not found"),
                )
            })?;
            tables.rfns.remove(&row.rfn);
            Ok(())
        })
    }

    fn get_replica(&mut self, replica_id: i64) -> DmResult<Replica> {
        self.read(|tables| {
            tables.replicas.get(&replica_id).cloned().ok_or_else(|| {
                DmError::new(
                    ErrorCode::NO_SUCH_REPLICA,
                    format!("replica #{replica_id} not found"),
                )
            })
        })
    }

    fn get_replica_by_rfn(&mut self, rfn: &str) -> DmResult<Replica> {
        self.read(|tables| {
            tables
                .rfns
                .get(rfn)
                .and_then(|rid| tables.replicas.get(rid))
                .cloned()
                .ok_or_else(|| {
                    DmError::new(ErrorCode::NO_SUCH_REPLICA, format!("replica {rfn} not found"))
                })
        })
    }

    fn update_replica(&mut self, replica: &Replica) -> DmResult<()> {
        let replica = replica.clone();
        self.mutate(move |tables| {
            let existing = tables.replicas.get(&replica.replica_id).ok_or_else(|| {
                DmError::new(
                    ErrorCode::NO_SUCH_REPLICA,
                    format!("replica #{} not found", replica.replica_id),
                )
            })?;
            if existing.rfn != replica.rfn {
                tables.rfns.remove(&existing.rfn);
                if tables.rfns.contains_key(&replica.rfn) {
                    return Err(DmError::new(
                        ErrorCode::EXISTS,
                        format!("replica {} already registered", replica.rfn),
                    ));
                }
                tables.rfns.insert(replica.rfn.clone(), replica.replica_id);
            }
            tables.replicas.insert(replica.replica_id, replica);
            Ok(())
        })
    }

    fn get_replicas(&mut self, ino: InodeId) -> DmResult<Vec<Replica>> {
        self.read(|tables| {
            Ok(tables
                .replicas
                .values()
                .filter(|r| r.fileid == ino)
                .cloned()
                .collect())
        })
    }

    fn utime(&mut self, ino: InodeId, times: Option<(i64, i64)>) -> DmResult<()> {
        self.mutate(move |tables| {
            let (atime, mtime) = times.unwrap_or_else(|| (unix_now(), unix_now()));
            let meta = tables.stat_mut(ino)?;
            meta.atime = atime;
            meta.mtime = mtime;
            meta.ctime = unix_now();
            Ok(())
        })
    }

    fn set_mode(
        &mut self,
        ino: InodeId,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: u32,
        acl: Option<&Acl>,
    ) -> DmResult<()> {
        let acl = acl.cloned();
        self.mutate(move |tables| {
            let meta = tables.stat_mut(ino)?;
            meta.mode = (mode & !libc::S_IFMT) | (meta.mode & libc::S_IFMT);
            if let Some(uid) = uid {
                meta.uid = uid;
            }
            if let Some(gid) = gid {
                meta.gid = gid;
            }
            if let Some(acl) = acl {
                meta.acl = acl;
            }
            meta.ctime = unix_now();
            Ok(())
        })
    }

    fn set_size(&mut self, ino: InodeId, size: u64) -> DmResult<()> {
        self.mutate(move |tables| {
            let meta = tables.stat_mut(ino)?;
            let delta = size as i64 - meta.size as i64;
            let parent = meta.parent;
            meta.size = size;
            meta.ctime = unix_now();
            tables.account_dir_usage(parent, delta);
            Ok(())
        })
    }

    fn set_checksum(&mut self, ino: InodeId, csumtype: &str, csumvalue: &str) -> DmResult<()> {
        let (t, v) = (csumtype.to_string(), csumvalue.to_string());
        self.mutate(move |tables| {
            let meta = tables.stat_mut(ino)?;
            meta.csumtype = t;
            meta.csumvalue = v;
            meta.ctime = unix_now();
            Ok(())
        })
    }

    fn set_guid(&mut self, ino: InodeId, guid: &str) -> DmResult<()> {
        let guid = guid.to_string();
        self.mutate(move |tables| {
            if let Some(holder) = tables.guids.get(&guid) {
                if *holder != ino {
                    return Err(DmError::new(
                        ErrorCode::EXISTS,
                        format!("guid {guid} already in use"),
                    ));
                }
                return Ok(());
            }
            let old = {
                let meta = tables.stat_mut(ino)?;
                let old = meta.guid.take();
                meta.guid = Some(guid.clone());
                meta.ctime = unix_now();
                old
            };
            if let Some(old) = old {
                tables.guids.remove(&old);
            }
            tables.guids.insert(guid, ino);
            Ok(())
        })
    }

    fn get_comment(&mut self, ino: InodeId) -> DmResult<String> {
        self.read(|tables| {
            tables.stat(ino)?;
            tables
                .comments
                .get(&ino)
                .cloned()
                .ok_or_else(|| {
                    DmError::new(ErrorCode::NO_COMMENT, format!("no comment for #{ino}"))
                })
        })
    }

    fn set_comment(&mut self, ino: InodeId, comment: &str) -> DmResult<()> {
        let comment = comment.to_string();
        self.mutate(move |tables| {
            tables.stat(ino)?;
            tables.comments.insert(ino, comment);
            Ok(())
        })
    }

    fn delete_comment(&mut self, ino: InodeId) -> DmResult<()> {
        self.mutate(|tables| {
            tables.comments.remove(&ino);
            Ok(())
        })
    }

    fn update_xattrs(&mut self, ino: InodeId, attrs: &Extensible) -> DmResult<()> {
        let attrs = attrs.clone();
        self.mutate(move |tables| {
            let meta = tables.stat_mut(ino)?;
            meta.xattrs = attrs;
            meta.ctime = unix_now();
            Ok(())
        })
    }

    fn open_dir(&mut self, ino: InodeId) -> DmResult<Box<dyn DirCursor>> {
        self.read(|tables| {
            let meta = tables.stat(ino)?;
            if !meta.is_directory() {
                return Err(DmError::new(
                    ErrorCode::NOT_DIRECTORY,
                    format!("{} is not a directory", meta.name),
                ));
            }
            let mut entries: Vec<ExtendedStat> = tables
                .files
                .values()
                .filter(|f| f.parent == ino && f.ino != ROOT_INODE)
                .cloned()
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Box::new(EmbeddedCursor {
                entries: entries.into_iter(),
            }) as Box<dyn DirCursor>)
        })
    }
}

impl Drop for EmbeddedInode {
    fn drop(&mut self) {
        // best-effort rollback when a transaction never saw its commit
        if self.txn_depth > 0 {
            warn!("store handle dropped with an open transaction, rolling back");
            if let (Some(mut guard), Some(snapshot)) =
                (self.txn_guard.take(), self.txn_snapshot.take())
            {
                *guard = snapshot;
            }
        }
    }
}

struct EmbeddedCursor {
    entries: std::vec::IntoIter<ExtendedStat>,
}

impl DirCursor for EmbeddedCursor {
    fn next_entry(&mut self) -> DmResult<Option<ExtendedStat>> {
        Ok(self.entries.next())
    }
}

/// Configuration of the `builtin_ns` plug-in, shared between its inode and
/// authn factories.
pub(crate) struct NsBackendConfig {
    pub(crate) host: String,
    pub(crate) ns_database: String,
    pub(crate) db_username: String,
    pub(crate) db_password: String,
    pub(crate) db_port: u16,
    pub(crate) pool_size: usize,
    pub(crate) map_file: PathBuf,
    pub(crate) admin_username: String,
    pub(crate) host_dn_is_root: bool,
}

impl Default for NsBackendConfig {
    fn default() -> NsBackendConfig {
        NsBackendConfig {
            host: "localhost".to_string(),
            ns_database: "cns_db".to_string(),
            db_username: String::new(),
            db_password: String::new(),
            db_port: 0,
            pool_size: 32,
            map_file: PathBuf::from("/etc/lcgdm-mapfile"),
            admin_username: "root".to_string(),
            host_dn_is_root: false,
        }
    }
}

pub(crate) struct NsBackendFactory {
    pub(crate) config: RwLock<NsBackendConfig>,
    pool: Mutex<Option<Arc<PoolContainer<NsConnectionFactory>>>>,
}

impl NsBackendFactory {
    fn new() -> NsBackendFactory {
        NsBackendFactory {
            config: RwLock::new(NsBackendConfig::default()),
            pool: Mutex::new(None),
        }
    }

    /// The shared connection pool, built on first use from the settled
    /// configuration.
    pub(crate) fn connection_pool(&self) -> DmResult<Arc<PoolContainer<NsConnectionFactory>>> {
        let mut slot = self.pool.lock();
        if let Some(pool) = &*slot {
            return Ok(Arc::clone(pool));
        }
        let config = self.config.read();
        let db = NsDatabase::open(&config.ns_database)?;
        let pool = Arc::new(PoolContainer::new(
            NsConnectionFactory { db },
            config.pool_size,
        ));
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    pub(crate) fn session(&self) -> DmResult<Lease<NsConnectionFactory>> {
        self.connection_pool()?.acquire(true)
    }
}

impl Configurable for NsBackendFactory {
    fn configure(&self, key: &str, value: &str) -> DmResult<()> {
        let mut config = self.config.write();
        match key {
            "Host" => config.host = value.to_string(),
            "NsDatabase" => config.ns_database = value.to_string(),
            "DbUsername" => config.db_username = value.to_string(),
            "DbPassword" => config.db_password = value.to_string(),
            "DbPort" => {
                config.db_port = value.parse().map_err(|_| {
                    DmError::new(ErrorCode::INVALID_VALUE, format!("bad DbPort '{value}'"))
                })?
            }
            "PoolSize" => {
                config.pool_size = value.parse().map_err(|_| {
                    DmError::new(ErrorCode::INVALID_VALUE, format!("bad PoolSize '{value}'"))
                })?;
                if let Some(pool) = &*self.pool.lock() {
                    pool.resize(config.pool_size);
                }
            }
            "MapFile" => config.map_file = PathBuf::from(value),
            "AdminUsername" => config.admin_username = value.to_string(),
            "HostDnIsRoot" => {
                config.host_dn_is_root =
                    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
            }
            "DirspaceReportDepth" => {
                let depth: usize = value.parse().map_err(|_| {
                    DmError::new(
                        ErrorCode::INVALID_VALUE,
                        format!("bad DirspaceReportDepth '{value}'"),
                    )
                })?;
                DIRSPACE_DEPTH.set(depth);
            }
            _ => return Err(DmError::new(ErrorCode::UNKNOWN_KEY, key.to_string())),
        }
        Ok(())
    }
}

impl InodeFactory for NsBackendFactory {
    fn create_inode(
        &self,
        _manager: &Arc<PluginManager>,
        lower: Option<Box<dyn InodeStore>>,
    ) -> DmResult<Box<dyn InodeStore>> {
        if lower.is_some() {
            warn!("builtin_ns is a base inode store, discarding the decorated product");
        }
        Ok(Box::new(EmbeddedInode::new(self.session()?)))
    }
}

impl AuthnFactory for NsBackendFactory {
    fn create_authn(
        &self,
        _manager: &Arc<PluginManager>,
        lower: Option<Box<dyn crate::authn::Authn>>,
    ) -> DmResult<Box<dyn crate::authn::Authn>> {
        if lower.is_some() {
            warn!("builtin_ns is a base authn, discarding the decorated product");
        }
        let (map_file, admin_username, host_dn_is_root) = {
            let config = self.config.read();
            (
                config.map_file.clone(),
                config.admin_username.clone(),
                config.host_dn_is_root,
            )
        };
        Ok(Box::new(super::authn::BuiltinAuthn::new(
            self.session()?,
            map_file,
            admin_username,
            host_dn_is_root,
        )))
    }
}

pub(crate) fn register(manager: &mut PluginManager) -> DmResult<()> {
    let factory = Arc::new(NsBackendFactory::new());
    manager.register_configurable(Arc::clone(&factory) as Arc<dyn Configurable>);
    manager.register_inode_factory(Arc::clone(&factory) as Arc<dyn InodeFactory>);
    manager.register_authn_factory(factory);
    Ok(())
}

/// Id card of the `builtin_ns` plug-in.
pub(crate) const PLUGIN_BUILTIN_NS: PluginIdCard = PluginIdCard {
    api_version: crate::plugin::API_VERSION,
    register,
};
