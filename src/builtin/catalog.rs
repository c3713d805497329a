//! Bundled namespace engine: path resolution and POSIX + ACL semantics over
//! an inode store.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::acl::{Acl, AclEntry};
use crate::catalog::Catalog;
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::inode::{DirCursor, ExtendedStat, FileStatus, InodeId, InodeStore, Replica};
use crate::plugin::{CatalogFactory, Configurable, PluginIdCard, PluginManager};
use crate::security::{
    check_permissions, require_permissions, SecurityContext, PERM_EXEC, PERM_READ, PERM_WRITE,
};
use crate::url::Url;

use super::store::unix_now;

const DEFAULT_SYMLINK_LIMIT: u32 = 3;
const DEFAULT_UMASK: u32 = 0o022;

/// The bundled [`Catalog`] implementation.
pub struct BuiltinCatalog {
    store: Box<dyn InodeStore>,
    context: Option<Arc<SecurityContext>>,
    cwd: Option<(String, InodeId)>,
    umask: u32,
    symlink_limit: u32,
}

impl std::fmt::Debug for BuiltinCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinCatalog")
            .field("cwd", &self.cwd)
            .field("umask", &format_args!("{:o}", self.umask))
            .finish()
    }
}

/// The parent node of "/": a synthetic world-traversable directory.
fn above_root() -> ExtendedStat {
    ExtendedStat {
        ino: 0,
        parent: 0,
        name: String::new(),
        mode: libc::S_IFDIR | 0o555,
        ..Default::default()
    }
}

impl BuiltinCatalog {
    /// Build over a store with the given symlink traversal limit.
    pub fn new(store: Box<dyn InodeStore>, symlink_limit: u32) -> BuiltinCatalog {
        BuiltinCatalog {
            store,
            context: None,
            cwd: None,
            umask: DEFAULT_UMASK,
            symlink_limit,
        }
    }

    fn context(&self) -> DmResult<Arc<SecurityContext>> {
        self.context.clone().ok_or_else(|| {
            DmError::new(ErrorCode::NO_SECURITY_CONTEXT, "no security context set")
        })
    }

    fn with_txn<T>(
        &mut self,
        f: impl FnOnce(&mut BuiltinCatalog) -> DmResult<T>,
    ) -> DmResult<T> {
        self.store.begin()?;
        match f(self) {
            Ok(v) => {
                self.store.commit()?;
                Ok(v)
            }
            Err(e) => {
                // a nested rollback may already have unwound the counter
                if let Err(rb) = self.store.rollback() {
                    if rb.code() != ErrorCode::BAD_OPERATION {
                        error!("rollback after '{e}' failed: {rb}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Resolve a path to its metadata, enforcing traversal permission and
    /// bounding symlink expansion.
    fn resolve(&mut self, path: &str, follow_sym: bool) -> DmResult<ExtendedStat> {
        let context = self.context()?;
        let mut components: VecDeque<String> = Url::split_path(path).into();

        let mut meta;
        if path.starts_with('/') || self.cwd.is_none() {
            components.push_front("/".to_string());
            meta = above_root();
        } else {
            let (_, cwd_ino) = self.cwd.as_ref().expect("cwd checked above");
            meta = self.store.extended_stat(*cwd_ino)?;
        }

        let mut symlink_level = 0u32;
        while let Some(component) = components.pop_front() {
            if !meta.is_directory() {
                return Err(DmError::new(
                    ErrorCode::NOT_DIRECTORY,
                    format!("{} is not a directory", meta.name),
                ));
            }
            if !check_permissions(&context, &meta.acl, &meta, PERM_EXEC) {
                return Err(DmError::new(
                    ErrorCode::FORBIDDEN,
                    format!("not enough permissions to traverse {}", meta.name),
                ));
            }

            if component == "." {
                continue;
            }
            if component == ".." {
                // never above the root
                if meta.parent != 0 {
                    meta = self.store.extended_stat(meta.parent)?;
                }
                continue;
            }

            let next = self.store.extended_stat_by_name(meta.ino, &component)?;

            if next.is_link() && (follow_sym || !components.is_empty()) {
                symlink_level += 1;
                if symlink_level > self.symlink_limit {
                    return Err(DmError::new(
                        ErrorCode::TOO_MANY_SYMLINKS,
                        format!("symbolic link limit exceeded: > {}", self.symlink_limit),
                    ));
                }
                let link = self.store.read_link(next.ino)?;
                for piece in Url::split_path(&link.target).into_iter().rev() {
                    components.push_front(piece);
                }
                if link.target.starts_with('/') {
                    components.push_front("/".to_string());
                    meta = above_root();
                }
                // relative targets resolve against the current directory
                continue;
            }
            meta = next;
        }
        Ok(meta)
    }

    /// Split off the last component and resolve the parent directory.
    fn get_parent(&mut self, path: &str) -> DmResult<(ExtendedStat, String)> {
        let components = Url::split_path(path);
        let name = match components.last() {
            Some(n) => n.clone(),
            None => {
                return Err(DmError::new(
                    ErrorCode::INVALID_VALUE,
                    "the root itself can not be the target",
                ))
            }
        };
        let parents = &components[..components.len() - 1];
        let parent_path = if path.starts_with('/') {
            Url::join_path(parents)
        } else {
            parents.join("/")
        };

        let parent = if parent_path.is_empty() {
            match &self.cwd {
                Some((_, ino)) => {
                    let ino = *ino;
                    self.store.extended_stat(ino)?
                }
                None => self.resolve("/", true)?,
            }
        } else {
            self.resolve(&parent_path, true)?
        };
        if !parent.is_directory() {
            return Err(DmError::new(
                ErrorCode::NOT_DIRECTORY,
                format!("{parent_path} is not a directory"),
            ));
        }
        Ok((parent, name))
    }

    /// Create a fresh inode under `parent`, applying setgid propagation,
    /// default-ACL inheritance and the stack umask.
    fn new_file(
        &mut self,
        parent: &ExtendedStat,
        name: &str,
        raw_mode: u32,
        nlink: u32,
    ) -> DmResult<ExtendedStat> {
        let context = self.context()?;
        require_permissions(&context, parent, PERM_WRITE, "write to the parent")?;

        let mut mode = raw_mode;
        let egid;
        if parent.mode & libc::S_ISGID != 0 {
            egid = parent.gid;
            mode |= libc::S_ISGID;
        } else {
            egid = context.primary_gid();
        }

        let has_defaults = parent.acl.entries().iter().any(AclEntry::is_default);
        let (acl, fmode) = if has_defaults {
            Acl::inherit(&parent.acl, context.user.uid, egid, mode)
        } else {
            (Acl::new(), mode & !(self.umask & 0o777))
        };

        let fresh = ExtendedStat {
            parent: parent.ino,
            name: name.to_string(),
            mode: fmode,
            nlink,
            uid: context.user.uid,
            gid: egid,
            status: FileStatus::Online,
            acl,
            ..Default::default()
        };
        self.store.create(&fresh)
    }

    /// Walk from an entry up to the root, requiring traversal permission on
    /// every ancestor. Guards the stat-by-inode entry points against
    /// bypassing path checks.
    fn traverse_backwards(&mut self, meta: &ExtendedStat) -> DmResult<()> {
        let context = self.context()?;
        let mut current = meta.clone();
        while current.parent != 0 {
            current = self.store.extended_stat(current.parent)?;
            if !check_permissions(&context, &current.acl, &current, PERM_EXEC) {
                return Err(DmError::new(
                    ErrorCode::FORBIDDEN,
                    format!("can not access #{}", current.ino),
                ));
            }
        }
        Ok(())
    }

    /// Sticky-directory deletion rule: with the sticky bit on the parent,
    /// only the entry owner, the parent owner, root, or a caller with write
    /// permission on the entry itself may remove or rename it.
    fn check_removal(
        &mut self,
        parent: &ExtendedStat,
        entry: &ExtendedStat,
        what: &str,
    ) -> DmResult<()> {
        let context = self.context()?;
        if parent.mode & libc::S_ISVTX != 0 {
            if context.user.uid != entry.uid
                && context.user.uid != parent.uid
                && !check_permissions(&context, &entry.acl, entry, PERM_WRITE)
            {
                return Err(DmError::new(
                    ErrorCode::FORBIDDEN,
                    format!("not enough permissions to {what} (sticky bit set)"),
                ));
            }
            Ok(())
        } else {
            require_permissions(&context, parent, PERM_WRITE, what)
        }
    }

    fn replica_file(&mut self, replica: &Replica) -> DmResult<ExtendedStat> {
        let meta = self.store.extended_stat(replica.fileid)?;
        self.traverse_backwards(&meta)?;
        Ok(meta)
    }
}

impl Catalog for BuiltinCatalog {
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>) {
        self.context = context;
    }

    fn change_dir(&mut self, path: &str) -> DmResult<()> {
        let meta = self.resolve(path, true)?;
        if !meta.is_directory() {
            return Err(DmError::new(
                ErrorCode::NOT_DIRECTORY,
                format!("{path} is not a directory"),
            ));
        }
        self.cwd = Some((path.to_string(), meta.ino));
        Ok(())
    }

    fn get_working_dir(&self) -> Option<String> {
        self.cwd.as_ref().map(|(p, _)| p.clone())
    }

    fn extended_stat(&mut self, path: &str, follow_sym: bool) -> DmResult<ExtendedStat> {
        self.resolve(path, follow_sym)
    }

    fn extended_stat_by_rfn(&mut self, rfn: &str) -> DmResult<ExtendedStat> {
        let replica = self.store.get_replica_by_rfn(rfn)?;
        let meta = self.store.extended_stat(replica.fileid)?;
        self.traverse_backwards(&meta)?;
        Ok(meta)
    }

    fn access(&mut self, path: &str, mode: u32) -> DmResult<bool> {
        let context = self.context()?;
        let meta = match self.resolve(path, true) {
            Ok(meta) => meta,
            Err(e) if e.code() == ErrorCode::FORBIDDEN => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut wanted = 0;
        if mode & libc::R_OK as u32 != 0 {
            wanted |= PERM_READ;
        }
        if mode & libc::W_OK as u32 != 0 {
            wanted |= PERM_WRITE;
        }
        if mode & libc::X_OK as u32 != 0 {
            wanted |= PERM_EXEC;
        }
        Ok(wanted == 0 || check_permissions(&context, &meta.acl, &meta, wanted))
    }

    fn add_replica(&mut self, replica: &Replica) -> DmResult<Replica> {
        let context = self.context()?;
        let meta = self.replica_file(replica)?;
        require_permissions(&context, &meta, PERM_WRITE, "add a replica")?;
        self.store.add_replica(replica)
    }

    fn delete_replica(&mut self, replica: &Replica) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.replica_file(replica)?;
        require_permissions(&context, &meta, PERM_WRITE, "remove the replica")?;
        let rid = if replica.replica_id != 0 {
            replica.replica_id
        } else {
            self.store.get_replica_by_rfn(&replica.rfn)?.replica_id
        };
        self.store.delete_replica(rid)
    }

    fn get_replicas(&mut self, path: &str) -> DmResult<Vec<Replica>> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_READ, format!("read {path}").as_str())?;
        let replicas = self.store.get_replicas(meta.ino)?;
        if replicas.is_empty() {
            return Err(DmError::new(
                ErrorCode::NO_REPLICAS,
                format!("no replicas available for {path}"),
            ));
        }
        Ok(replicas)
    }

    fn get_replica_by_rfn(&mut self, rfn: &str) -> DmResult<Replica> {
        let context = self.context()?;
        let replica = self.store.get_replica_by_rfn(rfn)?;
        let meta = self.store.extended_stat(replica.fileid)?;
        self.traverse_backwards(&meta)?;
        require_permissions(&context, &meta, PERM_READ, "read the replica")?;
        Ok(replica)
    }

    fn update_replica(&mut self, replica: &Replica) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.replica_file(replica)?;
        require_permissions(&context, &meta, PERM_WRITE, "modify the replica")?;
        self.store.update_replica(replica)
    }

    fn symlink(&mut self, old_path: &str, new_path: &str) -> DmResult<()> {
        let (parent, name) = self.get_parent(new_path)?;
        let old_path = old_path.to_string();
        self.with_txn(move |cat| {
            let link = cat.new_file(&parent, &name, libc::S_IFLNK | 0o777, 1)?;
            cat.store.symlink(link.ino, &old_path)
        })
    }

    fn read_link(&mut self, path: &str) -> DmResult<String> {
        let meta = self.resolve(path, false)?;
        if !meta.is_link() {
            return Err(DmError::new(
                ErrorCode::INVALID_VALUE,
                format!("{path} is not a symbolic link"),
            ));
        }
        Ok(self.store.read_link(meta.ino)?.target)
    }

    fn unlink(&mut self, path: &str) -> DmResult<()> {
        let (parent, name) = self.get_parent(path)?;
        let file = self.store.extended_stat_by_name(parent.ino, &name)?;

        if file.is_directory() {
            return Err(DmError::new(
                ErrorCode::IS_DIRECTORY,
                format!("{path} is a directory, can not unlink"),
            ));
        }
        self.check_removal(&parent, &file, &format!("unlink {path}"))?;

        if !file.is_link() && !self.store.get_replicas(file.ino)?.is_empty() {
            return Err(DmError::new(
                ErrorCode::EXISTS,
                format!("{path} has replicas, can not remove"),
            ));
        }
        self.with_txn(|cat| cat.store.unlink(file.ino))
    }

    fn create(&mut self, path: &str, mode: u32) -> DmResult<()> {
        let context = self.context()?;
        let (parent, name) = self.get_parent(path)?;
        require_permissions(&context, &parent, PERM_WRITE, "write to the parent")?;

        match self.store.extended_stat_by_name(parent.ino, &name) {
            Ok(existing) => {
                if !self.store.get_replicas(existing.ino)?.is_empty() {
                    return Err(DmError::new(
                        ErrorCode::EXISTS,
                        format!("{path} exists and has replicas, can not truncate"),
                    ));
                }
                require_permissions(&context, &existing, PERM_WRITE, "truncate the file")?;
                self.with_txn(|cat| cat.store.set_size(existing.ino, 0))
            }
            Err(e) if e.code() == ErrorCode::NO_SUCH_FILE => {
                let raw = libc::S_IFREG | (mode & !libc::S_IFMT);
                self.with_txn(move |cat| cat.new_file(&parent, &name, raw, 1).map(|_| ()))
            }
            Err(e) => Err(e),
        }
    }

    fn umask(&mut self, mask: u32) -> u32 {
        let previous = self.umask;
        self.umask = mask & 0o777;
        previous
    }

    fn set_mode(&mut self, path: &str, mode: u32) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;

        if context.user.uid != meta.uid && context.user.uid != 0 {
            return Err(DmError::new(
                ErrorCode::FORBIDDEN,
                format!("only the owner can change the mode of {path}"),
            ));
        }

        let mut mode = mode & !libc::S_IFMT;
        if !meta.is_directory() && context.user.uid != 0 {
            mode &= !libc::S_ISVTX;
        }
        if context.user.uid != 0 && !context.has_group(meta.gid) {
            mode &= !libc::S_ISGID;
        }

        let acl = if meta.acl.is_empty() {
            None
        } else {
            let mut acl = meta.acl.clone();
            acl.update_from_mode(mode);
            Some(acl)
        };
        self.store.set_mode(meta.ino, None, None, mode, acl.as_ref())
    }

    fn set_owner(
        &mut self,
        path: &str,
        new_uid: Option<u32>,
        new_gid: Option<u32>,
        follow_sym: bool,
    ) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, follow_sym)?;

        let uid = new_uid.unwrap_or(meta.uid);
        let gid = new_gid.unwrap_or(meta.gid);
        if uid == meta.uid && gid == meta.gid {
            return Ok(());
        }

        if context.user.uid != 0 {
            if meta.uid != uid {
                return Err(DmError::new(
                    ErrorCode::BAD_OPERATION,
                    "only root can change the owner",
                ));
            }
            if meta.gid != gid {
                if meta.uid != context.user.uid {
                    return Err(DmError::new(
                        ErrorCode::BAD_OPERATION,
                        "only root or the owner can change the group",
                    ));
                }
                if !context.has_group(gid) {
                    return Err(DmError::new(
                        ErrorCode::BAD_OPERATION,
                        format!("the user does not belong to group {gid}"),
                    ));
                }
            }
        }
        self.store
            .set_mode(meta.ino, Some(uid), Some(gid), meta.mode & 0o7777, None)
    }

    fn set_size(&mut self, path: &str, size: u64) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_WRITE, "change the size")?;
        self.store.set_size(meta.ino, size)
    }

    fn set_checksum(&mut self, path: &str, csumtype: &str, csumvalue: &str) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_WRITE, "change the checksum")?;
        self.store.set_checksum(meta.ino, csumtype, csumvalue)
    }

    fn set_acl(&mut self, path: &str, acl: &Acl) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        if context.user.uid != meta.uid && context.user.uid != 0 {
            return Err(DmError::new(
                ErrorCode::FORBIDDEN,
                format!("only the owner can change the acl of {path}"),
            ));
        }

        acl.validate()?;
        let has_defaults = acl.entries().iter().any(AclEntry::is_default);
        if has_defaults && !meta.is_directory() {
            return Err(DmError::new(
                ErrorCode::INVALID_ACL,
                "default entries are only allowed on directories",
            ));
        }

        // canonicalize: base entry ids follow the entry owner, and the mode
        // bits follow the base entries
        let mut entries = acl.entries().to_vec();
        let (mut user_perm, mut group_perm, mut other_perm) = (0u32, 0u32, 0u32);
        for e in &mut entries {
            match e.entry_type {
                AclEntry::USER_OBJ => {
                    e.id = meta.uid;
                    user_perm = e.perm.into();
                }
                AclEntry::GROUP_OBJ => {
                    e.id = meta.gid;
                    group_perm = e.perm.into();
                }
                AclEntry::OTHER => other_perm = e.perm.into(),
                _ => {}
            }
        }
        let canonical = Acl::from_entries(entries);
        let mode =
            (meta.mode & 0o7000) | (user_perm << 6) | (group_perm << 3) | other_perm;
        self.store
            .set_mode(meta.ino, None, None, mode, Some(&canonical))
    }

    fn utime(&mut self, path: &str, times: Option<(i64, i64)>) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        if context.user.uid != meta.uid
            && !check_permissions(&context, &meta.acl, &meta, PERM_WRITE)
        {
            return Err(DmError::new(
                ErrorCode::FORBIDDEN,
                format!("not enough permissions to modify the time of {path}"),
            ));
        }
        self.store.utime(meta.ino, times)
    }

    fn get_comment(&mut self, path: &str) -> DmResult<String> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_READ, format!("read {path}").as_str())?;
        self.store.get_comment(meta.ino)
    }

    fn set_comment(&mut self, path: &str, comment: &str) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_WRITE, format!("write {path}").as_str())?;
        self.store.set_comment(meta.ino, comment)
    }

    fn set_guid(&mut self, path: &str, guid: &str) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        if context.user.uid != meta.uid && context.user.uid != 0 {
            return Err(DmError::new(
                ErrorCode::FORBIDDEN,
                format!("only the owner can set the guid of {path}"),
            ));
        }
        self.store.set_guid(meta.ino, guid)
    }

    fn update_xattrs(&mut self, path: &str, attrs: &Extensible) -> DmResult<()> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_WRITE, format!("write {path}").as_str())?;
        self.store.update_xattrs(meta.ino, attrs)
    }

    fn open_dir(&mut self, path: &str) -> DmResult<Box<dyn DirCursor>> {
        let context = self.context()?;
        let meta = self.resolve(path, true)?;
        require_permissions(&context, &meta, PERM_READ, format!("read {path}").as_str())?;
        // opening touches the access time
        self.store.utime(meta.ino, Some((unix_now(), meta.mtime)))?;
        self.store.open_dir(meta.ino)
    }

    fn make_dir(&mut self, path: &str, mode: u32) -> DmResult<()> {
        let (parent, name) = self.get_parent(path)?;
        let raw = libc::S_IFDIR | (mode & !libc::S_IFMT);
        self.with_txn(move |cat| cat.new_file(&parent, &name, raw, 0).map(|_| ()))
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> DmResult<()> {
        let context = self.context()?;
        if Url::normalize_path(old_path) == "/" || Url::normalize_path(new_path) == "/" {
            return Err(DmError::new(
                ErrorCode::INVALID_VALUE,
                "neither the source nor the destination can be '/'",
            ));
        }

        let (old_parent, old_name) = self.get_parent(old_path)?;
        let (new_parent, new_name) = self.get_parent(new_path)?;
        let old = self.store.extended_stat_by_name(old_parent.ino, &old_name)?;

        if self.cwd.as_ref().is_some_and(|(_, ino)| *ino == old.ino) {
            return Err(DmError::new(
                ErrorCode::IS_CWD,
                "can not rename the current working directory",
            ));
        }

        require_permissions(&context, &old_parent, PERM_WRITE, "modify the origin")?;
        require_permissions(&context, &new_parent, PERM_WRITE, "modify the destination")?;

        if old.is_directory() {
            require_permissions(&context, &old, PERM_WRITE, format!("move {old_path}").as_str())?;
            // the destination can not hang below the source
            let mut aux = new_parent.clone();
            loop {
                if aux.ino == old.ino {
                    return Err(DmError::new(
                        ErrorCode::INVALID_VALUE,
                        "the destination is a descendant of the source",
                    ));
                }
                if aux.parent == 0 {
                    break;
                }
                aux = self.store.extended_stat(aux.parent)?;
            }
        }

        self.check_removal(&old_parent, &old, &format!("rename {old_path}"))?;

        // everything from here runs in one transaction, so a half-finished
        // replace is never visible
        self.with_txn(move |cat| {
            match cat.store.extended_stat_by_name(new_parent.ino, &new_name) {
                Ok(existing) => {
                    if existing.ino == old.ino {
                        return Ok(());
                    }
                    if (existing.mode & libc::S_IFMT) != (old.mode & libc::S_IFMT) {
                        return Err(if old.is_directory() {
                            DmError::new(
                                ErrorCode::NOT_DIRECTORY,
                                "the source is a directory and the destination is not",
                            )
                        } else {
                            DmError::new(
                                ErrorCode::IS_DIRECTORY,
                                "the source is not a directory and the destination is",
                            )
                        });
                    }
                    // fails on non-empty directories, failing the rename
                    if existing.is_directory() {
                        cat.remove_dir(new_path)?;
                    } else {
                        cat.unlink(new_path)?;
                    }
                }
                Err(e) if e.code() == ErrorCode::NO_SUCH_FILE => {}
                Err(e) => return Err(e),
            }

            if new_name != old.name {
                cat.store.rename_entry(old.ino, &new_name)?;
            }
            if new_parent.ino != old_parent.ino {
                cat.store.move_entry(old.ino, new_parent.ino)?;
            }
            Ok(())
        })
    }

    fn remove_dir(&mut self, path: &str) -> DmResult<()> {
        if Url::normalize_path(path) == "/" {
            return Err(DmError::new(ErrorCode::INVALID_VALUE, "can not remove '/'"));
        }
        let (parent, name) = self.get_parent(path)?;
        let entry = self.store.extended_stat_by_name(parent.ino, &name)?;

        if !entry.is_directory() {
            return Err(DmError::new(
                ErrorCode::NOT_DIRECTORY,
                format!("{path} is not a directory, can not remove"),
            ));
        }
        if self.cwd.as_ref().is_some_and(|(_, ino)| *ino == entry.ino) {
            return Err(DmError::new(
                ErrorCode::IS_CWD,
                "can not remove the current working directory",
            ));
        }
        if entry.nlink > 0 {
            return Err(DmError::new(
                ErrorCode::EXISTS,
                format!("{path} is not empty, can not remove"),
            ));
        }
        self.check_removal(&parent, &entry, &format!("remove {path}"))?;
        self.with_txn(|cat| cat.store.unlink(entry.ino))
    }
}

/// Factory of the `builtin_catalog` plug-in.
struct BuiltinCatalogFactory {
    symlink_limit: RwLock<u32>,
}

impl Configurable for BuiltinCatalogFactory {
    fn configure(&self, key: &str, value: &str) -> DmResult<()> {
        match key {
            "SymLinkLimit" => {
                *self.symlink_limit.write() = value.parse().map_err(|_| {
                    DmError::new(
                        ErrorCode::INVALID_VALUE,
                        format!("bad SymLinkLimit '{value}'"),
                    )
                })?;
                Ok(())
            }
            _ => Err(DmError::new(ErrorCode::UNKNOWN_KEY, key.to_string())),
        }
    }
}

impl CatalogFactory for BuiltinCatalogFactory {
    fn create_catalog(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn Catalog>>,
    ) -> DmResult<Box<dyn Catalog>> {
        if lower.is_some() {
            warn!("builtin_catalog is a base catalog, discarding the decorated product");
        }
        let store = manager.instantiate_inode()?;
        debug!("catalog over a fresh inode store");
        Ok(Box::new(BuiltinCatalog::new(
            store,
            *self.symlink_limit.read(),
        )))
    }
}

pub(crate) fn register(manager: &mut PluginManager) -> DmResult<()> {
    let factory = Arc::new(BuiltinCatalogFactory {
        symlink_limit: RwLock::new(DEFAULT_SYMLINK_LIMIT),
    });
    manager.register_configurable(Arc::clone(&factory) as Arc<dyn Configurable>);
    manager.register_catalog_factory(factory);
    Ok(())
}

/// Id card of the `builtin_catalog` plug-in.
pub(crate) const PLUGIN_BUILTIN_CATALOG: PluginIdCard = PluginIdCard {
    api_version: crate::plugin::API_VERSION,
    register,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::store::{EmbeddedInode, NsConnectionFactory, NsDatabase};
    use crate::pool_container::PoolContainer;
    use crate::security::{GroupInfo, UserInfo};

    fn catalog_for(db_name: &str) -> BuiltinCatalog {
        let db = NsDatabase::open(db_name).unwrap();
        let pool = PoolContainer::new(NsConnectionFactory { db }, 4);
        let store = EmbeddedInode::new(pool.acquire(true).unwrap());
        let mut catalog = BuiltinCatalog::new(Box::new(store), 3);
        catalog.set_security_context(Some(Arc::new(SecurityContext::root())));
        catalog
    }

    fn user_context(uid: u32, gid: u32) -> Arc<SecurityContext> {
        Arc::new(SecurityContext {
            user: UserInfo {
                uid,
                name: format!("user{uid}"),
                ..Default::default()
            },
            groups: vec![GroupInfo {
                gid,
                name: format!("group{gid}"),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[test]
    fn test_create_mode_honors_umask() {
        let mut cat = catalog_for("t_cat_umask");
        cat.umask(0o027);
        cat.make_dir("/a", 0o755).unwrap();
        cat.create("/a/f", 0o666).unwrap();
        let meta = cat.extended_stat("/a/f", true).unwrap();
        assert_eq!(meta.mode & 0o777, 0o666 & !0o027);
        assert_eq!(meta.nlink, 1);
        assert!(meta.is_regular());
        let dir = cat.extended_stat("/a", true).unwrap();
        assert_eq!(dir.mode & 0o777, 0o755 & !0o027);
    }

    #[test]
    fn test_nlink_follows_children() {
        let mut cat = catalog_for("t_cat_nlink");
        cat.make_dir("/d", 0o755).unwrap();
        assert_eq!(cat.extended_stat("/d", true).unwrap().nlink, 0);
        cat.make_dir("/d/sub", 0o755).unwrap();
        assert_eq!(cat.extended_stat("/d", true).unwrap().nlink, 1);
        cat.remove_dir("/d/sub").unwrap();
        assert_eq!(cat.extended_stat("/d", true).unwrap().nlink, 0);
    }

    #[test]
    fn test_rename_same_directory_keeps_inode() {
        let mut cat = catalog_for("t_cat_rename");
        cat.make_dir("/d", 0o755).unwrap();
        cat.create("/d/old", 0o644).unwrap();
        let before = cat.extended_stat("/d/old", true).unwrap();
        cat.rename("/d/old", "/d/new").unwrap();
        let after = cat.extended_stat("/d/new", true).unwrap();
        assert_eq!(before.ino, after.ino);
        assert!(cat.extended_stat("/d/old", true).is_err());
    }

    #[test]
    fn test_rename_into_own_subtree_fails() {
        let mut cat = catalog_for("t_cat_descend");
        cat.make_dir("/a", 0o755).unwrap();
        cat.make_dir("/a/b", 0o755).unwrap();
        let err = cat.rename("/a", "/a/b/a").unwrap_err();
        assert_eq!(err.code(), ErrorCode::INVALID_VALUE);
    }

    #[test]
    fn test_rename_over_non_empty_directory_fails_atomically() {
        let mut cat = catalog_for("t_cat_replace");
        cat.make_dir("/src", 0o755).unwrap();
        cat.make_dir("/dst", 0o755).unwrap();
        cat.create("/dst/busy", 0o644).unwrap();
        let err = cat.rename("/src", "/dst").unwrap_err();
        assert_eq!(err.code(), ErrorCode::EXISTS);
        // both trees intact
        assert!(cat.extended_stat("/src", true).is_ok());
        assert!(cat.extended_stat("/dst/busy", true).is_ok());
    }

    #[test]
    fn test_symlink_resolution() {
        let mut cat = catalog_for("t_cat_symlink");
        cat.make_dir("/real", 0o755).unwrap();
        cat.create("/real/f", 0o644).unwrap();
        cat.symlink("/real", "/alias").unwrap();

        let followed = cat.extended_stat("/alias", true).unwrap();
        let target = cat.extended_stat("/real", true).unwrap();
        assert_eq!(followed.ino, target.ino);

        let unfollowed = cat.extended_stat("/alias", false).unwrap();
        assert!(unfollowed.is_link());
        assert_eq!(cat.read_link("/alias").unwrap(), "/real");

        // intermediate links are always expanded
        let through = cat.extended_stat("/alias/f", false).unwrap();
        assert!(through.is_regular());
    }

    #[test]
    fn test_symlink_loop_bound() {
        let mut cat = catalog_for("t_cat_loop");
        cat.make_dir("/a", 0o755).unwrap();
        cat.symlink("/a", "/a/loop").unwrap();
        let err = cat
            .extended_stat("/a/loop/loop/loop/loop", true)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TOO_MANY_SYMLINKS);
    }

    #[test]
    fn test_sticky_directory_rules() {
        let mut cat = catalog_for("t_cat_sticky");
        cat.umask(0);
        cat.make_dir("/t", 0o1777).unwrap();

        cat.set_security_context(Some(user_context(101, 201)));
        cat.create("/t/f", 0o644).unwrap();

        cat.set_security_context(Some(user_context(102, 201)));
        let err = cat.unlink("/t/f").unwrap_err();
        assert_eq!(err.code(), ErrorCode::FORBIDDEN);

        cat.set_security_context(Some(user_context(101, 201)));
        cat.unlink("/t/f").unwrap();
    }

    #[test]
    fn test_setgid_propagation() {
        let mut cat = catalog_for("t_cat_setgid");
        cat.umask(0o002);
        cat.make_dir("/proj", 0o2775).unwrap();
        cat.set_owner("/proj", None, Some(555), true).unwrap();
        cat.set_security_context(Some(user_context(101, 555)));
        cat.create("/proj/data", 0o664).unwrap();
        let meta = cat.extended_stat("/proj/data", true).unwrap();
        assert_eq!(meta.gid, 555);
    }

    #[test]
    fn test_set_mode_strips_bits_for_non_root() {
        let mut cat = catalog_for("t_cat_chmod");
        cat.set_security_context(Some(user_context(101, 201)));
        cat.make_dir("/home", 0o777).unwrap();
        cat.create("/home/f", 0o644).unwrap();
        // sticky on a file and setgid outside the group are both dropped
        cat.set_mode("/home/f", 0o1666).unwrap();
        let meta = cat.extended_stat("/home/f", true).unwrap();
        assert_eq!(meta.mode & 0o7777, 0o666);

        cat.set_security_context(Some(user_context(102, 201)));
        let err = cat.set_mode("/home/f", 0o600).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FORBIDDEN);
    }

    #[test]
    fn test_chown_rules() {
        let mut cat = catalog_for("t_cat_chown");
        cat.umask(0);
        cat.make_dir("/f", 0o777).unwrap();
        cat.set_security_context(Some(user_context(101, 201)));
        cat.create("/f/mine", 0o644).unwrap();

        // non-root can not give the file away
        let err = cat.set_owner("/f/mine", Some(999), None, true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BAD_OPERATION);

        // owner can move it to a group they belong to
        cat.set_owner("/f/mine", None, Some(201), true).unwrap();
        let err = cat.set_owner("/f/mine", None, Some(999), true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BAD_OPERATION);

        cat.set_security_context(Some(Arc::new(SecurityContext::root())));
        cat.set_owner("/f/mine", Some(999), Some(999), true).unwrap();
        let meta = cat.extended_stat("/f/mine", true).unwrap();
        assert_eq!((meta.uid, meta.gid), (999, 999));
    }

    #[test]
    fn test_unlink_with_replicas_refused() {
        let mut cat = catalog_for("t_cat_unlink_rep");
        cat.create("/f", 0o644).unwrap();
        let meta = cat.extended_stat("/f", true).unwrap();
        cat.add_replica(&Replica {
            fileid: meta.ino,
            server: "h1".to_string(),
            rfn: "h1:/pool/f".to_string(),
            ..Default::default()
        })
        .unwrap();
        let err = cat.unlink("/f").unwrap_err();
        assert_eq!(err.code(), ErrorCode::EXISTS);
    }

    #[test]
    fn test_acl_inheritance_end_to_end() {
        let mut cat = catalog_for("t_cat_acl");
        cat.make_dir("/d", 0o750).unwrap();
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ, 5, 0),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER_OBJ | AclEntry::DEFAULT, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ | AclEntry::DEFAULT, 5, 0),
            AclEntry::new(AclEntry::OTHER | AclEntry::DEFAULT, 0, 0),
            AclEntry::new(AclEntry::USER | AclEntry::DEFAULT, 6, 300),
            AclEntry::new(AclEntry::MASK | AclEntry::DEFAULT, 7, 0),
        ]);
        cat.set_acl("/d", &acl).unwrap();
        cat.set_mode("/d", 0o757).unwrap();

        cat.set_security_context(Some(user_context(101, 201)));
        cat.umask(0o022);
        cat.create("/d/f", 0o666).unwrap();
        let meta = cat.extended_stat("/d/f", true).unwrap();
        assert_eq!(meta.mode & 0o777, 0o640);
        let named = meta.acl.entry(AclEntry::USER).unwrap();
        assert_eq!((named.id, named.perm), (300, 6));
    }

    #[test]
    fn test_working_directory_resolution() {
        let mut cat = catalog_for("t_cat_cwd");
        cat.make_dir("/w", 0o755).unwrap();
        cat.make_dir("/w/sub", 0o755).unwrap();
        cat.create("/w/sub/f", 0o644).unwrap();

        cat.change_dir("/w").unwrap();
        assert_eq!(cat.get_working_dir().as_deref(), Some("/w"));
        assert!(cat.extended_stat("sub/f", true).is_ok());
        assert!(cat.extended_stat("sub/../sub/f", true).is_ok());

        let err = cat.remove_dir("/w").unwrap_err();
        assert_eq!(err.code(), ErrorCode::IS_CWD);
    }

    #[test]
    fn test_comment_permissions() {
        let mut cat = catalog_for("t_cat_comment");
        cat.make_dir("/c", 0o755).unwrap();
        cat.create("/c/f", 0o644).unwrap();
        cat.set_comment("/c/f", "important data").unwrap();
        assert_eq!(cat.get_comment("/c/f").unwrap(), "important data");

        cat.set_security_context(Some(user_context(101, 201)));
        let err = cat.set_comment("/c/f", "defaced").unwrap_err();
        assert_eq!(err.code(), ErrorCode::FORBIDDEN);
    }

    #[test]
    fn test_access_masks() {
        let mut cat = catalog_for("t_cat_access");
        cat.make_dir("/pub", 0o755).unwrap();
        cat.create("/pub/f", 0o640).unwrap();

        cat.set_security_context(Some(user_context(101, 201)));
        assert!(cat.access("/pub/f", libc::F_OK as u32).unwrap());
        assert!(!cat.access("/pub/f", libc::R_OK as u32).unwrap());
        assert!(cat
            .access("/pub", (libc::R_OK | libc::X_OK) as u32)
            .unwrap());
    }
}
