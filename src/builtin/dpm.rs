//! Disk-pool daemon client.
//!
//! The pool drivers talk to the disk-pool manager daemon through the
//! [`DpmClient`] calls. [`LocalDpm`] is the bundled implementation: an
//! in-process daemon managing pools, filesystems and put requests over
//! local directories, shared process-wide by database name just like the
//! embedded namespace database.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::poolmanager::Pool;
use crate::url::Url;

use super::store::{FsRow, FsStatus, NsDatabase};

/// Daemon-side state of a put request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DpmRequestState {
    /// Accepted, not yet scheduled.
    Queued,
    /// Being scheduled.
    Running,
    /// Space is being allocated.
    Active,
    /// The destination is ready for the upload.
    Ready,
    /// The upload completed.
    Success,
    /// The request is fully closed out.
    Done,
    /// The request failed.
    Failed,
    /// The request was aborted.
    Aborted,
    /// The request timed out on the daemon.
    Expired,
}

impl DpmRequestState {
    /// Still worth polling.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            DpmRequestState::Queued | DpmRequestState::Running | DpmRequestState::Active
        )
    }

    /// Terminal and successful.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            DpmRequestState::Ready | DpmRequestState::Success | DpmRequestState::Done
        )
    }

    /// Terminal and failed.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            DpmRequestState::Failed | DpmRequestState::Aborted | DpmRequestState::Expired
        )
    }
}

/// What `put`/`getstatus_putreq` report back.
#[derive(Clone, Debug)]
pub struct DpmPutReply {
    /// The daemon's request id, posted back on completion.
    pub dpm_token: String,
    /// Transfer URL (`host:/path`) of the allocated destination.
    pub turl: String,
    /// Request state.
    pub state: DpmRequestState,
}

/// What `putdone` reports back.
#[derive(Clone, Debug)]
pub struct DpmPutDone {
    /// Physical path of the uploaded replica.
    pub pfn: String,
    /// Disk server hosting it.
    pub host: String,
    /// Pool the space came from.
    pub pool: String,
    /// Filesystem within the pool.
    pub filesystem: String,
    /// Observed size of the uploaded file.
    pub size: u64,
}

/// The calls the disk-pool daemon exposes to the drivers.
pub trait DpmClient: Send + Sync {
    /// Enumerate pools with their capacity/free properties.
    fn get_pools(&self) -> DmResult<Vec<Pool>>;

    /// The filesystems of one pool.
    fn get_pool_filesystems(&self, pool: &str) -> DmResult<Vec<FsRow>>;

    /// Open a put request for `sfn` in `pool`.
    fn put(&self, sfn: &str, pool: &str) -> DmResult<DpmPutReply>;

    /// Poll a put request.
    fn get_status_putreq(&self, dpm_token: &str) -> DmResult<DpmPutReply>;

    /// Finalize a put request after the upload.
    fn put_done(&self, dpm_token: &str, sfn: &str) -> DmResult<DpmPutDone>;

    /// Drop a put request and its partial upload. Unknown tokens are fine.
    fn rm(&self, dpm_token: &str) -> DmResult<()>;
}

struct PutRequest {
    sfn: String,
    pfn: PathBuf,
    host: String,
    pool: String,
    filesystem: String,
    state: DpmRequestState,
}

/// The bundled in-process daemon.
pub struct LocalDpm {
    db: Arc<NsDatabase>,
    requests: Mutex<HashMap<String, PutRequest>>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for LocalDpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDpm")
            .field("pending", &self.requests.lock().len())
            .finish()
    }
}

fn dpm_registry() -> &'static Mutex<HashMap<String, Weak<LocalDpm>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<LocalDpm>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LocalDpm {
    /// Connect to (or start) the daemon over the named database.
    pub fn connect(db_name: &str) -> DmResult<Arc<LocalDpm>> {
        let mut registry = dpm_registry().lock();
        if let Some(dpm) = registry.get(db_name).and_then(Weak::upgrade) {
            return Ok(dpm);
        }
        let dpm = Arc::new(LocalDpm {
            db: NsDatabase::open(db_name)?,
            requests: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        });
        registry.insert(db_name.to_string(), Arc::downgrade(&dpm));
        Ok(dpm)
    }

    // --- administrative surface, the analog of the daemon's admin tools ---

    /// Create a pool.
    pub fn add_pool(&self, name: &str, pool_type: &str) -> DmResult<()> {
        let mut tables = self.db.tables.lock();
        if tables.pools.contains_key(name) {
            return Err(DmError::new(
                ErrorCode::EXISTS,
                format!("pool {name} already exists"),
            ));
        }
        tables.pools.insert(
            name.to_string(),
            Pool {
                name: name.to_string(),
                pool_type: pool_type.to_string(),
                properties: Extensible::new(),
            },
        );
        Ok(())
    }

    /// Attach a filesystem (a local directory) to a pool.
    pub fn add_filesystem(
        &self,
        pool: &str,
        server: &str,
        fs_root: &Path,
        status: FsStatus,
        weight: u32,
    ) -> DmResult<()> {
        fs::create_dir_all(fs_root)?;
        let mut tables = self.db.tables.lock();
        if !tables.pools.contains_key(pool) {
            return Err(DmError::new(
                ErrorCode::NO_SUCH_POOL,
                format!("pool {pool} not found"),
            ));
        }
        tables.filesystems.push(FsRow {
            pool: pool.to_string(),
            server: server.to_string(),
            fs: fs_root.to_string_lossy().into_owned(),
            status,
            weight: weight.max(1),
        });
        Ok(())
    }

    /// Change the status flag of a filesystem.
    pub fn set_filesystem_status(&self, pool: &str, fs_root: &str, status: FsStatus) -> DmResult<()> {
        let mut tables = self.db.tables.lock();
        for row in tables.filesystems.iter_mut() {
            if row.pool == pool && row.fs == fs_root {
                row.status = status;
                return Ok(());
            }
        }
        Err(DmError::new(
            ErrorCode::NO_SUCH_POOL,
            format!("no filesystem {fs_root} in pool {pool}"),
        ))
    }

    fn pick_filesystem(&self, pool: &str) -> DmResult<FsRow> {
        let tables = self.db.tables.lock();
        let candidates: Vec<&FsRow> = tables
            .filesystems
            .iter()
            .filter(|row| row.pool == pool && row.status == FsStatus::Enabled)
            .collect();
        if candidates.is_empty() {
            return Err(DmError::new(
                ErrorCode::NO_SUCH_POOL,
                format!("no enabled filesystem inside pool {pool}"),
            ));
        }
        // weighted choice
        let total: u64 = candidates.iter().map(|r| u64::from(r.weight)).sum();
        let mut point = rand::thread_rng().gen_range(0..total);
        for row in &candidates {
            let w = u64::from(row.weight);
            if point < w {
                return Ok((*row).clone());
            }
            point -= w;
        }
        Ok(candidates[candidates.len() - 1].clone())
    }
}

impl DpmClient for LocalDpm {
    fn get_pools(&self) -> DmResult<Vec<Pool>> {
        let tables = self.db.tables.lock();
        let mut pools: Vec<Pool> = tables.pools.values().cloned().collect();
        for pool in &mut pools {
            let mut capacity = 0u64;
            let mut free = 0u64;
            for row in tables.filesystems.iter().filter(|r| r.pool == pool.name) {
                if let Ok(stat) = nix::sys::statvfs::statvfs(Path::new(&row.fs)) {
                    capacity += stat.blocks() * stat.fragment_size();
                    free += stat.blocks_available() * stat.fragment_size();
                }
            }
            pool.properties.set("capacity", capacity);
            pool.properties.set("free", free);
        }
        Ok(pools)
    }

    fn get_pool_filesystems(&self, pool: &str) -> DmResult<Vec<FsRow>> {
        let tables = self.db.tables.lock();
        let rows: Vec<FsRow> = tables
            .filesystems
            .iter()
            .filter(|r| r.pool == pool)
            .cloned()
            .collect();
        if rows.is_empty() {
            return Err(DmError::new(
                ErrorCode::NO_SUCH_POOL,
                format!("there are no filesystems inside pool {pool}"),
            ));
        }
        Ok(rows)
    }

    fn put(&self, sfn: &str, pool: &str) -> DmResult<DpmPutReply> {
        let row = self.pick_filesystem(pool)?;
        let basename = Url::split_path(sfn)
            .last()
            .cloned()
            .unwrap_or_else(|| "upload".to_string());
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let suffix: u32 = rand::thread_rng().r#gen();
        let dpm_token = format!("req-{sequence:08x}-{suffix:08x}");
        let pfn = Path::new(&row.fs).join(format!("{basename}.{sequence}.{suffix:x}"));

        let turl = format!("{}:{}", row.server, pfn.display());
        debug!("put request {dpm_token} for {sfn} lands on {turl}");
        self.requests.lock().insert(
            dpm_token.clone(),
            PutRequest {
                sfn: sfn.to_string(),
                pfn,
                host: row.server.clone(),
                pool: pool.to_string(),
                filesystem: row.fs.clone(),
                state: DpmRequestState::Queued,
            },
        );
        Ok(DpmPutReply {
            dpm_token,
            turl,
            state: DpmRequestState::Queued,
        })
    }

    fn get_status_putreq(&self, dpm_token: &str) -> DmResult<DpmPutReply> {
        let mut requests = self.requests.lock();
        let request = requests.get_mut(dpm_token).ok_or_else(|| {
            DmError::new(
                ErrorCode::QUERY_FAILED,
                format!("unknown put request {dpm_token}"),
            )
        })?;
        // scheduling is immediate here: one poll moves the request on
        if request.state.is_pending() {
            request.state = DpmRequestState::Ready;
        }
        Ok(DpmPutReply {
            dpm_token: dpm_token.to_string(),
            turl: format!("{}:{}", request.host, request.pfn.display()),
            state: request.state,
        })
    }

    fn put_done(&self, dpm_token: &str, sfn: &str) -> DmResult<DpmPutDone> {
        let mut requests = self.requests.lock();
        let request = requests.get(dpm_token).ok_or_else(|| {
            DmError::new(
                ErrorCode::QUERY_FAILED,
                format!("unknown put request {dpm_token}"),
            )
        })?;
        if request.sfn != sfn {
            return Err(DmError::new(
                ErrorCode::INVALID_VALUE,
                format!("put request {dpm_token} is not for {sfn}"),
            ));
        }
        let size = fs::metadata(&request.pfn)
            .map_err(|e| {
                DmError::new(
                    ErrorCode::QUERY_FAILED,
                    format!("no uploaded data at {}: {e}", request.pfn.display()),
                )
            })?
            .len();
        let done = DpmPutDone {
            pfn: request.pfn.to_string_lossy().into_owned(),
            host: request.host.clone(),
            pool: request.pool.clone(),
            filesystem: request.filesystem.clone(),
            size,
        };
        requests.remove(dpm_token);
        Ok(done)
    }

    fn rm(&self, dpm_token: &str) -> DmResult<()> {
        if let Some(request) = self.requests.lock().remove(dpm_token) {
            if let Err(e) = fs::remove_file(&request.pfn) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("can not drop partial upload {}: {e}", request.pfn.display());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon(name: &str) -> (Arc<LocalDpm>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dpm = LocalDpm::connect(name).unwrap();
        dpm.add_pool("p1", "fs").unwrap();
        dpm.add_filesystem("p1", "localhost", &dir.path().join("fs1"), FsStatus::Enabled, 1)
            .unwrap();
        (dpm, dir)
    }

    #[test]
    fn test_put_reaches_ready_and_finalizes() {
        let (dpm, _dir) = daemon("t_dpm_put");
        let reply = dpm.put("/logical/f", "p1").unwrap();
        assert!(reply.state.is_pending());

        let polled = dpm.get_status_putreq(&reply.dpm_token).unwrap();
        assert!(polled.state.is_ready());

        let url = Url::parse(&polled.turl);
        fs::write(&url.path, b"payload").unwrap();

        let done = dpm.put_done(&reply.dpm_token, "/logical/f").unwrap();
        assert_eq!(done.size, 7);
        assert_eq!(done.pool, "p1");

        // the request is gone now
        assert!(dpm.put_done(&reply.dpm_token, "/logical/f").is_err());
    }

    #[test]
    fn test_put_done_without_upload_fails() {
        let (dpm, _dir) = daemon("t_dpm_missing");
        let reply = dpm.put("/logical/g", "p1").unwrap();
        let err = dpm.put_done(&reply.dpm_token, "/logical/g").unwrap_err();
        assert_eq!(err.code(), ErrorCode::QUERY_FAILED);
    }

    #[test]
    fn test_rm_is_idempotent() {
        let (dpm, _dir) = daemon("t_dpm_rm");
        let reply = dpm.put("/logical/h", "p1").unwrap();
        dpm.rm(&reply.dpm_token).unwrap();
        dpm.rm(&reply.dpm_token).unwrap();
        dpm.rm("req-never-existed").unwrap();
    }

    #[test]
    fn test_disabled_filesystems_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dpm = LocalDpm::connect("t_dpm_disabled").unwrap();
        dpm.add_pool("p1", "fs").unwrap();
        dpm.add_filesystem("p1", "localhost", &dir.path().join("only"), FsStatus::Disabled, 1)
            .unwrap();
        let err = dpm.put("/logical/x", "p1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NO_SUCH_POOL);
    }
}
