//! C facade: opaque handles and error retrieval around the core.
//!
//! Every function is `extern "C"`, never unwinds, and reports failures
//! through the status saved in the handle: `dm_errno`/`dm_error` for
//! contexts, `dm_manager_error` for managers. Success returns 0 (or a
//! valid pointer); failure returns non-zero (or null) and stores the code.

use std::ffi::{c_char, c_int, c_longlong, c_uint, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use crate::errors::{DmError, DmResult, DmStatus, ErrorCode};
use crate::extensible::Extensible;
use crate::inode::Replica;
use crate::iodriver::{IoHandler, OpenFlags, Whence};
use crate::plugin::{PluginManager, API_VERSION};
use crate::security::SecurityCredentials;
use crate::stack::StackInstance;

/// Opaque manager handle.
pub struct DmManager {
    building: Option<PluginManager>,
    shared: Option<Arc<PluginManager>>,
    error: DmStatus,
    error_text: CString,
}

impl std::fmt::Debug for DmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmManager").finish()
    }
}

/// Opaque context handle: one stack instance plus its saved error.
pub struct DmContext {
    stack: StackInstance,
    error: DmStatus,
    error_text: CString,
}

impl std::fmt::Debug for DmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmContext").finish()
    }
}

/// Opaque I/O handle.
pub struct DmFd {
    handler: Box<dyn IoHandler>,
    error: DmStatus,
    error_text: CString,
}

impl std::fmt::Debug for DmFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmFd").finish()
    }
}

/// Fixed-size stat record crossing the C boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DmStatInfo {
    /// Inode id.
    pub ino: u64,
    /// Parent inode id.
    pub parent: u64,
    /// Mode bits including the file type.
    pub mode: c_uint,
    /// Link count.
    pub nlink: c_uint,
    /// Owner uid.
    pub uid: c_uint,
    /// Owning gid.
    pub gid: c_uint,
    /// Size in bytes.
    pub size: u64,
    /// Access time.
    pub atime: c_longlong,
    /// Modification time.
    pub mtime: c_longlong,
    /// Change time.
    pub ctime: c_longlong,
}

/// Fixed-size replica record crossing the C boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DmReplicaInfo {
    /// Replica id.
    pub replica_id: i64,
    /// Owning file inode.
    pub fileid: u64,
    /// Status character ('-', 'P', 'D').
    pub status: c_char,
    /// Type character ('V', 'P').
    pub rtype: c_char,
    /// Disk server, NUL terminated.
    pub server: [c_char; 256],
    /// Replica file name, NUL terminated.
    pub rfn: [c_char; 1024],
    /// Pool name, NUL terminated.
    pub pool: [c_char; 64],
    /// Filesystem name, NUL terminated.
    pub filesystem: [c_char; 256],
}

/// Fixed-size single-chunk location crossing the C boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DmLocationInfo {
    /// Disk server to contact, NUL terminated.
    pub host: [c_char; 256],
    /// Physical path, NUL terminated.
    pub path: [c_char; 1024],
    /// Chunk offset.
    pub offset: u64,
    /// Chunk size.
    pub size: u64,
    /// Access token, NUL terminated.
    pub token: [c_char; 512],
    /// Daemon put-request id (writes only), NUL terminated.
    pub dpmtoken: [c_char; 256],
}

fn fill_c_buffer(dst: &mut [c_char], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    for (i, b) in bytes[..n].iter().enumerate() {
        dst[i] = *b as c_char;
    }
    dst[n] = 0;
}

unsafe fn arg_str<'a>(p: *const c_char) -> DmResult<&'a str> {
    if p.is_null() {
        return Err(DmError::new(ErrorCode::INVALID_VALUE, "null string argument"));
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| DmError::new(ErrorCode::INVALID_VALUE, "string argument is not utf-8"))
}

fn store_error(error: &mut DmStatus, text: &mut CString, e: DmError) -> c_int {
    *text = CString::new(e.message().to_string()).unwrap_or_default();
    *error = DmStatus::from(e);
    error.code() as c_int
}

fn clear_error(error: &mut DmStatus, text: &mut CString) {
    *error = DmStatus::ok();
    *text = CString::default();
}

/// Run a fallible closure against a context, saving the outcome.
fn with_context<T>(
    context: &mut DmContext,
    f: impl FnOnce(&mut StackInstance) -> DmResult<T>,
) -> Option<T> {
    let result = catch_unwind(AssertUnwindSafe(|| f(&mut context.stack)));
    match result {
        Ok(Ok(v)) => {
            clear_error(&mut context.error, &mut context.error_text);
            Some(v)
        }
        Ok(Err(e)) => {
            store_error(&mut context.error, &mut context.error_text, e);
            None
        }
        Err(_) => {
            store_error(
                &mut context.error,
                &mut context.error_text,
                DmError::new(ErrorCode::INTERNAL_ERROR, "panic inside the library"),
            );
            None
        }
    }
}

/// The API version this library speaks.
#[unsafe(no_mangle)]
pub extern "C" fn dm_api_version() -> c_uint {
    API_VERSION
}

/// Create a plug-in manager. Returns null only on allocation failure.
#[unsafe(no_mangle)]
pub extern "C" fn dm_manager_new() -> *mut DmManager {
    Box::into_raw(Box::new(DmManager {
        building: Some(PluginManager::new()),
        shared: None,
        error: DmStatus::ok(),
        error_text: CString::default(),
    }))
}

/// Destroy a manager.
///
/// # Safety
/// `manager` must come from [`dm_manager_new`] and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_manager_free(manager: *mut DmManager) -> c_int {
    if !manager.is_null() {
        drop(unsafe { Box::from_raw(manager) });
    }
    0
}

fn with_manager(manager: *mut DmManager, f: impl FnOnce(&mut PluginManager) -> DmResult<()>) -> c_int {
    let Some(handle) = (unsafe { manager.as_mut() }) else {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    };
    let result = match handle.building.as_mut() {
        Some(pm) => catch_unwind(AssertUnwindSafe(|| f(pm))).unwrap_or_else(|_| {
            Err(DmError::new(ErrorCode::INTERNAL_ERROR, "panic inside the library"))
        }),
        None => Err(DmError::new(
            ErrorCode::BAD_OPERATION,
            "the manager is frozen once a context exists",
        )),
    };
    match result {
        Ok(()) => {
            clear_error(&mut handle.error, &mut handle.error_text);
            0
        }
        Err(e) => store_error(&mut handle.error, &mut handle.error_text, e),
    }
}

/// Load a plug-in by id; the library path is informational.
///
/// # Safety
/// `manager` must be a live manager handle; strings must be NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_manager_load_plugin(
    manager: *mut DmManager,
    lib: *const c_char,
    id: *const c_char,
) -> c_int {
    with_manager(manager, |pm| {
        let id = unsafe { arg_str(id) }?;
        let lib = unsafe { arg_str(lib) }.unwrap_or("");
        pm.load_plugin(id, lib)
    })
}

/// Apply one configuration pair.
///
/// # Safety
/// `manager` must be a live manager handle; strings must be NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_manager_set(
    manager: *mut DmManager,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    with_manager(manager, |pm| {
        pm.configure(unsafe { arg_str(key) }?, unsafe { arg_str(value) }?)
    })
}

/// Read a configuration file.
///
/// # Safety
/// `manager` must be a live manager handle; `file` must be NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_manager_load_configuration(
    manager: *mut DmManager,
    file: *const c_char,
) -> c_int {
    with_manager(manager, |pm| pm.load_configuration(unsafe { arg_str(file) }?))
}

/// The last error message of the manager. Do not free.
///
/// # Safety
/// `manager` must be a live manager handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_manager_error(manager: *mut DmManager) -> *const c_char {
    match unsafe { manager.as_ref() } {
        Some(handle) => handle.error_text.as_ptr(),
        None => ptr::null(),
    }
}

/// Build a usable context from the loaded plug-ins.
///
/// # Safety
/// `manager` must be a live manager handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_context_new(manager: *mut DmManager) -> *mut DmContext {
    let Some(handle) = (unsafe { manager.as_mut() }) else {
        return ptr::null_mut();
    };
    if handle.shared.is_none() {
        match handle.building.take() {
            Some(pm) => handle.shared = Some(Arc::new(pm)),
            None => return ptr::null_mut(),
        }
    }
    let shared = handle.shared.as_ref().expect("frozen above");
    Box::into_raw(Box::new(DmContext {
        stack: StackInstance::new(Arc::clone(shared)),
        error: DmStatus::ok(),
        error_text: CString::default(),
    }))
}

/// Destroy a context.
///
/// # Safety
/// `context` must come from [`dm_context_new`] and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_context_free(context: *mut DmContext) -> c_int {
    if !context.is_null() {
        drop(unsafe { Box::from_raw(context) });
    }
    0
}

/// Resolve credentials and adopt the resulting identity.
///
/// # Safety
/// `context` must be a live context; `client_name` must be NUL terminated;
/// `remote_address` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_setcredentials(
    context: *mut DmContext,
    client_name: *const c_char,
    remote_address: *const c_char,
) -> c_int {
    let Some(handle) = (unsafe { context.as_mut() }) else {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    };
    let outcome = with_context(handle, |stack| {
        let mut credentials =
            SecurityCredentials::for_client(unsafe { arg_str(client_name) }?);
        if !remote_address.is_null() {
            credentials.remote_address = unsafe { arg_str(remote_address) }?.to_string();
        }
        stack.set_security_credentials(&credentials)
    });
    match outcome {
        Some(()) => 0,
        None => handle.error.code() as c_int,
    }
}

/// The last error code of the context (0 when clear).
///
/// # Safety
/// `context` must be a live context handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_errno(context: *mut DmContext) -> c_int {
    match unsafe { context.as_ref() } {
        Some(handle) => handle.error.code() as c_int,
        None => ErrorCode::INVALID_VALUE.raw() as c_int,
    }
}

/// The last error message of the context. Do not free.
///
/// # Safety
/// `context` must be a live context handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_error(context: *mut DmContext) -> *const c_char {
    match unsafe { context.as_ref() } {
        Some(handle) => handle.error_text.as_ptr(),
        None => ptr::null(),
    }
}

macro_rules! context_call {
    ($context:expr, $f:expr) => {{
        let Some(handle) = (unsafe { $context.as_mut() }) else {
            return ErrorCode::INVALID_VALUE.raw() as c_int;
        };
        match with_context(handle, $f) {
            Some(v) => v,
            None => return handle.error.code() as c_int,
        }
    }};
}

/// Stat a logical path.
///
/// # Safety
/// All pointers must be valid; `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_stat(
    context: *mut DmContext,
    path: *const c_char,
    buf: *mut DmStatInfo,
) -> c_int {
    if buf.is_null() {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    }
    let meta = context_call!(context, |stack| {
        stack.catalog()?.extended_stat(unsafe { arg_str(path) }?, true)
    });
    unsafe {
        *buf = DmStatInfo {
            ino: meta.ino,
            parent: meta.parent,
            mode: meta.mode,
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            size: meta.size,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
        };
    }
    0
}

/// Create a directory.
///
/// # Safety
/// `context` live, `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_mkdir(
    context: *mut DmContext,
    path: *const c_char,
    mode: c_uint,
) -> c_int {
    context_call!(context, |stack| {
        stack.catalog()?.make_dir(unsafe { arg_str(path) }?, mode)
    });
    0
}

/// Remove an empty directory.
///
/// # Safety
/// `context` live, `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_rmdir(context: *mut DmContext, path: *const c_char) -> c_int {
    context_call!(context, |stack| {
        stack.catalog()?.remove_dir(unsafe { arg_str(path) }?)
    });
    0
}

/// Remove a file.
///
/// # Safety
/// `context` live, `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_unlink(context: *mut DmContext, path: *const c_char) -> c_int {
    context_call!(context, |stack| {
        stack.catalog()?.unlink(unsafe { arg_str(path) }?)
    });
    0
}

/// Create (or truncate) a file.
///
/// # Safety
/// `context` live, `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_create(
    context: *mut DmContext,
    path: *const c_char,
    mode: c_uint,
) -> c_int {
    context_call!(context, |stack| {
        stack.catalog()?.create(unsafe { arg_str(path) }?, mode)
    });
    0
}

/// Rename or move an entry.
///
/// # Safety
/// `context` live, both paths NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_rename(
    context: *mut DmContext,
    old_path: *const c_char,
    new_path: *const c_char,
) -> c_int {
    context_call!(context, |stack| {
        stack
            .catalog()?
            .rename(unsafe { arg_str(old_path) }?, unsafe { arg_str(new_path) }?)
    });
    0
}

/// Change permission bits.
///
/// # Safety
/// `context` live, `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_chmod(
    context: *mut DmContext,
    path: *const c_char,
    mode: c_uint,
) -> c_int {
    context_call!(context, |stack| {
        stack.catalog()?.set_mode(unsafe { arg_str(path) }?, mode)
    });
    0
}

/// Change ownership; pass `(uid_t)-1` to keep a field.
///
/// # Safety
/// `context` live, `path` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_chown(
    context: *mut DmContext,
    path: *const c_char,
    uid: c_uint,
    gid: c_uint,
) -> c_int {
    context_call!(context, |stack| {
        let uid = if uid == c_uint::MAX { None } else { Some(uid) };
        let gid = if gid == c_uint::MAX { None } else { Some(gid) };
        stack.catalog()?.set_owner(unsafe { arg_str(path) }?, uid, gid, true)
    });
    0
}

/// Set the file creation mask of the context, returning the previous one.
///
/// # Safety
/// `context` must be a live context handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_umask(context: *mut DmContext, mask: c_uint) -> c_uint {
    let Some(handle) = (unsafe { context.as_mut() }) else {
        return 0;
    };
    with_context(handle, |stack| Ok(stack.catalog()?.umask(mask))).unwrap_or(0)
}

/// Read the comment of an entry into `buf` (truncated to `buf_size`).
///
/// # Safety
/// `context` live, `path` NUL terminated, `buf` at least `buf_size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_getcomment(
    context: *mut DmContext,
    path: *const c_char,
    buf: *mut c_char,
    buf_size: usize,
) -> c_int {
    if buf.is_null() || buf_size == 0 {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    }
    let comment = context_call!(context, |stack| {
        stack.catalog()?.get_comment(unsafe { arg_str(path) }?)
    });
    let out = unsafe { std::slice::from_raw_parts_mut(buf, buf_size) };
    fill_c_buffer(out, &comment);
    0
}

/// Set the comment of an entry.
///
/// # Safety
/// `context` live, both strings NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_setcomment(
    context: *mut DmContext,
    path: *const c_char,
    comment: *const c_char,
) -> c_int {
    context_call!(context, |stack| {
        stack
            .catalog()?
            .set_comment(unsafe { arg_str(path) }?, unsafe { arg_str(comment) }?)
    });
    0
}

fn replica_to_c(replica: &Replica) -> DmReplicaInfo {
    let mut out = DmReplicaInfo {
        replica_id: replica.replica_id,
        fileid: replica.fileid,
        status: replica.status.as_char() as c_char,
        rtype: match replica.rtype {
            crate::inode::ReplicaType::Volatile => 'V' as c_char,
            crate::inode::ReplicaType::Permanent => 'P' as c_char,
        },
        server: [0; 256],
        rfn: [0; 1024],
        pool: [0; 64],
        filesystem: [0; 256],
    };
    fill_c_buffer(&mut out.server, &replica.server);
    fill_c_buffer(&mut out.rfn, &replica.rfn);
    fill_c_buffer(&mut out.pool, &replica.pool);
    fill_c_buffer(&mut out.filesystem, &replica.filesystem);
    out
}

/// Fetch the replicas of a path. On success `*replicas` points to an array
/// of `*count` records to be released with [`dm_replicas_free`].
///
/// # Safety
/// `context` live, `path` NUL terminated, out pointers valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_getreplicas(
    context: *mut DmContext,
    path: *const c_char,
    replicas: *mut *mut DmReplicaInfo,
    count: *mut c_uint,
) -> c_int {
    if replicas.is_null() || count.is_null() {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    }
    let found = context_call!(context, |stack| {
        stack.catalog()?.get_replicas(unsafe { arg_str(path) }?)
    });
    let boxed: Box<[DmReplicaInfo]> = found.iter().map(replica_to_c).collect();
    unsafe {
        *count = boxed.len() as c_uint;
        *replicas = Box::into_raw(boxed) as *mut DmReplicaInfo;
    }
    0
}

/// Release an array returned by [`dm_getreplicas`].
///
/// # Safety
/// `replicas`/`count` must come from a successful [`dm_getreplicas`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_replicas_free(replicas: *mut DmReplicaInfo, count: c_uint) -> c_int {
    if !replicas.is_null() {
        let slice = ptr::slice_from_raw_parts_mut(replicas, count as usize);
        drop(unsafe { Box::from_raw(slice) });
    }
    0
}

/// Register a replica for an existing file.
///
/// # Safety
/// `context` live, all strings NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_addreplica(
    context: *mut DmContext,
    path: *const c_char,
    server: *const c_char,
    rfn: *const c_char,
    pool: *const c_char,
    filesystem: *const c_char,
) -> c_int {
    context_call!(context, |stack| {
        let catalog = stack.catalog()?;
        let meta = catalog.extended_stat(unsafe { arg_str(path) }?, true)?;
        catalog.add_replica(&Replica {
            fileid: meta.ino,
            server: unsafe { arg_str(server) }?.to_string(),
            rfn: unsafe { arg_str(rfn) }?.to_string(),
            pool: unsafe { arg_str(pool) }?.to_string(),
            filesystem: unsafe { arg_str(filesystem) }?.to_string(),
            ..Default::default()
        })?;
        Ok(())
    });
    0
}

fn location_to_c(location: &crate::poolmanager::Location, buf: &mut DmLocationInfo) {
    if let Some(chunk) = location.chunks.first() {
        fill_c_buffer(&mut buf.host, &chunk.host);
        fill_c_buffer(&mut buf.path, &chunk.path);
        buf.offset = chunk.offset;
        buf.size = chunk.size;
        fill_c_buffer(
            &mut buf.token,
            &chunk.query.get_string("token").unwrap_or_default(),
        );
        fill_c_buffer(
            &mut buf.dpmtoken,
            &chunk.query.get_string("dpmtoken").unwrap_or_default(),
        );
    }
}

/// Pick a replica of `path` for reading.
///
/// # Safety
/// `context` live, `path` NUL terminated, `buf` valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_wheretoread(
    context: *mut DmContext,
    path: *const c_char,
    buf: *mut DmLocationInfo,
) -> c_int {
    if buf.is_null() {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    }
    let location = context_call!(context, |stack| {
        stack.pool_manager()?.where_to_read(unsafe { arg_str(path) }?)
    });
    location_to_c(&location, unsafe { &mut *buf });
    0
}

/// Allocate a write destination for `path`.
///
/// # Safety
/// `context` live, `path` NUL terminated, `buf` valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_wheretowrite(
    context: *mut DmContext,
    path: *const c_char,
    buf: *mut DmLocationInfo,
) -> c_int {
    if buf.is_null() {
        return ErrorCode::INVALID_VALUE.raw() as c_int;
    }
    let location = context_call!(context, |stack| {
        stack.pool_manager()?.where_to_write(unsafe { arg_str(path) }?)
    });
    location_to_c(&location, unsafe { &mut *buf });
    0
}

/// Post the completion of an upload.
///
/// # Safety
/// `context` live, all strings NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_donewriting(
    context: *mut DmContext,
    host: *const c_char,
    rfn: *const c_char,
    sfn: *const c_char,
    token: *const c_char,
    dpmtoken: *const c_char,
) -> c_int {
    context_call!(context, |stack| {
        let mut params = Extensible::new();
        params.set("sfn", unsafe { arg_str(sfn) }?);
        params.set("token", unsafe { arg_str(token) }?);
        params.set("dpmtoken", unsafe { arg_str(dpmtoken) }?);
        stack.pool_manager()?.done_writing(
            unsafe { arg_str(host) }?,
            unsafe { arg_str(rfn) }?,
            &params,
        )
    });
    0
}

/// Open a physical file. `token` may be null with `OpenFlags::INSECURE`.
///
/// # Safety
/// `context` live, `pfn` NUL terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fopen(
    context: *mut DmContext,
    pfn: *const c_char,
    flags: c_uint,
    token: *const c_char,
    mode: c_uint,
) -> *mut DmFd {
    let Some(handle) = (unsafe { context.as_mut() }) else {
        return ptr::null_mut();
    };
    let opened = with_context(handle, |stack| {
        let mut extras = Extensible::new();
        if !token.is_null() {
            extras.set("token", unsafe { arg_str(token) }?);
        }
        stack.io_driver()?.create_io_handler(
            unsafe { arg_str(pfn) }?,
            OpenFlags::from_bits_truncate(flags),
            &extras,
            mode,
        )
    });
    match opened {
        Some(handler) => Box::into_raw(Box::new(DmFd {
            handler,
            error: DmStatus::ok(),
            error_text: CString::default(),
        })),
        None => ptr::null_mut(),
    }
}

fn with_fd(fd: *mut DmFd, f: impl FnOnce(&mut dyn IoHandler) -> DmResult<isize>) -> isize {
    let Some(handle) = (unsafe { fd.as_mut() }) else {
        return -1;
    };
    let result = catch_unwind(AssertUnwindSafe(|| f(handle.handler.as_mut())));
    match result {
        Ok(Ok(v)) => {
            clear_error(&mut handle.error, &mut handle.error_text);
            v
        }
        Ok(Err(e)) => {
            store_error(&mut handle.error, &mut handle.error_text, e);
            -1
        }
        Err(_) => {
            store_error(
                &mut handle.error,
                &mut handle.error_text,
                DmError::new(ErrorCode::INTERNAL_ERROR, "panic inside the library"),
            );
            -1
        }
    }
}

/// Read from an open file; -1 on failure.
///
/// # Safety
/// `fd` live, `buf` at least `count` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fread(fd: *mut DmFd, buf: *mut u8, count: usize) -> isize {
    if buf.is_null() {
        return -1;
    }
    with_fd(fd, |handler| {
        let out = unsafe { std::slice::from_raw_parts_mut(buf, count) };
        Ok(handler.read(out)? as isize)
    })
}

/// Write to an open file; -1 on failure.
///
/// # Safety
/// `fd` live, `buf` at least `count` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fwrite(fd: *mut DmFd, buf: *const u8, count: usize) -> isize {
    if buf.is_null() {
        return -1;
    }
    with_fd(fd, |handler| {
        let data = unsafe { std::slice::from_raw_parts(buf, count) };
        Ok(handler.write(data)? as isize)
    })
}

/// Move the cursor; returns the new position or -1.
///
/// # Safety
/// `fd` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fseek(fd: *mut DmFd, offset: c_longlong, whence: c_int) -> c_longlong {
    let whence = match whence {
        0 => Whence::Set,
        1 => Whence::Cur,
        _ => Whence::End,
    };
    with_fd(fd, |handler| Ok(handler.seek(offset, whence)? as isize)) as c_longlong
}

/// Size of the open file, or -1.
///
/// # Safety
/// `fd` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fsize(fd: *mut DmFd) -> c_longlong {
    with_fd(fd, |handler| Ok(handler.fstat()?.size as isize)) as c_longlong
}

/// The last error message of an I/O handle. Do not free.
///
/// # Safety
/// `fd` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fd_error(fd: *mut DmFd) -> *const c_char {
    match unsafe { fd.as_ref() } {
        Some(handle) => handle.error_text.as_ptr(),
        None => ptr::null(),
    }
}

/// Close and destroy an I/O handle.
///
/// # Safety
/// `fd` must come from [`dm_fopen`] and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dm_fclose(fd: *mut DmFd) -> c_int {
    if fd.is_null() {
        return 0;
    }
    let mut handle = unsafe { Box::from_raw(fd) };
    match handle.handler.close() {
        Ok(()) => 0,
        Err(e) => e.code().raw() as c_int,
    }
}
