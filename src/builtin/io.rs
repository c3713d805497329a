//! Bundled I/O driver: token-checked access to local files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::iodriver::{IoDriver, IoHandler, IoStat, OpenFlags, Whence};
use crate::plugin::{Configurable, IoDriverFactory, PluginIdCard, PluginManager};
use crate::poolmanager::PoolManager;
use crate::security::SecurityContext;
use crate::token::{validate_token, TokenResult};

/// I/O over plain local files, admitting requests only with a valid token.
pub struct StdIoDriver {
    manager: Arc<PluginManager>,
    password: String,
    use_ip: bool,
    context: Option<Arc<SecurityContext>>,
    pool_manager: Option<Box<dyn PoolManager>>,
}

impl std::fmt::Debug for StdIoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdIoDriver").finish()
    }
}

fn local_host() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl StdIoDriver {
    fn client_id(&self) -> DmResult<String> {
        let context = self.context.as_ref().ok_or_else(|| {
            DmError::new(ErrorCode::NO_SECURITY_CONTEXT, "no security context set")
        })?;
        Ok(if self.use_ip {
            context.credentials.remote_address.clone()
        } else {
            context.credentials.client_name.clone()
        })
    }

    fn check_token(&self, pfn: &str, flags: OpenFlags, extras: &Extensible) -> DmResult<()> {
        let token = extras.get_string("token").map_err(|_| {
            DmError::new(ErrorCode::FORBIDDEN, format!("missing token for {pfn}"))
        })?;
        let id = self.client_id()?;
        let verdict = validate_token(&token, &id, pfn, &self.password, flags.wants_write());
        match verdict {
            TokenResult::Ok => Ok(()),
            other => Err(DmError::new(
                ErrorCode::FORBIDDEN,
                format!("token does not validate for {pfn}: {other:?}"),
            )),
        }
    }
}

impl IoDriver for StdIoDriver {
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>) {
        self.context = context.clone();
        if let Some(pm) = self.pool_manager.as_mut() {
            pm.set_security_context(context);
        }
    }

    fn create_io_handler(
        &mut self,
        pfn: &str,
        flags: OpenFlags,
        extras: &Extensible,
        mode: u32,
    ) -> DmResult<Box<dyn IoHandler>> {
        if flags.contains(OpenFlags::INSECURE) {
            debug!("token validation bypassed for {pfn}");
        } else {
            self.check_token(pfn, flags, extras)?;
        }

        let mut options = OpenOptions::new();
        options
            .read(!flags.contains(OpenFlags::WRONLY))
            .write(flags.wants_write())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .create(flags.contains(OpenFlags::CREAT))
            .mode(mode);
        let file = options.open(pfn).map_err(|e| {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            if errno == libc::ENOENT {
                DmError::new(ErrorCode::NO_SUCH_FILE, format!("could not open {pfn}"))
            } else {
                DmError::new(
                    ErrorCode::system(errno as u32),
                    format!("could not open {pfn}: {e}"),
                )
            }
        })?;
        Ok(Box::new(StdIoHandler {
            file: Some(file),
            path: PathBuf::from(pfn),
            eof: false,
        }))
    }

    fn pfn_stat(&mut self, pfn: &str) -> DmResult<IoStat> {
        let meta = std::fs::metadata(pfn).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DmError::new(ErrorCode::NO_SUCH_FILE, format!("{pfn} does not exist"))
            } else {
                e.into()
            }
        })?;
        Ok(stat_from_metadata(&meta))
    }

    fn done_writing(&mut self, pfn: &str, params: &Extensible) -> DmResult<()> {
        if self.pool_manager.is_none() {
            let mut pm = self.manager.instantiate_pool_manager()?;
            pm.set_security_context(self.context.clone());
            self.pool_manager = Some(pm);
        }
        let host = local_host();
        let rfn = format!("{host}:{pfn}");
        self.pool_manager
            .as_mut()
            .expect("pool manager just created")
            .done_writing(&host, &rfn, params)
    }
}

fn stat_from_metadata(meta: &std::fs::Metadata) -> IoStat {
    let unix = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    };
    IoStat {
        size: meta.len(),
        atime: unix(meta.accessed()),
        mtime: unix(meta.modified()),
    }
}

/// Handler over one open local file.
pub struct StdIoHandler {
    file: Option<File>,
    path: PathBuf,
    eof: bool,
}

impl std::fmt::Debug for StdIoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdIoHandler").field("path", &self.path).finish()
    }
}

impl StdIoHandler {
    fn file(&mut self) -> DmResult<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            DmError::new(
                ErrorCode::system(libc::EBADF as u32),
                "the handler is already closed",
            )
        })
    }
}

impl IoHandler for StdIoHandler {
    fn read(&mut self, buffer: &mut [u8]) -> DmResult<usize> {
        let n = self.file()?.read(buffer)?;
        if n == 0 && !buffer.is_empty() {
            self.eof = true;
        }
        Ok(n)
    }

    fn write(&mut self, buffer: &[u8]) -> DmResult<usize> {
        Ok(self.file()?.write(buffer)?)
    }

    fn pread(&mut self, buffer: &mut [u8], offset: u64) -> DmResult<usize> {
        Ok(self.file()?.read_at(buffer, offset)?)
    }

    fn pwrite(&mut self, buffer: &[u8], offset: u64) -> DmResult<usize> {
        Ok(self.file()?.write_at(buffer, offset)?)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DmResult<u64> {
        let pos = match whence {
            Whence::Set => SeekFrom::Start(offset.max(0) as u64),
            Whence::Cur => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        self.eof = false;
        Ok(self.file()?.seek(pos)?)
    }

    fn tell(&mut self) -> DmResult<u64> {
        Ok(self.file()?.stream_position()?)
    }

    fn eof(&mut self) -> bool {
        self.eof
    }

    fn fstat(&mut self) -> DmResult<IoStat> {
        let meta = self.file()?.metadata()?;
        Ok(stat_from_metadata(&meta))
    }

    fn flush(&mut self) -> DmResult<()> {
        Ok(self.file()?.flush()?)
    }

    fn close(&mut self) -> DmResult<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for StdIoHandler {
    fn drop(&mut self) {
        if self.file.is_some() {
            debug!("implicitly closing {}", self.path.display());
        }
    }
}

struct IoConfig {
    password: String,
    use_ip: bool,
}

/// Factory of the `builtin_io` plug-in.
struct StdIoFactory {
    config: RwLock<IoConfig>,
}

impl Configurable for StdIoFactory {
    fn configure(&self, key: &str, value: &str) -> DmResult<()> {
        let mut config = self.config.write();
        match key {
            "TokenPassword" => config.password = value.to_string(),
            "TokenId" => {
                config.use_ip = match value.to_ascii_lowercase().as_str() {
                    "ip" => true,
                    "dn" => false,
                    _ => {
                        return Err(DmError::new(
                            ErrorCode::INVALID_VALUE,
                            format!("TokenId must be 'ip' or 'dn', not '{value}'"),
                        ))
                    }
                }
            }
            _ => return Err(DmError::new(ErrorCode::UNKNOWN_KEY, key.to_string())),
        }
        Ok(())
    }
}

impl IoDriverFactory for StdIoFactory {
    fn create_io_driver(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn IoDriver>>,
    ) -> DmResult<Box<dyn IoDriver>> {
        if lower.is_some() {
            warn!("builtin_io is a base io driver, discarding the decorated product");
        }
        let config = self.config.read();
        Ok(Box::new(StdIoDriver {
            manager: Arc::clone(manager),
            password: config.password.clone(),
            use_ip: config.use_ip,
            context: None,
            pool_manager: None,
        }))
    }
}

pub(crate) fn register(manager: &mut PluginManager) -> DmResult<()> {
    let factory = Arc::new(StdIoFactory {
        config: RwLock::new(IoConfig {
            password: "change-me".to_string(),
            use_ip: true,
        }),
    });
    manager.register_configurable(Arc::clone(&factory) as Arc<dyn Configurable>);
    manager.register_io_factory(factory);
    Ok(())
}

/// Id card of the `builtin_io` plug-in.
pub(crate) const PLUGIN_BUILTIN_IO: PluginIdCard = PluginIdCard {
    api_version: crate::plugin::API_VERSION,
    register,
};
