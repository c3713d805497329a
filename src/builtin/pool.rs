//! Bundled pool manager and the `fs` pool-type driver.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::catalog::Catalog;
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::inode::{Replica, ReplicaStatus, ReplicaType};
use crate::plugin::{
    Configurable, PluginIdCard, PluginManager, PoolDriverFactory, PoolManagerFactory,
};
use crate::pooldriver::{with_retries, PoolDriver};
use crate::poolmanager::{Chunk, Location, Pool, PoolAvailability, PoolManager};
use crate::security::SecurityContext;
use crate::token::generate_token;
use crate::url::Url;

use super::dpm::{DpmClient, LocalDpm};
use super::store::FsStatus;

/// Pool type served by the bundled driver.
pub const DISK_POOL_TYPE: &str = "fs";

#[derive(Clone)]
struct TokenSettings {
    password: String,
    use_ip: bool,
    life: u64,
}

fn client_id(settings: &TokenSettings, context: &SecurityContext) -> String {
    if settings.use_ip {
        context.credentials.remote_address.clone()
    } else {
        context.credentials.client_name.clone()
    }
}

/// Driver for plain disk pools behind the disk-pool daemon.
pub struct FsPoolDriver {
    dpm: Arc<dyn DpmClient>,
    tokens: TokenSettings,
    retry_limit: u32,
    context: Option<Arc<SecurityContext>>,
}

impl std::fmt::Debug for FsPoolDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsPoolDriver").finish()
    }
}

impl FsPoolDriver {
    fn user_id(&self) -> DmResult<String> {
        let context = self.context.as_ref().ok_or_else(|| {
            DmError::new(ErrorCode::NO_SECURITY_CONTEXT, "no security context set")
        })?;
        Ok(client_id(&self.tokens, context))
    }
}

impl PoolDriver for FsPoolDriver {
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>) {
        self.context = context;
    }

    fn is_pool_available(&mut self, pool: &Pool, for_write: bool) -> DmResult<bool> {
        let rows = match self.dpm.get_pool_filesystems(&pool.name) {
            Ok(rows) => rows,
            Err(e) if e.code() == ErrorCode::NO_SUCH_POOL => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(rows.iter().any(|row| {
            if for_write {
                row.status == FsStatus::Enabled
            } else {
                row.status != FsStatus::Disabled
            }
        }))
    }

    fn is_replica_available(&mut self, replica: &Replica) -> DmResult<bool> {
        if replica.status != ReplicaStatus::Available {
            return Ok(false);
        }
        let rows = match self.dpm.get_pool_filesystems(&replica.pool) {
            Ok(rows) => rows,
            Err(e) if e.code() == ErrorCode::NO_SUCH_POOL => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(rows
            .iter()
            .any(|row| row.fs == replica.filesystem && row.status != FsStatus::Disabled))
    }

    fn where_to_read(&mut self, replica: &Replica, file_size: u64) -> DmResult<Location> {
        let user_id = self.user_id()?;
        let rfn = Url::parse(&replica.rfn);
        let host = if rfn.domain.is_empty() {
            replica.server.clone()
        } else {
            rfn.domain
        };
        let mut query = Extensible::new();
        query.set(
            "token",
            generate_token(&user_id, &rfn.path, &self.tokens.password, self.tokens.life, false),
        );
        Ok(Location::single(Chunk {
            host,
            path: rfn.path,
            offset: 0,
            size: file_size,
            query,
        }))
    }

    fn where_to_write(&mut self, pool: &Pool, sfn: &str) -> DmResult<Location> {
        let user_id = self.user_id()?;
        let mut reply = with_retries(self.retry_limit, "dpm put", || {
            self.dpm.put(sfn, &pool.name)
        })?;

        // poll the request until it settles
        let dpm_token = reply.dpm_token.clone();
        let mut polls = 0;
        while reply.state.is_pending() {
            polls += 1;
            if polls > self.retry_limit.max(1) * 4 {
                return Err(DmError::new(
                    ErrorCode::QUERY_FAILED,
                    "the put request never reached a terminal state",
                ));
            }
            reply = with_retries(self.retry_limit, "dpm getstatus_putreq", || {
                self.dpm.get_status_putreq(&dpm_token)
            })?;
        }
        if reply.state.is_failure() {
            return Err(DmError::new(
                ErrorCode::QUERY_FAILED,
                "the put request failed on the daemon",
            ));
        }

        let turl = Url::parse(&reply.turl);
        let path = Url::normalize_path(&turl.path);
        let mut query = Extensible::new();
        query.set("sfn", sfn);
        query.set("dpmtoken", reply.dpm_token.as_str());
        query.set(
            "token",
            generate_token(&user_id, &path, &self.tokens.password, self.tokens.life, true),
        );
        Ok(Location::single(Chunk {
            host: turl.domain,
            path,
            offset: 0,
            size: 0,
            query,
        }))
    }

    fn done_writing(&mut self, host: &str, rfn: &str, params: &Extensible) -> DmResult<Replica> {
        let sfn = params.get_string("sfn").map_err(|_| {
            DmError::new(ErrorCode::INVALID_VALUE, "sfn not present in the parameters")
        })?;
        let dpm_token = params.get_string("dpmtoken").map_err(|_| {
            DmError::new(ErrorCode::INVALID_VALUE, "dpmtoken not present in the parameters")
        })?;

        let done = with_retries(self.retry_limit, "dpm putdone", || {
            self.dpm.put_done(&dpm_token, &sfn)
        })?;

        let server = if host.is_empty() { done.host.clone() } else { host.to_string() };
        let rfn = if rfn.is_empty() {
            format!("{}:{}", server, done.pfn)
        } else {
            rfn.to_string()
        };
        let mut xattrs = Extensible::new();
        xattrs.set("filesize", done.size);
        Ok(Replica {
            replica_id: 0,
            fileid: 0,
            nbaccesses: 0,
            ctime: 0,
            atime: 0,
            ptime: 0,
            ltime: 0,
            status: ReplicaStatus::Available,
            rtype: ReplicaType::Permanent,
            setname: params.get_string("spacetoken").ok(),
            server,
            rfn,
            pool: done.pool,
            filesystem: done.filesystem,
            xattrs,
        })
    }

    fn cancel_write(&mut self, location: &Location) -> DmResult<()> {
        for chunk in &location.chunks {
            if let Ok(token) = chunk.query.get_string("dpmtoken") {
                self.dpm.rm(&token)?;
            }
        }
        Ok(())
    }
}

/// The bundled [`PoolManager`].
pub struct BuiltinPoolManager {
    manager: Arc<PluginManager>,
    catalog: Box<dyn Catalog>,
    dpm: Arc<LocalDpm>,
    drivers: HashMap<String, Box<dyn PoolDriver>>,
    context: Option<Arc<SecurityContext>>,
}

impl std::fmt::Debug for BuiltinPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinPoolManager").finish()
    }
}

impl BuiltinPoolManager {
    fn driver(&mut self, pool_type: &str) -> DmResult<&mut Box<dyn PoolDriver>> {
        if !self.drivers.contains_key(pool_type) {
            let mut driver = self.manager.instantiate_pool_driver(pool_type)?;
            driver.set_security_context(self.context.clone());
            self.drivers.insert(pool_type.to_string(), driver);
        }
        Ok(self.drivers.get_mut(pool_type).expect("driver just inserted"))
    }

    fn pool_availability(&mut self, pool: &Pool) -> DmResult<(bool, bool)> {
        let driver = self.driver(&pool.pool_type)?;
        let read = driver.is_pool_available(pool, false)?;
        let write = driver.is_pool_available(pool, true)?;
        Ok((read, write))
    }
}

impl PoolManager for BuiltinPoolManager {
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>) {
        self.context = context.clone();
        self.catalog.set_security_context(context.clone());
        for driver in self.drivers.values_mut() {
            driver.set_security_context(context.clone());
        }
    }

    fn get_pools(&mut self, availability: PoolAvailability) -> DmResult<Vec<Pool>> {
        let pools = self.dpm.get_pools()?;
        if availability == PoolAvailability::Any {
            return Ok(pools);
        }
        let mut out = Vec::new();
        for pool in pools {
            let (read, write) = self.pool_availability(&pool)?;
            let keep = match availability {
                PoolAvailability::Any => true,
                PoolAvailability::None => !read && !write,
                PoolAvailability::ForRead => read,
                PoolAvailability::ForWrite => write,
                PoolAvailability::ForBoth => read && write,
            };
            if keep {
                out.push(pool);
            }
        }
        Ok(out)
    }

    fn get_pool(&mut self, name: &str) -> DmResult<Pool> {
        self.dpm
            .get_pools()?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                DmError::new(ErrorCode::NO_SUCH_POOL, format!("pool {name} not found"))
            })
    }

    fn where_to_read(&mut self, path: &str) -> DmResult<Location> {
        let meta = self.catalog.extended_stat(path, true)?;
        let replicas = self.catalog.get_replicas(path)?;

        let mut available = Vec::new();
        for replica in replicas {
            let pool = match self.get_pool(&replica.pool) {
                Ok(pool) => pool,
                Err(e) if e.code() == ErrorCode::NO_SUCH_POOL => {
                    warn!("replica {} references unknown pool {}", replica.rfn, replica.pool);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let usable = self
                .driver(&pool.pool_type)?
                .is_replica_available(&replica)?;
            if usable {
                available.push((replica, pool.pool_type));
            }
        }

        let (replica, pool_type) = available
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                DmError::new(
                    ErrorCode::NO_REPLICAS,
                    format!("none of the replicas of {path} is currently available"),
                )
            })?;
        debug!("serving {path} from {}", replica.rfn);
        self.driver(&pool_type)?.where_to_read(&replica, meta.size)
    }

    fn where_to_write(&mut self, path: &str) -> DmResult<Location> {
        // allocate (or truncate) the catalog entry first
        self.catalog.create(path, 0o664)?;

        let mut candidates = Vec::new();
        for pool in self.dpm.get_pools()? {
            let (_, write) = self.pool_availability(&pool)?;
            if write {
                let free = pool.properties.get_unsigned("free").unwrap_or(0);
                candidates.push((pool, free));
            }
        }
        let (pool, _) = candidates
            .into_iter()
            .max_by_key(|(_, free)| *free)
            .ok_or_else(|| {
                DmError::new(ErrorCode::NO_SUCH_POOL, "no pool accepts writes right now")
            })?;

        debug!("writing {path} into pool {}", pool.name);
        self.driver(&pool.pool_type)?.where_to_write(&pool, path)
    }

    fn done_writing(&mut self, host: &str, rfn: &str, params: &Extensible) -> DmResult<()> {
        let mut replica = self
            .driver(DISK_POOL_TYPE)?
            .done_writing(host, rfn, params)?;
        let sfn = params.get_string("sfn").map_err(|_| {
            DmError::new(ErrorCode::INVALID_VALUE, "sfn not present in the parameters")
        })?;

        let meta = self.catalog.extended_stat(&sfn, true)?;
        replica.fileid = meta.ino;
        let size = replica.xattrs.get_unsigned("filesize").unwrap_or(0);
        replica.xattrs.remove("filesize");

        self.catalog.add_replica(&replica)?;
        self.catalog.set_size(&sfn, size)?;
        if let (Ok(t), Ok(v)) = (
            params.get_string("csumtype"),
            params.get_string("csumvalue"),
        ) {
            self.catalog.set_checksum(&sfn, &t, &v)?;
        }
        Ok(())
    }

    fn cancel_write(&mut self, location: &Location) -> DmResult<()> {
        self.driver(DISK_POOL_TYPE)?.cancel_write(location)
    }
}

struct PoolsConfig {
    dpm_database: String,
    tokens: TokenSettings,
    retry_limit: u32,
}

impl Default for PoolsConfig {
    fn default() -> PoolsConfig {
        PoolsConfig {
            dpm_database: "dpm_db".to_string(),
            tokens: TokenSettings {
                password: "change-me".to_string(),
                use_ip: true,
                life: 600,
            },
            retry_limit: 3,
        }
    }
}

/// Factory of the `builtin_pools` plug-in: pool manager plus the `fs`
/// driver, sharing one configuration.
struct PoolsFactory {
    config: RwLock<PoolsConfig>,
}

impl Configurable for PoolsFactory {
    fn configure(&self, key: &str, value: &str) -> DmResult<()> {
        let mut config = self.config.write();
        match key {
            "Host" => {} // accepted for compatibility; the daemon is in-process
            "DpmDatabase" => config.dpm_database = value.to_string(),
            "TokenPassword" => config.tokens.password = value.to_string(),
            "TokenId" => {
                config.tokens.use_ip = match value.to_ascii_lowercase().as_str() {
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
            "TokenLife" => {
                config.tokens.life = value.parse().map_err(|_| {
                    DmError::new(ErrorCode::INVALID_VALUE, format!("bad TokenLife '{value}'"))
                })?
            }
            "RetryLimit" => {
                config.retry_limit = value.parse().map_err(|_| {
                    DmError::new(ErrorCode::INVALID_VALUE, format!("bad RetryLimit '{value}'"))
                })?
            }
            _ => return Err(DmError::new(ErrorCode::UNKNOWN_KEY, key.to_string())),
        }
        Ok(())
    }
}

impl PoolManagerFactory for PoolsFactory {
    fn create_pool_manager(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn PoolManager>>,
    ) -> DmResult<Box<dyn PoolManager>> {
        if lower.is_some() {
            warn!("builtin_pools is a base pool manager, discarding the decorated product");
        }
        let config = self.config.read();
        Ok(Box::new(BuiltinPoolManager {
            manager: Arc::clone(manager),
            catalog: manager.instantiate_catalog()?,
            dpm: LocalDpm::connect(&config.dpm_database)?,
            drivers: HashMap::new(),
            context: None,
        }))
    }
}

impl PoolDriverFactory for PoolsFactory {
    fn create_pool_driver(
        &self,
        _manager: &Arc<PluginManager>,
        lower: Option<Box<dyn PoolDriver>>,
    ) -> DmResult<Box<dyn PoolDriver>> {
        if lower.is_some() {
            warn!("the fs driver is a base driver, discarding the decorated product");
        }
        let config = self.config.read();
        Ok(Box::new(FsPoolDriver {
            dpm: LocalDpm::connect(&config.dpm_database)?,
            tokens: config.tokens.clone(),
            retry_limit: config.retry_limit,
            context: None,
        }))
    }
}

pub(crate) fn register(manager: &mut PluginManager) -> DmResult<()> {
    let factory = Arc::new(PoolsFactory {
        config: RwLock::new(PoolsConfig::default()),
    });
    manager.register_configurable(Arc::clone(&factory) as Arc<dyn Configurable>);
    manager.register_pool_manager_factory(Arc::clone(&factory) as Arc<dyn PoolManagerFactory>);
    manager.register_pool_driver_factory(DISK_POOL_TYPE, factory);
    Ok(())
}

/// Id card of the `builtin_pools` plug-in.
pub(crate) const PLUGIN_BUILTIN_POOLS: PluginIdCard = PluginIdCard {
    api_version: crate::plugin::API_VERSION,
    register,
};
