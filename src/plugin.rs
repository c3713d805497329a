//! Plug-in registration, configuration and factory chains.
//!
//! A plug-in is identified by an id card carrying the API version it was
//! built against and a registration function. `LoadPlugin <id> <path>`
//! resolves the id against the process registry (the bundled plug-ins are
//! pre-registered; [`register_plugin`] adds more) and runs the registration
//! function, which contributes zero or more factories per interface kind.
//!
//! Factories of one kind form an ordered list: a factory registered later
//! decorates the product of the ones before it, receiving the already-built
//! inner object at creation time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::authn::Authn;
use crate::catalog::Catalog;
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::inode::InodeStore;
use crate::iodriver::IoDriver;
use crate::poolmanager::PoolManager;
use crate::pooldriver::PoolDriver;

/// The plug-in API version this build speaks.
pub const API_VERSION: u32 = 4;

/// What a plug-in exposes to be loadable.
#[derive(Clone, Copy)]
pub struct PluginIdCard {
    /// API version the plug-in was built against; must match
    /// [`API_VERSION`].
    pub api_version: u32,
    /// Called once per `LoadPlugin` to contribute factories.
    pub register: fn(&mut PluginManager) -> DmResult<()>,
}

impl std::fmt::Debug for PluginIdCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginIdCard")
            .field("api_version", &self.api_version)
            .finish()
    }
}

fn registry() -> &'static Mutex<HashMap<String, PluginIdCard>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, PluginIdCard>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(crate::builtin::id_cards()))
}

/// Make a plug-in resolvable by `LoadPlugin <id> ...`.
pub fn register_plugin(id: &str, card: PluginIdCard) {
    registry().lock().insert(id.to_string(), card);
}

/// Receives `<Key> <Value>` configuration directives. A factory rejects
/// keys it does not own with `UNKNOWN_KEY`.
pub trait Configurable: Send + Sync {
    /// Apply one configuration pair.
    fn configure(&self, key: &str, value: &str) -> DmResult<()>;
}

/// Builds [`Authn`] implementations, possibly decorating `lower`.
pub trait AuthnFactory: Send + Sync {
    /// Create the product, wrapping `lower` when decorating.
    fn create_authn(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn Authn>>,
    ) -> DmResult<Box<dyn Authn>>;
}

/// Builds [`InodeStore`] implementations, possibly decorating `lower`.
pub trait InodeFactory: Send + Sync {
    /// Create the product, wrapping `lower` when decorating.
    fn create_inode(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn InodeStore>>,
    ) -> DmResult<Box<dyn InodeStore>>;
}

/// Builds [`Catalog`] implementations, possibly decorating `lower`.
pub trait CatalogFactory: Send + Sync {
    /// Create the product, wrapping `lower` when decorating.
    fn create_catalog(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn Catalog>>,
    ) -> DmResult<Box<dyn Catalog>>;
}

/// Builds [`PoolManager`] implementations, possibly decorating `lower`.
pub trait PoolManagerFactory: Send + Sync {
    /// Create the product, wrapping `lower` when decorating.
    fn create_pool_manager(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn PoolManager>>,
    ) -> DmResult<Box<dyn PoolManager>>;
}

/// Builds [`PoolDriver`] implementations for one pool type.
pub trait PoolDriverFactory: Send + Sync {
    /// Create the product, wrapping `lower` when decorating.
    fn create_pool_driver(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn PoolDriver>>,
    ) -> DmResult<Box<dyn PoolDriver>>;
}

/// Builds [`IoDriver`] implementations, possibly decorating `lower`.
pub trait IoDriverFactory: Send + Sync {
    /// Create the product, wrapping `lower` when decorating.
    fn create_io_driver(
        &self,
        manager: &Arc<PluginManager>,
        lower: Option<Box<dyn IoDriver>>,
    ) -> DmResult<Box<dyn IoDriver>>;
}

/// Owns the factory lists and the configuration state shared by every
/// stack instance of the process.
#[derive(Default)]
pub struct PluginManager {
    configurables: Vec<Arc<dyn Configurable>>,
    authn_factories: Vec<Arc<dyn AuthnFactory>>,
    inode_factories: Vec<Arc<dyn InodeFactory>>,
    catalog_factories: Vec<Arc<dyn CatalogFactory>>,
    pool_manager_factories: Vec<Arc<dyn PoolManagerFactory>>,
    pool_driver_factories: HashMap<String, Vec<Arc<dyn PoolDriverFactory>>>,
    io_factories: Vec<Arc<dyn IoDriverFactory>>,
    loaded: Vec<(String, PathBuf)>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl PluginManager {
    /// An empty manager; nothing is loaded until `LoadPlugin` runs.
    pub fn new() -> PluginManager {
        PluginManager::default()
    }

    /// Resolve and register a plug-in by id. The path is recorded for
    /// diagnostics.
    pub fn load_plugin(&mut self, id: &str, path: &str) -> DmResult<()> {
        let card = registry().lock().get(id).copied().ok_or_else(|| {
            DmError::new(
                ErrorCode::NO_SUCH_SYMBOL,
                format!("no plug-in registered under id '{id}'"),
            )
        })?;
        if card.api_version != API_VERSION {
            return Err(DmError::new(
                ErrorCode::API_VERSION_MISMATCH,
                format!(
                    "plug-in '{id}' speaks api version {}, this build speaks {}",
                    card.api_version, API_VERSION
                ),
            ));
        }
        if self.loaded.iter().any(|(l, _)| l == id) {
            warn!("plug-in '{id}' loaded more than once");
        }
        (card.register)(self)?;
        self.loaded.push((id.to_string(), PathBuf::from(path)));
        info!("loaded plug-in '{id}' from {path}");
        Ok(())
    }

    /// Dispatch a `<Key> <Value>` pair to every registered factory.
    /// `UNKNOWN_KEY` when no factory claims it.
    pub fn configure(&mut self, key: &str, value: &str) -> DmResult<()> {
        let mut accepted = false;
        for c in &self.configurables {
            match c.configure(key, value) {
                Ok(()) => accepted = true,
                Err(e) if e.code() == ErrorCode::UNKNOWN_KEY => {}
                Err(e) => return Err(e),
            }
        }
        if accepted {
            debug!("configured {key}");
            Ok(())
        } else {
            Err(DmError::new(
                ErrorCode::UNKNOWN_KEY,
                format!("no plug-in accepts the configuration key '{key}'"),
            ))
        }
    }

    /// Read a configuration file: `LoadPlugin <id> <path>`,
    /// `Include <file>`, `#` comments, and `<Key> <Value>` pairs. A key no
    /// factory claims is logged and skipped, never a global failure.
    pub fn load_configuration(&mut self, path: impl AsRef<Path>) -> DmResult<()> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DmError::new(
                ErrorCode::configuration(libc::ENOENT as u32),
                format!("can not read configuration {}: {e}", path.display()),
            )
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.splitn(2, char::is_whitespace);
            let directive = words.next().unwrap_or_default();
            let rest = words.next().unwrap_or("").trim();

            match directive {
                "LoadPlugin" => {
                    let mut parts = rest.splitn(2, char::is_whitespace);
                    let id = parts.next().unwrap_or_default();
                    let lib = parts.next().unwrap_or("").trim();
                    if id.is_empty() {
                        return Err(DmError::new(
                            ErrorCode::MALFORMED,
                            format!("{}:{}: LoadPlugin needs an id", path.display(), lineno + 1),
                        ));
                    }
                    self.load_plugin(id, lib)?;
                }
                "Include" => {
                    let included = if Path::new(rest).is_absolute() {
                        PathBuf::from(rest)
                    } else {
                        base.join(rest)
                    };
                    self.load_configuration(included)?;
                }
                key => match self.configure(key, rest) {
                    Ok(()) => {}
                    Err(e) if e.code() == ErrorCode::UNKNOWN_KEY => {
                        warn!("{}:{}: {e}", path.display(), lineno + 1);
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Register a configuration receiver.
    pub fn register_configurable(&mut self, c: Arc<dyn Configurable>) {
        self.configurables.push(c);
    }

    /// Register an [`Authn`] factory on top of the current chain.
    pub fn register_authn_factory(&mut self, f: Arc<dyn AuthnFactory>) {
        self.authn_factories.push(f);
    }

    /// Register an [`InodeStore`] factory on top of the current chain.
    pub fn register_inode_factory(&mut self, f: Arc<dyn InodeFactory>) {
        self.inode_factories.push(f);
    }

    /// Register a [`Catalog`] factory on top of the current chain.
    pub fn register_catalog_factory(&mut self, f: Arc<dyn CatalogFactory>) {
        self.catalog_factories.push(f);
    }

    /// Register a [`PoolManager`] factory on top of the current chain.
    pub fn register_pool_manager_factory(&mut self, f: Arc<dyn PoolManagerFactory>) {
        self.pool_manager_factories.push(f);
    }

    /// Register a [`PoolDriver`] factory for a pool type.
    pub fn register_pool_driver_factory(&mut self, pool_type: &str, f: Arc<dyn PoolDriverFactory>) {
        self.pool_driver_factories
            .entry(pool_type.to_string())
            .or_default()
            .push(f);
    }

    /// Register an [`IoDriver`] factory on top of the current chain.
    pub fn register_io_factory(&mut self, f: Arc<dyn IoDriverFactory>) {
        self.io_factories.push(f);
    }

    /// Build the authn chain.
    pub fn instantiate_authn(self: &Arc<Self>) -> DmResult<Box<dyn Authn>> {
        let mut product = None;
        for f in &self.authn_factories {
            product = Some(f.create_authn(self, product)?);
        }
        product.ok_or_else(|| DmError::new(ErrorCode::NO_AUTHN, "no authn plug-in loaded"))
    }

    /// Build the inode-store chain.
    pub fn instantiate_inode(self: &Arc<Self>) -> DmResult<Box<dyn InodeStore>> {
        let mut product = None;
        for f in &self.inode_factories {
            product = Some(f.create_inode(self, product)?);
        }
        product.ok_or_else(|| DmError::new(ErrorCode::NO_INODE, "no inode plug-in loaded"))
    }

    /// Build the catalog chain.
    pub fn instantiate_catalog(self: &Arc<Self>) -> DmResult<Box<dyn Catalog>> {
        let mut product = None;
        for f in &self.catalog_factories {
            product = Some(f.create_catalog(self, product)?);
        }
        product.ok_or_else(|| DmError::new(ErrorCode::NO_CATALOG, "no catalog plug-in loaded"))
    }

    /// Build the pool-manager chain.
    pub fn instantiate_pool_manager(self: &Arc<Self>) -> DmResult<Box<dyn PoolManager>> {
        let mut product = None;
        for f in &self.pool_manager_factories {
            product = Some(f.create_pool_manager(self, product)?);
        }
        product
            .ok_or_else(|| DmError::new(ErrorCode::NO_POOL_MANAGER, "no pool manager plug-in loaded"))
    }

    /// Build the driver chain for one pool type (`UNKNOWN_POOL_TYPE` when
    /// nothing is registered for it).
    pub fn instantiate_pool_driver(self: &Arc<Self>, pool_type: &str) -> DmResult<Box<dyn PoolDriver>> {
        let factories = self.pool_driver_factories.get(pool_type).ok_or_else(|| {
            DmError::new(
                ErrorCode::UNKNOWN_POOL_TYPE,
                format!("no driver for pool type '{pool_type}'"),
            )
        })?;
        let mut product = None;
        for f in factories {
            product = Some(f.create_pool_driver(self, product)?);
        }
        product.ok_or_else(|| {
            DmError::new(
                ErrorCode::UNKNOWN_POOL_TYPE,
                format!("no driver for pool type '{pool_type}'"),
            )
        })
    }

    /// Pool types with a registered driver.
    pub fn known_pool_types(&self) -> Vec<String> {
        self.pool_driver_factories.keys().cloned().collect()
    }

    /// Build the I/O-driver chain.
    pub fn instantiate_io_driver(self: &Arc<Self>) -> DmResult<Box<dyn IoDriver>> {
        let mut product = None;
        for f in &self.io_factories {
            product = Some(f.create_io_driver(self, product)?);
        }
        product.ok_or_else(|| DmError::new(ErrorCode::NO_IO, "no io plug-in loaded"))
    }

    /// Ids and paths of the loaded plug-ins, in load order.
    pub fn loaded_plugins(&self) -> &[(String, PathBuf)] {
        &self.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct OneKey;

    impl Configurable for OneKey {
        fn configure(&self, key: &str, _value: &str) -> DmResult<()> {
            if key == "Accepted" {
                Ok(())
            } else {
                Err(DmError::new(ErrorCode::UNKNOWN_KEY, key.to_string()))
            }
        }
    }

    #[test]
    fn test_unknown_plugin_id() {
        let mut pm = PluginManager::new();
        let err = pm.load_plugin("no_such_plugin", "/usr/lib/nothing.so").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NO_SUCH_SYMBOL);
    }

    #[test]
    fn test_configure_dispatch() {
        let mut pm = PluginManager::new();
        pm.register_configurable(Arc::new(OneKey));
        pm.configure("Accepted", "1").unwrap();
        let err = pm.configure("Rejected", "1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UNKNOWN_KEY);
    }

    #[test]
    fn test_unclaimed_key_in_file_is_not_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "Accepted on").unwrap();
        writeln!(file, "SomebodyElses key").unwrap();
        file.flush().unwrap();

        let mut pm = PluginManager::new();
        pm.register_configurable(Arc::new(OneKey));
        pm.load_configuration(file.path()).unwrap();
    }

    #[test]
    fn test_include_directive() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner.conf");
        std::fs::write(&inner, "Accepted yes\n").unwrap();
        let outer = dir.path().join("outer.conf");
        std::fs::write(&outer, "Include inner.conf\n").unwrap();

        let mut pm = PluginManager::new();
        pm.register_configurable(Arc::new(OneKey));
        pm.load_configuration(&outer).unwrap();
    }

    #[test]
    fn test_missing_interface_errors() {
        let pm = Arc::new(PluginManager::new());
        assert_eq!(pm.instantiate_authn().unwrap_err().code(), ErrorCode::NO_AUTHN);
        assert_eq!(pm.instantiate_catalog().unwrap_err().code(), ErrorCode::NO_CATALOG);
        assert_eq!(
            pm.instantiate_pool_driver("tape").unwrap_err().code(),
            ErrorCode::UNKNOWN_POOL_TYPE
        );
    }
}
