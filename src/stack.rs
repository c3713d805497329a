//! The per-request stack of interface implementations.
//!
//! A [`StackInstance`] lazily instantiates at most one live authn, inode
//! store, catalog, pool manager and I/O driver from the manager's factory
//! chains, and pushes the active security context into every component it
//! has built. A stack is not thread safe: concurrent requests use separate
//! stacks drawing from the shared backing resources (connection pool,
//! metadata cache, factories).

use std::sync::Arc;

use crate::authn::Authn;
use crate::catalog::Catalog;
use crate::errors::DmResult;
use crate::inode::InodeStore;
use crate::iodriver::IoDriver;
use crate::plugin::PluginManager;
use crate::poolmanager::PoolManager;
use crate::security::{SecurityContext, SecurityCredentials};

/// One client's view of the stack.
pub struct StackInstance {
    manager: Arc<PluginManager>,
    authn: Option<Box<dyn Authn>>,
    inode: Option<Box<dyn InodeStore>>,
    catalog: Option<Box<dyn Catalog>>,
    pool_manager: Option<Box<dyn PoolManager>>,
    io_driver: Option<Box<dyn IoDriver>>,
    security_context: Option<Arc<SecurityContext>>,
}

impl std::fmt::Debug for StackInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackInstance")
            .field("has_context", &self.security_context.is_some())
            .finish()
    }
}

impl StackInstance {
    /// Create an empty stack over the manager's factories.
    pub fn new(manager: Arc<PluginManager>) -> StackInstance {
        StackInstance {
            manager,
            authn: None,
            inode: None,
            catalog: None,
            pool_manager: None,
            io_driver: None,
            security_context: None,
        }
    }

    /// The plug-in manager behind this stack.
    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Resolve credentials through the authn chain and adopt the resulting
    /// context.
    pub fn set_security_credentials(
        &mut self,
        credentials: &SecurityCredentials,
    ) -> DmResult<()> {
        let context = self.authn()?.create_security_context(credentials)?;
        self.set_security_context(Arc::new(context));
        Ok(())
    }

    /// Adopt a context, propagating it to every already-instantiated
    /// component.
    pub fn set_security_context(&mut self, context: Arc<SecurityContext>) {
        self.security_context = Some(Arc::clone(&context));
        let ctx = Some(context);
        if let Some(c) = self.catalog.as_mut() {
            c.set_security_context(ctx.clone());
        }
        if let Some(p) = self.pool_manager.as_mut() {
            p.set_security_context(ctx.clone());
        }
        if let Some(io) = self.io_driver.as_mut() {
            io.set_security_context(ctx.clone());
        }
    }

    /// The active context, if any.
    pub fn security_context(&self) -> Option<&Arc<SecurityContext>> {
        self.security_context.as_ref()
    }

    /// The authn component, instantiated on first use.
    pub fn authn(&mut self) -> DmResult<&mut dyn Authn> {
        if self.authn.is_none() {
            self.authn = Some(self.manager.instantiate_authn()?);
        }
        Ok(self.authn.as_mut().unwrap().as_mut())
    }

    /// The low-level inode store, instantiated on first use.
    pub fn inode(&mut self) -> DmResult<&mut dyn InodeStore> {
        if self.inode.is_none() {
            self.inode = Some(self.manager.instantiate_inode()?);
        }
        Ok(self.inode.as_mut().unwrap().as_mut())
    }

    /// The catalog, instantiated on first use.
    pub fn catalog(&mut self) -> DmResult<&mut dyn Catalog> {
        if self.catalog.is_none() {
            let mut catalog = self.manager.instantiate_catalog()?;
            if let Some(ctx) = &self.security_context {
                catalog.set_security_context(Some(Arc::clone(ctx)));
            }
            self.catalog = Some(catalog);
        }
        Ok(self.catalog.as_mut().unwrap().as_mut())
    }

    /// The pool manager, instantiated on first use.
    pub fn pool_manager(&mut self) -> DmResult<&mut dyn PoolManager> {
        if self.pool_manager.is_none() {
            let mut pm = self.manager.instantiate_pool_manager()?;
            if let Some(ctx) = &self.security_context {
                pm.set_security_context(Some(Arc::clone(ctx)));
            }
            self.pool_manager = Some(pm);
        }
        Ok(self.pool_manager.as_mut().unwrap().as_mut())
    }

    /// The I/O driver, instantiated on first use.
    pub fn io_driver(&mut self) -> DmResult<&mut dyn IoDriver> {
        if self.io_driver.is_none() {
            let mut io = self.manager.instantiate_io_driver()?;
            if let Some(ctx) = &self.security_context {
                io.set_security_context(Some(Arc::clone(ctx)));
            }
            self.io_driver = Some(io);
        }
        Ok(self.io_driver.as_mut().unwrap().as_mut())
    }
}
