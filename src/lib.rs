//! Pluggable storage catalog and data-access middleware for replicated
//! disk pools.
//!
//! `diskcat` mediates between clients speaking in logical file names and
//! the disk servers that actually hold the bytes: it resolves POSIX-like
//! operations against a persistent metadata store, enforces identity-based
//! authorization down to ACL granularity, selects replicas for reads,
//! allocates space for writes, and mints capability tokens that let disk
//! nodes admit the subsequent I/O without consulting the catalog again.
//!
//! The crate is organized as a plug-in stack: a [`PluginManager`] loads
//! plug-ins and dispatches configuration to their factories, and a
//! per-request [`StackInstance`] lazily instantiates one implementation
//! chain per interface ([`Authn`], [`InodeStore`], [`Catalog`],
//! [`PoolManager`], [`IoDriver`]). Factories registered later decorate the
//! ones registered before them, which is how the metadata cache slots in
//! above the store. The bundled plug-ins live in [`builtin`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::acl::{Acl, AclEntry};
pub use crate::authn::Authn;
pub use crate::catalog::Catalog;
pub use crate::errors::{DmError, DmResult, DmStatus, ErrorCategory, ErrorCode};
pub use crate::extensible::Extensible;
pub use crate::inode::{
    DirCursor, ExtendedStat, FileStatus, InodeId, InodeStore, Replica, ReplicaStatus,
    ReplicaType, SymLink, ROOT_INODE,
};
pub use crate::iodriver::{IoDriver, IoHandler, IoStat, OpenFlags, Whence};
pub use crate::mdcache::{CacheConfig, MetadataCache};
pub use crate::plugin::{register_plugin, PluginIdCard, PluginManager, API_VERSION};
pub use crate::pool_container::{Lease, PoolContainer, PoolElementFactory};
pub use crate::pooldriver::PoolDriver;
pub use crate::poolmanager::{Chunk, Location, Pool, PoolAvailability, PoolManager};
pub use crate::security::{
    check_permissions, GroupInfo, SecurityContext, SecurityCredentials, UserInfo,
};
pub use crate::stack::StackInstance;
pub use crate::token::{generate_token, validate_token, TokenResult};
pub use crate::url::Url;

pub mod acl;
pub mod authn;
pub mod builtin;
pub mod capi;
pub mod catalog;
pub mod errors;
pub mod extensible;
pub mod inode;
pub mod iodriver;
pub mod mdcache;
pub mod plugin;
pub mod pool_container;
pub mod pooldriver;
pub mod poolmanager;
pub mod security;
pub mod stack;
pub mod token;
pub mod url;
