//! Pool manager interface: replica placement and retrieval.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::DmResult;
use crate::extensible::Extensible;
use crate::security::SecurityContext;

/// A named group of filesystems managed as a unit. The type string selects
/// the [`PoolDriver`](crate::pooldriver::PoolDriver) that understands it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    /// Unique pool name.
    pub name: String,
    /// Pool type (driver key).
    pub pool_type: String,
    /// Driver-defined properties (capacity, free space, defsize, ...).
    pub properties: Extensible,
}

/// Availability filter for [`PoolManager::get_pools`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolAvailability {
    /// Every pool, whatever its state.
    Any,
    /// Only pools that serve neither reads nor writes.
    None,
    /// Pools currently able to serve reads.
    ForRead,
    /// Pools currently able to accept writes.
    ForWrite,
    /// Pools able to do both.
    ForBoth,
}

/// One piece of a file on a disk node: where to contact, what range, and the
/// query parameters (tokens included) the node expects.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    /// Disk server to contact.
    pub host: String,
    /// Physical path on that server.
    pub path: String,
    /// Byte offset of this chunk within the file.
    pub offset: u64,
    /// Chunk size in bytes.
    pub size: u64,
    /// Query parameters; always carries a `token`.
    pub query: Extensible,
}

/// An ordered list of chunks covering a file. Simple disk pools return a
/// single chunk; striped pools may return several.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Location {
    /// The chunks, in file order.
    pub chunks: Vec<Chunk>,
}

impl Location {
    /// A single-chunk location.
    pub fn single(chunk: Chunk) -> Location {
        Location {
            chunks: vec![chunk],
        }
    }
}

/// Replica placement and retrieval across the configured pools.
pub trait PoolManager: Send {
    /// Adopt the security context all subsequent calls run under.
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>);

    /// The pools, filtered by availability.
    fn get_pools(&mut self, availability: PoolAvailability) -> DmResult<Vec<Pool>>;

    /// One pool by name (`NO_SUCH_POOL` when absent).
    fn get_pool(&mut self, name: &str) -> DmResult<Pool>;

    /// Pick a replica of `path` for reading and return where to fetch it.
    fn where_to_read(&mut self, path: &str) -> DmResult<Location>;

    /// Allocate a replica location for writing `path`; creates (or
    /// truncates) the catalog entry.
    fn where_to_write(&mut self, path: &str) -> DmResult<Location>;

    /// Complete a write: finalize with the disk-pool daemon, record the
    /// replica and close out the inode.
    fn done_writing(&mut self, host: &str, rfn: &str, params: &Extensible) -> DmResult<()>;

    /// Release a pending write allocation. Safe to call more than once.
    fn cancel_write(&mut self, location: &Location) -> DmResult<()>;
}
