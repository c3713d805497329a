//! Metadata cache: TTL-bounded entry caching with pending-request
//! coalescing.
//!
//! Entries are keyed twice, by inode id and by `(parent inode, name)`, both
//! keys pointing at one shared entry. Stat and replica ("locations")
//! information carry independent status fields: a lookup that finds `NoInfo`
//! flips it to `InProgress` and becomes responsible for filling it, while
//! peers wait on the entry's condition variable and recheck on every
//! wakeup. The cache plugs into the stack as a decorator over the inode
//! store, registered by the `mdcache` plug-in; capacity 0 disables caching
//! entirely and the decorator steps aside.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::acl::Acl;
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::inode::{DirCursor, ExtendedStat, InodeId, InodeStore, Replica, SymLink};
use crate::plugin::{Configurable, InodeFactory, PluginIdCard, PluginManager};

/// Cache tuning, from the `mdcache.*` configuration keys.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum number of cached entries; 0 disables the cache.
    pub max_items: usize,
    /// Lifetime of a positive entry after its last reference.
    pub item_ttl: Duration,
    /// Absolute maximum lifetime of a positive entry.
    pub item_max_ttl: Duration,
    /// Lifetime of a negative (not-found) entry.
    pub item_ttl_negative: Duration,
    /// How long one call waits for a peer's in-progress lookup before
    /// fetching on its own.
    pub wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            max_items: 1_000_000,
            item_ttl: Duration::from_secs(3600),
            item_max_ttl: Duration::from_secs(7200),
            item_ttl_negative: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(3),
        }
    }
}

/// Fill state of one information kind within an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoStatus {
    /// Nothing known; the next lookup takes responsibility.
    NoInfo,
    /// Somebody is filling it; wait and recheck.
    InProgress,
    /// Filled.
    Ok,
    /// The store answered "no such entry".
    NotFound,
}

struct EntryData {
    stat_status: InfoStatus,
    stat: Option<ExtendedStat>,
    loc_status: InfoStatus,
    replicas: Vec<Replica>,
    last_update: Instant,
    last_request: Instant,
    last_reference: Instant,
}

impl EntryData {
    fn new() -> EntryData {
        let now = Instant::now();
        EntryData {
            stat_status: InfoStatus::NoInfo,
            stat: None,
            loc_status: InfoStatus::NoInfo,
            replicas: Vec::new(),
            last_update: now,
            last_request: now,
            last_reference: now,
        }
    }

    fn reset(&mut self) {
        self.stat_status = InfoStatus::NoInfo;
        self.stat = None;
        self.loc_status = InfoStatus::NoInfo;
        self.replicas.clear();
    }

    fn pending(&self) -> bool {
        self.stat_status == InfoStatus::InProgress || self.loc_status == InfoStatus::InProgress
    }
}

/// A shared cache entry: state under its own mutex, waiters on the condvar.
pub struct CacheEntry {
    state: Mutex<EntryData>,
    updated: Condvar,
}

impl CacheEntry {
    fn new() -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            state: Mutex::new(EntryData::new()),
            updated: Condvar::new(),
        })
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("stat_status", &state.stat_status)
            .field("loc_status", &state.loc_status)
            .finish()
    }
}

type NameKey = (InodeId, String);

#[derive(Default)]
struct Maps {
    by_id: HashMap<InodeId, Arc<CacheEntry>>,
    by_name: HashMap<NameKey, Arc<CacheEntry>>,
    lru_id: BTreeMap<u64, InodeId>,
    id_tick: HashMap<InodeId, u64>,
    lru_name: BTreeMap<u64, NameKey>,
    name_tick: HashMap<NameKey, u64>,
    tick: u64,
}

impl Maps {
    fn touch_id(&mut self, ino: InodeId) {
        self.tick += 1;
        if let Some(old) = self.id_tick.insert(ino, self.tick) {
            self.lru_id.remove(&old);
        }
        self.lru_id.insert(self.tick, ino);
    }

    fn touch_name(&mut self, key: &NameKey) {
        self.tick += 1;
        if let Some(old) = self.name_tick.insert(key.clone(), self.tick) {
            self.lru_name.remove(&old);
        }
        self.lru_name.insert(self.tick, key.clone());
    }

    fn remove_id(&mut self, ino: InodeId) {
        self.by_id.remove(&ino);
        if let Some(tick) = self.id_tick.remove(&ino) {
            self.lru_id.remove(&tick);
        }
    }

    fn remove_name(&mut self, key: &NameKey) {
        self.by_name.remove(key);
        if let Some(tick) = self.name_tick.remove(key) {
            self.lru_name.remove(&tick);
        }
    }

    fn len(&self) -> usize {
        self.by_id.len() + self.by_name.len()
    }
}

/// The dual-keyed entry cache. Thread safe and shared across stacks.
pub struct MetadataCache {
    config: CacheConfig,
    maps: Mutex<Maps>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("len", &self.len())
            .field("max_items", &self.config.max_items)
            .finish()
    }
}

impl MetadataCache {
    /// Create a cache with this tuning.
    pub fn new(config: CacheConfig) -> MetadataCache {
        MetadataCache {
            config,
            maps: Mutex::new(Maps::default()),
        }
    }

    /// The tuning in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of key registrations currently held.
    pub fn len(&self) -> usize {
        self.maps.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for an inode id, created as `NoInfo` when absent.
    pub fn entry_by_id(&self, ino: InodeId) -> Arc<CacheEntry> {
        let mut maps = self.maps.lock();
        maps.touch_id(ino);
        let entry = maps
            .by_id
            .entry(ino)
            .or_insert_with(CacheEntry::new)
            .clone();
        drop(maps);
        self.shrink_if_needed();
        entry
    }

    /// Entry for a `(parent, name)` key, created as `NoInfo` when absent.
    pub fn entry_by_name(&self, parent: InodeId, name: &str) -> Arc<CacheEntry> {
        let key = (parent, name.to_string());
        let mut maps = self.maps.lock();
        maps.touch_name(&key);
        let entry = maps
            .by_name
            .entry(key)
            .or_insert_with(CacheEntry::new)
            .clone();
        drop(maps);
        self.shrink_if_needed();
        entry
    }

    /// Make both keys of a freshly statted entry point at the same object.
    /// When two distinct objects grew under the two keys, the name key is
    /// redirected to the id one and waiters on the orphan are released.
    pub fn link_keys(&self, ino: InodeId, parent: InodeId, name: &str) {
        let key = (parent, name.to_string());
        let mut maps = self.maps.lock();
        let id_entry = match maps.by_id.get(&ino) {
            Some(e) => Arc::clone(e),
            None => return,
        };
        match maps.by_name.get(&key) {
            Some(existing) if Arc::ptr_eq(existing, &id_entry) => {}
            Some(existing) => {
                let orphan = Arc::clone(existing);
                maps.touch_name(&key);
                maps.by_name.insert(key, Arc::clone(&id_entry));
                drop(maps);
                let mut state = orphan.state.lock();
                state.reset();
                orphan.updated.notify_all();
                return;
            }
            None => {
                maps.touch_name(&key);
                maps.by_name.insert(key, id_entry);
            }
        }
    }

    fn wipe(entry: &Arc<CacheEntry>) {
        let mut state = entry.state.lock();
        state.reset();
        entry.updated.notify_all();
    }

    /// Forget everything about an inode; waiters wake and refetch.
    pub fn wipe_by_id(&self, ino: InodeId) {
        let entry = self.maps.lock().by_id.get(&ino).cloned();
        if let Some(e) = entry {
            Self::wipe(&e);
        }
    }

    /// Forget everything under a `(parent, name)` key.
    pub fn wipe_by_name(&self, parent: InodeId, name: &str) {
        let key = (parent, name.to_string());
        let entry = self.maps.lock().by_name.get(&key).cloned();
        if let Some(e) = entry {
            Self::wipe(&e);
        }
    }

    /// Forget only the replica list of an inode.
    pub fn wipe_locations(&self, ino: InodeId) {
        let entry = self.maps.lock().by_id.get(&ino).cloned();
        if let Some(e) = entry {
            let mut state = e.state.lock();
            state.loc_status = InfoStatus::NoInfo;
            state.replicas.clear();
            e.updated.notify_all();
        }
    }

    /// Purge expired entries; then, while over capacity, purge LRU victims.
    /// Entries with an in-progress lookup are never purged.
    pub fn maintain(&self) {
        let mut maps = self.maps.lock();
        let config = &self.config;
        let now = Instant::now();

        let expired = |entry: &Arc<CacheEntry>| -> bool {
            let state = entry.state.lock();
            if state.pending() {
                return false;
            }
            if state.stat_status == InfoStatus::NotFound {
                return now.duration_since(state.last_update) > config.item_ttl_negative;
            }
            now.duration_since(state.last_reference) > config.item_ttl
                || now.duration_since(state.last_update) > config.item_max_ttl
        };

        let stale_ids: Vec<InodeId> = maps
            .by_id
            .iter()
            .filter(|(_, e)| expired(e))
            .map(|(k, _)| *k)
            .collect();
        for ino in stale_ids {
            maps.remove_id(ino);
        }
        let stale_names: Vec<NameKey> = maps
            .by_name
            .iter()
            .filter(|(_, e)| expired(e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_names {
            maps.remove_name(&key);
        }

        let mut guard = 0usize;
        while maps.len() > self.config.max_items && guard < 2 * self.config.max_items + 16 {
            guard += 1;
            let id_victim = maps.lru_id.iter().next().map(|(t, k)| (*t, *k));
            let name_victim = maps.lru_name.iter().next().map(|(t, k)| (*t, k.clone()));
            match (id_victim, name_victim) {
                (Some((it, ino)), Some((nt, _))) if it <= nt => {
                    if !self.evict_id(&mut maps, ino) {
                        continue;
                    }
                }
                (_, Some((_, key))) => {
                    if !self.evict_name(&mut maps, &key) {
                        continue;
                    }
                }
                (Some((_, ino)), None) => {
                    if !self.evict_id(&mut maps, ino) {
                        continue;
                    }
                }
                (None, None) => break,
            }
        }
        if maps.len() > self.config.max_items {
            warn!(
                "metadata cache over capacity ({} > {}) with pending entries",
                maps.len(),
                self.config.max_items
            );
        }
    }

    fn evict_id(&self, maps: &mut Maps, ino: InodeId) -> bool {
        let pending = maps
            .by_id
            .get(&ino)
            .map(|e| e.state.lock().pending())
            .unwrap_or(false);
        if pending {
            // keep it, move to the warm end
            maps.touch_id(ino);
            false
        } else {
            maps.remove_id(ino);
            true
        }
    }

    fn evict_name(&self, maps: &mut Maps, key: &NameKey) -> bool {
        let pending = maps
            .by_name
            .get(key)
            .map(|e| e.state.lock().pending())
            .unwrap_or(false);
        if pending {
            maps.touch_name(key);
            false
        } else {
            maps.remove_name(key);
            true
        }
    }

    fn shrink_if_needed(&self) {
        if self.len() > self.config.max_items {
            self.maintain();
        }
    }
}

enum StatKey<'a> {
    Id(InodeId),
    Name(InodeId, &'a str),
}

/// Inode-store decorator backed by a shared [`MetadataCache`].
pub struct CachingInode {
    inner: Box<dyn InodeStore>,
    cache: Arc<MetadataCache>,
}

impl std::fmt::Debug for CachingInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingInode").finish()
    }
}

impl CachingInode {
    /// Wrap a store.
    pub fn new(inner: Box<dyn InodeStore>, cache: Arc<MetadataCache>) -> CachingInode {
        CachingInode { inner, cache }
    }

    fn cached_stat(&mut self, key: StatKey<'_>) -> DmResult<ExtendedStat> {
        let entry = match &key {
            StatKey::Id(ino) => self.cache.entry_by_id(*ino),
            StatKey::Name(parent, name) => self.cache.entry_by_name(*parent, name),
        };
        let config = self.cache.config().clone();

        let fetch = {
            let mut state = entry.state.lock();
            loop {
                let now = Instant::now();
                match state.stat_status {
                    InfoStatus::Ok => {
                        let fresh = now.duration_since(state.last_update) <= config.item_ttl
                            && now.duration_since(state.last_update) <= config.item_max_ttl;
                        if fresh {
                            state.last_reference = now;
                            return Ok(state.stat.clone().expect("cached stat present"));
                        }
                        state.stat_status = InfoStatus::InProgress;
                        state.last_request = now;
                        break true;
                    }
                    InfoStatus::NotFound => {
                        if now.duration_since(state.last_update) <= config.item_ttl_negative {
                            return Err(not_found(&key));
                        }
                        state.stat_status = InfoStatus::InProgress;
                        state.last_request = now;
                        break true;
                    }
                    InfoStatus::NoInfo => {
                        state.stat_status = InfoStatus::InProgress;
                        state.last_request = now;
                        break true;
                    }
                    InfoStatus::InProgress => {
                        let timed_out = entry
                            .updated
                            .wait_for(&mut state, config.wait_timeout)
                            .timed_out();
                        if timed_out {
                            debug!("gave up waiting for a peer lookup, fetching directly");
                            break true;
                        }
                        // rechecked on the next loop turn
                    }
                }
            }
        };
        debug_assert!(fetch);

        let result = match &key {
            StatKey::Id(ino) => self.inner.extended_stat(*ino),
            StatKey::Name(parent, name) => self.inner.extended_stat_by_name(*parent, name),
        };

        let mut state = entry.state.lock();
        let now = Instant::now();
        match &result {
            Ok(meta) => {
                state.stat_status = InfoStatus::Ok;
                state.stat = Some(meta.clone());
                state.last_update = now;
                state.last_reference = now;
            }
            Err(e) if e.code() == ErrorCode::NO_SUCH_FILE => {
                state.stat_status = InfoStatus::NotFound;
                state.stat = None;
                state.last_update = now;
            }
            Err(_) => {
                // transient failure; let somebody else retry
                state.stat_status = InfoStatus::NoInfo;
            }
        }
        entry.updated.notify_all();
        drop(state);

        if let Ok(meta) = &result {
            self.cache.link_keys(meta.ino, meta.parent, &meta.name);
        }
        result
    }

    /// Forget both keys of an inode, looking the name key up from the
    /// store when needed.
    fn wipe_entry(&mut self, ino: InodeId, known: Option<&ExtendedStat>) {
        match known {
            Some(meta) => {
                self.cache.wipe_by_id(ino);
                self.cache.wipe_by_name(meta.parent, &meta.name);
            }
            None => self.cache.wipe_by_id(ino),
        }
    }
}

fn not_found(key: &StatKey<'_>) -> DmError {
    match key {
        StatKey::Id(ino) => DmError::new(
            ErrorCode::NO_SUCH_FILE,
            format!("no such file or directory: #{ino}"),
        ),
        StatKey::Name(parent, name) => DmError::new(
            ErrorCode::NO_SUCH_FILE,
            format!("no such file or directory: {name} under #{parent}"),
        ),
    }
}

impl InodeStore for CachingInode {
    fn begin(&mut self) -> DmResult<()> {
        self.inner.begin()
    }

    fn commit(&mut self) -> DmResult<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> DmResult<()> {
        self.inner.rollback()
    }

    fn create(&mut self, f: &ExtendedStat) -> DmResult<ExtendedStat> {
        let created = self.inner.create(f)?;
        // the name key may hold a negative entry, and the parent's stat
        // (nlink, times) changed
        self.cache.wipe_by_name(created.parent, &created.name);
        self.cache.wipe_by_id(created.parent);
        Ok(created)
    }

    fn symlink(&mut self, ino: InodeId, target: &str) -> DmResult<()> {
        self.inner.symlink(ino, target)
    }

    fn unlink(&mut self, ino: InodeId) -> DmResult<()> {
        let known = self.inner.extended_stat(ino).ok();
        self.inner.unlink(ino)?;
        self.wipe_entry(ino, known.as_ref());
        if let Some(meta) = known {
            self.cache.wipe_by_id(meta.parent);
        }
        Ok(())
    }

    fn move_entry(&mut self, ino: InodeId, new_parent: InodeId) -> DmResult<()> {
        let known = self.inner.extended_stat(ino).ok();
        self.inner.move_entry(ino, new_parent)?;
        self.wipe_entry(ino, known.as_ref());
        if let Some(meta) = &known {
            self.cache.wipe_by_id(meta.parent);
        }
        self.cache.wipe_by_id(new_parent);
        Ok(())
    }

    fn rename_entry(&mut self, ino: InodeId, name: &str) -> DmResult<()> {
        let known = self.inner.extended_stat(ino).ok();
        self.inner.rename_entry(ino, name)?;
        self.wipe_entry(ino, known.as_ref());
        if let Some(meta) = &known {
            // the destination key may hold a negative entry
            self.cache.wipe_by_name(meta.parent, name);
        }
        Ok(())
    }

    fn extended_stat(&mut self, ino: InodeId) -> DmResult<ExtendedStat> {
        self.cached_stat(StatKey::Id(ino))
    }

    fn extended_stat_by_name(&mut self, parent: InodeId, name: &str) -> DmResult<ExtendedStat> {
        self.cached_stat(StatKey::Name(parent, name))
    }

    fn extended_stat_by_guid(&mut self, guid: &str) -> DmResult<ExtendedStat> {
        // guid lookups are rare; pass through
        self.inner.extended_stat_by_guid(guid)
    }

    fn read_link(&mut self, ino: InodeId) -> DmResult<SymLink> {
        self.inner.read_link(ino)
    }

    fn add_replica(&mut self, replica: &Replica) -> DmResult<Replica> {
        let added = self.inner.add_replica(replica)?;
        self.cache.wipe_locations(added.fileid);
        Ok(added)
    }

    fn delete_replica(&mut self, replica_id: i64) -> DmResult<()> {
        let fileid = self.inner.get_replica(replica_id).map(|r| r.fileid).ok();
        self.inner.delete_replica(replica_id)?;
        if let Some(fileid) = fileid {
            self.cache.wipe_locations(fileid);
        }
        Ok(())
    }

    fn get_replica(&mut self, replica_id: i64) -> DmResult<Replica> {
        self.inner.get_replica(replica_id)
    }

    fn get_replica_by_rfn(&mut self, rfn: &str) -> DmResult<Replica> {
        self.inner.get_replica_by_rfn(rfn)
    }

    fn update_replica(&mut self, replica: &Replica) -> DmResult<()> {
        self.inner.update_replica(replica)?;
        self.cache.wipe_locations(replica.fileid);
        Ok(())
    }

    fn get_replicas(&mut self, ino: InodeId) -> DmResult<Vec<Replica>> {
        let entry = self.cache.entry_by_id(ino);
        let config = self.cache.config().clone();
        {
            let mut state = entry.state.lock();
            loop {
                let now = Instant::now();
                match state.loc_status {
                    InfoStatus::Ok
                        if now.duration_since(state.last_update) <= config.item_ttl =>
                    {
                        state.last_reference = now;
                        return Ok(state.replicas.clone());
                    }
                    InfoStatus::InProgress => {
                        if entry
                            .updated
                            .wait_for(&mut state, config.wait_timeout)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    _ => {
                        state.loc_status = InfoStatus::InProgress;
                        state.last_request = now;
                        break;
                    }
                }
            }
        }

        let result = self.inner.get_replicas(ino);
        let mut state = entry.state.lock();
        match &result {
            Ok(replicas) => {
                state.loc_status = InfoStatus::Ok;
                state.replicas = replicas.clone();
                state.last_update = Instant::now();
                state.last_reference = state.last_update;
            }
            Err(_) => state.loc_status = InfoStatus::NoInfo,
        }
        entry.updated.notify_all();
        result
    }

    fn utime(&mut self, ino: InodeId, times: Option<(i64, i64)>) -> DmResult<()> {
        self.inner.utime(ino, times)?;
        self.cache.wipe_by_id(ino);
        Ok(())
    }

    fn set_mode(
        &mut self,
        ino: InodeId,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: u32,
        acl: Option<&Acl>,
    ) -> DmResult<()> {
        self.inner.set_mode(ino, uid, gid, mode, acl)?;
        self.cache.wipe_by_id(ino);
        Ok(())
    }

    fn set_size(&mut self, ino: InodeId, size: u64) -> DmResult<()> {
        self.inner.set_size(ino, size)?;
        self.cache.wipe_by_id(ino);
        Ok(())
    }

    fn set_checksum(&mut self, ino: InodeId, csumtype: &str, csumvalue: &str) -> DmResult<()> {
        self.inner.set_checksum(ino, csumtype, csumvalue)?;
        self.cache.wipe_by_id(ino);
        Ok(())
    }

    fn set_guid(&mut self, ino: InodeId, guid: &str) -> DmResult<()> {
        self.inner.set_guid(ino, guid)?;
        self.cache.wipe_by_id(ino);
        Ok(())
    }

    fn get_comment(&mut self, ino: InodeId) -> DmResult<String> {
        self.inner.get_comment(ino)
    }

    fn set_comment(&mut self, ino: InodeId, comment: &str) -> DmResult<()> {
        self.inner.set_comment(ino, comment)
    }

    fn delete_comment(&mut self, ino: InodeId) -> DmResult<()> {
        self.inner.delete_comment(ino)
    }

    fn update_xattrs(&mut self, ino: InodeId, attrs: &Extensible) -> DmResult<()> {
        self.inner.update_xattrs(ino, attrs)?;
        self.cache.wipe_by_id(ino);
        Ok(())
    }

    fn open_dir(&mut self, ino: InodeId) -> DmResult<Box<dyn DirCursor>> {
        self.inner.open_dir(ino)
    }
}

/// Factory state of the `mdcache` plug-in.
#[derive(Default)]
struct CacheFactory {
    config: RwLock<CacheConfig>,
    cache: Mutex<Option<Arc<MetadataCache>>>,
}

impl CacheFactory {
    fn shared_cache(&self) -> Arc<MetadataCache> {
        let mut slot = self.cache.lock();
        match &*slot {
            Some(cache) => Arc::clone(cache),
            None => {
                let cache = Arc::new(MetadataCache::new(self.config.read().clone()));
                *slot = Some(Arc::clone(&cache));
                cache
            }
        }
    }
}

impl Configurable for CacheFactory {
    fn configure(&self, key: &str, value: &str) -> DmResult<()> {
        let parse = |v: &str| -> DmResult<u64> {
            v.parse().map_err(|_| {
                DmError::new(
                    ErrorCode::INVALID_VALUE,
                    format!("'{value}' is not a number for {key}"),
                )
            })
        };
        let mut config = self.config.write();
        match key {
            "mdcache.maxitems" => config.max_items = parse(value)? as usize,
            "mdcache.itemttl" => config.item_ttl = Duration::from_secs(parse(value)?),
            "mdcache.itemmaxttl" => config.item_max_ttl = Duration::from_secs(parse(value)?),
            "mdcache.itemttl_negative" => {
                config.item_ttl_negative = Duration::from_secs(parse(value)?)
            }
            _ => return Err(DmError::new(ErrorCode::UNKNOWN_KEY, key.to_string())),
        }
        Ok(())
    }
}

impl InodeFactory for CacheFactory {
    fn create_inode(
        &self,
        _manager: &Arc<PluginManager>,
        lower: Option<Box<dyn InodeStore>>,
    ) -> DmResult<Box<dyn InodeStore>> {
        let lower = lower.ok_or_else(|| {
            DmError::new(
                ErrorCode::NO_INODE,
                "mdcache decorates an inode store; load one before it",
            )
        })?;
        if self.config.read().max_items == 0 {
            // pass-through mode
            return Ok(lower);
        }
        Ok(Box::new(CachingInode::new(lower, self.shared_cache())))
    }
}

pub(crate) fn register(manager: &mut PluginManager) -> DmResult<()> {
    let factory = Arc::new(CacheFactory::default());
    manager.register_configurable(Arc::clone(&factory) as Arc<dyn Configurable>);
    manager.register_inode_factory(factory);
    Ok(())
}

/// Id card of the `mdcache` plug-in.
pub(crate) const PLUGIN_MDCACHE: PluginIdCard = PluginIdCard {
    api_version: crate::plugin::API_VERSION,
    register,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CacheConfig {
        CacheConfig {
            max_items: 8,
            item_ttl: Duration::from_secs(60),
            item_max_ttl: Duration::from_secs(120),
            item_ttl_negative: Duration::from_secs(60),
            wait_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_entry_sharing_between_keys() {
        let cache = MetadataCache::new(quick_config());
        let by_id = cache.entry_by_id(42);
        {
            let mut state = by_id.state.lock();
            state.stat_status = InfoStatus::Ok;
            state.stat = Some(ExtendedStat {
                ino: 42,
                parent: 1,
                name: "f".to_string(),
                ..Default::default()
            });
        }
        let _ = cache.entry_by_name(1, "f");
        cache.link_keys(42, 1, "f");
        let by_name = cache.entry_by_name(1, "f");
        assert!(Arc::ptr_eq(&by_id, &by_name));
    }

    #[test]
    fn test_wipe_resets_status() {
        let cache = MetadataCache::new(quick_config());
        let entry = cache.entry_by_id(7);
        entry.state.lock().stat_status = InfoStatus::Ok;
        cache.wipe_by_id(7);
        assert_eq!(entry.state.lock().stat_status, InfoStatus::NoInfo);
    }

    #[test]
    fn test_lru_eviction_over_capacity() {
        let cache = MetadataCache::new(CacheConfig {
            max_items: 4,
            ..quick_config()
        });
        for ino in 0..32 {
            let entry = cache.entry_by_id(ino);
            entry.state.lock().stat_status = InfoStatus::Ok;
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_pending_entries_survive_eviction() {
        let cache = MetadataCache::new(CacheConfig {
            max_items: 2,
            ..quick_config()
        });
        let pending = cache.entry_by_id(1);
        pending.state.lock().stat_status = InfoStatus::InProgress;
        for ino in 2..20 {
            let e = cache.entry_by_id(ino);
            e.state.lock().stat_status = InfoStatus::Ok;
        }
        cache.maintain();
        let still_there = cache.entry_by_id(1);
        assert!(Arc::ptr_eq(&pending, &still_there));
    }

    #[test]
    fn test_negative_entries_expire_faster() {
        let cache = MetadataCache::new(CacheConfig {
            item_ttl_negative: Duration::from_millis(10),
            ..quick_config()
        });
        let entry = cache.entry_by_id(9);
        entry.state.lock().stat_status = InfoStatus::NotFound;
        std::thread::sleep(Duration::from_millis(30));
        cache.maintain();
        let fresh = cache.entry_by_id(9);
        assert!(!Arc::ptr_eq(&entry, &fresh));
    }
}
