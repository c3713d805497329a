//! The bundled plug-ins.
//!
//! These are the implementations shipped with the crate, registered in the
//! process plug-in registry under the ids below and loaded through the
//! ordinary `LoadPlugin` directive:
//!
//! * `builtin_ns` — embedded namespace database: inode store + authn
//! * `builtin_catalog` — the namespace engine over the stack's inode store
//! * `builtin_pools` — pool manager and the `fs` pool-type driver
//! * `builtin_io` — token-checked local-file I/O
//! * `mdcache` — caching decorator over the inode store

use std::collections::HashMap;

use crate::plugin::PluginIdCard;

pub mod authn;
pub mod catalog;
pub mod dpm;
pub mod io;
pub mod pool;
pub mod store;

pub(crate) fn id_cards() -> HashMap<String, PluginIdCard> {
    let mut cards = HashMap::new();
    cards.insert("builtin_ns".to_string(), store::PLUGIN_BUILTIN_NS);
    cards.insert("builtin_catalog".to_string(), catalog::PLUGIN_BUILTIN_CATALOG);
    cards.insert("builtin_pools".to_string(), pool::PLUGIN_BUILTIN_POOLS);
    cards.insert("builtin_io".to_string(), io::PLUGIN_BUILTIN_IO);
    cards.insert("mdcache".to_string(), crate::mdcache::PLUGIN_MDCACHE);
    cards
}
