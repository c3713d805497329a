//! Pool enumeration and availability filtering.

mod common;

use common::Harness;
use diskcat::builtin::store::FsStatus;
use diskcat::{Catalog as _, PoolManager as _};
use diskcat::{ErrorCode, PoolAvailability, Replica};

#[test]
fn pools_filter_by_availability() {
    let harness = Harness::new();
    let _rw_root = harness.add_pool("rw", "h1");
    let fs_b = harness.add_pool("ro", "h2");
    harness
        .dpm()
        .set_filesystem_status("ro", fs_b.to_str().unwrap(), FsStatus::ReadOnly)
        .unwrap();

    let mut stack = harness.root_stack();
    let pm = stack.pool_manager().unwrap();

    let any = pm.get_pools(PoolAvailability::Any).unwrap();
    assert_eq!(any.len(), 2);

    let writable: Vec<String> = pm
        .get_pools(PoolAvailability::ForWrite)
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(writable, vec!["rw".to_string()]);

    let readable = pm.get_pools(PoolAvailability::ForRead).unwrap();
    assert_eq!(readable.len(), 2);

    let both = pm.get_pools(PoolAvailability::ForBoth).unwrap();
    assert_eq!(both.len(), 1);

    assert_eq!(
        pm.get_pool("nowhere").unwrap_err().code(),
        ErrorCode::NO_SUCH_POOL
    );
    let pool = pm.get_pool("rw").unwrap();
    assert_eq!(pool.pool_type, "fs");
    assert!(pool.properties.has_field("capacity"));
}

#[test]
fn disabled_filesystem_makes_replicas_unavailable() {
    let harness = Harness::new();
    let fs_root = harness.add_pool("p1", "h1");
    let fs_name = fs_root.to_string_lossy().into_owned();

    let mut stack = harness.root_stack();
    let catalog = stack.catalog().unwrap();
    catalog.create("/only", 0o644).unwrap();
    let meta = catalog.extended_stat("/only", true).unwrap();
    catalog
        .add_replica(&Replica {
            fileid: meta.ino,
            server: "h1".to_string(),
            rfn: "h1:/pool/only".to_string(),
            pool: "p1".to_string(),
            filesystem: fs_name.clone(),
            ..Default::default()
        })
        .unwrap();

    // served while enabled
    assert!(stack.pool_manager().unwrap().where_to_read("/only").is_ok());

    harness
        .dpm()
        .set_filesystem_status("p1", &fs_name, FsStatus::Disabled)
        .unwrap();
    let err = stack
        .pool_manager()
        .unwrap()
        .where_to_read("/only")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NO_REPLICAS);
}
