//! Namespace scenarios over a full stack.

mod common;

use common::Harness;
use diskcat::acl::{Acl, AclEntry};
use diskcat::{Catalog as _, InodeStore as _, PoolManager as _};
use diskcat::{ErrorCode, Replica};

#[test]
fn create_and_read_back_with_replica() {
    let harness = Harness::new();
    harness.add_pool("p1", "h1");
    let mut stack = harness.root_stack();

    let catalog = stack.catalog().unwrap();
    assert_eq!(catalog.umask(0o027), 0o022);
    catalog.make_dir("/a", 0o755).unwrap();
    catalog.create("/a/f", 0o644).unwrap();

    let meta = catalog.extended_stat("/a/f", true).unwrap();
    assert_eq!(meta.mode & 0o777, 0o644 & !0o027);
    assert_eq!(meta.nlink, 1);

    let err = catalog.get_replicas("/a/f").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NO_REPLICAS);

    catalog
        .add_replica(&Replica {
            fileid: meta.ino,
            server: "h1".to_string(),
            rfn: "h1:/pool/a/f".to_string(),
            pool: "p1".to_string(),
            filesystem: harness
                .dir
                .path()
                .join("p1-fs1")
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(catalog.get_replicas("/a/f").unwrap().len(), 1);

    let location = stack.pool_manager().unwrap().where_to_read("/a/f").unwrap();
    assert_eq!(location.chunks.len(), 1);
    let chunk = &location.chunks[0];
    assert_eq!(chunk.host, "h1");
    assert_eq!(chunk.path, "/pool/a/f");
    assert!(!chunk.query.get_string("token").unwrap().is_empty());
}

#[test]
fn symlink_loop_is_bounded() {
    let harness = Harness::new();
    let mut stack = harness.root_stack();
    let catalog = stack.catalog().unwrap();

    catalog.make_dir("/a", 0o755).unwrap();
    catalog.symlink("/a", "/a/loop").unwrap();

    let err = catalog
        .extended_stat("/a/loop/loop/loop/loop", true)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TOO_MANY_SYMLINKS);
}

#[test]
fn sticky_directory_protects_entries() {
    let harness = Harness::new();

    {
        let mut root = harness.root_stack();
        let catalog = root.catalog().unwrap();
        catalog.umask(0);
        catalog.make_dir("/t", 0o1777).unwrap();
    }
    {
        let mut alice = harness.stack_as("/CN=alice", &["/dteam"]);
        alice.catalog().unwrap().create("/t/f", 0o644).unwrap();
    }
    {
        let mut bob = harness.stack_as("/CN=bob", &["/dteam"]);
        let err = bob.catalog().unwrap().unlink("/t/f").unwrap_err();
        assert_eq!(err.code(), ErrorCode::FORBIDDEN);
    }
    {
        let mut alice = harness.stack_as("/CN=alice", &["/dteam"]);
        alice.catalog().unwrap().unlink("/t/f").unwrap();
    }
}

#[test]
fn default_acl_inheritance() {
    let harness = Harness::new();

    // allocate alice's uid first so the default entry can reference it
    let alice_uid = {
        let mut alice = harness.stack_as("/CN=alice", &["/dteam"]);
        let uid = alice.security_context().unwrap().user.uid;
        assert!(uid > 0);
        uid
    };

    {
        let mut root = harness.root_stack();
        let catalog = root.catalog().unwrap();
        catalog.make_dir("/d", 0o750).unwrap();
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ, 5, 0),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER_OBJ | AclEntry::DEFAULT, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ | AclEntry::DEFAULT, 5, 0),
            AclEntry::new(AclEntry::OTHER | AclEntry::DEFAULT, 0, 0),
            AclEntry::new(AclEntry::USER | AclEntry::DEFAULT, 6, alice_uid),
            AclEntry::new(AclEntry::MASK | AclEntry::DEFAULT, 7, 0),
        ]);
        catalog.set_acl("/d", &acl).unwrap();
        // hand the directory to alice so she can create inside
        catalog.set_owner("/d", Some(alice_uid), None, true).unwrap();
    }

    let mut alice = harness.stack_as("/CN=alice", &["/dteam"]);
    let catalog = alice.catalog().unwrap();
    catalog.umask(0o022);
    catalog.create("/d/f", 0o666).unwrap();

    let meta = catalog.extended_stat("/d/f", true).unwrap();
    assert_eq!(meta.mode & 0o777, 0o640);
    let named = meta.acl.entry(AclEntry::USER).unwrap();
    assert_eq!(named.id, alice_uid);
    assert_eq!(named.perm, 6);
}

#[test]
fn nlink_tracks_directory_entries() {
    let harness = Harness::new();
    let mut stack = harness.root_stack();
    let catalog = stack.catalog().unwrap();

    catalog.make_dir("/parent", 0o755).unwrap();
    assert_eq!(catalog.extended_stat("/parent", true).unwrap().nlink, 0);
    catalog.make_dir("/parent/child", 0o755).unwrap();
    assert_eq!(catalog.extended_stat("/parent", true).unwrap().nlink, 1);
    catalog.remove_dir("/parent/child").unwrap();
    assert_eq!(catalog.extended_stat("/parent", true).unwrap().nlink, 0);
}

#[test]
fn rename_preserves_the_inode() {
    let harness = Harness::new();
    let mut stack = harness.root_stack();
    let catalog = stack.catalog().unwrap();

    catalog.make_dir("/r", 0o755).unwrap();
    catalog.create("/r/one", 0o644).unwrap();
    let before = catalog.extended_stat("/r/one", true).unwrap();
    catalog.rename("/r/one", "/r/two").unwrap();
    let after = catalog.extended_stat("/r/two", true).unwrap();
    assert_eq!(before.ino, after.ino);
    assert_eq!(
        catalog.extended_stat("/r/one", true).unwrap_err().code(),
        ErrorCode::NO_SUCH_FILE
    );
}

#[test]
fn absolute_symlinks_resolve_to_their_target() {
    let harness = Harness::new();
    let mut stack = harness.root_stack();
    let catalog = stack.catalog().unwrap();

    catalog.make_dir("/data", 0o755).unwrap();
    catalog.create("/data/f", 0o644).unwrap();
    catalog.symlink("/data/f", "/shortcut").unwrap();

    let through = catalog.extended_stat("/shortcut", true).unwrap();
    let target = catalog.extended_stat("/data/f", true).unwrap();
    assert_eq!(through.ino, target.ino);

    let raw = catalog.extended_stat("/shortcut", false).unwrap();
    assert!(raw.is_link());
}

#[test]
fn guid_lookup_round_trip() {
    let harness = Harness::new();
    let mut stack = harness.root_stack();

    stack.catalog().unwrap().create("/g", 0o644).unwrap();
    stack
        .catalog()
        .unwrap()
        .set_guid("/g", "aabb-ccdd-0011")
        .unwrap();
    let by_path = stack.catalog().unwrap().extended_stat("/g", true).unwrap();
    let by_guid = stack
        .inode()
        .unwrap()
        .extended_stat_by_guid("aabb-ccdd-0011")
        .unwrap();
    assert_eq!(by_path.ino, by_guid.ino);
}

#[test]
fn comments_follow_the_entry() {
    let harness = Harness::new();
    let mut stack = harness.root_stack();
    let catalog = stack.catalog().unwrap();

    catalog.create("/noted", 0o644).unwrap();
    assert_eq!(
        catalog.get_comment("/noted").unwrap_err().code(),
        ErrorCode::NO_COMMENT
    );
    catalog.set_comment("/noted", "production dataset").unwrap();
    assert_eq!(catalog.get_comment("/noted").unwrap(), "production dataset");

    catalog.unlink("/noted").unwrap();
    catalog.create("/noted", 0o644).unwrap();
    // a fresh inode under the same name has no comment
    assert_eq!(
        catalog.get_comment("/noted").unwrap_err().code(),
        ErrorCode::NO_COMMENT
    );
}
