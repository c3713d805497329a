//! Smoke tests of the C facade.

use std::ffi::{CStr, CString};

use diskcat::capi::*;
use diskcat::ErrorCode;

fn c(text: &str) -> CString {
    CString::new(text).unwrap()
}

#[test]
fn manager_context_and_catalog_calls() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ns.db");
    let config_path = dir.path().join("diskcat.conf");
    std::fs::write(
        &config_path,
        format!(
            "LoadPlugin builtin_ns lib/plugin.so\n\
             LoadPlugin builtin_catalog lib/plugin.so\n\
             NsDatabase {}\n\
             TokenPassword capi-secret\n",
            db.display()
        ),
    )
    .unwrap();

    unsafe {
        let manager = dm_manager_new();
        assert!(!manager.is_null());
        assert_eq!(dm_api_version(), diskcat::API_VERSION);

        // unknown plug-in ids surface through the saved error
        let rc = dm_manager_load_plugin(manager, c("x.so").as_ptr(), c("nope").as_ptr());
        assert_eq!(rc as u32, ErrorCode::NO_SUCH_SYMBOL.raw());
        assert!(!CStr::from_ptr(dm_manager_error(manager)).to_bytes().is_empty());

        let rc = dm_manager_load_configuration(manager, c(config_path.to_str().unwrap()).as_ptr());
        assert_eq!(rc, 0);

        let context = dm_context_new(manager);
        assert!(!context.is_null());

        // the manager is frozen once a context exists
        let rc = dm_manager_set(manager, c("PoolSize").as_ptr(), c("8").as_ptr());
        assert_eq!(rc as u32, ErrorCode::BAD_OPERATION.raw());

        let rc = dm_setcredentials(context, c("root").as_ptr(), c("127.0.0.1").as_ptr());
        assert_eq!(rc, 0);

        assert_eq!(dm_mkdir(context, c("/capi").as_ptr(), 0o755), 0);
        assert_eq!(dm_create(context, c("/capi/f").as_ptr(), 0o644), 0);
        assert_eq!(dm_chmod(context, c("/capi/f").as_ptr(), 0o600), 0);

        let mut stat = DmStatInfo::default();
        assert_eq!(dm_stat(context, c("/capi/f").as_ptr(), &mut stat), 0);
        assert_eq!(stat.mode & 0o777, 0o600);
        assert_eq!(stat.nlink, 1);
        assert!(stat.ino > 1);

        // failures set errno and the message
        let rc = dm_stat(context, c("/capi/missing").as_ptr(), &mut stat);
        assert_eq!(rc as u32, ErrorCode::NO_SUCH_FILE.raw());
        assert_eq!(dm_errno(context) as u32, ErrorCode::NO_SUCH_FILE.raw());
        assert!(!CStr::from_ptr(dm_error(context)).to_bytes().is_empty());

        // and the next success clears them
        assert_eq!(dm_setcomment(context, c("/capi/f").as_ptr(), c("kept").as_ptr()), 0);
        assert_eq!(dm_errno(context), 0);
        let mut buf = [0 as std::ffi::c_char; 64];
        assert_eq!(
            dm_getcomment(context, c("/capi/f").as_ptr(), buf.as_mut_ptr(), buf.len()),
            0
        );
        assert_eq!(
            CStr::from_ptr(buf.as_ptr()).to_str().unwrap(),
            "kept"
        );

        assert_eq!(dm_rename(context, c("/capi/f").as_ptr(), c("/capi/g").as_ptr()), 0);
        assert_eq!(dm_unlink(context, c("/capi/g").as_ptr()), 0);
        assert_eq!(dm_rmdir(context, c("/capi").as_ptr()), 0);

        dm_context_free(context);
        dm_manager_free(manager);
    }
}

#[test]
fn replica_array_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ns.db");
    let config_path = dir.path().join("diskcat.conf");
    std::fs::write(
        &config_path,
        format!(
            "LoadPlugin builtin_ns lib/plugin.so\n\
             LoadPlugin builtin_catalog lib/plugin.so\n\
             NsDatabase {}\n",
            db.display()
        ),
    )
    .unwrap();

    unsafe {
        let manager = dm_manager_new();
        dm_manager_load_configuration(manager, c(config_path.to_str().unwrap()).as_ptr());
        let context = dm_context_new(manager);
        dm_setcredentials(context, c("root").as_ptr(), c("127.0.0.1").as_ptr());

        assert_eq!(dm_create(context, c("/f").as_ptr(), 0o644), 0);
        assert_eq!(
            dm_addreplica(
                context,
                c("/f").as_ptr(),
                c("h1").as_ptr(),
                c("h1:/pool/f").as_ptr(),
                c("p1").as_ptr(),
                c("fs1").as_ptr(),
            ),
            0
        );

        let mut replicas = std::ptr::null_mut();
        let mut count = 0;
        assert_eq!(
            dm_getreplicas(context, c("/f").as_ptr(), &mut replicas, &mut count),
            0
        );
        assert_eq!(count, 1);
        let first = &*replicas;
        assert_eq!(first.status as u8 as char, '-');
        assert_eq!(
            CStr::from_ptr(first.server.as_ptr()).to_str().unwrap(),
            "h1"
        );
        dm_replicas_free(replicas, count);

        dm_context_free(context);
        dm_manager_free(manager);
    }
}
