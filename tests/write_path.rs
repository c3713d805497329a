//! The write path: whereToWrite, upload through the I/O driver,
//! doneWriting, cancelWrite.

mod common;

use common::Harness;
use diskcat::inode::ReplicaStatus;
use diskcat::iodriver::OpenFlags;
use diskcat::{generate_token, ErrorCode, Extensible};
use diskcat::{Catalog as _, IoDriver as _, IoHandler as _, PoolManager as _};

#[test]
fn write_token_round_trip() {
    let harness = Harness::new();
    harness.add_pool("p1", "localhost");
    let mut stack = harness.root_stack();

    stack.catalog().unwrap().make_dir("/w", 0o775).unwrap();
    let location = stack.pool_manager().unwrap().where_to_write("/w/f").unwrap();
    assert_eq!(location.chunks.len(), 1);
    let chunk = location.chunks[0].clone();

    let token = chunk.query.get_string("token").unwrap();
    let dpmtoken = chunk.query.get_string("dpmtoken").unwrap();
    assert!(!token.is_empty());
    assert!(!dpmtoken.is_empty());
    // the inode exists already, zero sized
    let meta = stack
        .catalog()
        .unwrap()
        .extended_stat("/w/f", true)
        .unwrap();
    assert_eq!(meta.size, 0);

    // a read-only token for the same pfn must not admit the upload
    let mut bad = Extensible::new();
    bad.set(
        "token",
        generate_token("127.0.0.1", &chunk.path, "test-secret", 600, false),
    );
    let err = stack
        .io_driver()
        .unwrap()
        .create_io_handler(
            &chunk.path,
            OpenFlags::WRONLY | OpenFlags::CREAT,
            &bad,
            0o664,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FORBIDDEN);

    // the write token does
    let mut handler = stack
        .io_driver()
        .unwrap()
        .create_io_handler(
            &chunk.path,
            OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
            &chunk.query,
            0o664,
        )
        .unwrap();
    handler.write(b"twelve bytes").unwrap();
    handler.flush().unwrap();
    handler.close().unwrap();

    let mut params = Extensible::new();
    params.set("sfn", "/w/f");
    params.set("token", token);
    params.set("dpmtoken", dpmtoken);
    let rfn = format!("{}:{}", chunk.host, chunk.path);
    stack
        .pool_manager()
        .unwrap()
        .done_writing(&chunk.host, &rfn, &params)
        .unwrap();

    // exactly one replica, available, and the size is closed out
    let replicas = stack.catalog().unwrap().get_replicas("/w/f").unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].status, ReplicaStatus::Available);
    assert_eq!(replicas[0].pool, "p1");
    let meta = stack
        .catalog()
        .unwrap()
        .extended_stat("/w/f", true)
        .unwrap();
    assert_eq!(meta.size, 12);
}

#[test]
fn done_writing_without_upload_fails_and_records_nothing() {
    let harness = Harness::new();
    harness.add_pool("p1", "localhost");
    let mut stack = harness.root_stack();

    stack.catalog().unwrap().make_dir("/w", 0o775).unwrap();
    let location = stack
        .pool_manager()
        .unwrap()
        .where_to_write("/w/ghost")
        .unwrap();
    let chunk = &location.chunks[0];

    let mut params = Extensible::new();
    params.set("sfn", "/w/ghost");
    params.set("dpmtoken", chunk.query.get_string("dpmtoken").unwrap());
    let err = stack
        .pool_manager()
        .unwrap()
        .done_writing(&chunk.host, "", &params)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QUERY_FAILED);

    assert_eq!(
        stack
            .catalog()
            .unwrap()
            .get_replicas("/w/ghost")
            .unwrap_err()
            .code(),
        ErrorCode::NO_REPLICAS
    );
}

#[test]
fn cancel_write_is_idempotent() {
    let harness = Harness::new();
    harness.add_pool("p1", "localhost");
    let mut stack = harness.root_stack();

    stack.catalog().unwrap().make_dir("/w", 0o775).unwrap();
    let location = stack
        .pool_manager()
        .unwrap()
        .where_to_write("/w/aborted")
        .unwrap();

    stack.pool_manager().unwrap().cancel_write(&location).unwrap();
    stack.pool_manager().unwrap().cancel_write(&location).unwrap();

    // the request is gone: completion now fails
    let chunk = &location.chunks[0];
    let mut params = Extensible::new();
    params.set("sfn", "/w/aborted");
    params.set("dpmtoken", chunk.query.get_string("dpmtoken").unwrap());
    let err = stack
        .pool_manager()
        .unwrap()
        .done_writing(&chunk.host, "", &params)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QUERY_FAILED);
}

#[test]
fn truncating_create_refuses_files_with_replicas() {
    let harness = Harness::new();
    harness.add_pool("p1", "localhost");
    let mut stack = harness.root_stack();

    stack.catalog().unwrap().make_dir("/w", 0o775).unwrap();

    // full upload cycle
    let location = stack.pool_manager().unwrap().where_to_write("/w/kept").unwrap();
    let chunk = location.chunks[0].clone();
    let mut handler = stack
        .io_driver()
        .unwrap()
        .create_io_handler(
            &chunk.path,
            OpenFlags::WRONLY | OpenFlags::CREAT,
            &chunk.query,
            0o664,
        )
        .unwrap();
    handler.write(b"x").unwrap();
    handler.close().unwrap();
    let mut params = Extensible::new();
    params.set("sfn", "/w/kept");
    params.set("dpmtoken", chunk.query.get_string("dpmtoken").unwrap());
    let rfn = format!("{}:{}", chunk.host, chunk.path);
    stack
        .pool_manager()
        .unwrap()
        .done_writing(&chunk.host, &rfn, &params)
        .unwrap();

    // a second whereToWrite must refuse to truncate it
    let err = stack
        .pool_manager()
        .unwrap()
        .where_to_write("/w/kept")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::EXISTS);
}
