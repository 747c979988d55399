//! File-backed integration tests: the same scenarios covered in-memory by
//! `src/storage.rs`'s unit tests, but driven through `Storage::open`/`close`
//! against real temp files, matching §8's scenarios 3–6.

use cfb_container::{with_storage, Mode, ObjectType, Storage};
use std::io::{Read, Write};
use tempfile::NamedTempFile;

#[test]
fn create_write_reopen_round_trips_on_disk() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    drop(tmp); // Storage::open(Create) creates the file itself.

    let mut storage = Storage::open(&path, Mode::Create).unwrap();
    let idx = storage
        .new_child(0, ObjectType::Stream, "hello")
        .unwrap();
    storage.write_stream(idx, b"world").unwrap();
    storage.close().unwrap();

    let mut reopened = Storage::open(&path, Mode::Read).unwrap();
    let found = reopened.dirent_from_path("/hello").unwrap();
    assert!((reopened.dirent(found).size as u32) < reopened.header().mini_cutoff);
    let mut io = reopened.open_stream(found).unwrap();
    let mut data = Vec::new();
    io.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"world");

    std::fs::remove_file(&path).ok();
}

#[test]
fn delete_and_repack_shrinks_or_preserves_file_size() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    drop(tmp);

    let mut storage = Storage::open(&path, Mode::Create).unwrap();
    let a = storage.new_child(0, ObjectType::Stream, "a").unwrap();
    let b = storage.new_child(0, ObjectType::Stream, "b").unwrap();
    storage.write_stream(a, &vec![b'A'; 9000]).unwrap();
    storage.write_stream(b, b"still here").unwrap();
    storage.close().unwrap();

    let size_before = std::fs::metadata(&path).unwrap().len();

    let mut storage = Storage::open(&path, Mode::ReadWrite).unwrap();
    let a_idx = storage.dirent_from_path("/a").unwrap();
    let b_idx = storage.dirent_from_path("/b").unwrap();
    storage.delete(0, a_idx).unwrap();
    let b_idx_after = storage.dirent_from_path("/b").unwrap();
    assert_eq!(b_idx, b_idx_after);
    storage.close().unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after <= size_before);

    let mut reopened = Storage::open(&path, Mode::Read).unwrap();
    assert!(reopened.dirent_from_path("/a").is_none());
    let found_b = reopened.dirent_from_path("/b").unwrap();
    let mut io = reopened.open_stream(found_b).unwrap();
    let mut data = Vec::new();
    io.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"still here");

    std::fs::remove_file(&path).ok();
}

#[test]
fn corrupt_magic_on_disk_fails_without_leaving_a_partial_handle() {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&[0u8; 512]).unwrap();
    let err = Storage::open(tmp.path(), Mode::Read).unwrap_err();
    assert_eq!(err.kind(), cfb_container::Kind::Corrupt);
}

#[test]
fn create_new_fails_if_path_already_exists() {
    let tmp = NamedTempFile::new().unwrap();
    let err = Storage::open(tmp.path(), Mode::CreateNew).unwrap_err();
    assert_eq!(err.kind(), cfb_container::Kind::AlreadyExists);
}

#[test]
fn with_storage_repacks_on_success_and_releases_on_error() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    drop(tmp);

    with_storage(&path, Mode::Create, |storage| {
        let idx = storage.new_child(0, ObjectType::Stream, "scoped")?;
        storage.write_stream(idx, b"payload")
    })
    .unwrap();

    let mut reopened = Storage::open(&path, Mode::Read).unwrap();
    let found = reopened.dirent_from_path("/scoped").unwrap();
    let mut io = reopened.open_stream(found).unwrap();
    let mut data = Vec::new();
    io.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"payload");
    drop(reopened);

    // a block that errors never repacks: the file on disk is left as the
    // prior successful close wrote it.
    let before = std::fs::read(&path).unwrap();
    let err = with_storage(&path, Mode::ReadWrite, |storage| -> cfb_container::Result<()> {
        storage.new_child(0, ObjectType::Stream, "ignored")?;
        Err(cfb_container::Error::Unsupported("deliberate failure"))
    })
    .unwrap_err();
    assert_eq!(err.kind(), cfb_container::Kind::Unsupported);
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);

    std::fs::remove_file(&path).ok();
}
