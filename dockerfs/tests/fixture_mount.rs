//! Drives `DockerFs`'s public node-tree operations against a synthetic,
//! in-memory `ContainerApi`, standing in for a real container runtime
//! socket. No FUSE kernel mount is involved.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use dockerfs::adapter::ContainerApi;
use dockerfs::error::{Error, Result};
use dockerfs::fs::DockerFs;
use dockerfs::snapshot::build_baseline;
use dockerfs::types::{Container, ContainerPathStat, FsChange, S_IFREG};

/// The inode `fuser` always assigns the mount root.
const ROOT: u64 = 1;

struct FileRecord {
    data: Vec<u8>,
    mode: u32,
}

/// A container runtime stand-in backed by an in-memory file table,
/// mirroring the fixture used to test the original implementation's
/// `dockerfs` package against a mock Docker client.
struct FixtureApi {
    files: Mutex<HashMap<String, FileRecord>>,
}

impl FixtureApi {
    fn new(files: impl IntoIterator<Item = (&'static str, &'static [u8])>) -> Self {
        let files = files
            .into_iter()
            .map(|(path, data)| {
                (
                    path.to_string(),
                    FileRecord {
                        data: data.to_vec(),
                        mode: S_IFREG | 0o644,
                    },
                )
            })
            .collect();
        Self {
            files: Mutex::new(files),
        }
    }
}

impl ContainerApi for FixtureApi {
    fn container_export(&self, dest: &mut dyn Write) -> Result<()> {
        let files = self.files.lock().unwrap();
        let mut builder = tar::Builder::new(dest);
        for (path, record) in files.iter() {
            let mut header = tar::Header::new_gnu();
            header.set_size(record.data.len() as u64);
            header.set_mode(record.mode & 0o7777);
            header.set_cksum();
            builder
                .append_data(&mut header, path.trim_start_matches('/'), record.data.as_slice())
                .map_err(|e| Error::ProtocolError(e.to_string()))?;
        }
        builder.finish().map_err(|e| Error::ProtocolError(e.to_string()))
    }

    fn get_path_attrs(&self, path: &str) -> Result<ContainerPathStat> {
        let files = self.files.lock().unwrap();
        let record = files.get(path).ok_or(Error::NotFound)?;
        Ok(ContainerPathStat {
            name: dockerfs::path::basename(path).to_string(),
            size: record.data.len() as i64,
            mode: record.mode,
            mtime: Utc::now(),
            link_target: String::new(),
        })
    }

    fn get_fs_changes(&self) -> Result<Vec<FsChange>> {
        Ok(Vec::new())
    }

    fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        let files = self.files.lock().unwrap();
        files.get(path).map(|r| r.data.clone()).ok_or(Error::NotFound)
    }

    fn save_file(&self, path: &str, data: &[u8], stat: Option<ContainerPathStat>) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let mode = stat
            .map(|s| s.mode)
            .or_else(|| files.get(path).map(|r| r.mode))
            .unwrap_or(S_IFREG | 0o644);
        files.insert(
            path.to_string(),
            FileRecord {
                data: data.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    fn containers_list(&self) -> Result<Vec<Container>> {
        unimplemented!("not exercised by this fixture")
    }
}

fn mounted_fs(files: impl IntoIterator<Item = (&'static str, &'static [u8])>) -> DockerFs {
    let api = std::sync::Arc::new(FixtureApi::new(files));
    let baseline = build_baseline("fixture-mount-test", api.as_ref())
        .expect("fixture export must parse into a baseline");
    DockerFs::new(api, baseline, Duration::from_millis(10))
}

#[test]
fn write_flush_reopen_read_round_trips() {
    let fs = mounted_fs([("/greeting.txt", b"hello\n".as_slice())]);

    let attr = fs.resolve(ROOT, "greeting.txt").expect("lookup must succeed");
    let ino = attr.ino;

    let write_fh = fs
        .open_path(ino, libc::O_RDWR)
        .expect("open for write must succeed");
    let written = fs
        .write_handle(write_fh, 0, b"HELLO WORLD\n")
        .expect("write must succeed");
    assert_eq!(written, 12);
    fs.flush_handle(write_fh).expect("flush must persist the buffer");
    fs.release_handle(write_fh);

    let read_fh = fs
        .open_path(ino, libc::O_RDONLY)
        .expect("reopen must fetch the persisted content");
    let data = fs
        .read_handle(read_fh, 0, 4096)
        .expect("read must succeed");
    assert_eq!(data, b"HELLO WORLD\n");
    fs.release_handle(read_fh);

    let refreshed = fs.attr_of(ino).expect("getattr must reflect the new size");
    assert_eq!(refreshed.size, 12);
}

#[test]
fn lookup_of_missing_path_is_not_found() {
    let fs = mounted_fs([("/greeting.txt", b"hello\n".as_slice())]);
    let err = fs.resolve(ROOT, "missing.txt").unwrap_err();
    assert_eq!(err, libc::ENOENT);
}

#[test]
fn read_without_open_is_bad_file_descriptor() {
    let fs = mounted_fs([("/greeting.txt", b"hello\n".as_slice())]);
    let err = fs.read_handle(999, 0, 10).unwrap_err();
    assert_eq!(err, libc::EBADF);
}
