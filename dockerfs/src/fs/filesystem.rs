use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request,
};
use libc::{ENOENT, EIO, EBADF};

use crate::adapter::ContainerApi;
use crate::changes::ChangeTracker;
use crate::error::Error;
use crate::inode::InodeAllocator;
use crate::snapshot::Baseline;
use crate::types::{mode_is_dir, mode_is_symlink, ContainerPathStat};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Directory,
    Regular,
    Symlink,
}

fn classify_mode(mode: u32) -> Kind {
    if mode_is_symlink(mode) {
        Kind::Symlink
    } else if mode_is_dir(mode) {
        Kind::Directory
    } else {
        Kind::Regular
    }
}

/// Flags a freshly fetched file buffer is opened with: derives `(read,
/// write, pos)` and applies `O_TRUNC` in place. Kept free of fuser types
/// so it can be exercised directly.
fn apply_open_flags(buffer: &mut Vec<u8>, flags: i32) -> (bool, bool, i64) {
    let access_mode = flags & libc::O_ACCMODE;
    let write = access_mode == libc::O_WRONLY || access_mode == libc::O_RDWR;
    // O_RDONLY is 0 on the platforms this mounts on, so anything that
    // isn't write-only is treated as readable.
    let read = access_mode != libc::O_WRONLY;
    let mut pos = 0i64;
    if flags & libc::O_APPEND != 0 {
        pos = buffer.len() as i64;
    }
    if flags & libc::O_TRUNC != 0 {
        buffer.truncate(0);
    }
    (read, write, pos)
}

/// Slice of `buffer` covering `[off, off + size)`, clamped to EOF. Offsets
/// past the end of the buffer yield an empty slice rather than an error.
fn read_slice(buffer: &[u8], off: usize, size: usize) -> &[u8] {
    if off >= buffer.len() {
        return &[];
    }
    let end = (off + size).min(buffer.len());
    &buffer[off..end]
}

/// Overwrites `buffer[effective_off..effective_off+data.len()]`, growing
/// the buffer with zero bytes first if the write extends past its end.
fn write_into_buffer(buffer: &mut Vec<u8>, effective_off: usize, data: &[u8]) {
    let end = effective_off + data.len();
    if end > buffer.len() {
        buffer.resize(end, 0);
    }
    buffer[effective_off..end].copy_from_slice(data);
}

/// Set of direct children of `dir_path` per Invariant 3: baseline children
/// union added children, minus removed children. Returns `(name, is_dir)`
/// pairs. Pure w.r.t. inode allocation — callers assign inodes afterward.
fn merge_children(
    baseline: &Baseline,
    changes: &[crate::types::FsChange],
    dir_path: &str,
) -> HashMap<String, bool> {
    let prefix = if dir_path == "/" {
        "/".to_string()
    } else {
        format!("{dir_path}/")
    };

    let mut children: HashMap<String, bool> = HashMap::new();
    for (path, mode) in baseline.children_with_prefix(&prefix) {
        if changes
            .iter()
            .any(|c| c.kind == crate::types::ChangeKind::Removed && c.path == path)
        {
            continue;
        }
        let sub = &path[prefix.len()..];
        match sub.find('/') {
            Some(0) => continue,
            Some(p) => {
                children.insert(sub[..p].to_string(), true);
            }
            None => {
                children
                    .entry(sub.to_string())
                    .or_insert_with(|| mode_is_dir(mode));
            }
        }
    }
    for change in changes {
        if change.kind != crate::types::ChangeKind::Added {
            continue;
        }
        let name = crate::path::basename(&change.path).to_string();
        let is_dir = change.mode.map(mode_is_dir).unwrap_or(false);
        children.insert(name, is_dir);
    }
    children
}

/// A materialized node: a `(parent, name)` lookup's child instance, kept
/// stable across repeated lookups within the mount session.
struct Entry {
    path: String,
    kind: Kind,
    link_target: String,
}

/// Per-open-session state for a file node.
struct FileSession {
    full_path: String,
    buffer: Vec<u8>,
    read: bool,
    write: bool,
    pos: i64,
}

/// The mounted filesystem: every kernel callback lands here and is
/// translated into baseline lookups, change-tracker queries, and live
/// API calls. `fuser` dispatches by bare inode number
/// rather than by node object, so the directory/file "node tree" of the
/// original design collapses into one struct holding an `ino -> Entry`
/// table plus a separate table of open file sessions keyed by file handle.
pub struct DockerFs {
    api: Arc<dyn ContainerApi>,
    baseline: Baseline,
    inodes: InodeAllocator,
    tracker: ChangeTracker,
    uid: u32,
    gid: u32,
    entries: Mutex<HashMap<u64, Entry>>,
    handles: Mutex<HashMap<u64, FileSession>>,
    next_fh: AtomicU64,
}

impl DockerFs {
    pub fn new(api: Arc<dyn ContainerApi>, baseline: Baseline, changes_interval: Duration) -> Self {
        let inodes = InodeAllocator::new();
        // Reserve inode 1 for the root so every other path starts at 2.
        let root_ino = inodes.inode("/");
        debug_assert_eq!(root_ino, ROOT_INO);

        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INO,
            Entry {
                path: "/".to_string(),
                kind: Kind::Directory,
                link_target: String::new(),
            },
        );

        Self {
            api,
            baseline,
            inodes,
            tracker: ChangeTracker::new(changes_interval),
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            entries: Mutex::new(entries),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn entry_path(&self, ino: u64) -> Option<String> {
        self.entries.lock().unwrap().get(&ino).map(|e| e.path.clone())
    }

    fn directory_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, ino: u64, kind: Kind, stat: &ContainerPathStat) -> FileAttr {
        let size = stat.size.max(0) as u64;
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(stat.mtime.timestamp().max(0) as u64);
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: if kind == Kind::Symlink {
                FileType::Symlink
            } else {
                FileType::RegularFile
            },
            perm: (stat.mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn errno_of(&self, op: &str, path: &str, e: Error) -> i32 {
        match e {
            Error::NotFound => ENOENT,
            other => {
                log::error!("{op}({path}): {other}");
                EIO
            }
        }
    }

    /// Resolves `name` under `parent`, materializing an [`Entry`] on first
    /// sight. Free of fuser reply types so it can be driven directly by
    /// tests as well as by [`Filesystem::lookup`].
    pub fn resolve(&self, parent: u64, name: &str) -> std::result::Result<FileAttr, i32> {
        let parent_path = self.entry_path(parent).ok_or(ENOENT)?;
        let path = crate::path::join(&parent_path, name);

        let stat = self
            .api
            .get_path_attrs(&path)
            .map_err(|e| self.errno_of("lookup", &path, e))?;

        let ino = self.inodes.inode(&path);
        let kind = classify_mode(stat.mode);

        self.entries.lock().unwrap().entry(ino).or_insert_with(|| Entry {
            path: path.clone(),
            kind,
            link_target: stat.link_target.clone(),
        });

        Ok(if kind == Kind::Directory {
            self.directory_attr(ino)
        } else {
            self.file_attr(ino, kind, &stat)
        })
    }

    /// Current attributes of an already-materialized inode.
    pub fn attr_of(&self, ino: u64) -> std::result::Result<FileAttr, i32> {
        let (path, kind) = self
            .entries
            .lock()
            .unwrap()
            .get(&ino)
            .map(|e| (e.path.clone(), e.kind))
            .ok_or(ENOENT)?;

        if kind == Kind::Directory {
            return Ok(self.directory_attr(ino));
        }
        let stat = self
            .api
            .get_path_attrs(&path)
            .map_err(|e| self.errno_of("getattr", &path, e))?;
        Ok(self.file_attr(ino, kind, &stat))
    }

    /// Fetches `ino`'s full contents and registers a new file session,
    /// returning its handle.
    pub fn open_path(&self, ino: u64, flags: i32) -> std::result::Result<u64, i32> {
        let path = self.entry_path(ino).ok_or(ENOENT)?;
        let mut buffer = self
            .api
            .get_file(&path)
            .map_err(|e| self.errno_of("open", &path, e))?;
        let (read, write, pos) = apply_open_flags(&mut buffer, flags);
        let fh = self.alloc_fh();
        self.handles.lock().unwrap().insert(
            fh,
            FileSession {
                full_path: path,
                buffer,
                read,
                write,
                pos,
            },
        );
        Ok(fh)
    }

    /// Reads `size` bytes at `offset` from an open session's buffer.
    pub fn read_handle(&self, fh: u64, offset: i64, size: u32) -> std::result::Result<Vec<u8>, i32> {
        let handles = self.handles.lock().unwrap();
        let session = handles.get(&fh).ok_or(EBADF)?;
        let off = offset.max(0) as usize;
        Ok(read_slice(&session.buffer, off, size as usize).to_vec())
    }

    /// Writes `data` at `offset` into an open session's buffer. The buffer
    /// is not persisted to the runtime until [`DockerFs::flush_handle`] or
    /// [`DockerFs::fsync_handle`] is called.
    pub fn write_handle(&self, fh: u64, offset: i64, data: &[u8]) -> std::result::Result<u32, i32> {
        let mut handles = self.handles.lock().unwrap();
        let session = handles.get_mut(&fh).ok_or(EBADF)?;
        if !session.write {
            return Err(EBADF);
        }
        let effective_off = (offset + session.pos) as usize;
        write_into_buffer(&mut session.buffer, effective_off, data);
        Ok(data.len() as u32)
    }

    /// Persists a write session's buffer via [`ContainerApi::save_file`]
    /// and clears it, per Invariant 3: a session that hasn't been opened
    /// for writing, or one already closed, is a no-op.
    pub fn flush_handle(&self, fh: u64) -> std::result::Result<(), i32> {
        let mut handles = self.handles.lock().unwrap();
        let Some(session) = handles.get_mut(&fh) else {
            return Ok(());
        };
        if !session.write {
            return Ok(());
        }
        self.api
            .save_file(&session.full_path, &session.buffer, None)
            .map_err(|e| self.errno_of("flush", &session.full_path, e))?;
        session.buffer = Vec::new();
        session.read = false;
        session.write = false;
        Ok(())
    }

    /// Persists a write session's buffer without closing it.
    pub fn fsync_handle(&self, fh: u64) -> std::result::Result<(), i32> {
        let handles = self.handles.lock().unwrap();
        let Some(session) = handles.get(&fh) else {
            return Ok(());
        };
        if !session.write {
            return Ok(());
        }
        self.api
            .save_file(&session.full_path, &session.buffer, None)
            .map_err(|e| self.errno_of("fsync", &session.full_path, e))
    }

    /// Drops an open session's in-memory buffer.
    pub fn release_handle(&self, fh: u64) {
        self.handles.lock().unwrap().remove(&fh);
    }
}

impl Filesystem for DockerFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        match self.resolve(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.attr_of(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let target = self
            .entries
            .lock()
            .unwrap()
            .get(&ino)
            .map(|e| e.link_target.clone());
        match target {
            Some(t) => reply.data(t.as_bytes()),
            None => reply.error(ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir_path) = self.entry_path(ino) else {
            reply.error(ENOENT);
            return;
        };

        let changes = match self.tracker.changes_in_dir(&dir_path, self.api.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                log::error!("readdir({dir_path}): {e}");
                reply.error(EIO);
                return;
            }
        };

        let children = merge_children(&self.baseline, &changes, &dir_path);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for (name, is_dir) in children {
            let child_path = crate::path::join(&dir_path, &name);
            let child_ino = self.inodes.inode(&child_path);
            let kind = if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child_ino, kind, name));
        }

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            let next_offset = (i + 1) as i64;
            if reply.add(child_ino, next_offset, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_path(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_handle(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_handle(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_handle(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fsync_handle(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_handle(fh);
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, FsChange, S_IFDIR, S_IFLNK, S_IFREG};

    fn baseline_fixture() -> Baseline {
        Baseline::from_entries([
            ("/file1.txt".to_string(), S_IFREG | 0o644),
            ("/dir2/file2.txt".to_string(), S_IFREG | 0o644),
            ("/file3.txt".to_string(), S_IFREG | 0o644),
            ("/dir2/file4.txt".to_string(), S_IFREG | 0o644),
            ("/dir3/file5.txt".to_string(), S_IFREG | 0o644),
        ])
    }

    #[test]
    fn baseline_listing_infers_directories_from_prefixes() {
        let baseline = baseline_fixture();
        let root_children = merge_children(&baseline, &[], "/");
        let mut names: Vec<_> = root_children.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["dir2", "dir3", "file1.txt", "file3.txt"]);
        assert!(root_children["dir2"]);
        assert!(root_children["dir3"]);
        assert!(!root_children["file1.txt"]);

        let dir2_children = merge_children(&baseline, &[], "/dir2");
        let mut names: Vec<_> = dir2_children.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["file2.txt", "file4.txt"]);
    }

    #[test]
    fn added_change_appears_in_listing() {
        let baseline = baseline_fixture();
        let changes = vec![FsChange {
            path: "/dir2/file6.txt".to_string(),
            kind: ChangeKind::Added,
            mode: Some(S_IFREG | 0o644),
        }];
        let children = merge_children(&baseline, &changes, "/dir2");
        assert_eq!(children.len(), 3);
        assert!(!children["file6.txt"]);
    }

    #[test]
    fn removed_change_is_omitted_from_listing() {
        let baseline = baseline_fixture();
        let changes = vec![FsChange {
            path: "/dir2/file2.txt".to_string(),
            kind: ChangeKind::Removed,
            mode: None,
        }];
        let children = merge_children(&baseline, &changes, "/dir2");
        let mut names: Vec<_> = children.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["file4.txt"]);
    }

    #[test]
    fn modified_changes_never_surface_as_new_children() {
        let baseline = baseline_fixture();
        let changes = vec![FsChange {
            path: "/dir2/file7.txt".to_string(),
            kind: ChangeKind::Modified,
            mode: Some(S_IFREG | 0o644),
        }];
        let children = merge_children(&baseline, &changes, "/dir2");
        assert!(!children.contains_key("file7.txt"));
    }

    #[test]
    fn classify_mode_dispatches_on_type_bits() {
        assert_eq!(classify_mode(S_IFDIR | 0o755), Kind::Directory);
        assert_eq!(classify_mode(S_IFLNK | 0o777), Kind::Symlink);
        assert_eq!(classify_mode(S_IFREG | 0o644), Kind::Regular);
    }

    #[test]
    fn open_flags_readonly_by_default() {
        let mut buf = b"hello".to_vec();
        let (read, write, pos) = apply_open_flags(&mut buf, libc::O_RDONLY);
        assert!(read);
        assert!(!write);
        assert_eq!(pos, 0);
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn open_flags_wronly_is_not_readable() {
        let mut buf = b"hello".to_vec();
        let (read, write, _) = apply_open_flags(&mut buf, libc::O_WRONLY);
        assert!(!read);
        assert!(write);
    }

    #[test]
    fn open_flags_trunc_empties_buffer_immediately() {
        let mut buf = b"hello".to_vec();
        apply_open_flags(&mut buf, libc::O_RDWR | libc::O_TRUNC);
        assert!(buf.is_empty());
    }

    #[test]
    fn open_flags_append_seeks_to_end() {
        let mut buf = b"hello".to_vec();
        let (_, _, pos) = apply_open_flags(&mut buf, libc::O_RDWR | libc::O_APPEND);
        assert_eq!(pos, 5);
    }

    #[test]
    fn read_slice_short_reads_at_eof() {
        let buf = b"file1\n".to_vec();
        assert_eq!(read_slice(&buf, 0, 100), b"file1\n");
        assert_eq!(read_slice(&buf, 100, 10), b"");
        assert_eq!(read_slice(&buf, 2, 2), b"le");
    }

    #[test]
    fn write_into_buffer_grows_and_overwrites() {
        let mut buf = b"file1\n".to_vec();
        write_into_buffer(&mut buf, 0, b"zz");
        assert_eq!(buf, b"zzle1\n");

        let mut buf2 = Vec::new();
        write_into_buffer(&mut buf2, 3, b"ab");
        assert_eq!(buf2, vec![0, 0, 0, b'a', b'b']);
    }
}
