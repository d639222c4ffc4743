use std::collections::HashMap;
use std::sync::Mutex;

/// Deterministic, process-lifetime `path -> inode number` table.
/// Allocation is append-only: once a path is assigned an inode it keeps
/// it for the life of the mount.
pub struct InodeAllocator {
    inner: Mutex<HashMap<String, u64>>,
}

impl InodeAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the stable inode for `path`. The root is hardcoded to
    /// inode 1 and never occupies a slot in the table; every other path
    /// allocates `len() + 2` the first time it's seen.
    pub fn inode(&self, path: &str) -> u64 {
        if path == "/" {
            return 1;
        }
        let mut map = self.inner.lock().unwrap();
        if let Some(ino) = map.get(path) {
            return *ino;
        }
        let ino = map.len() as u64 + 2;
        map.insert(path.to_string(), ino);
        ino
    }
}

impl Default for InodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}
