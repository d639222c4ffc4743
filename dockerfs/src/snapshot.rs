use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use tar::EntryType;

use crate::adapter::ContainerApi;
use crate::client::{create_scratch_file, default_cache_dir};
use crate::error::Result;
use crate::types::{mode_is_symlink, S_IFLNK, S_IFREG};

/// Immutable `path -> mode` table derived once from the container's export
/// archive at mount time.
#[derive(Debug, Default)]
pub struct Baseline {
    entries: BTreeMap<String, u32>,
}

impl Baseline {
    #[cfg(test)]
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = (String, u32)>) -> Self {
        Baseline {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<u32> {
        self.entries.get(path).copied()
    }

    /// Entries whose path starts with `prefix`, in lexicographic order.
    pub fn children_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, u32)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), *v))
    }
}

/// Exports the container's filesystem to a local scratch file and parses it
/// into a [`Baseline`]. The scratch file is removed once parsing completes;
/// the cache directory itself persists (other mounts may share it).
pub fn build_baseline(container_id: &str, api: &dyn ContainerApi) -> Result<Baseline> {
    let cache_dir = default_cache_dir()?;
    let (scratch_path, mut scratch_file) = create_scratch_file(&cache_dir, container_id)?;
    api.container_export(&mut scratch_file)?;
    drop(scratch_file);

    let baseline = parse_snapshot_file(&scratch_path);
    let _ = std::fs::remove_file(&scratch_path);
    baseline
}

fn parse_snapshot_file(path: &Path) -> Result<Baseline> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(file);
    let mut entries = BTreeMap::new();

    let iter = match archive.entries() {
        Ok(iter) => iter,
        Err(e) => {
            log::warn!("failed to read snapshot archive, returning empty baseline: {e}");
            return Ok(Baseline { entries });
        }
    };

    for entry_result in iter {
        let entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                log::warn!("snapshot decode error, aborting parse with partial result: {e}");
                break;
            }
        };
        let header = entry.header();
        let entry_type = header.entry_type();
        let path = match entry.path() {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(e) => {
                log::warn!("skipping snapshot entry with invalid path: {e}");
                continue;
            }
        };
        match entry_type {
            EntryType::Regular | EntryType::Continuous => {
                let perm = header.mode().unwrap_or(0o644) & 0o7777;
                entries.insert(crate::path::clean(&path), S_IFREG | perm);
            }
            EntryType::Symlink => {
                let perm = header.mode().unwrap_or(0o777) & 0o7777;
                entries.insert(crate::path::clean(&path), S_IFLNK | perm);
            }
            EntryType::Directory => continue,
            other => {
                log::debug!("skipping snapshot entry of kind {other:?} at {path}");
                continue;
            }
        }
    }

    Ok(Baseline { entries })
}

pub fn symlink_bit_set(mode: u32) -> bool {
    mode_is_symlink(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar(entries: &[(&str, EntryType, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("content_test.tar");
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        for (name, kind, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*kind);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
        dir
    }

    #[test]
    fn parses_regular_files_and_skips_directories() {
        let dir = write_tar(&[
            ("dir2/", EntryType::Directory, b""),
            ("dir2/file2.txt", EntryType::Regular, b"file2\n"),
            ("file1.txt", EntryType::Regular, b"file1\n"),
        ]);
        let baseline = parse_snapshot_file(&dir.path().join("content_test.tar")).unwrap();
        assert!(baseline.get("/file1.txt").is_some());
        assert!(baseline.get("/dir2/file2.txt").is_some());
        assert!(baseline.get("/dir2").is_none());
    }

    #[test]
    fn records_symlink_bit() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("content_test.tar");
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder
            .append_link(&mut header, "link1", "file1.txt")
            .unwrap();
        builder.finish().unwrap();

        let baseline = parse_snapshot_file(&tar_path).unwrap();
        let mode = baseline.get("/link1").unwrap();
        assert!(symlink_bit_set(mode));
    }
}
