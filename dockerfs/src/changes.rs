use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::adapter::ContainerApi;
use crate::error::{Error, Result};
use crate::types::{ChangeKind, FsChange};

/// Caches the runtime's change list for a bounded interval and serves
/// "direct children of directory D" queries from it.
pub struct ChangeTracker {
    interval: Duration,
    state: Mutex<State>,
}

struct State {
    changes: Vec<FsChange>,
    fetched_at: Option<Instant>,
}

impl ChangeTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(State {
                changes: Vec::new(),
                fetched_at: None,
            }),
        }
    }

    /// Returns the `Added`/`Removed` changes whose parent directory is
    /// exactly `dir`, each with its live mode filled in. `Modified`
    /// entries are withheld.
    pub fn changes_in_dir(&self, dir: &str, api: &dyn ContainerApi) -> Result<Vec<FsChange>> {
        let dir = crate::path::clean(dir);
        let mut state = self.state.lock().unwrap();

        let stale = match state.fetched_at {
            None => true,
            Some(t) => Instant::now() >= t + self.interval,
        };
        if stale {
            let refreshed = api.get_fs_changes()?;
            state.changes = refreshed;
            state.fetched_at = Some(Instant::now());
        }

        let mut result = Vec::new();
        for change in state.changes.iter() {
            if change.kind == ChangeKind::Modified {
                continue;
            }
            if crate::path::parent_of(&change.path) != dir {
                continue;
            }
            match api.get_path_attrs(&change.path) {
                Ok(stat) => {
                    let mut entry = change.clone();
                    entry.mode = Some(stat.mode);
                    result.push(entry);
                }
                Err(Error::NotFound) => continue,
                Err(e) => {
                    log::error!("failed to get attrs of {:?}: {e}", change.path);
                    continue;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Container, ContainerPathStat};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingApi {
        calls: AtomicUsize,
    }

    impl ContainerApi for CountingApi {
        fn container_export(&self, _dest: &mut dyn Write) -> Result<()> {
            unimplemented!()
        }
        fn get_path_attrs(&self, _path: &str) -> Result<ContainerPathStat> {
            unimplemented!()
        }
        fn get_fs_changes(&self) -> Result<Vec<FsChange>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        fn get_file(&self, _path: &str) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn save_file(&self, _path: &str, _data: &[u8], _stat: Option<ContainerPathStat>) -> Result<()> {
            unimplemented!()
        }
        fn containers_list(&self) -> Result<Vec<Container>> {
            unimplemented!()
        }
    }

    #[test]
    fn single_flight_refresh_within_interval() {
        let api = CountingApi {
            calls: AtomicUsize::new(0),
        };
        let tracker = ChangeTracker::new(Duration::from_millis(50));

        tracker.changes_in_dir("/", &api).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        tracker.changes_in_dir("/", &api).unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(100));
        tracker.changes_in_dir("/", &api).unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }
}
