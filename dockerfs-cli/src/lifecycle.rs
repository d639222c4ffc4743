//! Mount/unmount lifecycle: daemonization, PID/signal handling, and the
//! persistent `container id -> mount path` status file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use dockerfs::adapter::{ContainerApi, HttpContainerApi};
use dockerfs::client::ControlClient;
use dockerfs::types::Container as RuntimeContainer;
use dockerfs::Mount;
use fuser::BackgroundSession;

/// A container as shown to the picker: the runtime's own fields plus
/// whatever this manager currently knows about its mount state.
#[derive(Debug, Clone)]
pub struct ContainerEntry {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub image: String,
    pub command: String,
    pub mount_point: Option<PathBuf>,
}

impl ContainerEntry {
    fn from_runtime(c: RuntimeContainer, mount_point: Option<PathBuf>) -> Self {
        let name = c
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        Self {
            short_id: c.id.chars().take(8).collect(),
            id: c.id,
            name,
            image: c.image,
            command: c.command,
            mount_point,
        }
    }

    pub fn mounted(&self) -> bool {
        self.mount_point.is_some()
    }
}

pub struct Manager {
    status_path: PathBuf,
    docker_addr: String,
}

impl Manager {
    pub fn new(docker_addr: impl Into<String>) -> Self {
        let status_path = dirs_home()
            .map(|home| home.join(".dockerfs.status.json"))
            .unwrap_or_else(|| PathBuf::from("/tmp/.dockerfs.status.json"));
        Self {
            status_path,
            docker_addr: docker_addr.into(),
        }
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerEntry>> {
        let client = ControlClient::connect(&self.docker_addr)
            .context("failed to connect to the container runtime socket")?;
        let api = HttpContainerApi::new(client, String::new());
        let list = api.containers_list().context("failed to list containers")?;
        let status = self.read_status()?;
        Ok(list
            .into_iter()
            .map(|c| {
                let mount_point = status.get(&c.id).map(PathBuf::from);
                ContainerEntry::from_runtime(c, mount_point)
            })
            .collect())
    }

    /// Mounts `container_id`'s filesystem at `mount_point`. If
    /// `daemonize` is set, forks to the background before serving so the
    /// caller's shell regains control; otherwise blocks until unmounted.
    pub fn mount_container(
        &self,
        container_id: &str,
        mount_point: &Path,
        changes_interval: Duration,
        daemonize: bool,
    ) -> Result<()> {
        std::fs::create_dir_all(mount_point)
            .with_context(|| format!("failed to create mount point {}", mount_point.display()))?;

        let mut mount = Mount::new(container_id)
            .with_docker_addr(self.docker_addr.clone())
            .with_changes_interval(changes_interval);
        mount.init().context("dockerfs Mount::init failed")?;
        let root = mount.root();

        log::info!("mounting {container_id} at {}", mount_point.display());
        let session = fuser::spawn_mount2(root, mount_point, &[])
            .with_context(|| format!("failed to mount at {}", mount_point.display()))?;

        self.write_status(container_id, Some(mount_point))?;

        if daemonize {
            let log_path = format!("/tmp/dockerfs-{container_id}.log");
            log::warn!("daemonizing; writing log to {log_path}");
            let log_file = std::fs::File::create(&log_path)?;
            daemonize::Daemonize::new()
                .stdout(log_file.try_clone()?)
                .stderr(log_file)
                .start()
                .context("daemonization failed")?;
        }

        let session = Arc::new(Mutex::new(Some(session)));
        install_unmount_on_signal(Arc::clone(&session));

        wait_for_unmount(session);
        self.write_status(container_id, None)?;
        Ok(())
    }

    pub fn unmount_container(&self, container_id: &str, mount_point: &Path) -> Result<()> {
        let status = Command::new("umount")
            .arg(mount_point)
            .status()
            .context("failed to invoke umount")?;
        if !status.success() {
            log::warn!("umount exited with {status}");
        }
        self.write_status(container_id, None)
    }

    fn read_status(&self) -> Result<HashMap<String, String>> {
        match std::fs::read(&self.status_path) {
            Ok(data) => Ok(serde_json::from_slice(&data).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).context("failed to read dockerfs status file"),
        }
    }

    fn write_status(&self, container_id: &str, mount_point: Option<&Path>) -> Result<()> {
        let mut status = self.read_status()?;
        match mount_point {
            Some(p) => {
                let abs = std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
                status.insert(container_id.to_string(), abs.display().to_string());
            }
            None => {
                status.remove(container_id);
            }
        }
        let data = serde_json::to_vec(&status)?;
        std::fs::write(&self.status_path, data).context("failed to write dockerfs status file")
    }
}

fn dirs_home() -> Option<PathBuf> {
    directories::UserDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Blocks the current thread until the background session is gone,
/// either because the kernel unmounted it or a signal handler dropped it.
fn wait_for_unmount(session: Arc<Mutex<Option<BackgroundSession>>>) {
    loop {
        {
            let guard = session.lock().unwrap();
            if guard.is_none() {
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn install_unmount_on_signal(session: Arc<Mutex<Option<BackgroundSession>>>) {
    let result = ctrlc::set_handler(move || {
        log::info!("received interrupt, unmounting");
        session.lock().unwrap().take();
    });
    if let Err(e) = result {
        log::warn!("failed to install signal handler: {e}");
    }
}
