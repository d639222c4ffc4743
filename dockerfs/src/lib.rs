//! Virtual filesystem engine that mounts a running container's filesystem
//! through FUSE, reconciling a one-shot snapshot with the container
//! runtime's live change list and per-path metadata.

pub mod adapter;
pub mod changes;
pub mod client;
pub mod error;
pub mod fs;
pub mod inode;
pub mod path;
pub mod snapshot;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use adapter::{ContainerApi, HttpContainerApi};
use client::ControlClient;
use error::Result;
use fs::DockerFs;
use snapshot::Baseline;

/// Default interval between change-list refreshes.
pub const DEFAULT_CHANGES_INTERVAL: Duration = Duration::from_secs(1);

/// Default control-plane socket address.
pub const DEFAULT_DOCKER_ADDR: &str = "unix:/var/run/docker.sock";

/// Orchestrates mount initialization: builds the control client and API
/// adapter, exports and parses the baseline snapshot, and finally hands
/// back a [`DockerFs`] ready to be given to the kernel mount layer.
pub struct Mount {
    container_id: String,
    docker_addr: String,
    changes_interval: Duration,
    api: Option<Arc<dyn ContainerApi>>,
    baseline: Option<Baseline>,
}

impl Mount {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            docker_addr: DEFAULT_DOCKER_ADDR.to_string(),
            changes_interval: DEFAULT_CHANGES_INTERVAL,
            api: None,
            baseline: None,
        }
    }

    /// Bypasses control-client construction with a pre-existing adapter,
    /// for tests backed by a fixture [`ContainerApi`].
    pub fn with_api(container_id: impl Into<String>, api: Arc<dyn ContainerApi>) -> Self {
        Self {
            container_id: container_id.into(),
            docker_addr: DEFAULT_DOCKER_ADDR.to_string(),
            changes_interval: DEFAULT_CHANGES_INTERVAL,
            api: Some(api),
            baseline: None,
        }
    }

    pub fn with_docker_addr(mut self, addr: impl Into<String>) -> Self {
        self.docker_addr = addr.into();
        self
    }

    pub fn with_changes_interval(mut self, interval: Duration) -> Self {
        self.changes_interval = interval;
        self
    }

    /// Constructs the control client (unless one was supplied via
    /// [`Mount::with_api`]), exports the container's filesystem, and
    /// parses it into the baseline snapshot. Must be called before
    /// [`Mount::root`].
    pub fn init(&mut self) -> Result<()> {
        let api = match self.api.take() {
            Some(api) => api,
            None => {
                let client = ControlClient::connect(&self.docker_addr)?;
                Arc::new(HttpContainerApi::new(client, self.container_id.clone())) as Arc<dyn ContainerApi>
            }
        };
        let baseline = snapshot::build_baseline(&self.container_id, api.as_ref())?;
        self.api = Some(api);
        self.baseline = Some(baseline);
        Ok(())
    }

    /// Returns the mountable root, consuming the baseline produced by
    /// [`Mount::init`]. Panics if called before `init`.
    pub fn root(&mut self) -> DockerFs {
        let api = self
            .api
            .clone()
            .expect("Mount::init must be called before Mount::root");
        let baseline = self
            .baseline
            .take()
            .expect("Mount::init must be called before Mount::root");
        DockerFs::new(api, baseline, self.changes_interval)
    }
}
