use std::io::Write;

use base64::Engine;
use chrono::Utc;

use crate::client::ControlClient;
use crate::error::{Error, Result};
use crate::types::{Container, ContainerPathStat, FsChange};

/// Typed wrapper over the control client, single-owner of a container id.
/// Exposed as a trait so tests can substitute a fixture-backed implementation
/// that never touches a real socket.
pub trait ContainerApi: Send + Sync {
    fn container_export(&self, dest: &mut dyn Write) -> Result<()>;
    fn get_path_attrs(&self, path: &str) -> Result<ContainerPathStat>;
    fn get_fs_changes(&self) -> Result<Vec<FsChange>>;
    fn get_file(&self, path: &str) -> Result<Vec<u8>>;
    fn save_file(&self, path: &str, data: &[u8], stat: Option<ContainerPathStat>) -> Result<()>;
    fn containers_list(&self) -> Result<Vec<Container>>;
}

pub struct HttpContainerApi {
    client: ControlClient,
    id: String,
}

impl HttpContainerApi {
    pub fn new(client: ControlClient, id: String) -> Self {
        Self { client, id }
    }
}

impl ContainerApi for HttpContainerApi {
    fn container_export(&self, dest: &mut dyn Write) -> Result<()> {
        self.client
            .get_to_writer(&format!("/containers/{}/export", self.id), dest)
    }

    fn get_path_attrs(&self, path: &str) -> Result<ContainerPathStat> {
        let url = format!("/containers/{}/archive?path={}", self.id, encode_path(path));
        let resp = self.client.head(&url)?;
        let header = resp
            .headers
            .get("X-Docker-Container-Path-Stat")
            .ok_or_else(|| {
                Error::ProtocolError("X-Docker-Container-Path-Stat header not found".to_string())
            })?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header.as_bytes())
            .map_err(|e| Error::ProtocolError(format!("invalid base64 path-stat: {e}")))?;
        let stat: ContainerPathStat = serde_json::from_slice(&decoded)?;
        Ok(stat)
    }

    fn get_fs_changes(&self) -> Result<Vec<FsChange>> {
        let url = format!("/containers/{}/changes", self.id);
        let resp = self.client.get(&url)?;
        let changes: Vec<FsChange> = serde_json::from_slice(&resp.body)?;
        Ok(changes)
    }

    fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("/containers/{}/archive?path={}", self.id, encode_path(path));
        let resp = self.client.get(&url)?;
        let mut archive = tar::Archive::new(resp.body.as_ref());
        let mut entries = archive
            .entries()
            .map_err(|e| Error::ProtocolError(format!("malformed tar archive: {e}")))?;
        let mut entry = entries
            .next()
            .ok_or_else(|| Error::ProtocolError("empty tar archive for file".to_string()))?
            .map_err(|e| Error::ProtocolError(format!("malformed tar entry: {e}")))?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut buf)?;
        Ok(buf)
    }

    fn save_file(&self, path: &str, data: &[u8], stat: Option<ContainerPathStat>) -> Result<()> {
        let stat = match stat {
            Some(s) => s,
            None => self.get_path_attrs(path)?,
        };
        let name = crate::path::basename(path);
        let dir = crate::path::parent_of(path);
        let buffer = build_single_entry_tar(name, data, stat.mode, Utc::now().timestamp() as u64)?;

        let url = format!("/containers/{}/archive?path={}", self.id, encode_path(&dir));
        let content_type = sniff_content_type(&buffer);
        self.client.put(&url, content_type, buffer)?;
        Ok(())
    }

    fn containers_list(&self) -> Result<Vec<Container>> {
        let resp = self.client.get("/containers/json")?;
        let containers: Vec<Container> = serde_json::from_slice(&resp.body)?;
        Ok(containers)
    }
}

/// Builds a one-entry TAR archive `{name, mode, mtime}` followed by `data`,
/// the write-back format `SaveFile` PUTs to the archive endpoint.
fn build_single_entry_tar(name: &str, data: &[u8], mode: u32, mtime: u64) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut builder = tar::Builder::new(&mut buffer);
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::ProtocolError(format!("failed to build tar: {e}")))?;
    builder
        .finish()
        .map_err(|e| Error::ProtocolError(format!("failed to build tar: {e}")))?;
    drop(builder);
    Ok(buffer)
}

fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        "application/gzip"
    } else if bytes.starts_with(b"PK\x03\x04") {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}
