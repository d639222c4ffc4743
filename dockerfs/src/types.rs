use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;

pub fn mode_is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn mode_is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Attributes of a single path as reported by the runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerPathStat {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    #[serde(default, rename = "linkTarget")]
    pub link_target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Added,
    Removed,
}

impl<'de> Deserialize<'de> for ChangeKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = u8::deserialize(deserializer)?;
        match raw {
            0 => Ok(ChangeKind::Modified),
            1 => Ok(ChangeKind::Added),
            2 => Ok(ChangeKind::Removed),
            other => Err(serde::de::Error::custom(format!(
                "unknown change kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsChange {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Kind")]
    pub kind: ChangeKind,
    #[serde(skip)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: Vec<String>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Command")]
    pub command: String,
}
