//! Docker per-container state file (`config.v2.json`).

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const DOCKER_CONTAINERS_PATH: &str = "/var/lib/docker/containers";
pub const CONFIG_FILE: &str = "config.v2.json";

/// Prefix of the zero value Docker writes for timestamps never set.
const ZERO_TIME_PREFIX: &str = "0001-01-01";

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("reading file {path:?} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
    #[error("parsing config from file `{path:?}` failed")]
    ParseConfigFile {
        #[source]
        source: serde_json::error::Error,
        path: PathBuf,
    },
}

/// Subset of `config.v2.json` used to follow a container lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DockerConfigV2 {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Image", default)]
    pub image_id: String,
    #[serde(rename = "Name", default, deserialize_with = "container_name")]
    pub name: String,
    #[serde(rename = "State", default)]
    pub state: DockerState,
    #[serde(rename = "Config", default)]
    pub config: DockerContainerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DockerState {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub removal_in_progress: bool,
    pub dead: bool,
    pub pid: i32,
    #[serde(deserialize_with = "go_time")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "go_time")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DockerContainerConfig {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    pub image: String,
}

impl DockerConfigV2 {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read and parse a state file, returning it together with its raw content.
    pub fn from_file(path: &Path) -> Result<(Self, String), ContainerError> {
        let raw = fs::read_to_string(path).map_err(|source| ContainerError::ReadFile {
            source,
            path: path.to_path_buf(),
        })?;
        let config = Self::parse(&raw).map_err(|source| ContainerError::ParseConfigFile {
            source,
            path: path.to_path_buf(),
        })?;
        Ok((config, raw))
    }
}

/// Container names are stored with a leading `/`.
fn container_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let name = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    Ok(match name.strip_prefix('/') {
        Some(name) => name.to_owned(),
        None => name,
    })
}

/// RFC 3339 timestamp where a missing, empty or zero value means unset.
fn go_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let Some(time) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if time.is_empty() || time.starts_with(ZERO_TIME_PREFIX) {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(&time)
        .map(|time| Some(time.with_timezone(&Utc)))
        .map_err(serde::de::Error::custom)
}
