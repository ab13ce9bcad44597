//! Reconstruction of container lifecycle transitions from state file snapshots.
//!
//! Docker never reports transitions, it rewrites `config.v2.json` and deletes
//! it with the container. Every snapshot is classified on its own from the
//! flags it carries, so the result is a best-effort guess: flag combinations
//! overlap and the first matching rule wins.

use std::{collections::HashMap, ffi::OsStr, path::Path};

use sensor_common::{
    containers::{CONFIG_FILE, DockerConfigV2, DockerState},
    inotify::{AddWatchFlags, WatchEvent},
};
use sensor_core::{ContainerEvent, ContainerState};

use crate::SENSOR_NAME;

/// Lifecycle state of a snapshot, `None` when no rule applies.
pub fn classify(state: &DockerState) -> Option<ContainerState> {
    let started = state.started_at.is_some();
    let finished = state.finished_at.is_some();
    if !state.running && !started {
        Some(ContainerState::Created)
    } else if state.restarting {
        Some(ContainerState::Restarting)
    } else if state.running && started {
        Some(ContainerState::Running)
    } else if state.removal_in_progress {
        Some(ContainerState::Removing)
    } else if state.paused {
        Some(ContainerState::Paused)
    } else if !state.running && finished {
        Some(ContainerState::Exited)
    } else {
        None
    }
}

/// Turns state file changes into container events, forwarding a snapshot
/// only when its state or pid differ from the last forwarded ones.
#[derive(Debug, Default)]
pub struct ContainerTracker {
    last: HashMap<String, Known>,
}

/// What is remembered of a container between two snapshots.
#[derive(Debug)]
struct Known {
    state: ContainerState,
    pid: i32,
    /// Refreshed on every classified snapshot, forwarded or not.
    raw_config: String,
}

impl ContainerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_watch_event(&mut self, event: &WatchEvent) -> Option<ContainerEvent> {
        if event.name.as_deref() != Some(OsStr::new(CONFIG_FILE)) {
            return None;
        }
        if event.mask.contains(AddWatchFlags::IN_DELETE) {
            let id = container_dir(&event.path)?;
            self.last.remove(&id);
            return Some(ContainerEvent::dead(id));
        }

        let (config, raw) = match DockerConfigV2::from_file(&event.path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // Usually a write still in progress, the next one will be complete.
                log::warn!(target: SENSOR_NAME, "skipping {}: {err}", event.path.display());
                return None;
            }
        };
        let Some(state) = classify(&config.state) else {
            log::debug!(
                target: SENSOR_NAME,
                "no state for {}: {:?}",
                event.path.display(),
                config.state
            );
            return None;
        };
        let id = match config.id.is_empty() {
            true => container_dir(&event.path)?,
            false => config.id,
        };
        let container = ContainerEvent {
            id,
            name: config.name,
            image_id: config.image_id,
            image: config.config.image,
            state,
            pid: config.state.pid,
            raw_config: Some(raw.clone()),
        };
        self.update(container, raw)
    }

    fn update(&mut self, event: ContainerEvent, raw_config: String) -> Option<ContainerEvent> {
        let known = Known {
            state: event.state,
            pid: event.pid,
            raw_config,
        };
        match self.last.insert(event.id.clone(), known) {
            Some(previous) if previous.state == event.state && previous.pid == event.pid => {
                let refreshed = event.raw_config.as_deref() != Some(previous.raw_config.as_str());
                log::trace!(
                    target: SENSOR_NAME,
                    "{} still {}, snapshot changed: {refreshed}",
                    event.id,
                    event.state
                );
                None
            }
            _ => Some(event),
        }
    }

    /// Number of containers currently known.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Container id, taken from the name of the directory holding the state file.
fn container_dir(path: &Path) -> Option<String> {
    let dir = path.parent()?.file_name()?;
    Some(dir.to_string_lossy().into_owned())
}
