//! Docker container lifecycle sensor.
//!
//! Watches the Docker storage directory with inotify and follows the
//! `config.v2.json` state file of every container, see [`state`] for how
//! snapshots become [`ContainerEvent`]s.

use std::{
    convert::Infallible,
    env,
    path::{Path, PathBuf},
};

use regex::Regex;
use sensor_common::{
    containers::DOCKER_CONTAINERS_PATH,
    inotify::{AddWatchFlags, WatchControl, WatchStream, Watcher},
};
use sensor_core::{
    BoxError, ConfigError, ContainerEvent, Controller, EventStream, Sensor, SensorCell,
    SensorConfig, SensorError, SensorHandle, Sink, Source,
};

pub mod state;

pub use state::{ContainerTracker, classify};

pub const SENSOR_NAME: &str = "container-sensor";

/// Overrides the default storage directory.
pub const STORAGE_DIR_ENV: &str = "DOCKER_LOCAL_STORAGE_DIR";

static SENSOR: SensorCell<ContainerSensor> = SensorCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSensor {
    storage_dir: PathBuf,
}

impl Default for ContainerSensor {
    fn default() -> Self {
        let storage_dir = env::var_os(STORAGE_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DOCKER_CONTAINERS_PATH));
        Self { storage_dir }
    }
}

impl ContainerSensor {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
        }
    }

    /// `storage_dir` from the configuration, falling back to the environment
    /// and then to the Docker default.
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        Ok(match config.optional::<PathBuf>("storage_dir")? {
            Some(storage_dir) => Self::new(storage_dir),
            None => Self::default(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

/// Directories named after a container id, directly under `storage_dir`.
fn container_dir_pattern(storage_dir: &Path) -> Result<Regex, regex::Error> {
    let storage_dir = storage_dir.to_string_lossy();
    let storage_dir = storage_dir.trim_end_matches('/');
    Regex::new(&format!(
        "^{}/[[:xdigit:]]{{64}}$",
        regex::escape(storage_dir)
    ))
}

impl Sensor for ContainerSensor {
    const NAME: &'static str = SENSOR_NAME;

    type Event = ContainerEvent;
    type Command = Infallible;
    type Controller = ContainerController;
    type Source = ContainerSource;

    fn setup(self) -> Result<(ContainerController, ContainerSource), BoxError> {
        let dir_mask = AddWatchFlags::IN_ONLYDIR | AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE;
        let config_mask =
            AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_CLOSE_WRITE;

        let watcher = Watcher::new()?;
        watcher.add_watch(&self.storage_dir, dir_mask)?;
        watcher.add_trigger(container_dir_pattern(&self.storage_dir)?, config_mask);
        // Containers we can't see now are picked up at their next state change.
        if let Err(err) = watcher.watch_existing(&self.storage_dir) {
            sensor_common::log_error("watching existing containers", err);
        }
        let (stream, control) = watcher.events()?;
        log::debug!(target: SENSOR_NAME, "watching {}", self.storage_dir.display());

        Ok((
            ContainerController { control },
            ContainerSource {
                stream,
                tracker: ContainerTracker::new(),
            },
        ))
    }
}

pub struct ContainerController {
    control: WatchControl,
}

impl Controller<Infallible> for ContainerController {
    fn handle(&mut self, command: Infallible) -> Result<(), BoxError> {
        match command {}
    }

    fn shutdown(self) {
        self.control.stop();
    }
}

pub struct ContainerSource {
    stream: WatchStream,
    tracker: ContainerTracker,
}

impl Source<ContainerEvent> for ContainerSource {
    async fn run(mut self, sink: Sink<ContainerEvent>) {
        loop {
            let event = tokio::select! {
                event = self.stream.recv() => event,
                _ = sink.closed() => break,
            };
            let Some(event) = event else {
                break;
            };
            if let Some(event) = self.tracker.on_watch_event(&event) {
                log::debug!(target: SENSOR_NAME, "{event}");
                if sink.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Handle of the shared sensor, started with `start` on first use.
pub async fn shared_handle<F>(start: F) -> Result<SensorHandle<ContainerSensor>, SensorError>
where
    F: FnOnce() -> Result<SensorHandle<ContainerSensor>, SensorError>,
{
    SENSOR.get_or_start(start).await
}

/// New stream of container events.
///
/// The first call starts the shared sensor on the default storage directory;
/// if that fails every call returns the same [`SensorError::Unavailable`].
pub async fn event_stream() -> Result<EventStream<ContainerEvent>, SensorError> {
    SENSOR
        .new_stream(|| SensorHandle::start(ContainerSensor::default()))
        .await
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use sensor_core::ContainerState;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);
    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const OTHER: &str = "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

    const CREATED: &str = r#"{"ID":"ID_","Name":"/web","Config":{"Image":"nginx"},
        "State":{"Running":false,"StartedAt":"0001-01-01T00:00:00Z"}}"#;
    const RUNNING: &str = r#"{"ID":"ID_","Name":"/web","Config":{"Image":"nginx"},
        "State":{"Running":true,"Pid":4242,"StartedAt":"2023-11-02T10:15:30Z"}}"#;

    fn config(template: &str, id: &str) -> String {
        template.replace("ID_", id)
    }

    /// Replace a state file the way Docker does, through a rename.
    fn write_config(dir: &Path, content: &str) {
        let tmp = dir.join(".tmp-config.v2.json");
        fs::write(&tmp, content).unwrap();
        fs::rename(&tmp, dir.join("config.v2.json")).unwrap();
    }

    async fn next(stream: &mut EventStream<ContainerEvent>) -> ContainerEvent {
        let item = timeout(WAIT, stream.recv())
            .await
            .expect("timed out waiting for a container event")
            .expect("stream ended");
        (*item.unwrap()).clone()
    }

    #[test]
    fn pattern_matches_container_directories_only() {
        let pattern = container_dir_pattern(Path::new("/var/lib/docker/containers/")).unwrap();
        assert!(pattern.is_match(&format!("/var/lib/docker/containers/{ID}")));
        assert!(!pattern.is_match(&format!("/var/lib/docker/containers/{ID}/mounts")));
        assert!(!pattern.is_match(&format!("/var/lib/docker/containers/{}", &ID[1..])));
        assert!(!pattern.is_match(&format!("/other/containers/{ID}")));
    }

    #[test]
    fn storage_dir_from_config() {
        let config = SensorConfig::new().with("storage_dir", "/srv/docker/containers");
        let sensor = ContainerSensor::from_config(&config).unwrap();
        assert_eq!(sensor.storage_dir(), Path::new("/srv/docker/containers"));
    }

    #[tokio::test]
    async fn missing_storage_dir_makes_the_sensor_unavailable() {
        let sensor = ContainerSensor::new("/nonexistent/sensord/containers");
        let err = SensorHandle::start(sensor).unwrap_err();
        assert!(matches!(err, SensorError::Unavailable(SENSOR_NAME, _)));
    }

    #[tokio::test]
    async fn existing_containers_are_reported_at_setup() {
        let root = tempfile::tempdir().unwrap();
        let existing = root.path().join(ID);
        fs::create_dir(&existing).unwrap();
        write_config(&existing, &config(RUNNING, ID));

        let (_controller, mut source) = ContainerSensor::new(root.path()).setup().unwrap();
        let event = timeout(WAIT, async {
            loop {
                let event = source.stream.recv().await.expect("watcher stopped");
                if let Some(event) = source.tracker.on_watch_event(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for the existing container");
        assert_eq!((event.id.as_str(), event.state), (ID, ContainerState::Running));
        assert_eq!(event.pid, 4242);
        assert_eq!(event.name, "web");
    }

    #[tokio::test]
    async fn follows_containers_on_disk() {
        let root = tempfile::tempdir().unwrap();
        let handle = SensorHandle::start(ContainerSensor::new(root.path())).unwrap();
        let mut stream = handle.new_stream().await.unwrap();

        let dir = root.path().join(OTHER);
        fs::create_dir(&dir).unwrap();
        write_config(&dir, &config(CREATED, OTHER));
        let event = next(&mut stream).await;
        assert_eq!((event.id.as_str(), event.state), (OTHER, ContainerState::Created));
        assert_eq!(event.image, "nginx");

        write_config(&dir, &config(RUNNING, OTHER));
        let event = next(&mut stream).await;
        assert_eq!((event.id.as_str(), event.state), (OTHER, ContainerState::Running));
        assert_eq!(event.pid, 4242);

        fs::remove_dir_all(&dir).unwrap();
        assert_eq!(next(&mut stream).await, ContainerEvent::dead(OTHER));
    }
}
