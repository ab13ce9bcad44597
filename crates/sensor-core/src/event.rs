use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Any event produced by a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sensor", content = "event", rename_all = "snake_case")]
pub enum Event {
    Process(ProcessEvent),
    Container(ContainerEvent),
}

impl From<ProcessEvent> for Event {
    fn from(event: ProcessEvent) -> Self {
        Event::Process(event)
    }
}

impl From<ContainerEvent> for Event {
    fn from(event: ContainerEvent) -> Self {
        Event::Container(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Process(event) => write!(f, "[process] {event}"),
            Event::Container(event) => write!(f, "[container] {event}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Process reporting the event.
    pub pid: i32,
    /// Monotonic kernel timestamp of the sample.
    pub counter: u64,
    pub state: ProcessState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum ProcessState {
    Fork { child_pid: i32 },
    Exec { filename: String },
    Exit { exit_status: u64 },
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ProcessEvent {
            pid,
            counter,
            state,
        } = self;
        write!(f, "{counter} ({pid}) {state}")
    }
}

#[rustfmt::skip]
impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Fork { child_pid } => write!(f, "Fork {{ child_pid: {child_pid} }}"),
            ProcessState::Exec { filename } => write!(f, "Exec {{ filename: {filename} }}"),
            ProcessState::Exit { exit_status } => write!(f, "Exit {{ exit_status: {exit_status} }}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub image: String,
    pub state: ContainerState,
    /// Host pid of the container init process, 0 when not running.
    pub pid: i32,
    /// Content of the state file this event was derived from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub raw_config: Option<String>,
}

impl ContainerEvent {
    /// Event for a container whose state file is gone: only the id is known.
    pub fn dead(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            image_id: String::new(),
            image: String::new(),
            state: ContainerState::Dead,
            pid: 0,
            raw_config: None,
        }
    }
}

impl fmt::Display for ContainerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_id = self.id.get(..12).unwrap_or(&self.id);
        write!(
            f,
            "{short_id} {} {{ name: {}, image: {}, pid: {} }}",
            self.state, self.name, self.image, self.pid
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerState {
    Created,
    Restarting,
    Running,
    Removing,
    Paused,
    Exited,
    Dead,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn running() -> ContainerEvent {
        ContainerEvent {
            id: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".to_string(),
            name: "web".to_string(),
            image_id: "sha256:feed".to_string(),
            image: "nginx:latest".to_string(),
            state: ContainerState::Running,
            pid: 4242,
            raw_config: None,
        }
    }

    #[test]
    fn process_event_display() {
        let event = Event::from(ProcessEvent {
            pid: 100,
            counter: 7,
            state: ProcessState::Fork { child_pid: 200 },
        });
        assert_eq!(event.to_string(), "[process] 7 (100) Fork { child_pid: 200 }");
    }

    #[test]
    fn container_event_display_uses_short_id() {
        let event = Event::from(running());
        assert_eq!(
            event.to_string(),
            "[container] 0123456789ab running { name: web, image: nginx:latest, pid: 4242 }"
        );
    }

    #[test]
    fn dead_event_only_carries_the_id() {
        let event = ContainerEvent::dead("abc");
        assert_eq!(event.id, "abc");
        assert_eq!(event.state, ContainerState::Dead);
        assert!(event.name.is_empty() && event.image.is_empty() && event.image_id.is_empty());
        assert_eq!(event.pid, 0);
        assert_eq!(event.raw_config, None);
        assert_eq!(event.to_string(), "abc dead { name: , image: , pid: 0 }");
    }

    #[test]
    fn container_state_names() {
        assert_eq!(ContainerState::Removing.to_string(), "removing");
        assert_eq!(
            ContainerState::from_str("restarting").unwrap(),
            ContainerState::Restarting
        );
        assert!(ContainerState::from_str("unknown").is_err());
    }

    #[test]
    fn json_layout() {
        let event = Event::from(ProcessEvent {
            pid: 100,
            counter: 1,
            state: ProcessState::Exit { exit_status: 9 },
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sensor": "process",
                "event": {
                    "pid": 100,
                    "counter": 1,
                    "state": { "type": "Exit", "content": { "exit_status": 9 } }
                }
            })
        );

        let json = serde_json::to_value(Event::from(running())).unwrap();
        assert_eq!(json["event"]["state"], "running");
        assert!(json["event"].get("raw_config").is_none());
    }
}
