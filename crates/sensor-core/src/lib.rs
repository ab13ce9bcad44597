//! Building blocks shared by every sensor: the [`Stream`] channel pair, the
//! [`Repeater`] fan-out, the sensor runtime and the domain events.

pub mod config;
pub mod event;
pub mod repeater;
pub mod sensor;
pub mod stream;

pub use config::{ConfigError, SensorConfig};
pub use event::{ContainerEvent, ContainerState, Event, ProcessEvent, ProcessState};
pub use repeater::{HandleControl, Repeater, RepeaterError, Subscription};
pub use sensor::{
    BoxError, Controller, EventStream, Sensor, SensorCell, SensorError, SensorHandle, Sink,
    SinkClosed, Source,
};
pub use stream::{Item, Stream, StreamError};
