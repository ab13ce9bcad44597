//! Process lifecycle sensor.
//!
//! Subscribes to the fork, exec and exit_group tracepoints and turns every
//! sample into a [`ProcessEvent`]. Samples which fail to decode are forwarded
//! to subscribers as stream errors.

use std::path::PathBuf;

use sensor_common::{
    Pid,
    perf::{
        DecodeError, EventMonitorBuilder, MonitorControl, MonitorFeed, MonitorFilter,
        PERF_PAGES_DEFAULT, SampleRecord, TraceEventSampleData, Tracepoint,
    },
};
use sensor_core::{
    BoxError, ConfigError, Controller, EventStream, ProcessEvent, ProcessState, Sensor,
    SensorCell, SensorConfig, SensorError, SensorHandle, Sink, Source,
};
use tokio::sync::mpsc;

pub const SENSOR_NAME: &str = "process-sensor";

const FEED_CAPACITY: usize = 1024;

static SENSOR: SensorCell<ProcessSensor> = SensorCell::new();

/// Commands accepted by a running process sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommand {
    Enable,
    Disable,
}

/// Settings of a process sensor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSensor {
    filter: MonitorFilter,
    perf_pages: usize,
    tracefs: Option<PathBuf>,
}

impl ProcessSensor {
    pub fn new(filter: MonitorFilter) -> Self {
        Self {
            filter,
            perf_pages: PERF_PAGES_DEFAULT,
            tracefs: None,
        }
    }

    pub fn system_wide() -> Self {
        Self::new(MonitorFilter::SystemWide)
    }

    /// Process `pid` and its descendants.
    pub fn pid(pid: Pid) -> Self {
        Self::new(MonitorFilter::Pids {
            pids: vec![pid],
            cpus: None,
        })
    }

    /// Process `pid` and its descendants while they run on `cpu`.
    pub fn pid_and_cpu(pid: Pid, cpu: u32) -> Self {
        Self::new(MonitorFilter::Pids {
            pids: vec![pid],
            cpus: Some(vec![cpu]),
        })
    }

    /// Every process in the cgroup `name`.
    pub fn cgroup(name: impl Into<String>) -> Self {
        Self::new(MonitorFilter::Cgroups(vec![name.into()]))
    }

    /// Read the sensor settings from its configuration section.
    ///
    /// `cgroups` takes precedence over `pids`; with neither the sensor is
    /// system-wide and `cpus` is ignored.
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        let pids: Vec<i32> = config.get_list("pids")?;
        let cpus: Vec<u32> = config.get_list("cpus")?;
        let cgroups: Vec<String> = config.get_list("cgroups")?;
        if let Some(pid) = pids.iter().find(|pid| **pid <= 0) {
            return Err(ConfigError::InvalidValue {
                field: "pids".to_string(),
                value: pid.to_string(),
                err: "pid must be positive".to_string(),
            });
        }

        let filter = if !cgroups.is_empty() {
            MonitorFilter::Cgroups(cgroups)
        } else if !pids.is_empty() {
            MonitorFilter::Pids {
                pids: pids.into_iter().map(Pid::from_raw).collect(),
                cpus: (!cpus.is_empty()).then_some(cpus),
            }
        } else {
            if !cpus.is_empty() {
                log::warn!(target: SENSOR_NAME, "cpus is only used together with pids, ignoring it");
            }
            MonitorFilter::SystemWide
        };

        let mut sensor = Self::new(filter)
            .perf_pages(config.optional_or("perf_pages", PERF_PAGES_DEFAULT)?);
        sensor.tracefs = config.optional("tracefs")?;
        Ok(sensor)
    }

    /// Pages of each per cpu ring buffer, a power of two.
    pub fn perf_pages(mut self, perf_pages: usize) -> Self {
        self.perf_pages = perf_pages;
        self
    }

    /// Tracefs mount point, looked up when not set.
    pub fn tracefs(mut self, root: impl Into<PathBuf>) -> Self {
        self.tracefs = Some(root.into());
        self
    }

    pub fn filter(&self) -> &MonitorFilter {
        &self.filter
    }

    fn monitor_builder(&self) -> EventMonitorBuilder<ProcessEvent> {
        let builder = EventMonitorBuilder::new(self.filter.clone()).perf_pages(self.perf_pages);
        let builder = match &self.tracefs {
            Some(root) => builder.tracefs(root),
            None => builder,
        };
        builder
            .register(Tracepoint::new("sched", "sched_process_fork"), decode_fork)
            .register(Tracepoint::new("sched", "sched_process_exec"), decode_exec)
            .register(
                Tracepoint::new("syscalls", "sys_enter_exit_group"),
                decode_exit_group,
            )
    }
}

impl Sensor for ProcessSensor {
    const NAME: &'static str = SENSOR_NAME;

    type Event = ProcessEvent;
    type Command = ProcessCommand;
    type Controller = ProcessController;
    type Source = ProcessSource;

    fn setup(self) -> Result<(ProcessController, ProcessSource), BoxError> {
        log::debug!(target: SENSOR_NAME, "setting up monitor with filter {:?}", self.filter);
        let (control, feed) = self.monitor_builder().build()?.split();
        control.enable()?;
        Ok((
            ProcessController {
                control: control.clone(),
            },
            ProcessSource { feed, control },
        ))
    }
}

pub struct ProcessController {
    control: MonitorControl,
}

impl Controller<ProcessCommand> for ProcessController {
    fn handle(&mut self, command: ProcessCommand) -> Result<(), BoxError> {
        match command {
            ProcessCommand::Enable => self.control.enable()?,
            ProcessCommand::Disable => self.control.disable()?,
        }
        Ok(())
    }

    fn shutdown(self) {
        self.control.stop();
    }
}

pub struct ProcessSource {
    feed: MonitorFeed<ProcessEvent>,
    control: MonitorControl,
}

impl Source<ProcessEvent> for ProcessSource {
    async fn run(self, sink: Sink<ProcessEvent>) {
        let (tx, mut rx) = mpsc::channel(FEED_CAPACITY);
        if let Err(err) = self.feed.spawn(tx) {
            sensor_common::log_error("starting perf monitor thread", err);
            return;
        }
        forward_samples(&mut rx, &sink).await;
        // Either the monitor was stopped or nobody is reading anymore.
        self.control.stop();
    }
}

/// Hand decoded samples to `sink` until the feed ends or the sink closes.
/// Samples which failed to decode reach subscribers as stream errors.
async fn forward_samples(
    rx: &mut mpsc::Receiver<Result<ProcessEvent, DecodeError>>,
    sink: &Sink<ProcessEvent>,
) {
    while let Some(item) = rx.recv().await {
        let sent = match item {
            Ok(event) => sink.send(event).await,
            Err(err) => {
                log::debug!(target: SENSOR_NAME, "decoding sample: {err}");
                sink.send_error(err).await
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

fn decode_fork(
    sample: &SampleRecord,
    data: &TraceEventSampleData,
) -> Result<ProcessEvent, DecodeError> {
    Ok(ProcessEvent {
        pid: data.pid("common_pid")?,
        counter: sample.time,
        state: ProcessState::Fork {
            child_pid: data.pid("child_pid")?,
        },
    })
}

fn decode_exec(
    sample: &SampleRecord,
    data: &TraceEventSampleData,
) -> Result<ProcessEvent, DecodeError> {
    Ok(ProcessEvent {
        pid: data.pid("common_pid")?,
        counter: sample.time,
        state: ProcessState::Exec {
            filename: data.string("filename")?.to_string(),
        },
    })
}

fn decode_exit_group(
    sample: &SampleRecord,
    data: &TraceEventSampleData,
) -> Result<ProcessEvent, DecodeError> {
    Ok(ProcessEvent {
        pid: data.pid("common_pid")?,
        counter: sample.time,
        state: ProcessState::Exit {
            exit_status: data.unsigned("error_code")?,
        },
    })
}

/// Handle of the shared system-wide sensor, started with `start` on first use.
pub async fn shared_handle<F>(start: F) -> Result<SensorHandle<ProcessSensor>, SensorError>
where
    F: FnOnce() -> Result<SensorHandle<ProcessSensor>, SensorError>,
{
    SENSOR.get_or_start(start).await
}

/// New stream of system-wide process events.
///
/// The first call starts the shared sensor; if that fails every call returns
/// the same [`SensorError::Unavailable`].
pub async fn event_stream() -> Result<EventStream<ProcessEvent>, SensorError> {
    SENSOR
        .new_stream(|| SensorHandle::start(ProcessSensor::system_wide()))
        .await
}

/// Start a sensor following `pid` and its descendants.
///
/// The sensor runs as long as the returned handle, or one of its clones, lives.
pub fn for_pid(pid: Pid) -> Result<SensorHandle<ProcessSensor>, SensorError> {
    SensorHandle::start(ProcessSensor::pid(pid))
}

/// Start a sensor following `pid` and its descendants on `cpu` only.
pub fn for_pid_and_cpu(pid: Pid, cpu: u32) -> Result<SensorHandle<ProcessSensor>, SensorError> {
    SensorHandle::start(ProcessSensor::pid_and_cpu(pid, cpu))
}

/// Start a sensor following the processes of cgroup `name`.
pub fn for_cgroup(name: &str) -> Result<SensorHandle<ProcessSensor>, SensorError> {
    SensorHandle::start(ProcessSensor::cgroup(name))
}
