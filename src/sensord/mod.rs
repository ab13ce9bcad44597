use anyhow::{Context, Result};
use nix::unistd::geteuid;
use sensor_core::{Event, EventStream, StreamError};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};

use crate::cli::SensordOpts;

mod config;
mod term_print;

use config::SensordConfig;
use term_print::{OutputFormat, TermPrintable};

const PROCESS_SENSOR: &str = "process-sensor";
const CONTAINER_SENSOR: &str = "container-sensor";

const EVENTS_CAPACITY: usize = 1024;

pub async fn sensord_run(options: &SensordOpts) -> Result<()> {
    log::trace!("Sensord Options: {:?}", options);

    if !geteuid().is_root() {
        log::warn!("Not running as root, sensors may be unavailable");
    }

    let mut config = if let Some(custom_file) = &options.config_file {
        SensordConfig::with_custom_file(custom_file)?
    } else {
        SensordConfig::new()?
    };
    apply_options(&mut config, options);

    let buffer = config
        .repeater_buffer()
        .context("Invalid repeater configuration")?;
    let format = if options.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let (tx_events, mut rx_events) =
        mpsc::channel::<Result<Event, StreamError>>(EVENTS_CAPACITY);
    let (process, container) = options.sensors();

    // Scoped sensors live as long as their handle.
    #[cfg(feature = "process-sensor")]
    let _process_sensor = if process {
        let (handle, stream) = process::start(&config, buffer).await?;
        forward(PROCESS_SENSOR, stream, tx_events.clone());
        Some(handle)
    } else {
        None
    };
    #[cfg(not(feature = "process-sensor"))]
    anyhow::ensure!(!process, "{PROCESS_SENSOR} not included in this build");

    #[cfg(feature = "container-sensor")]
    let _container_sensor = if container {
        let (handle, stream) = container::start(&config, buffer).await?;
        forward(CONTAINER_SENSOR, stream, tx_events.clone());
        Some(handle)
    } else {
        None
    };
    #[cfg(not(feature = "container-sensor"))]
    anyhow::ensure!(!container, "{CONTAINER_SENSOR} not included in this build");

    drop(tx_events);

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            item = rx_events.recv() => match item {
                Some(Ok(event)) => event.term_print(format)?,
                Some(Err(err)) => log::warn!("{err:#}"),
                None => {
                    log::info!("Every event stream ended");
                    break;
                }
            },
            _ = sig_int.recv() => {
                log::trace!("SIGINT received");
                break;
            }
            _ = sig_term.recv() => {
                log::trace!("SIGTERM received");
                break;
            }
        }
    }

    Ok(())
}

/// Apply command line overrides on top of the configuration file.
fn apply_options(config: &mut SensordConfig, options: &SensordOpts) {
    for kv in &options.set {
        config.set(&kv.sensor_name, &kv.key, &kv.value);
    }
    if !options.pids.is_empty() {
        config.set(PROCESS_SENSOR, "pids", &join(&options.pids));
    }
    if !options.cpus.is_empty() {
        config.set(PROCESS_SENSOR, "cpus", &join(&options.cpus));
    }
    if !options.cgroups.is_empty() {
        config.set(PROCESS_SENSOR, "cgroups", &join(&options.cgroups));
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Copy the items of `stream` into the merged event channel.
fn forward<E>(
    name: &'static str,
    mut stream: EventStream<E>,
    tx_events: mpsc::Sender<Result<Event, StreamError>>,
) where
    E: Clone + Into<Event> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.recv().await {
            let item = item.map(|event| E::clone(&event).into());
            if tx_events.send(item).await.is_err() {
                return;
            }
        }
        log::info!("{name} event stream ended");
    });
}

#[cfg(feature = "process-sensor")]
mod process {
    use anyhow::{Context, Result};
    use process_sensor::ProcessSensor;
    use sensor_common::perf::MonitorFilter;
    use sensor_core::{EventStream, ProcessEvent, SensorHandle};

    use super::{PROCESS_SENSOR, SensordConfig};

    /// System-wide monitoring goes through the shared sensor, scoped
    /// monitoring gets its own.
    pub(super) async fn start(
        config: &SensordConfig,
        buffer: usize,
    ) -> Result<(SensorHandle<ProcessSensor>, EventStream<ProcessEvent>)> {
        let sensor = ProcessSensor::from_config(&config.sensor_config(PROCESS_SENSOR))
            .context("Invalid process sensor configuration")?;
        let handle = if matches!(sensor.filter(), MonitorFilter::SystemWide) {
            process_sensor::shared_handle(|| SensorHandle::start_with_buffer(sensor, buffer)).await?
        } else {
            SensorHandle::start_with_buffer(sensor, buffer)?
        };
        let stream = handle.new_stream().await?;
        Ok((handle, stream))
    }
}

#[cfg(feature = "container-sensor")]
mod container {
    use anyhow::{Context, Result};
    use container_sensor::ContainerSensor;
    use sensor_core::{ContainerEvent, EventStream, SensorHandle};

    use super::{CONTAINER_SENSOR, SensordConfig};

    pub(super) async fn start(
        config: &SensordConfig,
        buffer: usize,
    ) -> Result<(SensorHandle<ContainerSensor>, EventStream<ContainerEvent>)> {
        let sensor = ContainerSensor::from_config(&config.sensor_config(CONTAINER_SENSOR))
            .context("Invalid container sensor configuration")?;
        let handle =
            container_sensor::shared_handle(|| SensorHandle::start_with_buffer(sensor, buffer))
                .await?;
        let stream = handle.new_stream().await?;
        Ok((handle, stream))
    }
}
