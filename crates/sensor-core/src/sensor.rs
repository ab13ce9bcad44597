//! Runtime shared by every sensor.
//!
//! A sensor is split by [`Sensor::setup`] into a [`Controller`], driven by the
//! control loop, and a [`Source`], driven by the data loop. The data loop owns
//! the upstream side of a [`Repeater`]; the control loop owns the [`Repeater`]
//! handle and answers stream requests with it.
//!
//! ```text
//!  SensorHandle ──Control──▶ control loop ──▶ Controller
//!                                 │
//!                            new_stream()
//!                                 ▼
//!  Source ──Sink──▶ data channel ──▶ Repeater ──▶ EventStream, EventStream, ...
//! ```
//!
//! The sensor stays alive as long as a [`SensorHandle`] exists. When the source
//! ends, the data channel closes and every [`EventStream`] ends with it.

use std::{error::Error, fmt, future::Future, sync::Arc};

use thiserror::Error;
use tokio::sync::{OnceCell, mpsc, oneshot};

use crate::{
    repeater::{DEFAULT_BUFFER, Repeater, RepeaterError, Subscription},
    stream::{Item, StreamError},
};

pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Stream of events, or pipeline errors, produced by a sensor.
pub type EventStream<E> = Subscription<Item<E>>;

const CTRL_CAPACITY: usize = 16;
const SOURCE_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone)]
pub enum SensorError {
    #[error("sensor {0} not available")]
    Unavailable(&'static str, #[source] StreamError),
    #[error("sensor {0} terminated")]
    Terminated(&'static str),
    #[error("sensor {0} rejected command")]
    Command(&'static str, #[source] StreamError),
}

impl SensorError {
    pub fn unavailable<S: Sensor>(err: impl Into<BoxError>) -> Self {
        Self::Unavailable(S::NAME, Arc::from(err.into()))
    }
}

pub trait Sensor: Send + Sized + 'static {
    /// Name used for logging and errors.
    const NAME: &'static str;

    type Event: Send + Sync + 'static;
    type Command: fmt::Debug + Send + 'static;
    type Controller: Controller<Self::Command>;
    type Source: Source<Self::Event>;

    /// Acquire the raw event source. Failing here makes the sensor unavailable.
    fn setup(self) -> Result<(Self::Controller, Self::Source), BoxError>;
}

/// Receives commands from the control loop.
pub trait Controller<C>: Send + 'static {
    fn handle(&mut self, command: C) -> Result<(), BoxError>;

    /// Called once, after the last [`SensorHandle`] is gone.
    fn shutdown(self);
}

/// Produces events into a [`Sink`] until the raw source ends.
pub trait Source<E: Send + Sync + 'static>: Send + 'static {
    fn run(self, sink: Sink<E>) -> impl Future<Output = ()> + Send;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("sensor data channel closed")]
pub struct SinkClosed;

/// Write end of the sensor data channel.
///
/// The channel closes when the last clone of the sink is dropped.
pub struct Sink<E> {
    name: &'static str,
    tx: mpsc::Sender<Item<E>>,
}

impl<E> Clone for Sink<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<E> fmt::Debug for Sink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").field("name", &self.name).finish()
    }
}

impl<E> Sink<E> {
    pub async fn send(&self, event: E) -> Result<(), SinkClosed> {
        self.tx
            .send(Ok(Arc::new(event)))
            .await
            .map_err(|_| SinkClosed)
    }

    /// Forward a pipeline error to every subscriber.
    pub async fn send_error<Err>(&self, err: Err) -> Result<(), SinkClosed>
    where
        Err: Error + Send + Sync + 'static,
    {
        self.tx.send(Err(Arc::new(err))).await.map_err(|_| SinkClosed)
    }

    /// Completes when no one is listening anymore.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Messages accepted by the control loop.
pub enum Control<E, C> {
    NewStream {
        tx_reply: oneshot::Sender<Result<EventStream<E>, RepeaterError>>,
    },
    Command {
        command: C,
        tx_reply: oneshot::Sender<Result<(), StreamError>>,
    },
}

/// Raw handle to a running sensor.
pub struct SensorHandle<S: Sensor> {
    tx_ctrl: mpsc::Sender<Control<S::Event, S::Command>>,
}

impl<S: Sensor> Clone for SensorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx_ctrl: self.tx_ctrl.clone(),
        }
    }
}

impl<S: Sensor> fmt::Debug for SensorHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorHandle").field("name", &S::NAME).finish()
    }
}

impl<S: Sensor> SensorHandle<S> {
    /// Set up `sensor` and start its loops on the current tokio runtime.
    pub fn start(sensor: S) -> Result<Self, SensorError> {
        Self::start_with_buffer(sensor, DEFAULT_BUFFER)
    }

    /// Like [`SensorHandle::start`], with `buffer` items of queue per subscriber.
    pub fn start_with_buffer(sensor: S, buffer: usize) -> Result<Self, SensorError> {
        let (controller, source) = sensor.setup().map_err(|err| {
            log::error!(target: S::NAME, "setup failed: {err}");
            SensorError::unavailable::<S>(err)
        })?;

        let (tx_data, rx_data) = mpsc::channel(SOURCE_CAPACITY);
        let repeater = Repeater::with_buffer(S::NAME, rx_data, buffer);
        let (tx_ctrl, rx_ctrl) = mpsc::channel(CTRL_CAPACITY);

        tokio::spawn(data_loop::<S>(
            source,
            Sink {
                name: S::NAME,
                tx: tx_data,
            },
        ));
        tokio::spawn(control_loop::<S>(controller, repeater, rx_ctrl));

        log::info!(target: S::NAME, "sensor started");
        Ok(Self { tx_ctrl })
    }

    /// Get a new independent stream of the events produced from now on.
    pub async fn new_stream(&self) -> Result<EventStream<S::Event>, SensorError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_ctrl
            .send(Control::NewStream { tx_reply })
            .await
            .map_err(|_| SensorError::Terminated(S::NAME))?;
        match rx_reply.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(RepeaterError::Closed)) | Err(_) => Err(SensorError::Terminated(S::NAME)),
        }
    }

    pub async fn command(&self, command: S::Command) -> Result<(), SensorError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_ctrl
            .send(Control::Command { command, tx_reply })
            .await
            .map_err(|_| SensorError::Terminated(S::NAME))?;
        rx_reply
            .await
            .map_err(|_| SensorError::Terminated(S::NAME))?
            .map_err(|err| SensorError::Command(S::NAME, err))
    }
}

async fn control_loop<S: Sensor>(
    mut controller: S::Controller,
    repeater: Repeater<Item<S::Event>>,
    mut rx_ctrl: mpsc::Receiver<Control<S::Event, S::Command>>,
) {
    while let Some(msg) = rx_ctrl.recv().await {
        match msg {
            Control::NewStream { tx_reply } => {
                let _ = tx_reply.send(repeater.new_stream().await);
            }
            Control::Command { command, tx_reply } => {
                log::debug!(target: S::NAME, "command {command:?}");
                let result = controller.handle(command).map_err(StreamError::from);
                if let Err(err) = &result {
                    log::warn!(target: S::NAME, "command failed: {err}");
                }
                let _ = tx_reply.send(result);
            }
        }
    }
    log::info!(target: S::NAME, "no handles left, shutting down");
    controller.shutdown();
}

async fn data_loop<S: Sensor>(source: S::Source, sink: Sink<S::Event>) {
    // Run the source in its own task so that a panic still closes the sink.
    match tokio::spawn(source.run(sink)).await {
        Ok(()) => log::info!(target: S::NAME, "event source ended"),
        Err(err) => log::error!(target: S::NAME, "event source failed: {err}"),
    }
}

/// Run-once cell holding a sensor singleton.
///
/// Concurrent first callers wait for a single initialisation and then all see
/// the same handle, or the same error.
pub struct SensorCell<S: Sensor> {
    cell: OnceCell<Result<SensorHandle<S>, SensorError>>,
}

impl<S: Sensor> Default for SensorCell<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Sensor> SensorCell<S> {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Return the running sensor, starting it with `start` on first use.
    pub async fn get_or_start<F>(&self, start: F) -> Result<SensorHandle<S>, SensorError>
    where
        F: FnOnce() -> Result<SensorHandle<S>, SensorError>,
    {
        self.cell.get_or_init(|| async move { start() }).await.clone()
    }

    /// Shortcut for [`SensorCell::get_or_start`] followed by [`SensorHandle::new_stream`].
    pub async fn new_stream<F>(&self, start: F) -> Result<EventStream<S::Event>, SensorError>
    where
        F: FnOnce() -> Result<SensorHandle<S>, SensorError>,
    {
        self.get_or_start(start).await?.new_stream().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Error, Debug)]
    #[error("bad sample {0}")]
    struct BadSample(u32);

    #[derive(Debug, PartialEq, Eq)]
    enum TestCommand {
        Enable,
        Fail,
    }

    #[derive(Default)]
    struct Shared {
        setups: AtomicUsize,
        commands: Mutex<Vec<TestCommand>>,
        shutdown: AtomicUsize,
    }

    struct TestSensor {
        shared: Arc<Shared>,
        raw: Option<mpsc::Receiver<Result<u32, u32>>>,
    }

    struct TestController(Arc<Shared>);

    struct TestSource(mpsc::Receiver<Result<u32, u32>>);

    impl Sensor for TestSensor {
        const NAME: &'static str = "test-sensor";
        type Event = u32;
        type Command = TestCommand;
        type Controller = TestController;
        type Source = TestSource;

        fn setup(self) -> Result<(TestController, TestSource), BoxError> {
            self.shared.setups.fetch_add(1, Ordering::SeqCst);
            let raw = self.raw.ok_or("no raw source")?;
            Ok((TestController(self.shared), TestSource(raw)))
        }
    }

    impl Controller<TestCommand> for TestController {
        fn handle(&mut self, command: TestCommand) -> Result<(), BoxError> {
            if command == TestCommand::Fail {
                return Err("unsupported".into());
            }
            self.0.commands.lock().unwrap().push(command);
            Ok(())
        }

        fn shutdown(self) {
            self.0.shutdown.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Source<u32> for TestSource {
        async fn run(mut self, sink: Sink<u32>) {
            while let Some(raw) = self.0.recv().await {
                let sent = match raw {
                    Ok(event) => sink.send(event).await,
                    Err(bad) => sink.send_error(BadSample(bad)).await,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    fn test_sensor(shared: &Arc<Shared>) -> (TestSensor, mpsc::Sender<Result<u32, u32>>) {
        let (tx, rx) = mpsc::channel(16);
        let sensor = TestSensor {
            shared: shared.clone(),
            raw: Some(rx),
        };
        (sensor, tx)
    }

    async fn next(stream: &mut EventStream<u32>) -> Option<Item<u32>> {
        timeout(WAIT, stream.recv())
            .await
            .expect("timed out waiting for the sensor")
    }

    #[tokio::test]
    async fn events_and_errors_reach_subscribers() {
        let shared = Arc::new(Shared::default());
        let (sensor, raw) = test_sensor(&shared);
        let handle = SensorHandle::start(sensor).unwrap();
        let mut stream = handle.new_stream().await.unwrap();

        raw.send(Ok(1)).await.unwrap();
        raw.send(Err(2)).await.unwrap();
        raw.send(Ok(3)).await.unwrap();

        assert_eq!(*next(&mut stream).await.unwrap().unwrap(), 1);
        let err = next(&mut stream).await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "bad sample 2");
        assert_eq!(*next(&mut stream).await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_setup() {
        let shared = Arc::new(Shared::default());
        let (sensor, raw) = test_sensor(&shared);
        let cell = Arc::new(SensorCell::<TestSensor>::new());
        let sensor = Arc::new(Mutex::new(Some(sensor)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cell = cell.clone();
            let sensor = sensor.clone();
            tasks.push(tokio::spawn(async move {
                cell.new_stream(|| {
                    let sensor = sensor.lock().unwrap().take().expect("started twice");
                    SensorHandle::start(sensor)
                })
                .await
            }));
        }
        let mut streams = Vec::new();
        for task in tasks {
            streams.push(task.await.unwrap().unwrap());
        }
        assert_eq!(shared.setups.load(Ordering::SeqCst), 1);

        raw.send(Ok(42)).await.unwrap();
        for stream in &mut streams {
            assert_eq!(*next(stream).await.unwrap().unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn setup_failure_is_reported_to_every_caller() {
        let shared = Arc::new(Shared::default());
        let cell = SensorCell::<TestSensor>::new();
        let start = || {
            SensorHandle::start(TestSensor {
                shared: shared.clone(),
                raw: None,
            })
        };

        let first = cell.new_stream(start).await.unwrap_err();
        let second = cell.new_stream(start).await.unwrap_err();
        assert!(matches!(first, SensorError::Unavailable("test-sensor", _)));
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(
            first.source().map(|err| err.to_string()).as_deref(),
            Some("no raw source")
        );
        assert_eq!(shared.setups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn source_end_terminates_the_sensor() {
        let shared = Arc::new(Shared::default());
        let (sensor, raw) = test_sensor(&shared);
        let handle = SensorHandle::start(sensor).unwrap();
        let mut a = handle.new_stream().await.unwrap();
        let mut b = handle.new_stream().await.unwrap();

        raw.send(Ok(5)).await.unwrap();
        drop(raw);

        assert_eq!(*next(&mut a).await.unwrap().unwrap(), 5);
        assert!(next(&mut a).await.is_none());
        assert_eq!(*next(&mut b).await.unwrap().unwrap(), 5);
        assert!(next(&mut b).await.is_none());

        assert!(matches!(
            handle.new_stream().await,
            Err(SensorError::Terminated("test-sensor"))
        ));
    }

    #[tokio::test]
    async fn commands_reach_the_controller() {
        let shared = Arc::new(Shared::default());
        let (sensor, _raw) = test_sensor(&shared);
        let handle = SensorHandle::start(sensor).unwrap();

        handle.command(TestCommand::Enable).await.unwrap();
        let err = handle.command(TestCommand::Fail).await.unwrap_err();
        assert!(matches!(err, SensorError::Command("test-sensor", _)));
        assert_eq!(*shared.commands.lock().unwrap(), vec![TestCommand::Enable]);
    }

    #[tokio::test]
    async fn dropping_every_handle_shuts_the_controller_down() {
        let shared = Arc::new(Shared::default());
        let (sensor, _raw) = test_sensor(&shared);
        let handle = SensorHandle::start(sensor).unwrap();
        let other = handle.clone();
        drop(handle);
        drop(other);

        timeout(WAIT, async {
            while shared.shutdown.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(shared.shutdown.load(Ordering::SeqCst), 1);
    }
}
