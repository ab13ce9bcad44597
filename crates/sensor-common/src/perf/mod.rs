//! Kernel tracepoint monitor.
//!
//! [`EventMonitorBuilder`] opens one perf event per registered tracepoint and
//! target, funnels all the events of a cpu into a single ring buffer and
//! dispatches every sample to the decoder of the tracepoint which produced it.
//!
//! The resulting [`EventMonitor`] splits into a cloneable [`MonitorControl`],
//! to enable, disable and stop the events, and a [`MonitorFeed`] which reads
//! the ring buffers on a dedicated thread.

use std::{
    collections::{HashMap, hash_map::Entry},
    fs::File,
    io,
    os::fd::{AsRawFd, OwnedFd},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use libc::{c_int, c_ulong};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::Pid;

mod sample;
mod sys;
pub mod tracefs;

pub use sample::{DecodeError, FieldValue, SampleRecord, TraceEventSampleData};
pub use sys::{online_cpus, parse_cpu_list};
pub use tracefs::Tracepoint;

use tracefs::TraceEventFormat;

/// Default number of data pages of each per cpu ring buffer.
pub const PERF_PAGES_DEFAULT: usize = 64;

const POLL_TIMEOUT_MS: c_int = 200;

/// Turns a sample into a domain value.
pub type Decoder<T> = fn(&SampleRecord, &TraceEventSampleData) -> Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("tracefs not found")]
    TracefsNotFound,
    #[error("invalid tracepoint {0}, expected group/name")]
    InvalidTracepoint(String),
    #[error("reading format of tracepoint {tracepoint}")]
    ReadFormat {
        tracepoint: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid format of tracepoint {tracepoint}: {reason}")]
    InvalidFormat { tracepoint: String, reason: String },
    #[error("no tracepoint registered")]
    NoTracepoints,
    #[error("no cpu to monitor")]
    NoCpus,
    #[error("empty cgroup set")]
    EmptyCgroups,
    #[error("empty pid set")]
    EmptyPids,
    #[error("cgroup {0} not found")]
    CgroupNotFound(String),
    #[error("reading online cpus")]
    OnlineCpus(#[source] io::Error),
    #[error("opening perf event {tracepoint} (pid {pid}, cpu {cpu})")]
    Open {
        tracepoint: String,
        pid: c_int,
        cpu: u32,
        #[source]
        source: io::Error,
    },
    #[error("mapping perf ring buffer of cpu {cpu}")]
    Mmap {
        cpu: u32,
        #[source]
        source: io::Error,
    },
    #[error("perf ioctl {op}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: nix::Error,
    },
}

/// Which tasks are monitored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorFilter {
    /// Every task on every online cpu.
    SystemWide,
    /// The given processes and their descendants, optionally on a subset of cpus.
    Pids { pids: Vec<Pid>, cpus: Option<Vec<u32>> },
    /// Tasks in the given cgroups, by path relative to the cgroup mount.
    Cgroups(Vec<String>),
}

pub struct EventMonitorBuilder<T> {
    filter: MonitorFilter,
    perf_pages: usize,
    tracefs: Option<PathBuf>,
    cgroup_roots: Vec<PathBuf>,
    tracepoints: Vec<(Tracepoint, Decoder<T>)>,
}

impl<T: Send + 'static> EventMonitorBuilder<T> {
    pub fn new(filter: MonitorFilter) -> Self {
        Self {
            filter,
            perf_pages: PERF_PAGES_DEFAULT,
            tracefs: None,
            cgroup_roots: vec![
                PathBuf::from("/sys/fs/cgroup/perf_event"),
                PathBuf::from("/sys/fs/cgroup"),
            ],
            tracepoints: Vec::new(),
        }
    }

    /// Size of each ring buffer in pages, which must be a power of 2.
    pub fn perf_pages(mut self, perf_pages: usize) -> Self {
        if !perf_pages.is_power_of_two() {
            log::warn!("Invalid value ({perf_pages}) for perf_pages, which must be a power of 2.");
            log::warn!("The default value {PERF_PAGES_DEFAULT} will be used.");
            self.perf_pages = PERF_PAGES_DEFAULT;
        } else {
            self.perf_pages = perf_pages;
        }
        self
    }

    /// Use `root` as tracefs mount instead of looking for it.
    pub fn tracefs(mut self, root: impl Into<PathBuf>) -> Self {
        self.tracefs = Some(root.into());
        self
    }

    pub fn register(mut self, tracepoint: Tracepoint, decoder: Decoder<T>) -> Self {
        self.tracepoints.push((tracepoint, decoder));
        self
    }

    /// Open every event, initially disabled.
    pub fn build(self) -> Result<EventMonitor<T>, MonitorError> {
        if self.tracepoints.is_empty() {
            return Err(MonitorError::NoTracepoints);
        }
        let root = match self.tracefs {
            Some(root) => root,
            None => tracefs::tracefs_root()?,
        };
        let formats = self
            .tracepoints
            .iter()
            .map(|(tracepoint, _)| tracefs::read_format(&root, tracepoint).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        // The cgroup directories must stay open while the events are created.
        let mut cgroups = Vec::new();
        let targets = targets(&self.filter, &self.cgroup_roots, &mut cgroups)?;
        let inherit = matches!(self.filter, MonitorFilter::Pids { .. });

        let mut fds = Vec::new();
        let mut rings: HashMap<u32, sys::RingBuffer> = HashMap::new();
        let mut decoders = HashMap::new();
        for target in &targets {
            for ((tracepoint, decoder), format) in self.tracepoints.iter().zip(&formats) {
                let attr = sys::PerfEventAttr::tracepoint(format.id, inherit);
                let fd = sys::perf_event_open(&attr, target.pid, target.cpu as c_int, target.flags)
                    .map_err(|source| MonitorError::Open {
                        tracepoint: tracepoint.to_string(),
                        pid: target.pid,
                        cpu: target.cpu,
                        source,
                    })?;
                let id = sys::event_id(&fd).map_err(|source| MonitorError::Ioctl {
                    op: "id",
                    source,
                })?;
                match rings.entry(target.cpu) {
                    Entry::Occupied(ring) => {
                        sys::set_output(&fd, ring.get().fd()).map_err(|source| {
                            MonitorError::Ioctl {
                                op: "set output",
                                source,
                            }
                        })?;
                    }
                    Entry::Vacant(entry) => {
                        let ring = sys::RingBuffer::new(&fd, self.perf_pages).map_err(|source| {
                            MonitorError::Mmap {
                                cpu: target.cpu,
                                source,
                            }
                        })?;
                        entry.insert(ring);
                    }
                }
                decoders.insert(id, (format.clone(), *decoder));
                fds.push(fd);
            }
        }
        log::debug!(
            "opened {} perf events on {} cpus for {} tracepoints",
            fds.len(),
            rings.len(),
            self.tracepoints.len()
        );

        let fds = Arc::new(fds);
        let stopped = Arc::new(AtomicBool::new(false));
        Ok(EventMonitor {
            control: MonitorControl {
                fds: fds.clone(),
                stopped: stopped.clone(),
            },
            feed: MonitorFeed {
                rings: rings.into_values().collect(),
                decoders,
                stopped,
                _fds: fds,
            },
        })
    }
}

struct Target {
    pid: c_int,
    cpu: u32,
    flags: c_ulong,
}

fn targets(
    filter: &MonitorFilter,
    cgroup_roots: &[PathBuf],
    cgroups: &mut Vec<File>,
) -> Result<Vec<Target>, MonitorError> {
    let online = || online_cpus().map_err(MonitorError::OnlineCpus);
    let targets: Vec<Target> = match filter {
        MonitorFilter::SystemWide => online()?
            .into_iter()
            .map(|cpu| Target { pid: -1, cpu, flags: 0 })
            .collect(),
        MonitorFilter::Pids { pids, cpus } => {
            if pids.is_empty() {
                return Err(MonitorError::EmptyPids);
            }
            let cpus = match cpus {
                Some(cpus) => cpus.clone(),
                None => online()?,
            };
            pids.iter()
                .flat_map(|pid| {
                    cpus.iter().map(|cpu| Target {
                        pid: pid.as_raw(),
                        cpu: *cpu,
                        flags: 0,
                    })
                })
                .collect()
        }
        MonitorFilter::Cgroups(names) => {
            if names.is_empty() {
                return Err(MonitorError::EmptyCgroups);
            }
            let cpus = online()?;
            let mut targets = Vec::new();
            for name in names {
                let dir = open_cgroup(cgroup_roots, name)?;
                let pid = dir.as_raw_fd();
                cgroups.push(dir);
                targets.extend(cpus.iter().map(|cpu| Target {
                    pid,
                    cpu: *cpu,
                    flags: sys::PERF_FLAG_PID_CGROUP,
                }));
            }
            targets
        }
    };
    if targets.is_empty() {
        return Err(MonitorError::NoCpus);
    }
    Ok(targets)
}

fn open_cgroup(roots: &[PathBuf], name: &str) -> Result<File, MonitorError> {
    let name = name.trim_start_matches('/');
    roots
        .iter()
        .map(|root| root.join(name))
        .filter(|path| path.is_dir())
        .find_map(|path| File::open(path).ok())
        .ok_or_else(|| MonitorError::CgroupNotFound(name.to_string()))
}

pub struct EventMonitor<T> {
    control: MonitorControl,
    feed: MonitorFeed<T>,
}

impl<T: Send + 'static> EventMonitor<T> {
    pub fn split(self) -> (MonitorControl, MonitorFeed<T>) {
        (self.control, self.feed)
    }
}

/// Lifecycle controls of the events of an [`EventMonitor`].
#[derive(Clone)]
pub struct MonitorControl {
    fds: Arc<Vec<OwnedFd>>,
    stopped: Arc<AtomicBool>,
}

impl MonitorControl {
    pub fn enable(&self) -> Result<(), MonitorError> {
        for fd in self.fds.iter() {
            sys::enable(fd).map_err(|source| MonitorError::Ioctl {
                op: "enable",
                source,
            })?;
        }
        Ok(())
    }

    pub fn disable(&self) -> Result<(), MonitorError> {
        for fd in self.fds.iter() {
            sys::disable(fd).map_err(|source| MonitorError::Ioctl {
                op: "disable",
                source,
            })?;
        }
        Ok(())
    }

    /// Make the feed return. Events are closed when both sides are dropped.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Reading side of an [`EventMonitor`].
pub struct MonitorFeed<T> {
    rings: Vec<sys::RingBuffer>,
    decoders: HashMap<u64, (Arc<TraceEventFormat>, Decoder<T>)>,
    stopped: Arc<AtomicBool>,
    _fds: Arc<Vec<OwnedFd>>,
}

impl<T: Send + 'static> MonitorFeed<T> {
    /// Read samples on a new thread and send them, decoded, to `tx`.
    ///
    /// The thread exits when the monitor is stopped or `tx` is closed, then
    /// unmaps the ring buffers. Dropping the last clone of `tx` is how the
    /// receiver learns the feed ended.
    pub fn spawn(self, tx: mpsc::Sender<Result<T, DecodeError>>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("perf-monitor".to_string())
            .spawn(move || self.run(tx))
    }

    /// Blocking read loop, see [`MonitorFeed::spawn`].
    pub fn run(mut self, tx: mpsc::Sender<Result<T, DecodeError>>) {
        let fds: Vec<_> = self.rings.iter().map(sys::RingBuffer::fd).collect();
        while !self.stopped.load(Ordering::Acquire) && !tx.is_closed() {
            if let Err(err) = crate::poll_readable(&fds, POLL_TIMEOUT_MS) {
                crate::log_error("polling perf ring buffers", err);
                return;
            }
            let mut items = Vec::new();
            for ring in &mut self.rings {
                ring.drain(|kind, body| match kind {
                    sys::PERF_RECORD_SAMPLE => {
                        if let Some(item) = dispatch(&self.decoders, body) {
                            items.push(item);
                        }
                    }
                    sys::PERF_RECORD_LOST => {
                        let lost = body.get(8..16).map(|lost| {
                            u64::from_ne_bytes(lost.try_into().unwrap_or_default())
                        });
                        log::warn!("lost {} perf samples", lost.unwrap_or_default());
                    }
                    _ => {}
                });
            }
            for item in items {
                if tx.blocking_send(item).is_err() {
                    return;
                }
            }
        }
        log::debug!("perf monitor feed stopped");
    }
}

fn dispatch<T>(
    decoders: &HashMap<u64, (Arc<TraceEventFormat>, Decoder<T>)>,
    body: &[u8],
) -> Option<Result<T, DecodeError>> {
    let sample = match SampleRecord::parse(body) {
        Ok(sample) => sample,
        Err(err) => return Some(Err(err)),
    };
    let Some((format, decoder)) = decoders.get(&sample.id) else {
        log::debug!("dropping sample of unknown event {}", sample.id);
        return None;
    };
    Some(
        TraceEventSampleData::decode(format, &sample.raw)
            .and_then(|data| decoder(&sample, &data)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::tracefs::{parse_format, tests::FORK_FORMAT};

    fn child_pid(_: &SampleRecord, data: &TraceEventSampleData) -> Result<i32, DecodeError> {
        data.pid("child_pid")
    }

    fn fork_body(id: u64) -> Vec<u8> {
        let mut raw = vec![0u8; 48];
        raw[4..8].copy_from_slice(&100i32.to_ne_bytes());
        raw[44..48].copy_from_slice(&200i32.to_ne_bytes());
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_ne_bytes());
        body.extend_from_slice(&100u32.to_ne_bytes());
        body.extend_from_slice(&100u32.to_ne_bytes());
        body.extend_from_slice(&5u64.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        body.extend_from_slice(&(raw.len() as u32).to_ne_bytes());
        body.extend_from_slice(&raw);
        body
    }

    fn decoders() -> HashMap<u64, (Arc<TraceEventFormat>, Decoder<i32>)> {
        let format = Arc::new(parse_format(FORK_FORMAT).unwrap());
        HashMap::from([(11, (format, child_pid as Decoder<i32>))])
    }

    #[test]
    fn samples_go_to_the_decoder_of_their_event() {
        assert_eq!(dispatch(&decoders(), &fork_body(11)), Some(Ok(200)));
    }

    #[test]
    fn samples_of_unknown_events_are_dropped() {
        assert_eq!(dispatch(&decoders(), &fork_body(12)), None);
    }

    #[test]
    fn malformed_samples_are_errors() {
        let body = fork_body(11);
        assert!(matches!(
            dispatch(&decoders(), &body[..20]),
            Some(Err(DecodeError::Truncated { .. }))
        ));
    }

    #[test]
    fn invalid_perf_pages_fall_back_to_default() {
        let builder = EventMonitorBuilder::<i32>::new(MonitorFilter::SystemWide).perf_pages(3);
        assert_eq!(builder.perf_pages, PERF_PAGES_DEFAULT);
        let builder = EventMonitorBuilder::<i32>::new(MonitorFilter::SystemWide).perf_pages(128);
        assert_eq!(builder.perf_pages, 128);
    }

    #[test]
    fn build_without_tracepoints_fails() {
        let result = EventMonitorBuilder::<i32>::new(MonitorFilter::SystemWide).build();
        assert!(matches!(result, Err(MonitorError::NoTracepoints)));
    }

    #[test]
    fn empty_filters_fail() {
        let mut cgroups = Vec::new();
        assert!(matches!(
            targets(&MonitorFilter::Cgroups(vec![]), &[], &mut cgroups),
            Err(MonitorError::EmptyCgroups)
        ));
        assert!(matches!(
            targets(
                &MonitorFilter::Pids {
                    pids: vec![],
                    cpus: None
                },
                &[],
                &mut cgroups
            ),
            Err(MonitorError::EmptyPids)
        ));
    }

    #[test]
    fn pid_filter_opens_one_target_per_pid_and_cpu() {
        let mut cgroups = Vec::new();
        let filter = MonitorFilter::Pids {
            pids: vec![Pid::from_raw(10), Pid::from_raw(20)],
            cpus: Some(vec![0, 1, 2]),
        };
        let targets = targets(&filter, &[], &mut cgroups).unwrap();
        assert_eq!(targets.len(), 6);
        assert!(targets.iter().all(|target| target.flags == 0));
        assert_eq!((targets[3].pid, targets[3].cpu), (20, 0));
    }

    #[test]
    fn cgroups_are_looked_up_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(second.path().join("system.slice/docker.service")).unwrap();
        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        assert!(open_cgroup(&roots, "/system.slice/docker.service").is_ok());
        assert!(matches!(
            open_cgroup(&roots, "missing"),
            Err(MonitorError::CgroupNotFound(name)) if name == "missing"
        ));
    }
}
