//! Recursive inotify watcher.
//!
//! Besides plain watches, a [`Watcher`] supports triggers: when a directory
//! whose full path matches a trigger pattern shows up under a watched
//! directory, a watch with the trigger mask is installed on it and the entries
//! it already contains are reported as synthetic `IN_CREATE` events, so files
//! written before the watch existed are not missed.

use std::{
    collections::HashMap,
    ffi::OsString,
    fs, io,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

pub use nix::sys::inotify::AddWatchFlags;
use nix::{
    errno::Errno,
    sys::inotify::{InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;

const POLL_TIMEOUT_MS: libc::c_int = 200;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("initializing inotify")]
    Init(#[source] nix::Error),
    #[error("watching {path}")]
    AddWatch {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("listing {path}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("starting watcher thread")]
    Thread(#[source] io::Error),
}

/// A change observed under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Full path of the entry the event refers to.
    pub path: PathBuf,
    /// Name of the entry inside the watched directory, if any.
    pub name: Option<OsString>,
    pub mask: AddWatchFlags,
}

struct Trigger {
    pattern: Regex,
    mask: AddWatchFlags,
}

#[derive(Default)]
struct State {
    watches: HashMap<WatchDescriptor, PathBuf>,
    triggers: Vec<Trigger>,
    // synthetic events produced before the reader started
    pending: Vec<WatchEvent>,
}

pub struct Watcher {
    inotify: Arc<Inotify>,
    state: Arc<Mutex<State>>,
}

impl Watcher {
    pub fn new() -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(WatchError::Init)?;
        Ok(Self {
            inotify: Arc::new(inotify),
            state: Default::default(),
        })
    }

    pub fn add_watch(&self, path: impl AsRef<Path>, mask: AddWatchFlags) -> Result<(), WatchError> {
        let mut state = lock(&self.state);
        add_watch(&self.inotify, &mut state, path.as_ref(), mask)
    }

    /// Watch with `mask` every directory matching `pattern`, existing ones
    /// through [`Watcher::watch_existing`] and new ones as they are created.
    pub fn add_trigger(&self, pattern: Regex, mask: AddWatchFlags) {
        lock(&self.state).triggers.push(Trigger { pattern, mask });
    }

    /// Walk `root` and apply the triggers to the directories below it.
    pub fn watch_existing(&self, root: impl AsRef<Path>) -> Result<(), WatchError> {
        let mut state = lock(&self.state);
        let mut dirs = vec![root.as_ref().to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let entries = fs::read_dir(&dir).map_err(|source| WatchError::ReadDir {
                path: dir.clone(),
                source,
            })?;
            for entry in entries.flatten() {
                if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                    continue;
                }
                let path = entry.path();
                if let Some(mut events) = apply_triggers(&self.inotify, &mut state, &path) {
                    state.pending.append(&mut events);
                }
                dirs.push(path);
            }
        }
        Ok(())
    }

    /// Start reading events on a dedicated thread.
    pub fn events(self) -> Result<(WatchStream, WatchControl), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let pending = std::mem::take(&mut lock(&self.state).pending);
        for event in pending {
            let _ = tx.send(event);
        }
        let reader = Reader {
            inotify: self.inotify,
            state: self.state,
            stop: stop.clone(),
            tx,
        };
        thread::Builder::new()
            .name("inotify".to_string())
            .spawn(move || reader.run())
            .map_err(WatchError::Thread)?;
        Ok((WatchStream { rx }, WatchControl { stop }))
    }
}

/// Events of a [`Watcher`] in arrival order. Dropping it stops the watcher.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    /// `None` once the watcher stopped.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct WatchControl {
    stop: Arc<AtomicBool>,
}

impl WatchControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct Reader {
    inotify: Arc<Inotify>,
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Reader {
    fn run(self) {
        let fd = self.inotify.as_fd().as_raw_fd();
        while !self.stop.load(Ordering::Acquire) && !self.tx.is_closed() {
            if let Err(err) = crate::poll_readable(&[fd], POLL_TIMEOUT_MS) {
                crate::log_error("polling inotify", err);
                return;
            }
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(err) => {
                    crate::log_error("reading inotify events", err);
                    return;
                }
            };
            for event in events {
                for event in self.handle(event) {
                    if self.tx.send(event).is_err() {
                        return;
                    }
                }
            }
        }
        log::debug!("inotify watcher stopped");
    }

    fn handle(&self, event: InotifyEvent) -> Vec<WatchEvent> {
        if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            log::warn!("inotify queue overflow, events were lost");
            return Vec::new();
        }
        let mut state = lock(&self.state);
        if event.mask.contains(AddWatchFlags::IN_IGNORED) {
            state.watches.remove(&event.wd);
            return Vec::new();
        }
        let Some(dir) = state.watches.get(&event.wd).cloned() else {
            return Vec::new();
        };
        let path = match &event.name {
            Some(name) => dir.join(name),
            None => dir,
        };

        let mut synthetic = None;
        if event.mask.contains(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR) {
            synthetic = apply_triggers(&self.inotify, &mut state, &path);
        }

        let mut events = vec![WatchEvent {
            path,
            name: event.name,
            mask: event.mask,
        }];
        events.extend(synthetic.into_iter().flatten());
        events
    }
}

fn lock(state: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    // The state stays consistent even if a holder panicked.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn add_watch(
    inotify: &Inotify,
    state: &mut State,
    path: &Path,
    mask: AddWatchFlags,
) -> Result<(), WatchError> {
    let wd = inotify
        .add_watch(path, mask)
        .map_err(|source| WatchError::AddWatch {
            path: path.to_path_buf(),
            source,
        })?;
    log::trace!("watching {}", path.display());
    state.watches.insert(wd, path.to_path_buf());
    Ok(())
}

/// Watch `dir` if a trigger matches it, returning synthetic events for its
/// current entries.
fn apply_triggers(inotify: &Inotify, state: &mut State, dir: &Path) -> Option<Vec<WatchEvent>> {
    let path = dir.to_string_lossy();
    let mask = state
        .triggers
        .iter()
        .filter(|trigger| trigger.pattern.is_match(&path))
        .fold(AddWatchFlags::empty(), |mask, trigger| mask | trigger.mask);
    if mask.is_empty() {
        return None;
    }
    if let Err(err) = add_watch(inotify, state, dir, mask) {
        crate::log_error("applying trigger", err);
        return None;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            crate::log_error("listing triggered directory", err);
            return Some(Vec::new());
        }
    };
    let events = entries
        .flatten()
        .map(|entry| {
            let mut mask = AddWatchFlags::IN_CREATE;
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                mask |= AddWatchFlags::IN_ISDIR;
            }
            WatchEvent {
                path: entry.path(),
                name: Some(entry.file_name()),
                mask,
            }
        })
        .collect();
    Some(events)
}
