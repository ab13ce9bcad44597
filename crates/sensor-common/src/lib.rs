//! Raw event sources used by the sensors: a tracepoint monitor built on
//! `perf_event_open`, an inotify watcher and the Docker state file schema.

pub mod containers;
pub mod inotify;
pub mod perf;

/// Utility function to pretty print an error with its sources.
///
/// Rust won't print the source of an error message by default, so anyhow is
/// used as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;

/// Wait until one of `fds` is readable or `timeout_ms` elapses.
pub(crate) fn poll_readable(
    fds: &[std::os::fd::RawFd],
    timeout_ms: libc::c_int,
) -> std::io::Result<()> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: *fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}
