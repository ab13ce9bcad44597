//! sensord turns raw Linux telemetry into typed lifecycle events.
//!
//! Two sensors are available, each behind a feature flag enabled by default:
//!
//! - `process-sensor`: fork, exec and exit of processes, from kernel
//!   tracepoints read through `perf_event_open`. It can follow the whole
//!   system, a process tree, optionally on a single cpu, or a cgroup.
//! - `container-sensor`: lifecycle of Docker containers, reconstructed from
//!   the state files Docker keeps in its storage directory.
//!
//! Every sensor is started once and fans its events out to any number of
//! independent [streams](sensor_core::EventStream). The `sensord` binary
//! subscribes to the selected sensors and prints what they report.
//!
//! ```sh
//! # Every process and container event
//! sensord
//!
//! # Process events of a process tree, as JSON
//! sensord --process --pid 4242 --json
//! ```

pub mod cli;
pub mod sensord;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::LevelFilter) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        env_logger::builder()
            .filter_level(override_log_level)
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
