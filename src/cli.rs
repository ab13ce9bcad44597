use std::{env, ffi::OsString, path::PathBuf};

use anyhow::{Result, ensure};
use clap::{ArgAction, Parser};

pub const NAME: &str = "sensord";

#[derive(Parser, Debug, Clone, Default)]
#[clap(name = NAME)]
#[clap(about = "Print process and container lifecycle events as they happen")]
#[clap(version)]
pub struct SensordOpts {
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file, sections are named after the sensors
    #[clap(long)]
    pub config_file: Option<PathBuf>,

    /// Override a configuration value: syntax is 'SENSOR.KEY=VALUE'
    #[clap(long, value_parser = parse_sc_key_value, value_name = "SENSOR.KEY=VALUE")]
    pub set: Vec<SensorConfigKV>,

    /// Print process events
    #[clap(long)]
    pub process: bool,

    /// Print container events
    #[clap(long)]
    pub container: bool,

    /// Follow only this process and its descendants
    #[clap(long = "pid", value_name = "PID")]
    pub pids: Vec<i32>,

    /// With --pid, follow the processes only on this cpu
    #[clap(long = "cpu", value_name = "CPU", requires = "pids")]
    pub cpus: Vec<u32>,

    /// Follow only the processes of this cgroup
    #[clap(long = "cgroup", value_name = "NAME", conflicts_with = "pids")]
    pub cgroups: Vec<String>,

    /// Print events as JSON lines
    #[clap(long)]
    pub json: bool,
}

impl SensordOpts {
    /// Sensors to run as (process, container). With no choice both run.
    pub fn sensors(&self) -> (bool, bool) {
        match (self.process, self.container) {
            (false, false) => (true, true),
            selected => selected,
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfigKV {
    pub sensor_name: String,
    pub key: String,
    pub value: String,
}

fn parse_sc_key_value(input: &str) -> Result<SensorConfigKV> {
    // split 'sensor_name.config_name=config_value'
    let Some((sensor_and_config, value)) = input.split_once('=') else {
        anyhow::bail!("invalid configuration expression '{input}': syntax is 'SENSOR.KEY=VALUE'");
    };
    ensure!(
        !value.is_empty(),
        "invalid configuration expression '{}': syntax is 'SENSOR.KEY=VALUE'",
        input
    );

    // split 'sensor_name.config_name'
    let parts: Vec<&str> = sensor_and_config
        .split('.')
        .filter(|s| !s.is_empty())
        .collect();
    ensure!(
        parts.len() == 2,
        "invalid sensor expression '{}': syntax is 'SENSOR.KEY=VALUE'",
        sensor_and_config
    );
    let (sensor_name, key) = (parts[0], parts[1]);

    Ok(SensorConfigKV {
        sensor_name: sensor_name.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

pub fn parse_from_args() -> SensordOpts {
    parse_from(&mut std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> SensordOpts
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<SensordOpts, clap::Error>
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    SensordOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        u8::MIN..=0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One line with every cause, or the full debug output with causes and
    // backtrace when debugging.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<SensordOpts, clap::Error> {
        try_parse_from(std::iter::once("sensord").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_run_both_sensors() {
        let options = parse(&[]).unwrap();
        assert_eq!(options.sensors(), (true, true));
        assert_eq!(options.log_level(), log::LevelFilter::Info);
        assert!(!options.json);
    }

    #[test]
    fn sensor_selection() {
        assert_eq!(parse(&["--process"]).unwrap().sensors(), (true, false));
        assert_eq!(parse(&["--container"]).unwrap().sensors(), (false, true));
        assert_eq!(
            parse(&["--process", "--container"]).unwrap().sensors(),
            (true, true)
        );
    }

    #[test]
    fn verbosity() {
        assert_eq!(parse(&["-v"]).unwrap().log_level(), log::LevelFilter::Debug);
        assert_eq!(parse(&["-vvv"]).unwrap().log_level(), log::LevelFilter::Trace);
    }

    #[test]
    fn process_scope() {
        let options = parse(&["--pid", "10", "--pid", "20", "--cpu", "1"]).unwrap();
        assert_eq!(options.pids, vec![10, 20]);
        assert_eq!(options.cpus, vec![1]);

        assert!(parse(&["--cpu", "1"]).is_err());
        assert!(parse(&["--pid", "1", "--cgroup", "docker"]).is_err());
    }

    #[test]
    fn set_values() {
        let options = parse(&["--set", "process-sensor.perf_pages=128"]).unwrap();
        assert_eq!(
            options.set,
            vec![SensorConfigKV {
                sensor_name: "process-sensor".to_string(),
                key: "perf_pages".to_string(),
                value: "128".to_string(),
            }]
        );
        assert!(parse(&["--set", "perf_pages=128"]).is_err());
        assert!(parse(&["--set", "process-sensor.perf_pages"]).is_err());
        assert!(parse(&["--set", "process-sensor.perf_pages="]).is_err());
    }
}
