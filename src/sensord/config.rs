use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result, bail};
use sensor_core::{ConfigError, SensorConfig, repeater::DEFAULT_BUFFER};

const DEFAULT_CONFIG_FILE: &str = "/etc/sensord/sensord.ini";

/// Section for the settings of the event fan-out shared by every sensor.
pub const REPEATER_CONFIG: &str = "repeater";

/// Configuration of every sensor, one `INI` section each.
#[derive(Debug, Clone, Default)]
pub struct SensordConfig {
    sections: HashMap<String, SensorConfig>,
}

impl SensordConfig {
    /// Load the default file, or use the defaults when it doesn't exist.
    pub fn new() -> Result<Self> {
        let config_file = Path::new(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using the default configuration");
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: &Path) -> Result<Self> {
        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str(content).context("Error parsing configuration")?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut config = Self::default();
        for (section, prop) in conf {
            // Keys outside of any section don't belong to a sensor.
            let Some(section) = section else {
                continue;
            };
            for (key, value) in prop.iter() {
                log::debug!("{}.{}={}", section, key, value);
                config.set(section, key, value);
            }
        }
        config
    }

    /// Configuration of `sensor`, empty when it has no section.
    pub fn sensor_config(&self, sensor: &str) -> SensorConfig {
        self.sections.get(sensor).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, sensor: &str, key: &str, value: &str) {
        self.sections
            .entry(sensor.to_string())
            .or_default()
            .insert(key, value);
    }

    /// Queue capacity of each subscriber of a sensor.
    pub fn repeater_buffer(&self) -> Result<usize, ConfigError> {
        let buffer = self
            .sensor_config(REPEATER_CONFIG)
            .optional_or("buffer", DEFAULT_BUFFER)?;
        if buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer".to_string(),
                value: buffer.to_string(),
                err: "must be greater than zero".to_string(),
            });
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
top_level=ignored

[process-sensor]
pids=10,20
perf_pages=16

[container-sensor]
storage_dir=/srv/docker/containers

[repeater]
buffer=64
";

    #[test]
    fn sections_become_sensor_configs() {
        let config = SensordConfig::parse(CONFIG).unwrap();
        let process = config.sensor_config("process-sensor");
        assert_eq!(process.get_list::<i32>("pids"), Ok(vec![10, 20]));
        assert_eq!(process.required::<usize>("perf_pages"), Ok(16));
        assert_eq!(
            config.sensor_config("container-sensor").get_raw("storage_dir"),
            Some("/srv/docker/containers")
        );
        assert!(config.sensor_config("top_level").is_empty());
        assert_eq!(config.repeater_buffer(), Ok(64));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = SensordConfig::default();
        assert!(config.sensor_config("process-sensor").is_empty());
        assert_eq!(config.repeater_buffer(), Ok(DEFAULT_BUFFER));
    }

    #[test]
    fn overrides_win() {
        let mut config = SensordConfig::parse(CONFIG).unwrap();
        config.set("process-sensor", "perf_pages", "128");
        config.set("repeater", "buffer", "0");
        assert_eq!(
            config
                .sensor_config("process-sensor")
                .required::<usize>("perf_pages"),
            Ok(128)
        );
        assert!(matches!(
            config.repeater_buffer(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "buffer"
        ));
    }

    #[test]
    fn custom_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensord.ini");
        assert!(SensordConfig::with_custom_file(&path).is_err());

        std::fs::write(&path, CONFIG).unwrap();
        let config = SensordConfig::with_custom_file(&path).unwrap();
        assert_eq!(config.repeater_buffer(), Ok(64));
    }
}
