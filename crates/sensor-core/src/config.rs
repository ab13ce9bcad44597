use std::{
    collections::BTreeMap,
    fmt::Display,
    str::FromStr,
};

use thiserror::Error;

/// Key/value settings of a single sensor, usually one section of the
/// configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorConfig {
    values: BTreeMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl SensorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style [`SensorConfig::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a mandatory value.
    pub fn required<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.values.get(key) {
            None => Err(ConfigError::RequiredValue {
                field: key.to_string(),
            }),
            Some(value) => parse(value, key),
        }
    }

    pub fn optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.values
            .get(key)
            .map(|value| parse(value, key))
            .transpose()
    }

    pub fn optional_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    /// Parse a comma separated list. A missing key is an empty list.
    pub fn get_list<T>(&self, key: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.values
            .get(key)
            .into_iter()
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(item, key))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SensorConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: key.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn typed_values() {
        let config = SensorConfig::new()
            .with("perf_pages", "64")
            .with("storage_dir", "/tmp/containers");

        assert_eq!(config.required::<usize>("perf_pages"), Ok(64));
        assert_eq!(
            config.optional::<PathBuf>("storage_dir"),
            Ok(Some(PathBuf::from("/tmp/containers")))
        );
        assert_eq!(config.optional::<u32>("missing"), Ok(None));
        assert_eq!(config.optional_or("missing", 7u32), Ok(7));
        assert_eq!(
            config.required::<u32>("missing"),
            Err(ConfigError::RequiredValue {
                field: "missing".to_string()
            })
        );
    }

    #[test]
    fn invalid_value_names_field_and_value() {
        let config = SensorConfig::from_iter([("perf_pages", "lots")]);
        let err = config.required::<usize>("perf_pages").unwrap_err();
        assert!(matches!(
            &err,
            ConfigError::InvalidValue { field, value, .. } if field == "perf_pages" && value == "lots"
        ));
        assert!(err.to_string().starts_with("lots is not a valid value for field perf_pages"));
    }

    #[test]
    fn lists() {
        let config = SensorConfig::from_iter([("pids", "1, 2,,3 "), ("cgroups", "")]);
        assert_eq!(config.get_list::<i32>("pids"), Ok(vec![1, 2, 3]));
        assert_eq!(config.get_list::<String>("cgroups"), Ok(vec![]));
        assert_eq!(config.get_list::<i32>("cpus"), Ok(vec![]));
        assert!(config.get_list::<i32>("cgroups").unwrap().is_empty());

        let bad = SensorConfig::from_iter([("pids", "1,x")]);
        assert!(bad.get_list::<i32>("pids").is_err());
    }
}
