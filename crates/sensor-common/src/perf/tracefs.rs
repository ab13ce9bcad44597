//! Tracepoint metadata exposed by tracefs.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use super::MonitorError;

const TRACEFS_PATHS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// A tracepoint, written `group/name` as in `sched/sched_process_fork`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tracepoint {
    pub group: String,
    pub name: String,
}

impl Tracepoint {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl FromStr for Tracepoint {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((group, name)) if !group.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(group, name))
            }
            _ => Err(MonitorError::InvalidTracepoint(s.to_string())),
        }
    }
}

impl fmt::Display for Tracepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// How the bytes of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Integer of `size` bytes.
    Integer,
    /// `char[N]` stored inline.
    CharArray,
    /// `__data_loc` reference to variable length data after the fixed fields.
    DataLoc,
    /// Anything else, kept as raw bytes.
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFormat {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
    pub kind: FieldKind,
}

/// Parsed content of `events/<group>/<name>/format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEventFormat {
    pub id: u64,
    pub fields: Vec<FieldFormat>,
}

impl TraceEventFormat {
    pub fn field(&self, name: &str) -> Option<&FieldFormat> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Mount point of tracefs.
pub fn tracefs_root() -> Result<PathBuf, MonitorError> {
    TRACEFS_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.join("events").is_dir())
        .map(Path::to_path_buf)
        .ok_or(MonitorError::TracefsNotFound)
}

/// Read and parse the format of `tracepoint` under the tracefs mount `root`.
pub fn read_format(root: &Path, tracepoint: &Tracepoint) -> Result<TraceEventFormat, MonitorError> {
    let path = root
        .join("events")
        .join(&tracepoint.group)
        .join(&tracepoint.name)
        .join("format");
    let content = fs::read_to_string(&path).map_err(|source| MonitorError::ReadFormat {
        tracepoint: tracepoint.to_string(),
        source,
    })?;
    parse_format(&content).map_err(|reason| MonitorError::InvalidFormat {
        tracepoint: tracepoint.to_string(),
        reason,
    })
}

pub fn parse_format(content: &str) -> Result<TraceEventFormat, String> {
    let mut id = None;
    let mut fields = Vec::new();
    for line in content.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("ID:") {
            id = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|err| format!("invalid id {value}: {err}"))?,
            );
        } else if line.starts_with("field:") {
            fields.push(parse_field(line)?);
        }
    }
    Ok(TraceEventFormat {
        id: id.ok_or("missing ID")?,
        fields,
    })
}

// field:__data_loc char[] filename;	offset:8;	size:4;	signed:1;
fn parse_field(line: &str) -> Result<FieldFormat, String> {
    let mut declaration = None;
    let mut offset = None;
    let mut size = None;
    let mut signed = false;
    for part in line.split(';').map(str::trim).filter(|part| !part.is_empty()) {
        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| format!("malformed field attribute {part}"))?;
        let number = || {
            value
                .trim()
                .parse::<usize>()
                .map_err(|err| format!("invalid {key} in {line}: {err}"))
        };
        match key.trim() {
            "field" => declaration = Some(value.trim()),
            "offset" => offset = Some(number()?),
            "size" => size = Some(number()?),
            "signed" => signed = number()? != 0,
            _ => {}
        }
    }
    let declaration = declaration.ok_or_else(|| format!("missing declaration in {line}"))?;
    let offset = offset.ok_or_else(|| format!("missing offset in {line}"))?;
    let size = size.ok_or_else(|| format!("missing size in {line}"))?;

    let last = declaration
        .split_whitespace()
        .last()
        .ok_or_else(|| format!("empty declaration in {line}"))?;
    let (name, is_array) = match last.find('[') {
        Some(index) => (&last[..index], true),
        None => (last, false),
    };
    let kind = if declaration.starts_with("__data_loc") {
        FieldKind::DataLoc
    } else if is_array && declaration.contains("char") {
        FieldKind::CharArray
    } else if !is_array && matches!(size, 1 | 2 | 4 | 8) {
        FieldKind::Integer
    } else {
        FieldKind::Bytes
    };

    Ok(FieldFormat {
        name: name.to_string(),
        offset,
        size,
        signed,
        kind,
    })
}
