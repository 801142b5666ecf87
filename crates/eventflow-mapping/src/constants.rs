//! Constant producers: `text(...)`, numeric literals, `map(...)`,
//! `file(...)` and `classpath(...)`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::model::lookup_in;
use crate::operators::{str_to_double, str_to_float, str_to_int, str_to_long};
use crate::statement::{CLOSE_BRACKET, MAP_TYPE};
use crate::value::Value;

const TEXT_TYPE: &str = "text(";
const INTEGER_TYPE: &str = "int(";
const LONG_TYPE: &str = "long(";
const FLOAT_TYPE: &str = "float(";
const DOUBLE_TYPE: &str = "double(";
const BOOLEAN_TYPE: &str = "boolean(";
const FILE_TYPE: &str = "file(";
const CLASSPATH_TYPE: &str = "classpath(";

/// Source of `map(config.key)` values.
pub trait ConfigReader: Send + Sync {
    /// Look up a dotted configuration key
    fn get_property(&self, key: &str) -> Option<Value>;
}

/// A configuration tree is its own reader.
impl ConfigReader for Value {
    fn get_property(&self, key: &str) -> Option<Value> {
        lookup_in(self, key)
    }
}

/// Reader behind `file(...)` and `classpath(...)`.
pub trait ResourceReader: Send + Sync {
    /// Read a file by absolute name. `None` when missing or unreadable.
    fn read_file(&self, name: &str) -> Option<Vec<u8>>;

    /// Read a bundled resource by absolute name.
    fn read_classpath(&self, name: &str) -> Option<Vec<u8>>;
}

/// Filesystem-backed resource reader.
///
/// File names are absolute (`/tmp/x.json`). When `file_root` is set they are
/// resolved below it instead of the filesystem root. Classpath names always
/// resolve below `classpath_root`.
#[derive(Debug, Clone, Default)]
pub struct FsResourceReader {
    pub file_root: Option<PathBuf>,
    pub classpath_root: PathBuf,
}

impl FsResourceReader {
    pub fn new(file_root: Option<PathBuf>, classpath_root: impl Into<PathBuf>) -> Self {
        Self {
            file_root,
            classpath_root: classpath_root.into(),
        }
    }

    fn read(path: &Path) -> Option<Vec<u8>> {
        if !path.is_file() {
            debug!(path = %path.display(), "Resource not found");
            return None;
        }
        std::fs::read(path).ok()
    }
}

impl ResourceReader for FsResourceReader {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        match &self.file_root {
            Some(root) => Self::read(&root.join(name.trim_start_matches('/'))),
            None => Self::read(Path::new(name)),
        }
    }

    fn read_classpath(&self, name: &str) -> Option<Vec<u8>> {
        Self::read(&self.classpath_root.join(name.trim_start_matches('/')))
    }
}

/// Decode mode of a file producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Text,
    Json,
    Binary,
    Append,
}

/// Parsed `file(mode:name)` / `classpath(mode:name)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_name: String,
    pub mode: FileMode,
}

impl FileDescriptor {
    pub fn parse(text: &str) -> Option<Self> {
        let last = text.rfind(CLOSE_BRACKET)?;
        let offset = if text.starts_with(FILE_TYPE) {
            FILE_TYPE.len()
        } else if text.starts_with(CLASSPATH_TYPE) {
            CLASSPATH_TYPE.len()
        } else {
            0
        };
        if last < offset {
            return None;
        }
        let path = text[offset..last].trim();
        let (mode, name) = [
            ("text:", FileMode::Text),
            ("json:", FileMode::Json),
            ("binary:", FileMode::Binary),
            ("append:", FileMode::Append),
        ]
        .iter()
        .find_map(|(prefix, mode)| path.strip_prefix(prefix).map(|rest| (*mode, rest)))
        .unwrap_or((FileMode::Binary, path));
        let file_name = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        };
        Some(Self { file_name, mode })
    }
}

/// Produce the value of a constant LHS, or `None` when `lhs` is not a
/// constant or its resource cannot be read.
pub fn constant_value(
    lhs: &str,
    config: &dyn ConfigReader,
    resources: &dyn ResourceReader,
) -> Option<Value> {
    let last = lhs.rfind(CLOSE_BRACKET).filter(|last| *last > 0)?;
    let inner = |prefix: &str| lhs.get(prefix.len()..last).unwrap_or_default();
    if lhs.starts_with(TEXT_TYPE) {
        Some(Value::Text(inner(TEXT_TYPE).to_string()))
    } else if lhs.starts_with(INTEGER_TYPE) {
        Some(Value::Int(str_to_int(inner(INTEGER_TYPE))))
    } else if lhs.starts_with(LONG_TYPE) {
        Some(Value::Long(str_to_long(inner(LONG_TYPE))))
    } else if lhs.starts_with(FLOAT_TYPE) {
        Some(Value::Float(str_to_float(inner(FLOAT_TYPE))))
    } else if lhs.starts_with(DOUBLE_TYPE) {
        Some(Value::Double(str_to_double(inner(DOUBLE_TYPE))))
    } else if lhs.starts_with(BOOLEAN_TYPE) {
        Some(Value::Bool(inner(BOOLEAN_TYPE).trim().eq_ignore_ascii_case("true")))
    } else if lhs.starts_with(MAP_TYPE) {
        map_value(inner(MAP_TYPE).trim(), config)
    } else if lhs.starts_with(FILE_TYPE) {
        let fd = FileDescriptor::parse(lhs)?;
        decode(lhs, fd.mode, resources.read_file(&fd.file_name)?)
    } else if lhs.starts_with(CLASSPATH_TYPE) {
        let fd = FileDescriptor::parse(lhs)?;
        decode(lhs, fd.mode, resources.read_classpath(&fd.file_name)?)
    } else {
        None
    }
}

fn map_value(reference: &str, config: &dyn ConfigReader) -> Option<Value> {
    if reference.contains('=') || reference.contains(',') {
        let map: BTreeMap<String, Value> = reference
            .split(',')
            .filter_map(|kv| {
                let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
                let k = k.trim();
                (!k.is_empty()).then(|| (k.to_string(), Value::Text(v.trim().to_string())))
            })
            .collect();
        Some(Value::Map(map))
    } else {
        config.get_property(reference)
    }
}

fn decode(lhs: &str, mode: FileMode, bytes: Vec<u8>) -> Option<Value> {
    match mode {
        FileMode::Text => Some(Value::Text(String::from_utf8_lossy(&bytes).into_owned())),
        FileMode::Json => {
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let json = content.trim();
            let structured = (json.starts_with('{') && json.ends_with('}'))
                || (json.starts_with('[') && json.ends_with(']'));
            if structured {
                match serde_json::from_str::<serde_json::Value>(json) {
                    Ok(parsed) => return Some(Value::from(parsed)),
                    Err(e) => warn!("Unable to decode JSON file {} - {}", lhs, e),
                }
            }
            Some(Value::Text(content))
        }
        FileMode::Binary | FileMode::Append => Some(Value::Bytes(bytes)),
    }
}
