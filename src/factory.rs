//! Device descriptor parsing and the backend factory: turns a
//! descriptor string (or an alias that resolves to one through a
//! [`DeviceMap`]) into an open [`SharedBackend`].
//!
//! No example in this library's lineage reaches for a URL-parsing
//! crate for the descriptor grammar — it is a bespoke micro-format, not
//! a URL, so it is hand-rolled the same way `backend::logical::expr`
//! hand-rolls its formula grammar.
//!
//! Real PCIe/UIO hardware access (the `numeric-addressed` scheme) is
//! deliberately not wired up here: no hardware driver exists anywhere
//! in this codebase, consistent with a software-only test/development
//! library. Requesting it is a logic error, not a panic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::logical::config::load_map_file;
use crate::backend::logical::LogicalNameMappingBackend;
use crate::backend::numeric_addressed::NumericAddressedBackend;
use crate::backend::rebot::RebotDevice;
use crate::backend::subdevice::{SubdeviceDevice, SubdeviceMode};
use crate::backend::{dummy, map_file, shared_dummy, SharedBackend};
use crate::error::{DeviceError, Result};

/// A parsed `(scheme?k=v&k=v&…)` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

impl ParsedDescriptor {
    fn param(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .map(|s| s.as_str())
            .ok_or_else(|| DeviceError::logic(key, format!("descriptor is missing required parameter '{key}'")))
    }

    fn param_opt(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

fn percent_decode(raw: &str, whole: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = raw
                    .get(i + 1..i + 3)
                    .ok_or_else(|| DeviceError::logic(whole, "truncated percent-encoding in descriptor"))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| DeviceError::logic(whole, format!("invalid percent-encoding '%{hex}'")))?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| DeviceError::logic(whole, "descriptor parameter is not valid UTF-8"))
}

/// Parses `(scheme?k=v&k=v&…)`. The surrounding parentheses are
/// optional so a bare `scheme?k=v` descriptor parses the same way.
pub fn parse_descriptor(descriptor: &str) -> Result<ParsedDescriptor> {
    let whole = descriptor;
    let trimmed = descriptor.trim();
    let inner = match (trimmed.strip_prefix('('), trimmed.strip_suffix(')')) {
        (Some(rest), Some(rest2)) if rest.len() == trimmed.len() - 1 => rest2,
        _ => trimmed,
    };

    let (scheme, params_str) = match inner.split_once('?') {
        Some((scheme, params)) => (scheme, Some(params)),
        None => (inner, None),
    };
    if scheme.is_empty() {
        return Err(DeviceError::logic(whole, "descriptor is missing a scheme"));
    }

    let mut params = BTreeMap::new();
    if let Some(params_str) = params_str {
        if !params_str.is_empty() {
            for pair in params_str.split('&') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| DeviceError::logic(whole, format!("malformed parameter '{pair}' in descriptor")))?;
                params.insert(percent_decode(key, whole)?, percent_decode(value, whole)?);
            }
        }
    }

    Ok(ParsedDescriptor {
        scheme: scheme.to_string(),
        params,
    })
}

/// One alias's entry in the device-map registry: the descriptor it
/// resolves to, and an optional map-file path for schemes that need
/// one (the file's own on-disk syntax is outside this registry's
/// concern — it maps aliases to descriptors, nothing more).
#[derive(Debug, Clone)]
pub struct DeviceMapEntry {
    pub descriptor: String,
    pub map_file: Option<PathBuf>,
}

/// A total alias -> descriptor map. Construction (reading an actual
/// device-map file) is left to the caller; this registry only models
/// the resolved, in-memory mapping.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    entries: BTreeMap<String, DeviceMapEntry>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, alias: impl Into<String>, descriptor: impl Into<String>, map_file: Option<PathBuf>) {
        self.entries.insert(
            alias.into(),
            DeviceMapEntry {
                descriptor: descriptor.into(),
                map_file,
            },
        );
    }

    pub fn resolve(&self, alias: &str) -> Result<&DeviceMapEntry> {
        self.entries
            .get(alias)
            .ok_or_else(|| DeviceError::logic(alias, "unknown device alias"))
    }
}

fn read_map_registers(path: &Path) -> Result<Vec<crate::backend::numeric_addressed::NumericAddressedInfo>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        DeviceError::runtime(path.to_string_lossy(), format!("could not read map file: {e}"))
    })?;
    Ok(map_file::parse(&contents)?.registers)
}

fn require_map_path(parsed: &ParsedDescriptor, entry: Option<&DeviceMapEntry>) -> Result<PathBuf> {
    if let Some(path) = parsed.param_opt("map") {
        return Ok(PathBuf::from(path));
    }
    if let Some(entry) = entry {
        if let Some(path) = &entry.map_file {
            return Ok(path.clone());
        }
    }
    Err(DeviceError::logic(parsed.scheme.as_str(), "descriptor needs a 'map' parameter"))
}

/// Builds and opens a backend from a raw descriptor string, resolving
/// any `target=<alias>` parameters (subdevice, logical-name-mapping)
/// recursively through `device_map`.
pub fn create_backend(descriptor: &str, device_map: &DeviceMap) -> Result<SharedBackend> {
    build_from_descriptor(descriptor, device_map, None)
}

/// Resolves `alias` through `device_map` and builds its backend.
pub fn create_backend_for_alias(alias: &str, device_map: &DeviceMap) -> Result<SharedBackend> {
    let entry = device_map.resolve(alias)?;
    build_from_descriptor(&entry.descriptor.clone(), device_map, Some(entry))
}

fn build_from_descriptor(
    descriptor: &str,
    device_map: &DeviceMap,
    entry: Option<&DeviceMapEntry>,
) -> Result<SharedBackend> {
    let parsed = parse_descriptor(descriptor)?;
    let backend: SharedBackend = match parsed.scheme.as_str() {
        "dummy" => {
            let registers = read_map_registers(&require_map_path(&parsed, entry)?)?;
            dummy::dummy_backend(registers)
        }
        "shared-dummy" => {
            let map_path = require_map_path(&parsed, entry)?;
            let registers = read_map_registers(&map_path)?;
            let instance = parsed.param_opt("instance").unwrap_or("default");
            let user = std::env::var("USER").unwrap_or_default();
            let key = format!("{instance}:{}:{user}", map_path.to_string_lossy());
            shared_dummy::shared_dummy_backend(&key, registers)
        }
        "numeric-addressed" => {
            return Err(DeviceError::logic(
                parsed.scheme.as_str(),
                "real PCIe/UIO hardware access is not supported by this library",
            ));
        }
        "rebot" => {
            let endpoint = parsed.param("endpoint")?;
            let timeout_ms: u64 = parsed
                .param_opt("timeout_ms")
                .map(|s| s.parse().map_err(|_| DeviceError::logic(parsed.scheme.as_str(), "invalid timeout_ms")))
                .transpose()?
                .unwrap_or(1000);
            let registers = read_map_registers(&require_map_path(&parsed, entry)?)?;
            let device = Arc::new(RebotDevice::new(endpoint, Duration::from_millis(timeout_ms)));
            let backend = NumericAddressedBackend::new(device.clone(), registers);
            device.start_heartbeat(backend.lifecycle());
            backend
        }
        "subdevice" => {
            let target = parsed.param("target")?;
            let host = create_backend_for_alias(target, device_map)?;
            let mode = match parsed.param("mode")? {
                "area" => SubdeviceMode::Area {
                    register: parsed.param("register")?.to_string(),
                },
                "register" => SubdeviceMode::Register {
                    address: parsed.param("address")?.to_string(),
                    data: parsed.param("data")?.to_string(),
                    status: parsed.param_opt("status").map(str::to_string),
                    sleep: Duration::from_millis(
                        parsed
                            .param_opt("sleep_ms")
                            .map(|s| s.parse::<u64>().map_err(|_| DeviceError::logic(parsed.scheme.as_str(), "invalid sleep_ms")))
                            .transpose()?
                            .unwrap_or(0),
                    ),
                },
                other => {
                    return Err(DeviceError::logic(parsed.scheme.as_str(), format!("unknown subdevice mode '{other}'")));
                }
            };
            let device = Arc::new(SubdeviceDevice::new(&host, mode)?);
            let registers = read_map_registers(&require_map_path(&parsed, entry)?)?;
            NumericAddressedBackend::new(device, registers)
        }
        "logical-name-mapping" => {
            let target = parsed.param("target")?;
            let host = create_backend_for_alias(target, device_map)?;
            let map_path = require_map_path(&parsed, entry)?;
            let registers = load_map_file(&map_path)?;
            LogicalNameMappingBackend::new(host, registers)?
        }
        other => {
            return Err(DeviceError::logic(parsed.scheme.as_str(), format!("unknown backend scheme '{other}'")));
        }
    };
    backend.open()?;
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_and_params_with_percent_decoding() {
        let parsed = parse_descriptor("(dummy?map=%2Ftmp%2Fa.map&name=A%20B)").unwrap();
        assert_eq!(parsed.scheme, "dummy");
        assert_eq!(parsed.params.get("map").unwrap(), "/tmp/a.map");
        assert_eq!(parsed.params.get("name").unwrap(), "A B");
    }

    #[test]
    fn parses_bare_scheme_with_no_params() {
        let parsed = parse_descriptor("dummy").unwrap();
        assert_eq!(parsed.scheme, "dummy");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn missing_scheme_is_a_logic_error() {
        let err = parse_descriptor("(?k=v)").unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn unknown_alias_is_a_logic_error() {
        let device_map = DeviceMap::new();
        let err = create_backend_for_alias("nope", &device_map).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn numeric_addressed_scheme_is_rejected() {
        let device_map = DeviceMap::new();
        let err = create_backend("(numeric-addressed?dev=/dev/uio0)", &device_map).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn dummy_without_map_parameter_is_a_logic_error() {
        let device_map = DeviceMap::new();
        let err = create_backend("(dummy)", &device_map).unwrap_err();
        assert!(err.is_logic());
    }
}
