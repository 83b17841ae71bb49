//! YAML mapping-document layer for the logical name mapping backend.
//!
//! The runtime types in [`super`] (`RegisterKind`, `Plugin`,
//! `LogicalRegisterSpec`) embed a non-`Deserialize` `RegisterPath` and
//! were not designed with a wire format in mind, so this module keeps a
//! separate, `serde`-derived config shape and converts it into them,
//! rather than deriving `Deserialize` directly on the domain types.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

use crate::backend::logical::{LogicalRegisterSpec, MathParameter, Plugin, RegisterKind};
use crate::error::{DeviceError, Result};

#[derive(Debug, Deserialize)]
pub struct LogicalMapConfig {
    pub registers: Vec<RegisterConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterConfig {
    pub path: String,
    pub n_elements: usize,
    #[serde(flatten)]
    pub kind: KindConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindConfig {
    Redirect {
        target: String,
        #[serde(default)]
        first_index: usize,
        #[serde(default)]
        length: Option<usize>,
    },
    Channel {
        target: String,
        channel: usize,
    },
    Bit {
        target: String,
        bit: u32,
    },
    Constant {
        values: Vec<f64>,
    },
    Variable {
        initial: Vec<f64>,
    },
    Area {
        target: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "plugin", rename_all = "snake_case")]
pub enum PluginConfig {
    Multiply {
        factor: f64,
    },
    ForceReadOnly,
    BitRange {
        shift: u32,
        width: u32,
    },
    TagModifier {
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
    },
    Math {
        expression: String,
        #[serde(default)]
        parameters: Vec<MathParameterConfig>,
    },
}

#[derive(Debug, Deserialize)]
pub struct MathParameterConfig {
    pub name: String,
    pub target: String,
}

fn to_kind(config: KindConfig) -> RegisterKind {
    match config {
        KindConfig::Redirect { target, first_index, length } => RegisterKind::Redirect { target, first_index, length },
        KindConfig::Channel { target, channel } => RegisterKind::Channel { target, channel },
        KindConfig::Bit { target, bit } => RegisterKind::Bit { target, bit },
        KindConfig::Constant { values } => RegisterKind::Constant { values },
        KindConfig::Variable { initial } => RegisterKind::Variable { initial },
        KindConfig::Area { target } => RegisterKind::Area { target },
    }
}

fn to_plugin(config: PluginConfig) -> Plugin {
    match config {
        PluginConfig::Multiply { factor } => Plugin::Multiply(factor),
        PluginConfig::ForceReadOnly => Plugin::ForceReadOnly,
        PluginConfig::BitRange { shift, width } => Plugin::BitRange { shift, width },
        PluginConfig::TagModifier { add, remove } => Plugin::TagModifier { add, remove },
        PluginConfig::Math { expression, parameters } => Plugin::Math {
            expression,
            parameters: parameters
                .into_iter()
                .map(|p| MathParameter { name: p.name, target: p.target })
                .collect(),
        },
    }
}

fn to_spec(config: RegisterConfig) -> LogicalRegisterSpec {
    let mut spec = LogicalRegisterSpec::new(config.path, to_kind(config.kind), config.n_elements);
    for plugin in config.plugins {
        spec = spec.with_plugin(to_plugin(plugin));
    }
    spec.tags = config.tags.into_iter().collect::<BTreeSet<_>>();
    spec
}

/// Parses a YAML mapping document into the runtime register specs
/// `LogicalNameMappingBackend::new` expects.
pub fn parse(contents: &str) -> Result<Vec<LogicalRegisterSpec>> {
    let config: LogicalMapConfig = serde_yaml::from_str(contents)
        .map_err(|e| DeviceError::logic("mapping document", format!("invalid mapping document: {e}")))?;
    Ok(config.registers.into_iter().map(to_spec).collect())
}

/// Reads and parses a mapping document from disk.
pub fn load_map_file(path: &Path) -> Result<Vec<LogicalRegisterSpec>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| DeviceError::runtime(path.to_string_lossy(), format!("could not read mapping document: {e}")))?;
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_redirect_and_a_constant_register() {
        let yaml = r#"
registers:
  - path: /app/voltage
    kind: redirect
    target: /raw/voltage
    n_elements: 1
    tags: [poll]
  - path: /app/answer
    kind: constant
    values: [42.0]
    n_elements: 1
"#;
        let specs = parse(yaml).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(matches!(specs[0].kind, RegisterKind::Redirect { first_index: 0, length: None, .. }));
        assert!(specs[0].tags.contains("poll"));
        assert!(matches!(&specs[1].kind, RegisterKind::Constant { values } if values == &[42.0]));
    }

    #[test]
    fn parses_a_plugin_chain() {
        let yaml = r#"
registers:
  - path: /app/scaled
    kind: channel
    target: /raw/daq
    channel: 2
    n_elements: 10
    plugins:
      - plugin: multiply
        factor: 2.5
      - plugin: force_read_only
"#;
        let specs = parse(yaml).unwrap();
        assert_eq!(specs[0].plugins.len(), 2);
        assert!(matches!(specs[0].plugins[0], Plugin::Multiply(f) if f == 2.5));
        assert!(matches!(specs[0].plugins[1], Plugin::ForceReadOnly));
    }

    #[test]
    fn parses_a_math_plugin_with_parameters() {
        let yaml = r#"
registers:
  - path: /app/derived
    kind: variable
    initial: [0.0]
    n_elements: 1
    plugins:
      - plugin: math
        expression: "2 * x + offset"
        parameters:
          - name: x
            target: /raw/x
          - name: offset
            target: /raw/offset
"#;
        let specs = parse(yaml).unwrap();
        match &specs[0].plugins[0] {
            Plugin::Math { expression, parameters } => {
                assert_eq!(expression, "2 * x + offset");
                assert_eq!(parameters.len(), 2);
            }
            other => panic!("expected a math plugin, got {other:?}"),
        }
    }

    #[test]
    fn malformed_document_is_a_logic_error() {
        let err = parse("registers:\n  - not: a valid register\n").unwrap_err();
        assert!(err.is_logic());
    }
}
