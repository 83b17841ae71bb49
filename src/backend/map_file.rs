//! Parser for the numeric-addressed backend's text map-file format:
//! one register declaration per line, plus `@name value` metadata
//! lines, plus a convention for folding per-channel sibling
//! declarations into one multiplexed 2-D register.
//!
//! Register line grammar:
//! `name nElements byteAddress byteSize [bar [width [bitInterpretation [signed [accessMode]]]]]`
//!
//! - `byteAddress`/`byteSize` accept decimal, `0x`-prefixed hex, or
//!   C-style leading-zero octal.
//! - `bitInterpretation` is a signed fractional-bit count, or the
//!   literal `IEEE754`/`ASCII` (case-insensitive).
//! - `signed` is `0`/`1` or `true`/`false`.
//! - `accessMode` is `RO`/`RW`/`WO`, or `INTERRUPT<id0>[:<id1>...]`.
//!
//! Omitted trailing fields default to `bar = 0`, `width = 32`,
//! `bitInterpretation = 0` (plain integer), `signed = true`,
//! `accessMode = RW`.

use std::collections::BTreeMap;

use crate::backend::numeric_addressed::{AccessClass, ChannelLayout, NumericAddressedInfo, Representation};
use crate::error::{DeviceError, Result};
use crate::path::RegisterPath;

/// The result of parsing one map-file document.
#[derive(Debug, Default)]
pub struct ParsedMap {
    pub registers: Vec<NumericAddressedInfo>,
    pub metadata: BTreeMap<String, String>,
}

fn parse_int(token: &str, path: &str) -> Result<i64> {
    let bad = || DeviceError::logic(path, format!("invalid integer literal '{token}'"));
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).map_err(|_| bad())
    } else if token.len() > 1 && token.starts_with('0') && token.chars().all(|c| c.is_ascii_digit()) {
        i64::from_str_radix(&token[1..], 8).map_err(|_| bad())
    } else {
        token.parse::<i64>().map_err(|_| bad())
    }
}

fn parse_bool(token: &str, path: &str) -> Result<bool> {
    match token.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(DeviceError::logic(path, format!("invalid boolean '{token}'"))),
    }
}

fn parse_representation(token: &str, path: &str) -> Result<Representation> {
    match token.to_ascii_uppercase().as_str() {
        "IEEE754" => Ok(Representation::Ieee754),
        "ASCII" => Ok(Representation::Ascii),
        _ => Ok(Representation::FixedPoint {
            n_fractional_bits: parse_int(token, path)? as i32,
        }),
    }
}

fn parse_access_mode(token: &str, path: &str) -> Result<(AccessClass, Option<Vec<u32>>)> {
    match token.to_ascii_uppercase().as_str() {
        "RO" => Ok((AccessClass::ReadOnly, None)),
        "RW" => Ok((AccessClass::ReadWrite, None)),
        "WO" => Ok((AccessClass::WriteOnly, None)),
        other if other.starts_with("INTERRUPT") => {
            let rest = &token[9..];
            let rest = rest.strip_prefix('<').unwrap_or(rest);
            let rest = rest.strip_suffix('>').unwrap_or(rest);
            let ids = rest
                .split(':')
                .map(|id| {
                    id.parse::<u32>()
                        .map_err(|_| DeviceError::logic(path, format!("invalid interrupt id '{id}'")))
                })
                .collect::<Result<Vec<_>>>()?;
            if ids.is_empty() {
                return Err(DeviceError::logic(path, "INTERRUPT access mode needs at least one id"));
            }
            Ok((AccessClass::Interrupt, Some(ids)))
        }
        _ => Err(DeviceError::logic(path, format!("invalid access mode '{token}'"))),
    }
}

fn parse_register_line(line: &str) -> Result<NumericAddressedInfo> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return Err(DeviceError::logic(
            line,
            "register line needs at least name, nElements, byteAddress, byteSize",
        ));
    }
    let name = tokens[0];
    let n_elements = parse_int(tokens[1], name)? as usize;
    let byte_address = parse_int(tokens[2], name)? as u64;
    let byte_size = parse_int(tokens[3], name)? as usize;
    let bar = tokens.get(4).map(|t| parse_int(t, name)).transpose()?.unwrap_or(0) as u8;
    let width = tokens.get(5).map(|t| parse_int(t, name)).transpose()?.unwrap_or(32) as u32;
    let representation = tokens
        .get(6)
        .map(|t| parse_representation(t, name))
        .transpose()?
        .unwrap_or(Representation::FixedPoint { n_fractional_bits: 0 });
    let signed = tokens.get(7).map(|t| parse_bool(t, name)).transpose()?.unwrap_or(true);
    let (access_class, interrupt) = tokens
        .get(8)
        .map(|t| parse_access_mode(t, name))
        .transpose()?
        .unwrap_or((AccessClass::ReadWrite, None));

    if n_elements == 0 {
        return Err(DeviceError::logic(name, "nElements must be at least 1"));
    }
    let block_size_bytes = if n_elements == 0 || byte_size % n_elements != 0 {
        return Err(DeviceError::logic(name, "byteSize is not a multiple of nElements"));
    } else {
        byte_size / n_elements
    };

    Ok(NumericAddressedInfo {
        path: RegisterPath::new(name),
        bar,
        byte_address,
        byte_size,
        block_size_bytes,
        n_blocks: n_elements,
        channels: vec![ChannelLayout {
            bit_offset: 0,
            width,
            signed,
            representation,
        }],
        access_class,
        interrupt,
        tags: Default::default(),
    })
}

/// The sibling-channel naming convention that triggers a multiplexer
/// fold: a leaf named `<prefix>_CHANNEL<n>`.
fn multiplexer_key(reg: &NumericAddressedInfo) -> Option<(RegisterPath, usize)> {
    let leaf = reg.path.leaf()?;
    let (prefix, suffix) = leaf.rsplit_once("_CHANNEL")?;
    let index: usize = suffix.parse().ok()?;
    if prefix.is_empty() {
        return None;
    }
    Some((reg.path.parent().join(prefix), index))
}

/// Folds sibling `*_CHANNEL<n>` declarations sharing the same address,
/// sample count, and layout into one multi-channel register; leaves
/// every other declaration untouched.
fn fold_multiplexers(registers: Vec<NumericAddressedInfo>) -> Result<Vec<NumericAddressedInfo>> {
    let mut groups: BTreeMap<RegisterPath, Vec<(usize, NumericAddressedInfo)>> = BTreeMap::new();
    let mut plain = Vec::new();

    for reg in registers {
        match multiplexer_key(&reg) {
            Some((group_path, index)) => groups.entry(group_path).or_default().push((index, reg)),
            None => plain.push(reg),
        }
    }

    for (group_path, mut members) in groups {
        if members.len() == 1 {
            let (_, mut reg) = members.pop().unwrap();
            reg.path = group_path;
            plain.push(reg);
            continue;
        }
        members.sort_by_key(|(index, _)| *index);
        let path_str = group_path.to_canonical_string();
        let first = &members[0].1;
        let (byte_address, n_blocks, access_class, interrupt) =
            (first.byte_address, first.n_blocks, first.access_class, first.interrupt.clone());
        let mut channels = Vec::with_capacity(members.len());
        let mut bit_offset = 0u32;
        for (_, member) in &members {
            if member.byte_address != byte_address
                || member.n_blocks != n_blocks
                || member.access_class != access_class
                || member.channels.len() != 1
            {
                return Err(DeviceError::logic(
                    &path_str,
                    "multiplexed channels disagree on address, sample count, or access mode",
                ));
            }
            let mut layout = member.channels[0];
            layout.bit_offset = bit_offset;
            bit_offset += layout.width;
            channels.push(layout);
        }
        let block_size_bytes = (bit_offset as usize).div_ceil(8);
        plain.push(NumericAddressedInfo {
            path: group_path,
            bar: first.bar,
            byte_address,
            byte_size: block_size_bytes * n_blocks,
            block_size_bytes,
            n_blocks,
            channels,
            access_class,
            interrupt,
            tags: Default::default(),
        });
    }

    Ok(plain)
}

/// Parses a complete map-file document.
pub fn parse(contents: &str) -> Result<ParsedMap> {
    let mut registers = Vec::new();
    let mut metadata = BTreeMap::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('@') {
            let (name, value) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| DeviceError::logic(line, "metadata line needs a name and a value"))?;
            metadata.insert(name.trim().to_string(), value.trim().to_string());
            continue;
        }
        registers.push(parse_register_line(line)?);
    }

    Ok(ParsedMap {
        registers: fold_multiplexers(registers)?,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_register_with_defaults() {
        let parsed = parse("TEMPERATURE 1 0x10 4\n").unwrap();
        assert_eq!(parsed.registers.len(), 1);
        let reg = &parsed.registers[0];
        assert_eq!(reg.path, RegisterPath::new("TEMPERATURE"));
        assert_eq!(reg.byte_address, 0x10);
        assert_eq!(reg.n_blocks, 1);
        assert_eq!(reg.access_class, AccessClass::ReadWrite);
        assert!(matches!(reg.channels[0].representation, Representation::FixedPoint { n_fractional_bits: 0 }));
    }

    #[test]
    fn parses_full_line_with_fractional_bits_and_interrupt() {
        let parsed = parse("APP.0.VOLTAGE 4 100 16 0 32 8 1 INTERRUPT<3:1>\n").unwrap();
        let reg = &parsed.registers[0];
        assert_eq!(reg.n_blocks, 4);
        assert!(matches!(
            reg.channels[0].representation,
            Representation::FixedPoint { n_fractional_bits: 8 }
        ));
        assert_eq!(reg.access_class, AccessClass::Interrupt);
        assert_eq!(reg.interrupt, Some(vec![3, 1]));
    }

    #[test]
    fn parses_ieee754_and_ascii_and_ro() {
        let parsed = parse("A 1 0 4 0 32 IEEE754 1 RO\nB 1 4 20 0 32 ASCII 1 RO\n").unwrap();
        assert!(matches!(parsed.registers[0].channels[0].representation, Representation::Ieee754));
        assert!(matches!(parsed.registers[1].channels[0].representation, Representation::Ascii));
        assert_eq!(parsed.registers[0].access_class, AccessClass::ReadOnly);
    }

    #[test]
    fn collects_metadata_lines() {
        let parsed = parse("@firmware 3.2.1\n@vendor Acme\nX 1 0 4\n").unwrap();
        assert_eq!(parsed.metadata.get("firmware"), Some(&"3.2.1".to_string()));
        assert_eq!(parsed.metadata.get("vendor"), Some(&"Acme".to_string()));
    }

    #[test]
    fn folds_channel_siblings_into_one_multiplexed_register() {
        let parsed = parse(
            "DAQ0_CHANNEL0 10 1000 40 0 16\nDAQ0_CHANNEL1 10 1000 40 0 16\nDAQ0_CHANNEL2 10 1000 40 0 16\n",
        )
        .unwrap();
        assert_eq!(parsed.registers.len(), 1);
        let reg = &parsed.registers[0];
        assert_eq!(reg.path, RegisterPath::new("DAQ0"));
        assert_eq!(reg.n_channels(), 3);
        assert_eq!(reg.n_blocks, 10);
        assert_eq!(reg.channels[0].bit_offset, 0);
        assert_eq!(reg.channels[1].bit_offset, 16);
        assert_eq!(reg.channels[2].bit_offset, 32);
    }

    #[test]
    fn mismatched_multiplexer_siblings_are_rejected() {
        let err = parse("DAQ0_CHANNEL0 10 1000 40 0 16\nDAQ0_CHANNEL1 5 1000 40 0 16\n").unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn bad_byte_size_is_a_logic_error() {
        let err = parse("X 3 0 10\n").unwrap_err();
        assert!(err.is_logic());
    }
}
