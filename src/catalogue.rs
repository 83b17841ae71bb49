//! Register catalogue: data descriptors, access modes, register info.

use std::collections::{BTreeSet, HashMap};

use crate::path::RegisterPath;
use crate::types::UserTypeTag;

/// The fundamental kind of a register's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FundamentalKind {
    Numeric,
    Boolean,
    String,
    NoData,
}

/// Describes the byte-level and numeric shape of a register's content,
/// independent of any particular backend's address model.
#[derive(Debug, Clone, PartialEq)]
pub struct DataDescriptor {
    pub fundamental_kind: FundamentalKind,
    pub is_integral: bool,
    pub is_signed: bool,
    pub n_digits: u32,
    pub n_fractional_digits: u32,
    /// The exact wire word for a register that supports raw access;
    /// `None` when the register has no raw representation.
    pub raw_data_type: Option<UserTypeTag>,
    pub transport_layer_data_type: UserTypeTag,
}

impl DataDescriptor {
    pub fn numeric(transport: UserTypeTag, raw: Option<UserTypeTag>) -> Self {
        DataDescriptor {
            fundamental_kind: FundamentalKind::Numeric,
            is_integral: !matches!(transport, UserTypeTag::Float32 | UserTypeTag::Float64),
            is_signed: !matches!(
                transport,
                UserTypeTag::UInt8 | UserTypeTag::UInt16 | UserTypeTag::UInt32 | UserTypeTag::UInt64
            ),
            n_digits: 10,
            n_fractional_digits: 0,
            raw_data_type: raw,
            transport_layer_data_type: transport,
        }
    }

    pub fn boolean() -> Self {
        DataDescriptor {
            fundamental_kind: FundamentalKind::Boolean,
            is_integral: true,
            is_signed: false,
            n_digits: 1,
            n_fractional_digits: 0,
            raw_data_type: None,
            transport_layer_data_type: UserTypeTag::Boolean,
        }
    }

    pub fn string() -> Self {
        DataDescriptor {
            fundamental_kind: FundamentalKind::String,
            is_integral: false,
            is_signed: false,
            n_digits: 0,
            n_fractional_digits: 0,
            raw_data_type: None,
            transport_layer_data_type: UserTypeTag::Str,
        }
    }

    pub fn void() -> Self {
        DataDescriptor {
            fundamental_kind: FundamentalKind::NoData,
            is_integral: false,
            is_signed: false,
            n_digits: 0,
            n_fractional_digits: 0,
            raw_data_type: None,
            transport_layer_data_type: UserTypeTag::Void,
        }
    }

    pub fn supports_raw(&self) -> bool {
        self.raw_data_type.is_some()
    }
}

/// Independent access-mode flags a register accessor may be opened
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// The user buffer carries untransformed wire words.
    Raw,
    /// Reads block until the backend pushes new data.
    WaitForNewData,
}

/// A set of [`AccessMode`] flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AccessModeFlags {
    flags: BTreeSet<AccessModeTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum AccessModeTag {
    Raw,
    WaitForNewData,
}

impl AccessModeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mode: AccessMode) -> Self {
        self.set(mode);
        self
    }

    pub fn set(&mut self, mode: AccessMode) {
        self.flags.insert(Self::tag(mode));
    }

    pub fn has(&self, mode: AccessMode) -> bool {
        self.flags.contains(&Self::tag(mode))
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    fn tag(mode: AccessMode) -> AccessModeTag {
        match mode {
            AccessMode::Raw => AccessModeTag::Raw,
            AccessMode::WaitForNewData => AccessModeTag::WaitForNewData,
        }
    }

    /// True iff every flag set in `self` is also set in `supported`.
    pub fn is_subset_of(&self, supported: &AccessModeFlags) -> bool {
        self.flags.is_subset(&supported.flags)
    }
}

/// The shape of a register's user buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterShape {
    pub n_channels: usize,
    pub n_elements_per_channel: usize,
    pub n_dimensions: u8,
}

impl RegisterShape {
    pub fn scalar() -> Self {
        RegisterShape {
            n_channels: 1,
            n_elements_per_channel: 1,
            n_dimensions: 0,
        }
    }

    pub fn one_d(n_elements: usize) -> Self {
        RegisterShape {
            n_channels: 1,
            n_elements_per_channel: n_elements,
            n_dimensions: 1,
        }
    }

    pub fn two_d(n_channels: usize, n_elements_per_channel: usize) -> Self {
        RegisterShape {
            n_channels,
            n_elements_per_channel,
            n_dimensions: 2,
        }
    }

    pub fn void() -> Self {
        RegisterShape {
            n_channels: 0,
            n_elements_per_channel: 0,
            n_dimensions: 0,
        }
    }
}

/// Catalogue entry binding a path to its shape, descriptor, supported
/// access modes, readability/writeability, and tags.
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub path: RegisterPath,
    pub shape: RegisterShape,
    pub descriptor: DataDescriptor,
    pub supported_modes: AccessModeFlags,
    pub readable: bool,
    pub writeable: bool,
    pub tags: BTreeSet<String>,
}

impl RegisterInfo {
    pub fn new(path: RegisterPath, shape: RegisterShape, descriptor: DataDescriptor) -> Self {
        RegisterInfo {
            path,
            shape,
            descriptor,
            supported_modes: AccessModeFlags::new(),
            readable: true,
            writeable: true,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// The set of registers a backend exposes, keyed by exact path.
#[derive(Debug, Clone, Default)]
pub struct RegisterCatalogue {
    entries: HashMap<RegisterPath, RegisterInfo>,
    metadata: HashMap<String, String>,
}

impl RegisterCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: RegisterInfo) {
        self.entries.insert(info.path.clone(), info);
    }

    pub fn get(&self, path: &RegisterPath) -> Option<&RegisterInfo> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &RegisterPath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterInfo> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_metadata(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(name.into(), value.into());
    }

    pub fn metadata(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }

    pub fn by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a RegisterInfo> {
        self.entries.values().filter(move |info| info.has_tag(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_exact_path() {
        let mut cat = RegisterCatalogue::new();
        let info = RegisterInfo::new(
            RegisterPath::new("/BOARD/WORD"),
            RegisterShape::scalar(),
            DataDescriptor::numeric(UserTypeTag::Int32, Some(UserTypeTag::Int32)),
        );
        cat.insert(info);
        assert!(cat.contains(&RegisterPath::new("/BOARD/WORD")));
        assert!(!cat.contains(&RegisterPath::new("/BOARD/OTHER")));
    }

    #[test]
    fn access_mode_subset() {
        let supported = AccessModeFlags::new().with(AccessMode::Raw);
        let requested = AccessModeFlags::new().with(AccessMode::Raw);
        assert!(requested.is_subset_of(&supported));

        let requested_more = AccessModeFlags::new()
            .with(AccessMode::Raw)
            .with(AccessMode::WaitForNewData);
        assert!(!requested_more.is_subset_of(&supported));
    }

    #[test]
    fn tag_filtering() {
        let mut cat = RegisterCatalogue::new();
        cat.insert(
            RegisterInfo::new(
                RegisterPath::new("/A"),
                RegisterShape::scalar(),
                DataDescriptor::boolean(),
            )
            .with_tags(["CS".to_string()]),
        );
        cat.insert(RegisterInfo::new(
            RegisterPath::new("/B"),
            RegisterShape::scalar(),
            DataDescriptor::boolean(),
        ));
        assert_eq!(cat.by_tag("CS").count(), 1);
    }
}
