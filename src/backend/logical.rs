//! The logical name mapping backend: virtual registers defined over a
//! host backend's real registers (or over other virtual registers),
//! optionally wrapped by a small chain of plugins.
//!
//! Every virtual register is built as a pipeline of `f64`-typed
//! [`NDRegisterAccessor`] decorators — the kind resolves (or
//! synthesizes) the base accessor, then each plugin wraps it in turn —
//! and a final [`LogicalTypeAdapter`] converts to/from the caller's
//! requested user type, mirroring the "kind + ordered plugin chain"
//! shape the mapping document describes. Every virtual register here is
//! scalar or 1-D; modelling 2-D virtual registers is out of scope.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accessor::NDRegisterAccessor;
use crate::backend::{get_register_accessor, Backend, BackendLifecycle, SharedBackend, TypeErasedAccessor};
use crate::bitops::{extract_bits, sign_extend_field, splice_bits};
use crate::catalogue::{
    AccessModeFlags, DataDescriptor, RegisterCatalogue, RegisterInfo, RegisterShape,
};
use crate::error::{DeviceError, Result};
use crate::path::RegisterPath;
use crate::transfer_element::{TransferElementBase, TransferElementId, TransferKind};
use crate::types::{round_half_away_from_zero, UserType, UserTypeTag, UserValue};
use crate::validity::DataValidity;
use crate::version::VersionNumber;

pub mod config;
mod expr;

/// What a virtual register's target resolves to.
#[derive(Debug, Clone)]
pub enum RegisterKind {
    /// Straight passthrough, optionally sliced to `[first_index,
    /// first_index + length)` of the target's 1-D range.
    Redirect {
        target: String,
        first_index: usize,
        length: Option<usize>,
    },
    /// One row of a multi-channel target.
    Channel { target: String, channel: usize },
    /// One bit of the target word, as a boolean-valued scalar.
    Bit { target: String, bit: u32 },
    /// A read-only literal, unconnected to any target.
    Constant { values: Vec<f64> },
    /// A process-wide mutable cell shared by every accessor of this path.
    Variable { initial: Vec<f64> },
    /// The target treated as a plain 1-D area (no slicing).
    Area { target: String },
}

/// One parameter binding for the `math` plugin.
#[derive(Debug, Clone)]
pub struct MathParameter {
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub enum Plugin {
    Multiply(f64),
    ForceReadOnly,
    /// Extracts bit field `[shift, shift+width)` of the wrapped
    /// register's (scalar) word.
    BitRange { shift: u32, width: u32 },
    TagModifier { add: Vec<String>, remove: Vec<String> },
    Math {
        expression: String,
        parameters: Vec<MathParameter>,
    },
}

/// The declared shape of one virtual register: its kind, its plugin
/// chain (evaluated in order), and its bookkeeping metadata.
#[derive(Debug, Clone)]
pub struct LogicalRegisterSpec {
    pub path: RegisterPath,
    pub kind: RegisterKind,
    pub n_elements: usize,
    pub plugins: Vec<Plugin>,
    pub tags: BTreeSet<String>,
}

impl LogicalRegisterSpec {
    pub fn new(path: impl Into<String>, kind: RegisterKind, n_elements: usize) -> Self {
        LogicalRegisterSpec {
            path: RegisterPath::new(path.into()),
            kind,
            n_elements,
            plugins: Vec::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    fn forbids_raw(&self) -> bool {
        self.plugins
            .iter()
            .any(|p| matches!(p, Plugin::Math { .. } | Plugin::Multiply(_) | Plugin::BitRange { .. }))
    }

    fn effective_tags(&self) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        for plugin in &self.plugins {
            if let Plugin::TagModifier { add, remove } = plugin {
                for t in add {
                    tags.insert(t.clone());
                }
                for t in remove {
                    tags.remove(t);
                }
            }
        }
        tags
    }

    fn is_forced_read_only(&self) -> bool {
        self.plugins.iter().any(|p| matches!(p, Plugin::ForceReadOnly))
    }
}

/// A read-only literal, detached from any target.
#[derive(Debug)]
struct ConstantAccessor {
    id: TransferElementId,
    path: RegisterPath,
    buffer: crate::buffer::Buffer<f64>,
    version: VersionNumber,
}

impl TransferElementBase for ConstantAccessor {
    fn id(&self) -> TransferElementId {
        self.id
    }
    fn register_path(&self) -> String {
        self.path.to_canonical_string()
    }
    fn pre_read(&mut self, _kind: TransferKind) -> Result<()> {
        Ok(())
    }
    fn read_transfer(&mut self) -> Result<()> {
        Ok(())
    }
    fn post_read(&mut self, _kind: TransferKind, has_new_data: bool) -> Result<()> {
        if has_new_data && self.version.is_null() {
            self.version = VersionNumber::new();
        }
        Ok(())
    }
    fn pre_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Err(DeviceError::logic(
            self.path.to_canonical_string(),
            "cannot write to a constant virtual register",
        ))
    }
    fn write_transfer(&mut self, _version: VersionNumber) -> Result<bool> {
        unreachable!("pre_write always rejects writes to a constant register")
    }
    fn post_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Ok(())
    }
    fn set_exception(&mut self, _error: DeviceError) {}
    fn get_version_number(&self) -> VersionNumber {
        self.version
    }
    fn get_validity(&self) -> DataValidity {
        DataValidity::Ok
    }
    fn is_readable(&self) -> bool {
        true
    }
    fn is_writeable(&self) -> bool {
        false
    }
}

impl NDRegisterAccessor<f64> for ConstantAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        self.buffer.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// A process-wide mutable cell shared by every accessor opened against
/// this path, the `variable` kind's backing store.
#[derive(Debug)]
struct VariableAccessor {
    id: TransferElementId,
    path: RegisterPath,
    cell: Arc<Mutex<Vec<f64>>>,
    buffer: crate::buffer::Buffer<f64>,
    version: VersionNumber,
}

impl TransferElementBase for VariableAccessor {
    fn id(&self) -> TransferElementId {
        self.id
    }
    fn register_path(&self) -> String {
        self.path.to_canonical_string()
    }
    fn pre_read(&mut self, _kind: TransferKind) -> Result<()> {
        Ok(())
    }
    fn read_transfer(&mut self) -> Result<()> {
        let cell = self.cell.lock();
        self.buffer.channel_mut(0).clone_from_slice(&cell);
        Ok(())
    }
    fn post_read(&mut self, _kind: TransferKind, has_new_data: bool) -> Result<()> {
        if has_new_data {
            self.version = VersionNumber::new();
        }
        Ok(())
    }
    fn pre_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Ok(())
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        let mut cell = self.cell.lock();
        cell.clear();
        cell.extend_from_slice(self.buffer.channel(0));
        self.version = version;
        Ok(false)
    }
    fn post_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Ok(())
    }
    fn set_exception(&mut self, _error: DeviceError) {}
    fn get_version_number(&self) -> VersionNumber {
        self.version
    }
    fn get_validity(&self) -> DataValidity {
        DataValidity::Ok
    }
    fn is_readable(&self) -> bool {
        true
    }
    fn is_writeable(&self) -> bool {
        true
    }
}

impl NDRegisterAccessor<f64> for VariableAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        self.buffer.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// Slices `[first_index, first_index + length)` out of a wider target,
/// read-modify-write so the untouched part of the target is preserved
/// on write.
struct SliceAccessor {
    inner: Box<dyn NDRegisterAccessor<f64>>,
    first_index: usize,
    buffer: crate::buffer::Buffer<f64>,
}

impl fmt::Debug for SliceAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceAccessor").field("inner", &self.inner).finish()
    }
}

impl TransferElementBase for SliceAccessor {
    fn id(&self) -> TransferElementId {
        self.inner.id()
    }
    fn register_path(&self) -> String {
        self.inner.register_path()
    }
    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.inner.pre_read(kind)
    }
    fn read_transfer(&mut self) -> Result<()> {
        self.inner.read_transfer()
    }
    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.inner.post_read(kind, has_new_data)?;
        if has_new_data {
            let len = self.buffer.n_elements_per_channel();
            let src = &self.inner.channel(0)[self.first_index..self.first_index + len];
            self.buffer.channel_mut(0).copy_from_slice(src);
        }
        Ok(())
    }
    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.read()?;
        let len = self.buffer.n_elements_per_channel();
        let values = self.buffer.channel(0).to_vec();
        self.inner.channel_mut(0)[self.first_index..self.first_index + len]
            .copy_from_slice(&values);
        self.inner.pre_write(kind, version)
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        self.inner.write_transfer(version)
    }
    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.post_write(kind, version)
    }
    fn set_exception(&mut self, error: DeviceError) {
        self.inner.set_exception(error)
    }
    fn get_version_number(&self) -> VersionNumber {
        self.inner.get_version_number()
    }
    fn get_validity(&self) -> DataValidity {
        self.inner.get_validity()
    }
    fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }
    fn is_writeable(&self) -> bool {
        self.inner.is_writeable()
    }
}

impl NDRegisterAccessor<f64> for SliceAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        self.buffer.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// One row of a multi-channel target, read-modify-write so the other
/// rows are preserved on write.
struct ChannelAccessor {
    inner: Box<dyn NDRegisterAccessor<f64>>,
    channel: usize,
    buffer: crate::buffer::Buffer<f64>,
}

impl fmt::Debug for ChannelAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelAccessor").field("channel", &self.channel).finish()
    }
}

impl TransferElementBase for ChannelAccessor {
    fn id(&self) -> TransferElementId {
        self.inner.id()
    }
    fn register_path(&self) -> String {
        self.inner.register_path()
    }
    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.inner.pre_read(kind)
    }
    fn read_transfer(&mut self) -> Result<()> {
        self.inner.read_transfer()
    }
    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.inner.post_read(kind, has_new_data)?;
        if has_new_data {
            self.buffer.channel_mut(0).copy_from_slice(self.inner.channel(self.channel));
        }
        Ok(())
    }
    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.read()?;
        let values = self.buffer.channel(0).to_vec();
        self.inner.channel_mut(self.channel).copy_from_slice(&values);
        self.inner.pre_write(kind, version)
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        self.inner.write_transfer(version)
    }
    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.post_write(kind, version)
    }
    fn set_exception(&mut self, error: DeviceError) {
        self.inner.set_exception(error)
    }
    fn get_version_number(&self) -> VersionNumber {
        self.inner.get_version_number()
    }
    fn get_validity(&self) -> DataValidity {
        self.inner.get_validity()
    }
    fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }
    fn is_writeable(&self) -> bool {
        self.inner.is_writeable()
    }
}

impl NDRegisterAccessor<f64> for ChannelAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        self.buffer.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// Extracts bit field `[bit_offset, bit_offset+width)` of the (scalar)
/// target word as a signed integer, used by both the `bit` kind
/// (width 1) and the `bitRange` plugin. Read-modify-write on write, the
/// same as [`SliceAccessor`]/[`ChannelAccessor`].
struct FieldAccessor {
    inner: Box<dyn NDRegisterAccessor<f64>>,
    bit_offset: u32,
    width: u32,
    buffer: crate::buffer::Buffer<f64>,
}

impl fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("bit_offset", &self.bit_offset)
            .field("width", &self.width)
            .finish()
    }
}

impl FieldAccessor {
    fn word_bytes(word: i64) -> [u8; 8] {
        word.to_le_bytes()
    }
}

impl TransferElementBase for FieldAccessor {
    fn id(&self) -> TransferElementId {
        self.inner.id()
    }
    fn register_path(&self) -> String {
        self.inner.register_path()
    }
    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.inner.pre_read(kind)
    }
    fn read_transfer(&mut self) -> Result<()> {
        self.inner.read_transfer()
    }
    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.inner.post_read(kind, has_new_data)?;
        if has_new_data {
            let word = round_half_away_from_zero(self.inner.channel(0)[0]) as i64;
            let bytes = Self::word_bytes(word);
            let raw = extract_bits(&bytes, self.bit_offset, self.width);
            let signed = sign_extend_field(raw, self.width, true);
            self.buffer.channel_mut(0)[0] = signed as f64;
        }
        Ok(())
    }
    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.read()?;
        let word = round_half_away_from_zero(self.inner.channel(0)[0]) as i64;
        let mut bytes = Self::word_bytes(word);
        let field_value = round_half_away_from_zero(self.buffer.channel(0)[0]) as i128;
        splice_bits(&mut bytes, self.bit_offset, self.width, field_value as u128);
        let new_word = i64::from_le_bytes(bytes);
        self.inner.channel_mut(0)[0] = new_word as f64;
        self.inner.pre_write(kind, version)
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        self.inner.write_transfer(version)
    }
    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.post_write(kind, version)
    }
    fn set_exception(&mut self, error: DeviceError) {
        self.inner.set_exception(error)
    }
    fn get_version_number(&self) -> VersionNumber {
        self.inner.get_version_number()
    }
    fn get_validity(&self) -> DataValidity {
        self.inner.get_validity()
    }
    fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }
    fn is_writeable(&self) -> bool {
        self.inner.is_writeable()
    }
}

impl NDRegisterAccessor<f64> for FieldAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        1
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// Scales the wrapped register by a constant factor, bidirectionally.
struct MultiplyAccessor {
    inner: Box<dyn NDRegisterAccessor<f64>>,
    factor: f64,
    buffer: crate::buffer::Buffer<f64>,
}

impl fmt::Debug for MultiplyAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplyAccessor").field("factor", &self.factor).finish()
    }
}

impl TransferElementBase for MultiplyAccessor {
    fn id(&self) -> TransferElementId {
        self.inner.id()
    }
    fn register_path(&self) -> String {
        self.inner.register_path()
    }
    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.inner.pre_read(kind)
    }
    fn read_transfer(&mut self) -> Result<()> {
        self.inner.read_transfer()
    }
    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.inner.post_read(kind, has_new_data)?;
        if has_new_data {
            for (dst, src) in self.buffer.channel_mut(0).iter_mut().zip(self.inner.channel(0)) {
                *dst = src * self.factor;
            }
        }
        Ok(())
    }
    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        for (dst, src) in self.inner.channel_mut(0).iter_mut().zip(self.buffer.channel(0)) {
            *dst = src / self.factor;
        }
        self.inner.pre_write(kind, version)
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        self.inner.write_transfer(version)
    }
    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.post_write(kind, version)
    }
    fn set_exception(&mut self, error: DeviceError) {
        self.inner.set_exception(error)
    }
    fn get_version_number(&self) -> VersionNumber {
        self.inner.get_version_number()
    }
    fn get_validity(&self) -> DataValidity {
        self.inner.get_validity()
    }
    fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }
    fn is_writeable(&self) -> bool {
        self.inner.is_writeable()
    }
}

impl NDRegisterAccessor<f64> for MultiplyAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        self.buffer.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// Marks the wrapped register read-only; writes fail with a logic error.
struct ForceReadOnlyAccessor {
    inner: Box<dyn NDRegisterAccessor<f64>>,
}

impl fmt::Debug for ForceReadOnlyAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForceReadOnlyAccessor").finish()
    }
}

impl TransferElementBase for ForceReadOnlyAccessor {
    fn id(&self) -> TransferElementId {
        self.inner.id()
    }
    fn register_path(&self) -> String {
        self.inner.register_path()
    }
    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.inner.pre_read(kind)
    }
    fn read_transfer(&mut self) -> Result<()> {
        self.inner.read_transfer()
    }
    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.inner.post_read(kind, has_new_data)
    }
    fn pre_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Err(DeviceError::logic(
            self.inner.register_path(),
            "register is marked force-read-only",
        ))
    }
    fn write_transfer(&mut self, _version: VersionNumber) -> Result<bool> {
        unreachable!("pre_write always rejects writes on a force-read-only register")
    }
    fn post_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Ok(())
    }
    fn set_exception(&mut self, error: DeviceError) {
        self.inner.set_exception(error)
    }
    fn get_version_number(&self) -> VersionNumber {
        self.inner.get_version_number()
    }
    fn get_validity(&self) -> DataValidity {
        self.inner.get_validity()
    }
    fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }
    fn is_writeable(&self) -> bool {
        false
    }
}

impl NDRegisterAccessor<f64> for ForceReadOnlyAccessor {
    fn n_channels(&self) -> usize {
        self.inner.n_channels()
    }
    fn n_elements_per_channel(&self) -> usize {
        self.inner.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.inner.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.inner.channel_mut(index)
    }
}

/// An expression evaluated over named parameter registers. Writes are
/// only supported with exactly one parameter: the formula is assumed
/// monotonic in it and inverted numerically (secant search) rather than
/// symbolically, which covers the common scale/offset formulas this
/// plugin is mostly used for without needing a full algebra engine.
struct MathAccessor {
    path: RegisterPath,
    id: TransferElementId,
    expression: String,
    parameters: Vec<(String, Box<dyn NDRegisterAccessor<f64>>)>,
    buffer: crate::buffer::Buffer<f64>,
    version: VersionNumber,
    validity: DataValidity,
}

impl fmt::Debug for MathAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MathAccessor")
            .field("path", &self.path)
            .field("expression", &self.expression)
            .finish()
    }
}

impl MathAccessor {
    fn current_vars(&self) -> HashMap<String, f64> {
        self.parameters
            .iter()
            .map(|(name, accessor)| (name.clone(), accessor.channel(0)[0]))
            .collect()
    }
}

impl TransferElementBase for MathAccessor {
    fn id(&self) -> TransferElementId {
        self.id
    }
    fn register_path(&self) -> String {
        self.path.to_canonical_string()
    }
    fn pre_read(&mut self, _kind: TransferKind) -> Result<()> {
        Ok(())
    }
    fn read_transfer(&mut self) -> Result<()> {
        for (_, accessor) in &mut self.parameters {
            accessor.read()?;
        }
        Ok(())
    }
    fn post_read(&mut self, _kind: TransferKind, has_new_data: bool) -> Result<()> {
        if has_new_data {
            let vars = self.current_vars();
            let path = self.path.to_canonical_string();
            let value = expr::evaluate(&self.expression, &vars, &path)?;
            self.buffer.channel_mut(0)[0] = value;
            self.version = VersionNumber::new();
            self.validity = DataValidity::Ok;
        }
        Ok(())
    }
    fn pre_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        if self.parameters.len() != 1 {
            return Err(DeviceError::logic(
                self.path.to_canonical_string(),
                "math plugin write requires exactly one parameter",
            ));
        }
        Ok(())
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        let (name, accessor) = &mut self.parameters[0];
        let target = self.buffer.channel(0)[0];
        let path = self.path.to_canonical_string();
        let solved = expr::solve_for_parameter(&self.expression, name, target, &path)?;
        accessor.channel_mut(0)[0] = solved;
        accessor.write()?;
        self.version = version;
        Ok(false)
    }
    fn post_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        Ok(())
    }
    fn set_exception(&mut self, _error: DeviceError) {
        self.validity = DataValidity::Faulty;
    }
    fn get_version_number(&self) -> VersionNumber {
        self.version
    }
    fn get_validity(&self) -> DataValidity {
        self.validity
    }
    fn is_readable(&self) -> bool {
        true
    }
    fn is_writeable(&self) -> bool {
        self.parameters.len() == 1
    }
}

impl NDRegisterAccessor<f64> for MathAccessor {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        1
    }
    fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        self.buffer.channel_mut(index)
    }
}

/// Converts a `f64` pipeline to/from the caller's requested user type.
struct LogicalTypeAdapter<T> {
    inner: Box<dyn NDRegisterAccessor<f64>>,
    buffer: crate::buffer::Buffer<T>,
}

impl<T: UserType> fmt::Debug for LogicalTypeAdapter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalTypeAdapter").field("inner", &self.inner).finish()
    }
}

impl<T: UserType> TransferElementBase for LogicalTypeAdapter<T> {
    fn id(&self) -> TransferElementId {
        self.inner.id()
    }
    fn register_path(&self) -> String {
        self.inner.register_path()
    }
    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.inner.pre_read(kind)
    }
    fn read_transfer(&mut self) -> Result<()> {
        self.inner.read_transfer()
    }
    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.inner.post_read(kind, has_new_data)?;
        if has_new_data {
            let path = self.inner.register_path();
            for (dst, src) in self.buffer.channel_mut(0).iter_mut().zip(self.inner.channel(0)) {
                *dst = T::from_user_value(&UserValue::Float64(*src), &path)?;
            }
        }
        Ok(())
    }
    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        for (dst, src) in self.inner.channel_mut(0).iter_mut().zip(self.buffer.channel(0)) {
            *dst = src.to_user_value().as_f64(&self.inner.register_path())?;
        }
        self.inner.pre_write(kind, version)
    }
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        self.inner.write_transfer(version)
    }
    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.inner.post_write(kind, version)
    }
    fn set_exception(&mut self, error: DeviceError) {
        self.inner.set_exception(error)
    }
    fn get_version_number(&self) -> VersionNumber {
        self.inner.get_version_number()
    }
    fn get_validity(&self) -> DataValidity {
        self.inner.get_validity()
    }
    fn is_readable(&self) -> bool {
        self.inner.is_readable()
    }
    fn is_writeable(&self) -> bool {
        self.inner.is_writeable()
    }
}

impl<T: UserType> NDRegisterAccessor<T> for LogicalTypeAdapter<T> {
    fn n_channels(&self) -> usize {
        1
    }
    fn n_elements_per_channel(&self) -> usize {
        self.buffer.n_elements_per_channel()
    }
    fn channel(&self, index: usize) -> &[T] {
        self.buffer.channel(index)
    }
    fn channel_mut(&mut self, index: usize) -> &mut [T] {
        self.buffer.channel_mut(index)
    }
}

/// A backend whose registers are defined over another backend's (or
/// its own siblings') registers, via a mapping document's virtual
/// register declarations.
pub struct LogicalNameMappingBackend {
    lifecycle: Arc<BackendLifecycle>,
    host: SharedBackend,
    registers: BTreeMap<RegisterPath, LogicalRegisterSpec>,
    variables: Mutex<HashMap<RegisterPath, Arc<Mutex<Vec<f64>>>>>,
}

impl fmt::Debug for LogicalNameMappingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalNameMappingBackend")
            .field("n_registers", &self.registers.len())
            .finish()
    }
}

impl LogicalNameMappingBackend {
    pub fn new(host: SharedBackend, registers: Vec<LogicalRegisterSpec>) -> Result<Arc<Self>> {
        let mut map = BTreeMap::new();
        for spec in registers {
            map.insert(spec.path.clone(), spec);
        }
        let backend = LogicalNameMappingBackend {
            lifecycle: Arc::new(BackendLifecycle::new()),
            host,
            registers: map,
            variables: Mutex::new(HashMap::new()),
        };
        backend.check_for_cycles()?;
        Ok(Arc::new(backend))
    }

    fn check_for_cycles(&self) -> Result<()> {
        for path in self.registers.keys() {
            let mut visiting = BTreeSet::new();
            self.walk_math_parameters(path, &mut visiting)?;
        }
        Ok(())
    }

    fn walk_math_parameters(&self, path: &RegisterPath, visiting: &mut BTreeSet<RegisterPath>) -> Result<()> {
        if !visiting.insert(path.clone()) {
            return Err(DeviceError::logic(
                path.to_canonical_string(),
                "cyclic virtual register mapping",
            ));
        }
        if let Some(spec) = self.registers.get(path) {
            for plugin in &spec.plugins {
                if let Plugin::Math { parameters, .. } = plugin {
                    for param in parameters {
                        let target = RegisterPath::new(&param.target);
                        self.walk_math_parameters(&target, visiting)?;
                    }
                }
            }
        }
        visiting.remove(path);
        Ok(())
    }

    fn variable_cell(&self, path: &RegisterPath, initial: &[f64]) -> Arc<Mutex<Vec<f64>>> {
        self.variables
            .lock()
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(initial.to_vec())))
            .clone()
    }

    /// Resolves `target` against the host backend if it is one of its
    /// registers, otherwise against our own virtual registers
    /// (recursively), detecting cycles via `visiting`.
    fn resolve_target(
        &self,
        target: &str,
        visiting: &mut BTreeSet<RegisterPath>,
    ) -> Result<Box<dyn NDRegisterAccessor<f64>>> {
        let path = RegisterPath::new(target);
        if self.host.catalogue().contains(&path) {
            return get_register_accessor::<f64>(self.host.as_ref(), &path, &AccessModeFlags::new());
        }
        let spec = self
            .registers
            .get(&path)
            .ok_or_else(|| DeviceError::logic(target, "unknown target register"))?
            .clone();
        if !visiting.insert(path.clone()) {
            return Err(DeviceError::logic(target, "cyclic virtual register mapping"));
        }
        let built = self.build_pipeline(&spec, visiting);
        visiting.remove(&path);
        built
    }

    fn build_base(
        &self,
        spec: &LogicalRegisterSpec,
        visiting: &mut BTreeSet<RegisterPath>,
    ) -> Result<Box<dyn NDRegisterAccessor<f64>>> {
        let path_str = spec.path.to_canonical_string();
        match &spec.kind {
            RegisterKind::Redirect { target, first_index, length } => {
                let inner = self.resolve_target(target, visiting)?;
                if *first_index == 0 && length.is_none() {
                    Ok(inner)
                } else {
                    let len = length.unwrap_or(inner.n_elements_per_channel() - first_index);
                    Ok(Box::new(SliceAccessor {
                        inner,
                        first_index: *first_index,
                        buffer: crate::buffer::Buffer::new(1, len),
                    }))
                }
            }
            RegisterKind::Area { target } => self.resolve_target(target, visiting),
            RegisterKind::Channel { target, channel } => {
                let inner = self.resolve_target(target, visiting)?;
                let len = inner.n_elements_per_channel();
                Ok(Box::new(ChannelAccessor {
                    inner,
                    channel: *channel,
                    buffer: crate::buffer::Buffer::new(1, len),
                }))
            }
            RegisterKind::Bit { target, bit } => {
                let inner = self.resolve_target(target, visiting)?;
                Ok(Box::new(FieldAccessor {
                    inner,
                    bit_offset: *bit,
                    width: 1,
                    buffer: crate::buffer::Buffer::new(1, 1),
                }))
            }
            RegisterKind::Constant { values } => {
                let mut buffer = crate::buffer::Buffer::new(1, values.len());
                buffer.channel_mut(0).copy_from_slice(values);
                Ok(Box::new(ConstantAccessor {
                    id: TransferElementId::new(),
                    path: RegisterPath::new(&path_str),
                    buffer,
                    version: VersionNumber::null(),
                }))
            }
            RegisterKind::Variable { initial } => {
                let cell = self.variable_cell(&spec.path, initial);
                let mut buffer = crate::buffer::Buffer::new(1, initial.len());
                buffer.channel_mut(0).copy_from_slice(initial);
                Ok(Box::new(VariableAccessor {
                    id: TransferElementId::new(),
                    path: RegisterPath::new(&path_str),
                    cell,
                    buffer,
                    version: VersionNumber::null(),
                }))
            }
        }
    }

    fn build_pipeline(
        &self,
        spec: &LogicalRegisterSpec,
        visiting: &mut BTreeSet<RegisterPath>,
    ) -> Result<Box<dyn NDRegisterAccessor<f64>>> {
        let mut accessor = self.build_base(spec, visiting)?;
        for plugin in &spec.plugins {
            accessor = match plugin {
                Plugin::Multiply(factor) => {
                    let len = accessor.n_elements_per_channel();
                    Box::new(MultiplyAccessor {
                        inner: accessor,
                        factor: *factor,
                        buffer: crate::buffer::Buffer::new(1, len),
                    })
                }
                Plugin::ForceReadOnly => Box::new(ForceReadOnlyAccessor { inner: accessor }),
                Plugin::BitRange { shift, width } => Box::new(FieldAccessor {
                    inner: accessor,
                    bit_offset: *shift,
                    width: *width,
                    buffer: crate::buffer::Buffer::new(1, 1),
                }),
                Plugin::TagModifier { .. } => accessor,
                Plugin::Math { expression, parameters } => {
                    let mut resolved = Vec::with_capacity(parameters.len());
                    for param in parameters {
                        let mut sub_visiting = visiting.clone();
                        let target_accessor = self.resolve_target(&param.target, &mut sub_visiting)?;
                        resolved.push((param.name.clone(), target_accessor));
                    }
                    // Validate the formula parses against a zero-filled
                    // environment so parse errors surface at load time.
                    let probe: HashMap<String, f64> =
                        resolved.iter().map(|(n, _)| (n.clone(), 0.0)).collect();
                    expr::evaluate(expression, &probe, &spec.path.to_canonical_string())?;
                    Box::new(MathAccessor {
                        path: spec.path.clone(),
                        id: TransferElementId::new(),
                        expression: expression.clone(),
                        parameters: resolved,
                        buffer: crate::buffer::Buffer::new(1, 1),
                        version: VersionNumber::null(),
                        validity: DataValidity::Ok,
                    })
                }
            };
        }
        Ok(accessor)
    }

    fn build_typed<T: UserType>(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<Box<dyn NDRegisterAccessor<T>>> {
        if !flags.is_empty() {
            return Err(DeviceError::logic(
                path.to_canonical_string(),
                "the logical name mapping backend does not support access-mode flags",
            ));
        }
        let spec = self
            .registers
            .get(path)
            .ok_or_else(|| DeviceError::logic(path.to_canonical_string(), "unknown register"))?
            .clone();
        let mut visiting = BTreeSet::new();
        visiting.insert(path.clone());
        let inner = self.build_pipeline(&spec, &mut visiting)?;
        let n = inner.n_elements_per_channel();
        Ok(Box::new(LogicalTypeAdapter::<T> {
            inner,
            buffer: crate::buffer::Buffer::new(1, n),
        }))
    }

    fn to_register_info(&self, spec: &LogicalRegisterSpec) -> RegisterInfo {
        let shape = if spec.n_elements == 1 {
            RegisterShape::scalar()
        } else {
            RegisterShape::one_d(spec.n_elements)
        };
        let writeable = !matches!(spec.kind, RegisterKind::Constant { .. }) && !spec.is_forced_read_only();
        RegisterInfo {
            path: spec.path.clone(),
            shape,
            descriptor: DataDescriptor::numeric(UserTypeTag::Float64, None),
            supported_modes: AccessModeFlags::new(),
            readable: true,
            writeable,
            tags: spec.effective_tags(),
        }
    }
}

/// Builds a typed accessor for a logical register, bypassing the
/// single-tag erasure `Backend::get_register_accessor_erased` uses;
/// mirrors [`crate::backend::numeric_addressed::get_typed_accessor`].
pub fn get_typed_accessor<T: UserType>(
    backend: &LogicalNameMappingBackend,
    path: &RegisterPath,
    flags: &AccessModeFlags,
) -> Result<Box<dyn NDRegisterAccessor<T>>> {
    backend.build_typed::<T>(path, flags)
}

impl Backend for LogicalNameMappingBackend {
    fn open(&self) -> Result<()> {
        self.host.open()?;
        self.lifecycle.mark_open();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.lifecycle.mark_closed();
        Ok(())
    }

    fn is_functional(&self) -> bool {
        self.lifecycle.is_functional() && self.host.is_functional()
    }

    fn set_exception(&self, message: &str) {
        self.lifecycle.set_exception(message);
    }

    fn catalogue(&self) -> RegisterCatalogue {
        let mut cat = RegisterCatalogue::new();
        for spec in self.registers.values() {
            cat.insert(self.to_register_info(spec));
        }
        cat
    }

    fn activate_async_read(&self) -> Result<()> {
        self.host.activate_async_read()
    }

    fn get_register_accessor_erased(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<TypeErasedAccessor> {
        let accessor = self.build_typed::<f64>(path, flags)?;
        Ok(crate::backend::erase_accessor(accessor))
    }
}
