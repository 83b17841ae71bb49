//! The numeric-addressed backend: maps a catalogue onto a
//! `(bar, byte-offset, byte-length)` address space.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::accessor::NDRegisterAccessor;
use crate::async_dispatch::{
    AcknowledgeVariant, ControllerNode, ControllerTree, EnableVariant, InterruptDispatcher, InterruptId,
};
use crate::backend::{erase_accessor, Backend, BackendLifecycle, TypeErasedAccessor};
use crate::bitops::{extract_bits, sign_extend_field, splice_bits};
use crate::catalogue::{
    AccessMode, AccessModeFlags, DataDescriptor, RegisterCatalogue, RegisterInfo, RegisterShape,
};
use crate::conversion::{FixedPointConverter, Ieee754Converter, RawConverter};
use crate::dispatch_user_type;
use crate::error::{DeviceError, Result};
use crate::path::RegisterPath;
use crate::transfer_element::{TransferElementBase, TransferElementId, TransferKind};
use crate::transfer_group::{GroupMember, MergeDescriptor, MergedRawElement};
use crate::types::{UserType, UserTypeTag, UserValue};
use crate::validity::DataValidity;
use crate::version::VersionNumber;

pub const WORD_SIZE: usize = 4;

/// How a channel's bits are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Representation {
    FixedPoint { n_fractional_bits: i32 },
    Ieee754,
    Ascii,
}

/// One channel's bit slice within a block (one block = one sample of
/// every channel, tightly packed).
#[derive(Debug, Clone, Copy)]
pub struct ChannelLayout {
    pub bit_offset: u32,
    pub width: u32,
    pub signed: bool,
    pub representation: Representation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    Interrupt,
}

/// Backend-private register descriptor: a [`crate::catalogue::RegisterInfo`]
/// plus the numeric-addressed specific address mapping.
#[derive(Debug, Clone)]
pub struct NumericAddressedInfo {
    pub path: RegisterPath,
    pub bar: u8,
    pub byte_address: u64,
    pub byte_size: usize,
    pub block_size_bytes: usize,
    pub n_blocks: usize,
    pub channels: Vec<ChannelLayout>,
    pub access_class: AccessClass,
    pub interrupt: Option<Vec<u32>>,
    pub tags: BTreeSet<String>,
}

impl NumericAddressedInfo {
    /// A plain scalar/1-D register: one channel, raw 32-bit words,
    /// `n_fractional_bits` fixed-point (0 = plain integer).
    pub fn simple(
        path: impl Into<String>,
        bar: u8,
        byte_address: u64,
        n_elements: usize,
        n_fractional_bits: i32,
        signed: bool,
        access_class: AccessClass,
    ) -> Self {
        NumericAddressedInfo {
            path: RegisterPath::new(path.into()),
            bar,
            byte_address,
            byte_size: n_elements * WORD_SIZE,
            block_size_bytes: WORD_SIZE,
            n_blocks: n_elements,
            channels: vec![ChannelLayout {
                bit_offset: 0,
                width: 32,
                signed,
                representation: Representation::FixedPoint { n_fractional_bits },
            }],
            access_class,
            interrupt: None,
            tags: BTreeSet::new(),
        }
    }

    /// An interrupt-driven register: same raw layout as [`Self::simple`],
    /// but tagged with the dispatcher id a `wait_for_new_data` accessor
    /// subscribes under.
    pub fn interrupt(path: impl Into<String>, bar: u8, byte_address: u64, n_elements: usize, id: InterruptId) -> Self {
        let mut info = Self::simple(path, bar, byte_address, n_elements, 0, false, AccessClass::Interrupt);
        info.interrupt = Some(id);
        info
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self.access_class, AccessClass::WriteOnly)
    }

    pub fn is_writeable(&self) -> bool {
        matches!(self.access_class, AccessClass::ReadWrite | AccessClass::WriteOnly)
    }

    pub fn byte_range(&self) -> (u64, u64) {
        (self.byte_address, self.byte_address + self.byte_size as u64)
    }

    fn to_register_info(&self) -> RegisterInfo {
        let shape = if self.n_channels() == 1 {
            if self.n_blocks == 1 {
                RegisterShape::scalar()
            } else {
                RegisterShape::one_d(self.n_blocks)
            }
        } else {
            RegisterShape::two_d(self.n_channels(), self.n_blocks)
        };
        let supports_raw = self.n_channels() == 1
            && matches!(
                self.channels[0].representation,
                Representation::FixedPoint { n_fractional_bits: 0 }
            )
            && self.channels[0].width == 32;
        let descriptor = DataDescriptor::numeric(
            UserTypeTag::Float64,
            if supports_raw { Some(UserTypeTag::Int32) } else { None },
        );
        let mut modes = AccessModeFlags::new();
        if supports_raw {
            modes.set(AccessMode::Raw);
        }
        if self.access_class == AccessClass::Interrupt {
            modes.set(AccessMode::WaitForNewData);
        }
        RegisterInfo {
            path: self.path.clone(),
            shape,
            descriptor,
            supported_modes: modes,
            readable: self.is_readable(),
            writeable: self.is_writeable(),
            tags: self.tags.clone(),
        }
    }
}

/// The (out of scope, interface-only) concrete transport a
/// numeric-addressed backend drives. PCIe ioctl, UIO, and shared-memory
/// placement are external collaborators; only this interface is fixed.
/// The dummy and shared-dummy backends are the in-library
/// implementations used for tests and cross-process coupling.
pub trait RawDevice: fmt::Debug + Send + Sync {
    fn open(&self) -> Result<()> {
        Ok(())
    }
    fn close(&self) -> Result<()> {
        Ok(())
    }
    fn read_block(&self, bar: u8, byte_address: u64, byte_size: usize) -> Result<Vec<u8>>;
    fn write_block(&self, bar: u8, byte_address: u64, data: &[u8]) -> Result<()>;
}

/// Converts one channel's raw bits to/from a [`UserValue`].
fn channel_converter(layout: &ChannelLayout) -> Box<dyn RawConverter> {
    match layout.representation {
        Representation::FixedPoint { n_fractional_bits } => Box::new(FixedPointConverter::new(
            layout.width.min(64),
            n_fractional_bits,
            layout.signed,
        )),
        Representation::Ieee754 => Box::new(Ieee754Converter::new()),
        Representation::Ascii => Box::new(AsciiConverter),
    }
}

#[derive(Debug)]
struct AsciiConverter;
impl RawConverter for AsciiConverter {
    fn to_raw(&self, value: &UserValue, path: &str) -> Result<i64> {
        let s = value.convert_checked(UserTypeTag::Str, path)?;
        match s {
            UserValue::Str(s) => Ok(s.bytes().next().unwrap_or(0) as i64),
            _ => unreachable!(),
        }
    }

    fn from_raw(&self, raw: i64, _path: &str) -> Result<UserValue> {
        Ok(UserValue::Str(((raw & 0xFF) as u8 as char).to_string()))
    }
}

fn write_word(device: &dyn RawDevice, bar: u8, byte_address: u64, value: u32) -> Result<()> {
    device.write_block(bar, byte_address, &value.to_le_bytes())
}

/// A controller node's acknowledge handshake, resolved to concrete
/// `(bar, byte_address)` targets so a firing leaf can perform the
/// acknowledge write without holding a backend reference.
#[derive(Debug, Clone)]
enum ResolvedAck {
    Isr { bit: u32, isr: (u8, u64) },
    Iar { bit: u32, iar: (u8, u64) },
    Icr { bit: u32, icr: (u8, u64) },
}

/// The write to undo a controller node's enable when the last
/// subscriber for its id goes away.
#[derive(Debug, Clone)]
enum ResolvedDisable {
    /// Write `1<<bit` back to CIE, mirroring the SIE write on subscribe.
    Cie { bit: u32, cie: (u8, u64) },
    /// Clear the whole master-enable register. Assumes one id owns the
    /// register; sharing one MER across several interrupt ids is not
    /// supported.
    Mer { mer: (u8, u64) },
}

/// The async-read machinery a [`NumericLeaf`] built over an
/// `AccessClass::Interrupt` register carries: the queue it blocks on in
/// `read_transfer`, and the resolved acknowledge write to perform
/// afterward (if the controller node declared one).
struct InterruptWait {
    dispatcher: Arc<InterruptDispatcher>,
    receiver: Receiver<VersionNumber>,
    ack: Option<ResolvedAck>,
    id: InterruptId,
    device: Arc<dyn RawDevice>,
    disable: Option<ResolvedDisable>,
}

impl Drop for InterruptWait {
    /// Unsubscribes from the dispatcher and, if no subscriber is left
    /// for this id, writes the disable register so the line stops
    /// raising interrupts nobody is listening for.
    fn drop(&mut self) {
        let was_last = self.dispatcher.unsubscribe(&self.id, &self.receiver);
        if !was_last {
            return;
        }
        let _ = match &self.disable {
            Some(ResolvedDisable::Cie { bit, cie }) => write_word(self.device.as_ref(), cie.0, cie.1, 1 << bit),
            Some(ResolvedDisable::Mer { mer }) => write_word(self.device.as_ref(), mer.0, mer.1, 0),
            None => Ok(()),
        };
    }
}

/// Where a leaf's bytes currently live: independently fetched by this
/// leaf's own transfer, or rebased onto a transfer group's merged
/// element after finalization.
enum RawSource {
    Independent,
    Merged {
        merged: Arc<Mutex<MergedRawElement>>,
        byte_offset: usize,
    },
}

/// The hardware-accessing transfer element for one numeric-addressed
/// register: owns its local byte buffer and performs raw device I/O
/// (or, once merged into a transfer group, defers I/O to the merged
/// element and only copies its own slice).
struct NumericLeaf {
    id: TransferElementId,
    path: RegisterPath,
    lifecycle: Arc<BackendLifecycle>,
    device: Arc<dyn RawDevice>,
    bar: u8,
    byte_address: u64,
    byte_size: usize,
    local_bytes: Vec<u8>,
    source: RawSource,
    pending_exception: Option<DeviceError>,
    version: VersionNumber,
    validity: DataValidity,
    readable: bool,
    writeable: bool,
    interrupt: Option<InterruptWait>,
}

impl fmt::Debug for NumericLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumericLeaf")
            .field("path", &self.path)
            .field("bar", &self.bar)
            .field("byte_address", &self.byte_address)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

impl NumericLeaf {
    fn new(
        path: RegisterPath,
        lifecycle: Arc<BackendLifecycle>,
        device: Arc<dyn RawDevice>,
        bar: u8,
        byte_address: u64,
        byte_size: usize,
        readable: bool,
        writeable: bool,
    ) -> Self {
        NumericLeaf {
            id: TransferElementId::new(),
            path,
            lifecycle,
            device,
            bar,
            byte_address,
            byte_size,
            local_bytes: vec![0u8; byte_size],
            source: RawSource::Independent,
            pending_exception: None,
            version: VersionNumber::null(),
            validity: DataValidity::Ok,
            readable,
            writeable,
            interrupt: None,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.local_bytes
    }

    fn acknowledge(&self, wait: &InterruptWait) -> Result<()> {
        match &wait.ack {
            Some(ResolvedAck::Isr { bit, isr }) => write_word(self.device.as_ref(), isr.0, isr.1, 1 << bit),
            Some(ResolvedAck::Iar { bit, iar }) => write_word(self.device.as_ref(), iar.0, iar.1, 1 << bit),
            Some(ResolvedAck::Icr { bit, icr }) => write_word(self.device.as_ref(), icr.0, icr.1, 1 << bit),
            None => Ok(()),
        }
    }

    /// A genuine I/O failure from the transport faults the whole backend,
    /// not just this accessor: the next `isFunctional()` on any accessor
    /// sharing this lifecycle returns false until the next `open()`.
    fn fault(&self, error: DeviceError) -> DeviceError {
        if error.is_runtime() {
            self.lifecycle.set_exception(error.message());
        }
        error
    }
}

impl TransferElementBase for NumericLeaf {
    fn id(&self) -> TransferElementId {
        self.id
    }

    fn register_path(&self) -> String {
        self.path.to_canonical_string()
    }

    fn pre_read(&mut self, _kind: TransferKind) -> Result<()> {
        self.lifecycle.check_functional(&self.path.to_canonical_string())
    }

    fn read_transfer(&mut self) -> Result<()> {
        if let Some(wait) = &self.interrupt {
            crate::async_dispatch::recv_blocking(&wait.dispatcher, &wait.receiver, &self.path.to_canonical_string())?;
        }
        match &self.source {
            RawSource::Independent => {
                let bytes = self
                    .device
                    .read_block(self.bar, self.byte_address, self.byte_size)
                    .map_err(|e| self.fault(e))?;
                self.local_bytes = bytes;
            }
            RawSource::Merged { merged, byte_offset } => {
                let merged = merged.lock();
                let slice = merged.slice(*byte_offset, self.byte_size);
                self.local_bytes.copy_from_slice(slice);
            }
        }
        if let Some(wait) = &self.interrupt {
            self.acknowledge(wait)?;
        }
        Ok(())
    }

    fn post_read(&mut self, _kind: TransferKind, has_new_data: bool) -> Result<()> {
        if let Some(e) = self.pending_exception.take() {
            self.validity = DataValidity::Faulty;
            return Err(e);
        }
        if has_new_data {
            self.version = VersionNumber::new();
            self.validity = DataValidity::Ok;
        }
        Ok(())
    }

    fn pre_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        self.lifecycle.check_functional(&self.path.to_canonical_string())?;
        if !self.writeable {
            return Err(DeviceError::logic(
                self.path.to_canonical_string(),
                "writing to a read-only register",
            ));
        }
        if let RawSource::Merged { merged, byte_offset } = &self.source {
            let mut merged = merged.lock();
            merged.stage(*byte_offset, &self.local_bytes);
        }
        Ok(())
    }

    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        match &self.source {
            RawSource::Independent => {
                self.device
                    .write_block(self.bar, self.byte_address, &self.local_bytes)
                    .map_err(|e| self.fault(e))?;
                self.version = version;
                Ok(false)
            }
            RawSource::Merged { .. } => {
                // Actual I/O happens once for the whole merged element;
                // the transfer group drives that separately.
                self.version = version;
                Ok(false)
            }
        }
    }

    fn post_write(&mut self, _kind: TransferKind, _version: VersionNumber) -> Result<()> {
        if let Some(e) = self.pending_exception.take() {
            self.validity = DataValidity::Faulty;
            return Err(e);
        }
        Ok(())
    }

    fn may_replace_other(&self, other: &dyn TransferElementBase) -> bool {
        if self.id() == other.id() {
            return true;
        }
        // Structural equivalence used by the transfer group: exposed
        // via downcast from `TransferGroup`, not needed here directly.
        false
    }

    fn set_exception(&mut self, error: DeviceError) {
        self.pending_exception = Some(error);
    }

    fn get_version_number(&self) -> VersionNumber {
        self.version
    }

    fn get_validity(&self) -> DataValidity {
        self.validity
    }

    fn is_readable(&self) -> bool {
        self.readable
    }

    fn is_writeable(&self) -> bool {
        self.writeable
    }
}

/// Wraps a [`NumericLeaf`] with conversion for one channel of one
/// register, producing a typed [`NDRegisterAccessor`].
struct ConvertingAccessor<T> {
    leaf: NumericLeaf,
    info: NumericAddressedInfo,
    n_blocks: usize,
    buffer: crate::buffer::Buffer<T>,
    raw_mode: bool,
}

impl<T: UserType> fmt::Debug for ConvertingAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvertingAccessor")
            .field("leaf", &self.leaf)
            .field("raw_mode", &self.raw_mode)
            .finish()
    }
}

impl<T: UserType> ConvertingAccessor<T> {
    fn block(&self, block_index: usize) -> &[u8] {
        let start = block_index * self.info.block_size_bytes;
        &self.leaf.bytes()[start..start + self.info.block_size_bytes]
    }

    fn block_mut(&mut self, block_index: usize) -> &mut [u8] {
        let block_size = self.info.block_size_bytes;
        let start = block_index * block_size;
        &mut self.leaf.local_bytes[start..start + block_size]
    }
}

impl<T: UserType> TransferElementBase for ConvertingAccessor<T> {
    fn id(&self) -> TransferElementId {
        self.leaf.id()
    }

    fn register_path(&self) -> String {
        self.leaf.register_path()
    }

    fn pre_read(&mut self, kind: TransferKind) -> Result<()> {
        self.leaf.pre_read(kind)
    }

    fn read_transfer(&mut self) -> Result<()> {
        self.leaf.read_transfer()
    }

    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()> {
        self.leaf.post_read(kind, has_new_data)?;
        if has_new_data {
            for block_index in 0..self.n_blocks {
                let path = self.leaf.register_path();
                let block = self.block(block_index).to_vec();
                for (ch, layout) in self.info.channels.clone().iter().enumerate() {
                    let value = if self.raw_mode {
                        let raw = extract_bits(&block, layout.bit_offset, layout.width);
                        let signed = sign_extend_field(raw, layout.width, true);
                        UserValue::Int32(signed as i32)
                    } else {
                        let raw = extract_bits(&block, layout.bit_offset, layout.width);
                        let signed = sign_extend_field(raw, layout.width, layout.signed);
                        channel_converter(layout).from_raw(signed, &path)?
                    };
                    let typed = T::from_user_value(&value, &path)?;
                    self.buffer.channel_mut(ch)[block_index] = typed;
                }
            }
        }
        Ok(())
    }

    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        if !self.leaf.is_writeable() {
            return Err(DeviceError::logic(
                self.leaf.register_path(),
                "writing to a read-only register",
            ));
        }
        let path = self.leaf.register_path();
        for block_index in 0..self.n_blocks {
            let channels = self.info.channels.clone();
            let raw_mode = self.raw_mode;
            let values: Vec<i64> = (0..channels.len())
                .map(|ch| -> Result<i64> {
                    let user_value = self.buffer.channel(ch)[block_index].to_user_value();
                    if raw_mode {
                        user_value.as_f64(&path).map(|v| v as i64)
                    } else {
                        channel_converter(&channels[ch]).to_raw(&user_value, &path)
                    }
                })
                .collect::<Result<_>>()?;
            let block = self.block_mut(block_index);
            for (layout, raw) in channels.iter().zip(values) {
                let truncated = (raw as u128) & ((1u128 << layout.width.min(127)) - 1);
                splice_bits(block, layout.bit_offset, layout.width, truncated);
            }
        }
        self.leaf.pre_write(kind, version)
    }

    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        self.leaf.write_transfer(version)
    }

    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()> {
        self.leaf.post_write(kind, version)
    }

    fn may_replace_other(&self, other: &dyn TransferElementBase) -> bool {
        self.leaf.may_replace_other(other)
    }

    fn hardware_accessing_elements(&self) -> Vec<TransferElementId> {
        vec![self.leaf.id()]
    }

    fn set_exception(&mut self, error: DeviceError) {
        self.leaf.set_exception(error)
    }

    fn get_version_number(&self) -> VersionNumber {
        self.leaf.get_version_number()
    }

    fn get_validity(&self) -> DataValidity {
        self.leaf.get_validity()
    }

    fn is_readable(&self) -> bool {
        self.leaf.is_readable()
    }

    fn is_writeable(&self) -> bool {
        self.leaf.is_writeable()
    }
}

impl<T: UserType> NDRegisterAccessor<T> for ConvertingAccessor<T> {
    fn n_channels(&self) -> usize {
        self.buffer.n_channels()
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

/// `GroupMember` adapter letting the transfer group drive a
/// [`ConvertingAccessor`] without knowing its user type `T`.
struct NumericGroupMember<T: UserType> {
    accessor: Box<ConvertingAccessor<T>>,
}

impl<T: UserType> fmt::Debug for NumericGroupMember<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NumericGroupMember({:?})", self.accessor)
    }
}

impl<T: UserType> GroupMember for NumericGroupMember<T> {
    fn pre_read(&mut self) -> Result<()> {
        TransferElementBase::pre_read(self.accessor.as_mut(), TransferKind::Read)
    }

    fn read_transfer(&mut self) -> Result<()> {
        // The leaf itself branches on `RawSource`: independent leaves
        // fetch their own bytes, merged leaves copy their slice out of
        // the chain's `MergedRawElement`, which the group has already
        // populated with one raw read by this point.
        TransferElementBase::read_transfer(self.accessor.as_mut())
    }

    fn post_read(&mut self, has_new_data: bool) -> Result<()> {
        TransferElementBase::post_read(self.accessor.as_mut(), TransferKind::Read, has_new_data)
    }

    fn pre_write(&mut self, version: VersionNumber) -> Result<()> {
        TransferElementBase::pre_write(self.accessor.as_mut(), TransferKind::Write, version)
    }

    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool> {
        // Merged leaves already staged their bytes into the chain's
        // buffer during `pre_write`; the group flushes that buffer with
        // one raw write after this call returns.
        TransferElementBase::write_transfer(self.accessor.as_mut(), version)
    }

    fn post_write(&mut self, version: VersionNumber) -> Result<()> {
        TransferElementBase::post_write(self.accessor.as_mut(), TransferKind::Write, version)
    }

    fn merge_descriptor(&self) -> Option<MergeDescriptor> {
        Some(MergeDescriptor {
            bar: self.accessor.leaf.bar,
            byte_address: self.accessor.leaf.byte_address,
            byte_size: self.accessor.leaf.byte_size,
            device: self.accessor.leaf.device.clone(),
        })
    }

    fn bind_merged(&mut self, merged: Arc<Mutex<MergedRawElement>>, byte_offset: usize) {
        self.accessor.leaf.source = RawSource::Merged { merged, byte_offset };
    }

    fn is_writeable(&self) -> bool {
        TransferElementBase::is_writeable(self.accessor.as_ref())
    }

    fn is_readable(&self) -> bool {
        TransferElementBase::is_readable(self.accessor.as_ref())
    }

    fn hardware_id(&self) -> TransferElementId {
        self.accessor.leaf.id()
    }
}

/// A backend mapping a register catalogue onto a `(bar, byte-offset,
/// byte-length)` address space over some [`RawDevice`] transport.
pub struct NumericAddressedBackend {
    lifecycle: Arc<BackendLifecycle>,
    device: Arc<dyn RawDevice>,
    registers: BTreeMap<RegisterPath, NumericAddressedInfo>,
    metadata: BTreeMap<String, String>,
    pub dispatcher: Arc<InterruptDispatcher>,
    controllers: Arc<ControllerTree>,
}

impl fmt::Debug for NumericAddressedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumericAddressedBackend")
            .field("n_registers", &self.registers.len())
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl NumericAddressedBackend {
    pub fn new(device: Arc<dyn RawDevice>, registers: Vec<NumericAddressedInfo>) -> Arc<Self> {
        let mut map = BTreeMap::new();
        for reg in registers {
            map.insert(reg.path.clone(), reg);
        }
        Arc::new(NumericAddressedBackend {
            lifecycle: Arc::new(BackendLifecycle::new()),
            device,
            registers: map,
            metadata: BTreeMap::new(),
            dispatcher: Arc::new(InterruptDispatcher::new()),
            controllers: Arc::new(ControllerTree::new()),
        })
    }

    pub fn with_metadata(mut self: Arc<Self>, name: &str, value: &str) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("metadata must be set before sharing the backend")
            .metadata
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn lifecycle(&self) -> Arc<BackendLifecycle> {
        self.lifecycle.clone()
    }

    pub fn device(&self) -> Arc<dyn RawDevice> {
        self.device.clone()
    }

    pub fn register_info(&self, path: &RegisterPath) -> Option<&NumericAddressedInfo> {
        self.registers.get(path)
    }

    fn require_register(&self, path: &RegisterPath) -> Result<&NumericAddressedInfo> {
        self.registers
            .get(path)
            .ok_or_else(|| DeviceError::logic(path.to_canonical_string(), "unknown register"))
    }

    fn resolve_handshake_register(&self, name: &str) -> Result<(u8, u64)> {
        let info = self.require_register(&RegisterPath::new(name))?;
        Ok((info.bar, info.byte_address))
    }

    fn resolve_ack(&self, node: &ControllerNode) -> Result<Option<ResolvedAck>> {
        match node.acknowledge {
            Some(AcknowledgeVariant::Isr) => {
                let isr = self.resolve_handshake_register(node.registers.isr.as_ref().expect("validated"))?;
                Ok(Some(ResolvedAck::Isr { bit: node.bit, isr }))
            }
            Some(AcknowledgeVariant::Iar) => {
                let iar = self.resolve_handshake_register(node.registers.iar.as_ref().expect("validated"))?;
                Ok(Some(ResolvedAck::Iar { bit: node.bit, iar }))
            }
            Some(AcknowledgeVariant::Icr) => {
                let icr = self.resolve_handshake_register(node.registers.icr.as_ref().expect("validated"))?;
                Ok(Some(ResolvedAck::Icr { bit: node.bit, icr }))
            }
            None => Ok(None),
        }
    }

    fn resolve_disable(&self, node: &ControllerNode) -> Result<Option<ResolvedDisable>> {
        match node.enable {
            Some(EnableVariant::SieCie) => {
                let cie = self.resolve_handshake_register(node.registers.cie.as_ref().expect("validated"))?;
                Ok(Some(ResolvedDisable::Cie { bit: node.bit, cie }))
            }
            Some(EnableVariant::MerGieMie) => {
                let mer = self.resolve_handshake_register(node.registers.mer.as_ref().expect("validated"))?;
                Ok(Some(ResolvedDisable::Mer { mer }))
            }
            None => Ok(None),
        }
    }

    fn write_enable(&self, node: &ControllerNode) -> Result<()> {
        match node.enable {
            Some(EnableVariant::SieCie) => {
                let (bar, addr) = self.resolve_handshake_register(node.registers.sie.as_ref().expect("validated"))?;
                write_word(self.device.as_ref(), bar, addr, 1 << node.bit)
            }
            Some(EnableVariant::MerGieMie) => {
                let (bar, addr) = self.resolve_handshake_register(node.registers.mer.as_ref().expect("validated"))?;
                write_word(self.device.as_ref(), bar, addr, 1)
            }
            None => Ok(()),
        }
    }

    /// Declares the interrupt-controller handshake for `id`: which
    /// registers to write to enable delivery and acknowledge a firing
    /// line. The named registers must already exist in this backend's
    /// catalogue.
    pub fn configure_interrupt_controller(&self, id: InterruptId, node: ControllerNode) -> Result<()> {
        for name in [
            &node.registers.isr,
            &node.registers.ier,
            &node.registers.iar,
            &node.registers.icr,
            &node.registers.sie,
            &node.registers.cie,
            &node.registers.mer,
        ]
        .into_iter()
        .flatten()
        {
            self.resolve_handshake_register(name)?;
        }
        self.controllers.configure(id, node)
    }

    fn build_concrete<T: UserType>(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<ConvertingAccessor<T>> {
        let info = self.require_register(path)?.clone();
        let path_str = path.to_canonical_string();

        let raw_mode = flags.has(AccessMode::Raw);
        if raw_mode {
            let reg_info = info.to_register_info();
            if !reg_info.supported_modes.has(AccessMode::Raw) {
                return Err(DeviceError::logic(&path_str, "register has no raw access mode"));
            }
            if T::TAG != UserTypeTag::Int32 {
                return Err(DeviceError::logic(&path_str, "raw access requires the Int32 user type"));
            }
        }
        if flags.has(AccessMode::WaitForNewData) && info.access_class != AccessClass::Interrupt {
            return Err(DeviceError::logic(
                &path_str,
                "register does not support wait_for_new_data",
            ));
        }

        let mut leaf = NumericLeaf::new(
            path.clone(),
            self.lifecycle.clone(),
            self.device.clone(),
            info.bar,
            info.byte_address,
            info.byte_size,
            info.is_readable(),
            info.is_writeable(),
        );
        if flags.has(AccessMode::WaitForNewData) {
            let id = info
                .interrupt
                .clone()
                .ok_or_else(|| DeviceError::logic(&path_str, "register has no interrupt id configured"))?;
            let receiver = self.dispatcher.subscribe(id.clone());
            let (ack, disable) = match self.controllers.get(&id) {
                Some(node) => (self.resolve_ack(&node)?, self.resolve_disable(&node)?),
                None => (None, None),
            };
            leaf.interrupt = Some(InterruptWait {
                dispatcher: self.dispatcher.clone(),
                receiver,
                ack,
                id,
                device: self.device.clone(),
                disable,
            });
        }
        Ok(ConvertingAccessor::<T> {
            leaf,
            n_blocks: info.n_blocks,
            buffer: crate::buffer::Buffer::new(info.n_channels(), info.n_blocks),
            info,
            raw_mode,
        })
    }

    fn build<T: UserType>(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<Box<dyn NDRegisterAccessor<T>>> {
        Ok(Box::new(self.build_concrete::<T>(path, flags)?))
    }

    /// Exposes a [`GroupMember`] adapter for this register, used by
    /// [`crate::transfer_group::TransferGroup`] to add a numeric-addressed
    /// accessor without knowing its user type.
    pub fn build_group_member<T: UserType>(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<Box<dyn GroupMember>> {
        let accessor = Box::new(self.build_concrete::<T>(path, flags)?);
        Ok(Box::new(NumericGroupMember { accessor }))
    }
}

impl Backend for NumericAddressedBackend {
    fn open(&self) -> Result<()> {
        self.device.open()?;
        self.lifecycle.mark_open();
        self.dispatcher.clear_poison();
        tracing::info!("numeric-addressed backend opened");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.device.close()?;
        self.lifecycle.mark_closed();
        Ok(())
    }

    fn is_functional(&self) -> bool {
        self.lifecycle.is_functional()
    }

    fn set_exception(&self, message: &str) {
        tracing::warn!(message, "numeric-addressed backend faulted");
        self.lifecycle.set_exception(message);
        self.dispatcher.poison_all(message);
    }

    fn catalogue(&self) -> RegisterCatalogue {
        let mut cat = RegisterCatalogue::new();
        for info in self.registers.values() {
            cat.insert(info.to_register_info());
        }
        for (k, v) in &self.metadata {
            cat.set_metadata(k, v);
        }
        cat
    }

    fn activate_async_read(&self) -> Result<()> {
        for id in self.dispatcher.subscribed_ids() {
            if let Some(node) = self.controllers.get(&id) {
                self.write_enable(&node)?;
            }
        }
        self.dispatcher.activate(self.device.as_ref())
    }

    fn get_register_accessor_erased(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<TypeErasedAccessor> {
        let tag = infer_tag(flags);
        dispatch_user_type!(tag, path, |T| {
            let accessor = self.build::<T>(path, flags)?;
            Ok(erase_accessor(accessor))
        })
    }
}

fn infer_tag(flags: &AccessModeFlags) -> UserTypeTag {
    if flags.has(AccessMode::Raw) {
        UserTypeTag::Int32
    } else {
        UserTypeTag::Float64
    }
}

/// Downcast helper retained for callers that already know the tag they
/// want (used by [`crate::device::Device`]); separate from
/// `get_register_accessor_erased`'s internal tag inference so a caller
/// asking for `i32` without raw mode still gets fixed-point-converted
/// `i32`, not a rejection.
pub fn get_typed_accessor<T: UserType>(
    backend: &NumericAddressedBackend,
    path: &RegisterPath,
    flags: &AccessModeFlags,
) -> Result<Box<dyn NDRegisterAccessor<T>>> {
    backend.build::<T>(path, flags)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex as PMutex;

    /// In-memory [`RawDevice`] used by unit tests: one growable byte
    /// vector per BAR, guarded by a single lock (the "buffer lock" the
    /// concurrency model requires of dummy-style backends).
    #[derive(Debug, Default)]
    pub struct MemoryDevice {
        bars: PMutex<BTreeMap<u8, Vec<u8>>>,
        pub fail_next: PMutex<bool>,
    }

    impl MemoryDevice {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn bar_mut<'a>(bars: &'a mut BTreeMap<u8, Vec<u8>>, bar: u8, min_len: usize) -> &'a mut Vec<u8> {
            let buf = bars.entry(bar).or_default();
            if buf.len() < min_len {
                buf.resize(min_len, 0);
            }
            buf
        }
    }

    impl RawDevice for MemoryDevice {
        fn read_block(&self, bar: u8, byte_address: u64, byte_size: usize) -> Result<Vec<u8>> {
            if *self.fail_next.lock() {
                *self.fail_next.lock() = false;
                return Err(DeviceError::runtime("/dummy", "injected read failure"));
            }
            let mut bars = self.bars.lock();
            let buf = Self::bar_mut(&mut bars, bar, byte_address as usize + byte_size);
            Ok(buf[byte_address as usize..byte_address as usize + byte_size].to_vec())
        }

        fn write_block(&self, bar: u8, byte_address: u64, data: &[u8]) -> Result<()> {
            if *self.fail_next.lock() {
                *self.fail_next.lock() = false;
                return Err(DeviceError::runtime("/dummy", "injected write failure"));
            }
            let mut bars = self.bars.lock();
            let buf = Self::bar_mut(&mut bars, bar, byte_address as usize + data.len());
            buf[byte_address as usize..byte_address as usize + data.len()].copy_from_slice(data);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryDevice;
    use super::*;

    fn backend_with(registers: Vec<NumericAddressedInfo>) -> Arc<NumericAddressedBackend> {
        let device = MemoryDevice::new();
        let backend = NumericAddressedBackend::new(device, registers);
        backend.open().unwrap();
        backend
    }

    #[test]
    fn simple_register_round_trip() {
        let backend = backend_with(vec![NumericAddressedInfo::simple(
            "/SIMPLE",
            0,
            0x20,
            1,
            0,
            true,
            AccessClass::ReadWrite,
        )]);
        let path = RegisterPath::new("/SIMPLE");
        let mut acc =
            get_typed_accessor::<i32>(&backend, &path, &AccessModeFlags::new()).unwrap();
        acc.channel_mut(0)[0] = 42;
        acc.write().unwrap();

        let mut reader =
            get_typed_accessor::<i32>(&backend, &path, &AccessModeFlags::new()).unwrap();
        reader.read().unwrap();
        assert_eq!(reader.channel(0)[0], 42);
    }

    #[test]
    fn fixed_point_channel_round_trip() {
        let backend = backend_with(vec![NumericAddressedInfo::simple(
            "/SCALED",
            0,
            0x40,
            1,
            16,
            true,
            AccessClass::ReadWrite,
        )]);
        let path = RegisterPath::new("/SCALED");
        let mut writer =
            get_typed_accessor::<f64>(&backend, &path, &AccessModeFlags::new()).unwrap();
        writer.channel_mut(0)[0] = 1.0 / 4.2;
        writer.write().unwrap();

        let mut reader =
            get_typed_accessor::<f64>(&backend, &path, &AccessModeFlags::new()).unwrap();
        reader.read().unwrap();
        let roundtrip = reader.channel(0)[0];
        assert!((roundtrip - 1.0 / 4.2).abs() < 1e-4);
    }

    #[test]
    fn set_exception_blocks_further_transfers() {
        let backend = backend_with(vec![NumericAddressedInfo::simple(
            "/SIMPLE", 0, 0x20, 1, 0, true, AccessClass::ReadWrite,
        )]);
        backend.set_exception("cable unplugged");
        assert!(!backend.is_functional());

        let path = RegisterPath::new("/SIMPLE");
        let mut acc =
            get_typed_accessor::<i32>(&backend, &path, &AccessModeFlags::new()).unwrap();
        let err = acc.read().unwrap_err();
        assert!(err.is_runtime());

        backend.open().unwrap();
        assert!(backend.is_functional());
    }

    #[test]
    fn unknown_register_is_logic_error() {
        let backend = backend_with(vec![]);
        let path = RegisterPath::new("/NOPE");
        let err =
            get_typed_accessor::<i32>(&backend, &path, &AccessModeFlags::new()).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn isr_acknowledge_interrupt_handshake_activates_and_acknowledges() {
        let backend = backend_with(vec![
            NumericAddressedInfo::interrupt("/DATA", 0, 0x100, 1, vec![0, 4]),
            NumericAddressedInfo::simple("/IER", 0, 0x10, 1, 0, false, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/CIE", 0, 0x14, 1, 0, false, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/ISR", 0, 0x18, 1, 0, false, AccessClass::ReadWrite),
        ]);
        backend
            .configure_interrupt_controller(
                vec![0, 4],
                ControllerNode {
                    bit: 4,
                    enable: Some(EnableVariant::SieCie),
                    acknowledge: Some(AcknowledgeVariant::Isr),
                    registers: crate::async_dispatch::HandshakeRegisters {
                        isr: Some("/ISR".to_string()),
                        sie: Some("/IER".to_string()),
                        cie: Some("/CIE".to_string()),
                        ..Default::default()
                    },
                },
            )
            .unwrap();

        let path = RegisterPath::new("/DATA");
        let flags = AccessModeFlags::new().with(AccessMode::WaitForNewData);
        let mut accessor = get_typed_accessor::<i32>(&backend, &path, &flags).unwrap();

        backend.activate_async_read().unwrap();
        let ier = backend.device().read_block(0, 0x10, WORD_SIZE).unwrap();
        assert_eq!(u32::from_le_bytes(ier.try_into().unwrap()), 1 << 4);

        accessor.read().unwrap();
        let isr = backend.device().read_block(0, 0x18, WORD_SIZE).unwrap();
        assert_eq!(u32::from_le_bytes(isr.try_into().unwrap()), 1 << 4);

        backend.dispatcher.dispatch(&vec![0, 4], VersionNumber::new());
        accessor.read().unwrap();
    }

    #[test]
    fn dropping_the_last_subscriber_clears_the_cie_bit() {
        let backend = backend_with(vec![
            NumericAddressedInfo::interrupt("/DATA", 0, 0x100, 1, vec![0, 4]),
            NumericAddressedInfo::simple("/IER", 0, 0x10, 1, 0, false, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/CIE", 0, 0x14, 1, 0, false, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/ISR", 0, 0x18, 1, 0, false, AccessClass::ReadWrite),
        ]);
        backend
            .configure_interrupt_controller(
                vec![0, 4],
                ControllerNode {
                    bit: 4,
                    enable: Some(EnableVariant::SieCie),
                    acknowledge: Some(AcknowledgeVariant::Isr),
                    registers: crate::async_dispatch::HandshakeRegisters {
                        isr: Some("/ISR".to_string()),
                        sie: Some("/IER".to_string()),
                        cie: Some("/CIE".to_string()),
                        ..Default::default()
                    },
                },
            )
            .unwrap();

        let path = RegisterPath::new("/DATA");
        let flags = AccessModeFlags::new().with(AccessMode::WaitForNewData);
        let accessor = get_typed_accessor::<i32>(&backend, &path, &flags).unwrap();
        backend.activate_async_read().unwrap();
        assert_eq!(backend.dispatcher.subscribed_ids(), vec![vec![0, 4]]);

        drop(accessor);

        assert!(backend.dispatcher.subscribed_ids().is_empty());
        let cie = backend.device().read_block(0, 0x14, WORD_SIZE).unwrap();
        assert_eq!(u32::from_le_bytes(cie.try_into().unwrap()), 1 << 4);
    }

    #[test]
    fn wait_for_new_data_on_a_non_interrupt_register_is_logic_error() {
        let backend = backend_with(vec![NumericAddressedInfo::simple(
            "/PLAIN", 0, 0x20, 1, 0, true, AccessClass::ReadWrite,
        )]);
        let path = RegisterPath::new("/PLAIN");
        let flags = AccessModeFlags::new().with(AccessMode::WaitForNewData);
        let err = get_typed_accessor::<i32>(&backend, &path, &flags).unwrap_err();
        assert!(err.is_logic());
    }
}
