//! Groups several register accessors so a single `read`/`write` call
//! transfers all of them together, merging adjacent numeric-addressed
//! registers into one raw I/O per contiguous byte range.
//!
//! Merging is scoped to numeric-addressed leaves: a member whose
//! [`GroupMember::merge_descriptor`] returns `None` (every other
//! backend kind, for now) is simply driven independently alongside the
//! merged ones. This mirrors the "exactly those leaves declaring
//! `mayReplaceOther`-style compatibility may be merged, everything else
//! transfers on its own" rule, applied only where a merge descriptor
//! can currently be produced.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::numeric_addressed::RawDevice;
use crate::error::{DeviceError, Result};
use crate::transfer_element::TransferElementId;
use crate::version::VersionNumber;

/// What a numeric-addressed leaf needs the group to know in order to
/// consider it for merging: which device and byte range it occupies.
pub struct MergeDescriptor {
    pub bar: u8,
    pub byte_address: u64,
    pub byte_size: usize,
    pub device: Arc<dyn RawDevice>,
}

/// One contiguous raw I/O spanning several merged leaves' byte ranges.
pub struct MergedRawElement {
    device: Arc<dyn RawDevice>,
    bar: u8,
    byte_address: u64,
    bytes: Vec<u8>,
}

impl fmt::Debug for MergedRawElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedRawElement")
            .field("bar", &self.bar)
            .field("byte_address", &self.byte_address)
            .field("byte_size", &self.bytes.len())
            .finish()
    }
}

impl MergedRawElement {
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    pub fn stage(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&mut self) -> Result<()> {
        self.bytes = self.device.read_block(self.bar, self.byte_address, self.bytes.len())?;
        Ok(())
    }

    fn write(&self) -> Result<()> {
        self.device.write_block(self.bar, self.byte_address, &self.bytes)
    }
}

/// Object-safe adapter a backend exposes per accessor so the group can
/// drive the five-phase protocol and, where possible, participate in
/// merging without knowing the accessor's user type.
pub trait GroupMember: fmt::Debug + Send {
    fn pre_read(&mut self) -> Result<()>;
    fn read_transfer(&mut self) -> Result<()>;
    fn post_read(&mut self, has_new_data: bool) -> Result<()>;
    fn pre_write(&mut self, version: VersionNumber) -> Result<()>;
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool>;
    fn post_write(&mut self, version: VersionNumber) -> Result<()>;

    /// `Some` iff this member is a hardware-accessing numeric-addressed
    /// leaf eligible for adjacent merging.
    fn merge_descriptor(&self) -> Option<MergeDescriptor> {
        None
    }

    /// Rebinds this member onto a merged raw element at the given byte
    /// offset; called once per member, during [`TransferGroup::finalize`].
    fn bind_merged(&mut self, _merged: Arc<Mutex<MergedRawElement>>, _byte_offset: usize) {}

    fn is_readable(&self) -> bool;
    fn is_writeable(&self) -> bool;
    fn hardware_id(&self) -> TransferElementId;
}

/// A set of accessors transferred together. Members are added before
/// the first `read`/`write`; the first call triggers [`Self::finalize`],
/// which partitions numeric-addressed members into adjacent-byte-range
/// chains and merges each chain into one [`MergedRawElement`].
pub struct TransferGroup {
    members: Vec<Box<dyn GroupMember>>,
    chains: Vec<Arc<Mutex<MergedRawElement>>>,
    finalized: bool,
    /// Set during `finalize` if two members sharing a device and bar
    /// occupy overlapping (not merely adjacent) byte ranges and at
    /// least one of them is writeable. Checked on the first `write`.
    overlap: Option<DeviceError>,
}

impl fmt::Debug for TransferGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferGroup")
            .field("n_members", &self.members.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Default for TransferGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferGroup {
    pub fn new() -> Self {
        TransferGroup {
            members: Vec::new(),
            chains: Vec::new(),
            finalized: false,
            overlap: None,
        }
    }

    /// Adds a member. Panics if called after the group has already
    /// transferred once, matching the "membership is fixed after the
    /// first transfer" rule.
    pub fn add(&mut self, member: Box<dyn GroupMember>) {
        assert!(
            !self.finalized,
            "cannot add a member to a transfer group that has already transferred"
        );
        self.members.push(member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Partitions members with a merge descriptor into adjacent chains
    /// (same device, same bar, byte ranges touching end-to-start) and
    /// rebinds each chain's members onto a shared [`MergedRawElement`].
    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        struct Candidate {
            index: usize,
            bar: u8,
            byte_address: u64,
            byte_size: usize,
            device_key: usize,
            device: Arc<dyn RawDevice>,
        }

        let mut candidates: Vec<Candidate> = self
            .members
            .iter()
            .enumerate()
            .filter_map(|(index, member)| {
                member.merge_descriptor().map(|descriptor| Candidate {
                    index,
                    bar: descriptor.bar,
                    byte_address: descriptor.byte_address,
                    byte_size: descriptor.byte_size,
                    device_key: Arc::as_ptr(&descriptor.device) as *const () as usize,
                    device: descriptor.device,
                })
            })
            .collect();

        candidates.sort_by_key(|c| (c.device_key, c.bar, c.byte_address));

        for pair in candidates.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.device_key != b.device_key || a.bar != b.bar {
                continue;
            }
            let a_end = a.byte_address + a.byte_size as u64;
            if b.byte_address < a_end && (self.members[a.index].is_writeable() || self.members[b.index].is_writeable()) {
                self.overlap = Some(DeviceError::logic(
                    "transfer group",
                    format!(
                        "members at byte {} and {} on bar {} overlap in a writable group",
                        a.byte_address, b.byte_address, a.bar
                    ),
                ));
                break;
            }
        }

        let mut i = 0;
        while i < candidates.len() {
            let mut j = i + 1;
            let mut end = candidates[i].byte_address + candidates[i].byte_size as u64;
            while j < candidates.len()
                && candidates[j].device_key == candidates[i].device_key
                && candidates[j].bar == candidates[i].bar
                && candidates[j].byte_address == end
            {
                end = candidates[j].byte_address + candidates[j].byte_size as u64;
                j += 1;
            }

            if j - i > 1 {
                let start = candidates[i].byte_address;
                let total = (end - start) as usize;
                let merged = Arc::new(Mutex::new(MergedRawElement {
                    device: candidates[i].device.clone(),
                    bar: candidates[i].bar,
                    byte_address: start,
                    bytes: vec![0u8; total],
                }));
                for candidate in &candidates[i..j] {
                    let offset = (candidate.byte_address - start) as usize;
                    self.members[candidate.index].bind_merged(merged.clone(), offset);
                }
                self.chains.push(merged);
            }
            i = j;
        }
    }

    /// Reads every member: first a blocking `read_transfer` for every
    /// distinct merged chain (one raw I/O each), then per-member
    /// `pre_read`/`post_read`, with independent (unmerged) members also
    /// performing their own `read_transfer` as usual.
    pub fn read(&mut self) -> Result<()> {
        self.finalize();
        for member in &mut self.members {
            member.pre_read()?;
        }
        self.read_merged_chains()?;
        for member in &mut self.members {
            member.read_transfer()?;
        }
        for member in &mut self.members {
            member.post_read(true)?;
        }
        Ok(())
    }

    /// Writes every member with a shared version number: merged chains
    /// are staged by each member's `pre_write` and flushed with one raw
    /// I/O per chain, independent members write themselves.
    pub fn write(&mut self) -> Result<()> {
        self.finalize();
        if let Some(err) = &self.overlap {
            return Err(err.clone());
        }
        let version = VersionNumber::new();
        for member in &mut self.members {
            member.pre_write(version)?;
        }
        for member in &mut self.members {
            member.write_transfer(version)?;
        }
        self.write_merged_chains()?;
        for member in &mut self.members {
            member.post_write(version)?;
        }
        Ok(())
    }

    fn read_merged_chains(&self) -> Result<()> {
        for chain in &self.chains {
            chain.lock().read()?;
        }
        Ok(())
    }

    fn write_merged_chains(&self) -> Result<()> {
        for chain in &self.chains {
            chain.lock().write()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::numeric_addressed::test_support::MemoryDevice;
    use crate::backend::numeric_addressed::{AccessClass, NumericAddressedBackend, NumericAddressedInfo};
    use crate::catalogue::AccessModeFlags;
    use crate::path::RegisterPath;

    fn member_for(backend: &Arc<NumericAddressedBackend>, path: &str) -> Box<dyn GroupMember> {
        backend
            .build_group_member::<i32>(&RegisterPath::new(path), &AccessModeFlags::new())
            .unwrap()
    }

    #[test]
    fn adjacent_writable_members_merge_without_error() {
        let backend = NumericAddressedBackend::new(
            MemoryDevice::new(),
            vec![
                NumericAddressedInfo::simple("/A", 0, 0, 1, 0, true, AccessClass::ReadWrite),
                NumericAddressedInfo::simple("/B", 0, 4, 1, 0, true, AccessClass::ReadWrite),
            ],
        );
        backend.open().unwrap();

        let mut group = TransferGroup::new();
        group.add(member_for(&backend, "/A"));
        group.add(member_for(&backend, "/B"));

        group.write().unwrap();
        assert_eq!(group.chains.len(), 1);
    }

    #[test]
    fn overlapping_writable_members_are_rejected_at_write_time() {
        let backend = NumericAddressedBackend::new(
            MemoryDevice::new(),
            vec![
                NumericAddressedInfo::simple("/A", 0, 0, 1, 0, true, AccessClass::ReadWrite),
                NumericAddressedInfo::simple("/B", 0, 2, 1, 0, true, AccessClass::ReadWrite),
            ],
        );
        backend.open().unwrap();

        let mut group = TransferGroup::new();
        group.add(member_for(&backend, "/A"));
        group.add(member_for(&backend, "/B"));

        let err = group.write().unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn overlapping_members_can_still_be_read() {
        let backend = NumericAddressedBackend::new(
            MemoryDevice::new(),
            vec![
                NumericAddressedInfo::simple("/A", 0, 0, 1, 0, true, AccessClass::ReadWrite),
                NumericAddressedInfo::simple("/B", 0, 2, 1, 0, true, AccessClass::ReadWrite),
            ],
        );
        backend.open().unwrap();

        let mut group = TransferGroup::new();
        group.add(member_for(&backend, "/A"));
        group.add(member_for(&backend, "/B"));

        group.read().unwrap();
    }
}
