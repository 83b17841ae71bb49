//! Data-consistency groups: deciding whether several independently-read
//! accessors currently agree on having observed "the same moment" of
//! the underlying process.
//!
//! A consistency group does not own its members' I/O the way
//! [`crate::transfer_group::TransferGroup`] does: the caller keeps its
//! own accessor handles and reads them through whatever schedule it
//! likes, sharing each one with the group as an `Arc<Mutex<_>>` so the
//! group can inspect its version and buffer after a read without
//! forcing the caller to give up ownership. After reading a member, the
//! caller reports it via `update(id)`.
//!
//! Two strategies:
//! - **exact**: consistent iff every member's most recently reported
//!   version is the same (and not the null version). Simple, but a
//!   member that updates faster than the others can never line up.
//! - **historized**: each member keeps a bounded ring of its last few
//!   `(version, values)` pairs; consistent iff some version appears in
//!   every ring, in which case every member's accessor buffer is
//!   rewound to that version's values and older ring entries are
//!   discarded. Tolerant of members updating at different rates, at the
//!   cost of a ring per member.
//!
//! Members are type-erased the same way [`crate::transfer_group`] erases
//! its [`crate::transfer_group::GroupMember`]s: a per-accessor adapter
//! implements a small object-safe trait, here carrying snapshots as
//! [`UserValue`] vectors rather than the `T` the concrete accessor is
//! typed over.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accessor::NDRegisterAccessor;
use crate::error::{DeviceError, Result};
use crate::transfer_element::TransferElementId;
use crate::types::{UserType, UserValue};
use crate::version::VersionNumber;

const DEFAULT_HISTORY_DEPTH: usize = 16;

/// A member accessor shared between its owner and a consistency group.
pub type SharedAccessor<T> = Arc<Mutex<Box<dyn NDRegisterAccessor<T>>>>;

/// Object-safe adapter over one shared member accessor, erasing its user
/// type behind [`UserValue`] snapshots.
pub trait ConsistencyMember: fmt::Debug + Send {
    fn id(&self) -> TransferElementId;
    fn version(&self) -> VersionNumber;
    fn is_faulty(&self) -> bool;
    fn snapshot(&self) -> Vec<UserValue>;
    fn restore(&self, values: &[UserValue]) -> Result<()>;
    fn path(&self) -> String;
}

struct AccessorMember<T: UserType> {
    accessor: SharedAccessor<T>,
}

impl<T: UserType> fmt::Debug for AccessorMember<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorMember").field("path", &self.accessor.lock().register_path()).finish()
    }
}

impl<T: UserType> ConsistencyMember for AccessorMember<T> {
    fn id(&self) -> TransferElementId {
        self.accessor.lock().id()
    }

    fn version(&self) -> VersionNumber {
        self.accessor.lock().get_version_number()
    }

    fn is_faulty(&self) -> bool {
        matches!(self.accessor.lock().get_validity(), crate::validity::DataValidity::Faulty)
    }

    fn snapshot(&self) -> Vec<UserValue> {
        let accessor = self.accessor.lock();
        (0..accessor.n_channels())
            .flat_map(|c| accessor.channel(c).iter().map(UserType::to_user_value).collect::<Vec<_>>())
            .collect()
    }

    fn restore(&self, values: &[UserValue]) -> Result<()> {
        let mut accessor = self.accessor.lock();
        let path = accessor.register_path();
        let per_channel = accessor.n_elements_per_channel();
        for c in 0..accessor.n_channels() {
            let slice = &values[c * per_channel..(c + 1) * per_channel];
            for (dst, src) in accessor.channel_mut(c).iter_mut().zip(slice) {
                *dst = T::from_user_value(src, &path)?;
            }
        }
        Ok(())
    }

    fn path(&self) -> String {
        self.accessor.lock().register_path()
    }
}

/// Wraps a shared typed accessor as a [`ConsistencyMember`].
pub fn wrap_member<T: UserType>(accessor: SharedAccessor<T>) -> Box<dyn ConsistencyMember> {
    Box::new(AccessorMember { accessor })
}

fn find_member<'a>(
    members: &'a [Box<dyn ConsistencyMember>],
    id: TransferElementId,
) -> Result<&'a dyn ConsistencyMember> {
    members
        .iter()
        .find(|m| m.id() == id)
        .map(|m| m.as_ref())
        .ok_or_else(|| DeviceError::logic("consistency-group", "update() called for an id that is not a member"))
}

/// Exact-match consistency: all members must report the identical,
/// non-null version at the same time. With fewer than two members the
/// notion is vacuous; such a group is never reported consistent.
#[derive(Debug, Default)]
pub struct ExactConsistencyGroup {
    members: Vec<Box<dyn ConsistencyMember>>,
    last_seen: HashMap<TransferElementId, VersionNumber>,
}

impl ExactConsistencyGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, member: Box<dyn ConsistencyMember>) {
        self.members.push(member);
    }

    /// Reports that `id`'s accessor was just read. Returns whether every
    /// member now agrees on the same version. A faulty member's
    /// exception surfaces here and leaves the group's state unchanged.
    pub fn update(&mut self, id: TransferElementId) -> Result<bool> {
        let member = find_member(&self.members, id)?;
        if member.is_faulty() {
            return Err(DeviceError::runtime(member.path(), "consistency group member is faulty"));
        }
        self.last_seen.insert(id, member.version());
        Ok(self.is_consistent())
    }

    fn is_consistent(&self) -> bool {
        if self.members.len() < 2 || self.last_seen.len() != self.members.len() {
            return false;
        }
        let mut versions = self.last_seen.values();
        match versions.next() {
            Some(first) if !first.is_null() => versions.all(|v| v == first),
            _ => false,
        }
    }
}

/// Historized consistency: each member keeps a bounded ring of its last
/// few `(version, values)` pairs; consistent iff some version is common
/// to every ring, in which case every member is rewound to it. With
/// fewer than two members the notion is vacuous; such a group is never
/// reported consistent.
#[derive(Debug)]
pub struct HistorizedConsistencyGroup {
    members: Vec<Box<dyn ConsistencyMember>>,
    rings: HashMap<TransferElementId, VecDeque<(VersionNumber, Vec<UserValue>)>>,
    depth: usize,
}

impl HistorizedConsistencyGroup {
    pub fn new(depth: usize) -> Self {
        HistorizedConsistencyGroup {
            members: Vec::new(),
            rings: HashMap::new(),
            depth: depth.max(2),
        }
    }

    pub fn add(&mut self, member: Box<dyn ConsistencyMember>) {
        self.rings.insert(member.id(), VecDeque::with_capacity(self.depth));
        self.members.push(member);
    }

    /// Reports that `id`'s accessor was just read, pushing its current
    /// version and values onto that member's ring. Returns whether a
    /// version common to every member's ring now exists; if so, every
    /// member's accessor buffer is rewound to that version's values and
    /// older ring entries are discarded.
    pub fn update(&mut self, id: TransferElementId) -> Result<bool> {
        {
            let member = find_member(&self.members, id)?;
            if member.is_faulty() {
                return Err(DeviceError::runtime(member.path(), "consistency group member is faulty"));
            }
            let version = member.version();
            let values = member.snapshot();
            let ring = self.rings.get_mut(&id).expect("ring created alongside member in add()");
            if ring.len() == self.depth {
                ring.pop_front();
            }
            ring.push_back((version, values));
        }

        if self.members.len() < 2 {
            return Ok(false);
        }

        match self.common_version() {
            Some(v) => {
                self.rewind_to(v)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The newest version present in every member's ring, if any.
    fn common_version(&self) -> Option<VersionNumber> {
        let mut rings = self.rings.values();
        let first = rings.next()?;
        let mut common: Vec<VersionNumber> = first.iter().map(|(v, _)| *v).filter(|v| !v.is_null()).collect();
        for ring in rings {
            let present: std::collections::HashSet<VersionNumber> = ring.iter().map(|(v, _)| *v).collect();
            common.retain(|v| present.contains(v));
            if common.is_empty() {
                return None;
            }
        }
        common.into_iter().max()
    }

    fn rewind_to(&mut self, version: VersionNumber) -> Result<()> {
        for member in &self.members {
            let id = member.id();
            let ring = self.rings.get_mut(&id).expect("ring created alongside member in add()");
            let values = ring
                .iter()
                .find(|(v, _)| *v == version)
                .map(|(_, values)| values.clone())
                .ok_or_else(|| DeviceError::logic(member.path(), "common version vanished from ring"))?;
            member.restore(&values)?;
            ring.retain(|(v, _)| *v >= version);
        }
        Ok(())
    }
}

impl Default for HistorizedConsistencyGroup {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}
