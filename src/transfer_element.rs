//! The five-phase transfer contract shared by every accessor, and the
//! bookkeeping needed to merge and identify transfer elements.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::error::DeviceError;
use crate::validity::DataValidity;
use crate::version::VersionNumber;

/// Distinguishes a read transfer from a write transfer in the phase
/// calls that are shared between both (`pre_read`/`pre_write` are
/// separate methods, but decorators forwarding to a target sometimes
/// need to know which phase is in flight without threading a second
/// parameter through every call site).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Read,
    Write,
}

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity for a transfer element, used by the
/// transfer group to partition members into merge-equivalence classes
/// and by the async dispatcher to key per-subscriber queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferElementId(u64);

impl TransferElementId {
    pub fn new() -> Self {
        TransferElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TransferElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The object-safe base of every transfer element: the five-phase
/// protocol plus identity, replaceability, and the exception/validity
/// bookkeeping the contract requires.
///
/// `pre_read`/`pre_write` are called exactly once per transfer and must
/// be idempotent if the transfer is later abandoned (the companion
/// `post_*` is still invoked with `has_new_data = false`). `read_transfer`
/// performs the blocking I/O. `write_transfer` returns whether data was
/// lost (queue overflow for writable async queues). If a lower layer
/// raises a runtime error during a `*_transfer` call, it is stored via
/// [`TransferElementBase::set_exception`] and the `post_*` call still
/// happens and re-raises after validity has been propagated.
pub trait TransferElementBase: fmt::Debug + Send {
    fn id(&self) -> TransferElementId;

    /// Human-readable path of the register this element ultimately
    /// belongs to, used in error messages.
    fn register_path(&self) -> String;

    fn pre_read(&mut self, kind: TransferKind) -> Result<()>;

    /// Performs the blocking I/O. For an async element this waits on
    /// the per-subscriber queue.
    fn read_transfer(&mut self) -> Result<()>;

    fn post_read(&mut self, kind: TransferKind, has_new_data: bool) -> Result<()>;

    fn pre_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()>;

    /// Performs the blocking I/O for a write. Returns `true` iff data
    /// was lost (only meaningful for writable async queues).
    fn write_transfer(&mut self, version: VersionNumber) -> Result<bool>;

    fn post_write(&mut self, kind: TransferKind, version: VersionNumber) -> Result<()>;

    /// True iff `self` and `other` would produce byte-identical
    /// transfers against the same backend. Reflexive and symmetric;
    /// used by the transfer group to deduplicate hardware-accessing
    /// elements. The default implementation compares identity only,
    /// which is always a safe (if conservative) answer.
    fn may_replace_other(&self, other: &dyn TransferElementBase) -> bool {
        self.id() == other.id()
    }

    /// The leaves of this element's decorator chain: typically a
    /// single low-level element, but a multi-input plugin (e.g. `math`)
    /// reports every hardware-accessing element it ultimately reads.
    fn hardware_accessing_elements(&self) -> Vec<TransferElementId> {
        vec![self.id()]
    }

    /// Records a pending exception to be re-raised by the next `post_*`
    /// call, and marks the element's validity faulty.
    fn set_exception(&mut self, error: DeviceError);

    fn get_version_number(&self) -> VersionNumber;

    fn get_validity(&self) -> DataValidity;

    fn is_readable(&self) -> bool;

    fn is_writeable(&self) -> bool;

    fn supports_wait_for_new_data(&self) -> bool {
        false
    }

    /// Poisons a blocking `read_transfer` with a runtime error,
    /// matching the per-accessor `interrupt()` cancellation contract.
    fn interrupt(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = TransferElementId::new();
        let b = TransferElementId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
