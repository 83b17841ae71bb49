//! Globally monotone version tokens.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// A totally-ordered token stamping every user-visible update.
///
/// `VersionNumber::default()` (equivalently [`VersionNumber::null`]) is
/// the distinguished value meaning "no data has ever been seen"; it
/// compares less than every version minted by [`VersionNumber::new`].
/// The generator is a process-wide, contention-free atomic counter, as
/// required by the concurrency model: minting a version is a single
/// `fetch_add` on the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionNumber(u64);

impl VersionNumber {
    /// The distinguished "no data ever seen" value.
    pub const fn null() -> Self {
        VersionNumber(0)
    }

    /// Mints a fresh, strictly-greater-than-every-previous-version token.
    pub fn new() -> Self {
        VersionNumber(NEXT_VERSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_least() {
        let v = VersionNumber::new();
        assert!(VersionNumber::null() < v);
        assert!(VersionNumber::null().is_null());
        assert!(!v.is_null());
    }

    #[test]
    fn monotonically_increasing() {
        let a = VersionNumber::new();
        let b = VersionNumber::new();
        assert!(a < b);
    }

    #[test]
    fn thread_safe_fast_path() {
        use std::thread;
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(VersionNumber::new))
            .collect();
        let mut versions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort();
        versions.dedup();
        assert_eq!(versions.len(), 8);
    }
}
