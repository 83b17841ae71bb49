//! The in-process dummy backend: a [`NumericAddressedBackend`] over a
//! plain `Vec<u8>`-backed [`RawDevice`], used for tests and for
//! developing against a mapping document with no real hardware.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::numeric_addressed::{
    AccessClass, NumericAddressedBackend, NumericAddressedInfo, RawDevice,
};
use crate::error::{DeviceError, Result};

/// A growable, zero-initialized byte array per BAR, guarded by a single
/// lock. Every access serializes through it, matching the "one buffer
/// lock, no per-register locking" concurrency model a software-only
/// backend can get away with.
#[derive(Debug, Default)]
pub struct DummyDevice {
    bars: Mutex<BTreeMap<u8, Vec<u8>>>,
    fail_next_read: Mutex<bool>,
    fail_next_write: Mutex<bool>,
}

impl DummyDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test/demo hook: makes the next read fail with a runtime error,
    /// exercising `setException` propagation without real hardware.
    pub fn inject_read_failure(&self) {
        *self.fail_next_read.lock() = true;
    }

    pub fn inject_write_failure(&self) {
        *self.fail_next_write.lock() = true;
    }

    fn ensure_len(bars: &mut BTreeMap<u8, Vec<u8>>, bar: u8, len: usize) -> &mut Vec<u8> {
        let buf = bars.entry(bar).or_default();
        if buf.len() < len {
            buf.resize(len, 0);
        }
        buf
    }
}

impl RawDevice for DummyDevice {
    fn read_block(&self, bar: u8, byte_address: u64, byte_size: usize) -> Result<Vec<u8>> {
        let mut fail = self.fail_next_read.lock();
        if *fail {
            *fail = false;
            return Err(DeviceError::runtime("/dummy", "injected read failure"));
        }
        drop(fail);
        let mut bars = self.bars.lock();
        let start = byte_address as usize;
        let buf = Self::ensure_len(&mut bars, bar, start + byte_size);
        Ok(buf[start..start + byte_size].to_vec())
    }

    fn write_block(&self, bar: u8, byte_address: u64, data: &[u8]) -> Result<()> {
        let mut fail = self.fail_next_write.lock();
        if *fail {
            *fail = false;
            return Err(DeviceError::runtime("/dummy", "injected write failure"));
        }
        drop(fail);
        let mut bars = self.bars.lock();
        let start = byte_address as usize;
        let buf = Self::ensure_len(&mut bars, bar, start + data.len());
        buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Builds a dummy backend from an explicit register list, as used by
/// tests that don't need a full map-file.
pub fn dummy_backend(registers: Vec<NumericAddressedInfo>) -> Arc<NumericAddressedBackend> {
    NumericAddressedBackend::new(DummyDevice::new(), registers)
}

/// Seeds a freshly-opened dummy backend so that read-only registers
/// return a predictable, non-zero value instead of all-zero memory,
/// mirroring the source's "initial values come from the map file's
/// fourth column" convention for constant-ish read-only registers.
pub fn seed_constant(backend: &NumericAddressedBackend, path: &str, raw_word: i32) -> Result<()> {
    let info = backend
        .register_info(&crate::path::RegisterPath::new(path))
        .ok_or_else(|| DeviceError::logic(path, "unknown register"))?
        .clone();
    if info.access_class == AccessClass::WriteOnly {
        return Err(DeviceError::logic(path, "cannot seed a write-only register"));
    }
    backend
        .device()
        .write_block(info.bar, info.byte_address, &raw_word.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::NDRegisterAccessor;
    use crate::backend::numeric_addressed::get_typed_accessor;
    use crate::catalogue::AccessModeFlags;
    use crate::path::RegisterPath;

    #[test]
    fn seeded_value_is_readable() {
        let backend = dummy_backend(vec![NumericAddressedInfo::simple(
            "/BOARD/TEMPERATURE",
            0,
            0x100,
            1,
            0,
            true,
            AccessClass::ReadOnly,
        )]);
        backend.open().unwrap();
        seed_constant(&backend, "/BOARD/TEMPERATURE", 21).unwrap();

        let path = RegisterPath::new("/BOARD/TEMPERATURE");
        let mut acc = get_typed_accessor::<i32>(&backend, &path, &AccessModeFlags::new()).unwrap();
        acc.read().unwrap();
        assert_eq!(acc.channel(0)[0], 21);
    }

    #[test]
    fn write_only_rejects_seeding() {
        let backend = dummy_backend(vec![NumericAddressedInfo::simple(
            "/BOARD/TRIGGER",
            0,
            0x200,
            1,
            0,
            false,
            AccessClass::WriteOnly,
        )]);
        backend.open().unwrap();
        assert!(seed_constant(&backend, "/BOARD/TRIGGER", 1).is_err());
    }

    #[test]
    fn injected_read_failure_faults_the_backend_until_reopened() {
        let device = DummyDevice::new();
        let backend = NumericAddressedBackend::new(
            device.clone(),
            vec![NumericAddressedInfo::simple(
                "/BOARD/X", 0, 0x300, 1, 0, true, AccessClass::ReadWrite,
            )],
        );
        backend.open().unwrap();

        let path = RegisterPath::new("/BOARD/X");
        let mut acc = get_typed_accessor::<i32>(&backend, &path, &AccessModeFlags::new()).unwrap();
        device.inject_read_failure();
        let err = acc.read().unwrap_err();
        assert!(err.is_runtime());

        // The injected failure was one-shot, but the backend itself is now
        // faulted: a second read fails too, with no further injection.
        assert!(!backend.is_functional());
        let err = acc.read().unwrap_err();
        assert!(err.is_runtime());

        backend.open().unwrap();
        assert!(backend.is_functional());
        acc.read().unwrap();
    }
}
