//! The shared-dummy backend: several backend handles within the same
//! process can open the same named instance and observe each other's
//! writes, standing in for the shared-memory-segment placement real
//! hardware-adjacent dummy backends use. Real cross-process shared
//! memory is an external collaborator outside this library's scope;
//! this backend models the same semantics (several open handles, one
//! underlying buffer) process-wide instead of via `shm_open`.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::backend::numeric_addressed::{NumericAddressedBackend, NumericAddressedInfo, RawDevice};
use crate::error::Result;

fn registry() -> &'static Mutex<BTreeMap<String, Arc<SharedDummyDevice>>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, Arc<SharedDummyDevice>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

#[derive(Debug, Default)]
pub struct SharedDummyDevice {
    bars: Mutex<BTreeMap<u8, Vec<u8>>>,
}

impl SharedDummyDevice {
    /// Returns the process-wide instance named `name`, creating it
    /// (zero-initialized) on first use.
    pub fn named(name: &str) -> Arc<Self> {
        registry()
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(SharedDummyDevice::default()))
            .clone()
    }

    fn ensure_len(bars: &mut BTreeMap<u8, Vec<u8>>, bar: u8, len: usize) -> &mut Vec<u8> {
        let buf = bars.entry(bar).or_default();
        if buf.len() < len {
            buf.resize(len, 0);
        }
        buf
    }
}

impl RawDevice for SharedDummyDevice {
    fn read_block(&self, bar: u8, byte_address: u64, byte_size: usize) -> Result<Vec<u8>> {
        let mut bars = self.bars.lock();
        let start = byte_address as usize;
        let buf = Self::ensure_len(&mut bars, bar, start + byte_size);
        Ok(buf[start..start + byte_size].to_vec())
    }

    fn write_block(&self, bar: u8, byte_address: u64, data: &[u8]) -> Result<()> {
        let mut bars = self.bars.lock();
        let start = byte_address as usize;
        let buf = Self::ensure_len(&mut bars, bar, start + data.len());
        buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Opens a named shared-dummy backend over the given catalogue. Two
/// calls with the same `name` (even with different catalogues) observe
/// the same underlying bytes.
pub fn shared_dummy_backend(
    name: &str,
    registers: Vec<NumericAddressedInfo>,
) -> Arc<NumericAddressedBackend> {
    NumericAddressedBackend::new(SharedDummyDevice::named(name), registers)
}

/// Drops the named instance from the process-wide registry, so a later
/// `shared_dummy_backend` call with the same name starts fresh. Mainly
/// useful between independent test cases that reuse the same name.
pub fn forget_named(name: &str) {
    registry().lock().remove(name);
}
