//! The subdevice backend: a [`RawDevice`] that tunnels its reads and
//! writes through another, already-open backend's registers instead of
//! touching hardware directly.
//!
//! Three tunnelling modes, all driven from the host's own typed raw
//! accessors:
//! - **area**: the host exposes one large 1-D register; a sub-register
//!   at logical byte offset `o` is just that array's word at `o`.
//! - **register** (3- or 2-register): writing sub-register `r = v`
//!   writes the host's `address` register to `r`, then `data` to `v`;
//!   reading writes `address` then reads `data` back. If a `status`
//!   register is configured the device polls it to zero before
//!   proceeding; otherwise it sleeps a fixed interval instead (the
//!   "2-register" variant).

use std::fmt;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::accessor::NDRegisterAccessor;
use crate::backend::numeric_addressed::RawDevice;
use crate::backend::{get_register_accessor, SharedBackend};
use crate::catalogue::{AccessMode, AccessModeFlags};
use crate::error::{DeviceError, Result};
use crate::path::RegisterPath;

const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 1000;

/// How a subdevice's logical address space is tunnelled through its
/// host backend.
pub enum SubdeviceMode {
    Area {
        register: String,
    },
    Register {
        address: String,
        data: String,
        status: Option<String>,
        sleep: Duration,
    },
}

fn raw_accessor(
    host: &SharedBackend,
    path: &str,
) -> Result<Mutex<Box<dyn NDRegisterAccessor<i32>>>> {
    let mut flags = AccessModeFlags::new();
    flags.set(AccessMode::Raw);
    let accessor = get_register_accessor::<i32>(host.as_ref(), &RegisterPath::new(path), &flags)?;
    Ok(Mutex::new(accessor))
}

pub struct SubdeviceDevice {
    area: Option<Mutex<Box<dyn NDRegisterAccessor<i32>>>>,
    address: Option<Mutex<Box<dyn NDRegisterAccessor<i32>>>>,
    data: Option<Mutex<Box<dyn NDRegisterAccessor<i32>>>>,
    status: Option<Mutex<Box<dyn NDRegisterAccessor<i32>>>>,
    sleep: Duration,
    max_poll_attempts: u32,
}

impl fmt::Debug for SubdeviceDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubdeviceDevice")
            .field("area_mode", &self.area.is_some())
            .field("has_status", &self.status.is_some())
            .finish()
    }
}

impl SubdeviceDevice {
    pub fn new(host: &SharedBackend, mode: SubdeviceMode) -> Result<Self> {
        match mode {
            SubdeviceMode::Area { register } => Ok(SubdeviceDevice {
                area: Some(raw_accessor(host, &register)?),
                address: None,
                data: None,
                status: None,
                sleep: Duration::ZERO,
                max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            }),
            SubdeviceMode::Register {
                address,
                data,
                status,
                sleep,
            } => Ok(SubdeviceDevice {
                area: None,
                address: Some(raw_accessor(host, &address)?),
                data: Some(raw_accessor(host, &data)?),
                status: status.as_deref().map(|p| raw_accessor(host, p)).transpose()?,
                sleep,
                max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            }),
        }
    }

    fn wait_quiescent(&self) -> Result<()> {
        match &self.status {
            Some(status) => {
                let mut guard = status.lock();
                for _ in 0..self.max_poll_attempts {
                    guard.read()?;
                    if guard.channel(0)[0] == 0 {
                        return Ok(());
                    }
                    thread::sleep(self.sleep.max(Duration::from_micros(1)));
                }
                Err(DeviceError::runtime(
                    guard.register_path(),
                    "timed out waiting for subdevice status register to quiesce",
                ))
            }
            None => {
                thread::sleep(self.sleep);
                Ok(())
            }
        }
    }

    fn read_word(&self, word_index: i32) -> Result<i32> {
        let address = self
            .address
            .as_ref()
            .expect("read_word only called in register mode");
        let data = self.data.as_ref().expect("read_word only called in register mode");

        address.lock().channel_mut(0)[0] = word_index;
        address.lock().write()?;
        self.wait_quiescent()?;

        let mut data = data.lock();
        data.read()?;
        Ok(data.channel(0)[0])
    }

    fn write_word(&self, word_index: i32, value: i32) -> Result<()> {
        let address = self
            .address
            .as_ref()
            .expect("write_word only called in register mode");
        let data = self.data.as_ref().expect("write_word only called in register mode");

        address.lock().channel_mut(0)[0] = word_index;
        address.lock().write()?;
        data.lock().channel_mut(0)[0] = value;
        data.lock().write()?;
        self.wait_quiescent()
    }
}

impl RawDevice for SubdeviceDevice {
    fn read_block(&self, _bar: u8, byte_address: u64, byte_size: usize) -> Result<Vec<u8>> {
        if byte_size % 4 != 0 {
            return Err(DeviceError::logic(
                "subdevice",
                "subdevice transfers must be a whole number of 32-bit words",
            ));
        }
        let first_word = (byte_address / 4) as usize;
        let n_words = byte_size / 4;
        let mut bytes = Vec::with_capacity(byte_size);

        if let Some(area) = &self.area {
            let mut area = area.lock();
            area.read()?;
            for word in &area.channel(0)[first_word..first_word + n_words] {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        } else {
            for i in 0..n_words {
                let word = self.read_word((first_word + i) as i32)?;
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        Ok(bytes)
    }

    fn write_block(&self, _bar: u8, byte_address: u64, data: &[u8]) -> Result<()> {
        if data.len() % 4 != 0 {
            return Err(DeviceError::logic(
                "subdevice",
                "subdevice transfers must be a whole number of 32-bit words",
            ));
        }
        let first_word = (byte_address / 4) as usize;

        if let Some(area) = &self.area {
            let mut area = area.lock();
            area.read()?;
            for (i, chunk) in data.chunks_exact(4).enumerate() {
                let word = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                area.channel_mut(0)[first_word + i] = word;
            }
            area.write()?;
        } else {
            for (i, chunk) in data.chunks_exact(4).enumerate() {
                let word = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                self.write_word((first_word + i) as i32, word)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::dummy_backend;
    use crate::backend::numeric_addressed::{AccessClass, NumericAddressedInfo};
    use std::sync::Arc;

    fn host_with_registers() -> SharedBackend {
        let backend = dummy_backend(vec![
            NumericAddressedInfo::simple("/AREA", 0, 0x0, 16, 0, true, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/ADDRESS", 0, 0x100, 1, 0, true, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/DATA", 0, 0x104, 1, 0, true, AccessClass::ReadWrite),
            NumericAddressedInfo::simple("/STATUS", 0, 0x108, 1, 0, true, AccessClass::ReadOnly),
        ]);
        backend.open().unwrap();
        backend as SharedBackend
    }

    #[test]
    fn area_mode_round_trip() {
        let host = host_with_registers();
        let device = SubdeviceDevice::new(
            &host,
            SubdeviceMode::Area {
                register: "/AREA".to_string(),
            },
        )
        .unwrap();

        device.write_block(0, 4, &7i32.to_le_bytes()).unwrap();
        let bytes = device.read_block(0, 4, 4).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 7);
    }

    #[test]
    fn two_register_mode_round_trip_without_status() {
        let host = host_with_registers();
        let device = SubdeviceDevice::new(
            &host,
            SubdeviceMode::Register {
                address: "/ADDRESS".to_string(),
                data: "/DATA".to_string(),
                status: None,
                sleep: Duration::from_micros(10),
            },
        )
        .unwrap();

        device.write_block(0, 4 * 3, &99i32.to_le_bytes()).unwrap();
        let bytes = device.read_block(0, 4 * 3, 4).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 99);
    }

    #[test]
    fn three_register_mode_polls_status_register() {
        let host = host_with_registers();
        let device = SubdeviceDevice::new(
            &host,
            SubdeviceMode::Register {
                address: "/ADDRESS".to_string(),
                data: "/DATA".to_string(),
                status: Some("/STATUS".to_string()),
                sleep: Duration::from_micros(10),
            },
        )
        .unwrap();

        device.write_block(0, 4 * 5, &123i32.to_le_bytes()).unwrap();
        let bytes = device.read_block(0, 4 * 5, 4).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 123);
    }
}
