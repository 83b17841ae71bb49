//! `Device`: the user-facing handle wrapping an open [`Backend`] by
//! alias, and the typed accessor getters built on top of it.

use std::sync::Mutex;

use crate::accessor::{OneDRegisterAccessor, ScalarRegisterAccessor, TwoDRegisterAccessor, VoidRegisterAccessor};
use crate::backend::{get_register_accessor, SharedBackend};
use crate::catalogue::{AccessModeFlags, RegisterCatalogue};
use crate::error::{DeviceError, Result};
use crate::factory::{self, DeviceMap};
use crate::path::RegisterPath;
use crate::types::UserType;

/// A handle obtained by alias, wrapping a shared [`SharedBackend`]
/// reference. `open(alias)` resolves the alias through a `DeviceMap` to
/// a descriptor string, builds (or reuses) the backend for it, and
/// remembers the alias so a later bare `open()` can reopen it.
pub struct Device {
    device_map: DeviceMap,
    backend: Mutex<Option<SharedBackend>>,
    last_alias: Mutex<Option<String>>,
}

impl Device {
    pub fn new(device_map: DeviceMap) -> Self {
        Device {
            device_map,
            backend: Mutex::new(None),
            last_alias: Mutex::new(None),
        }
    }

    /// Resolves `alias` through the device map and opens its backend.
    pub fn open(&self, alias: &str) -> Result<()> {
        let backend = factory::create_backend_for_alias(alias, &self.device_map)?;
        *self.backend.lock().unwrap() = Some(backend);
        *self.last_alias.lock().unwrap() = Some(alias.to_string());
        Ok(())
    }

    /// Reopens the alias passed to the most recent `open(alias)` call.
    pub fn reopen(&self) -> Result<()> {
        let alias = self
            .last_alias
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DeviceError::logic("device", "no alias has been opened yet"))?;
        self.open(&alias)
    }

    pub fn close(&self) -> Result<()> {
        if let Some(backend) = self.backend.lock().unwrap().take() {
            backend.close()?;
        }
        Ok(())
    }

    pub fn is_opened(&self) -> bool {
        self.backend.lock().unwrap().is_some()
    }

    pub fn is_functional(&self) -> bool {
        self.backend
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.is_functional())
            .unwrap_or(false)
    }

    pub fn catalogue(&self) -> Result<RegisterCatalogue> {
        Ok(self.backend()?.catalogue())
    }

    /// Walks the backend's interrupt-controller tree, writes the enable
    /// mask for every subscribed line, and delivers the current value
    /// once as an initial push. Must be called after `open()` and again
    /// after any reopen before async accessors can receive new pushes.
    pub fn activate_async_read(&self) -> Result<()> {
        self.backend()?.activate_async_read()
    }

    fn backend(&self) -> Result<SharedBackend> {
        self.backend
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DeviceError::logic("device", "device is not open"))
    }

    fn typed_accessor<T: UserType>(&self, path: &str, flags: &AccessModeFlags) -> Result<Box<dyn crate::accessor::NDRegisterAccessor<T>>> {
        let backend = self.backend()?;
        get_register_accessor::<T>(backend.as_ref(), &RegisterPath::new(path), flags)
    }

    pub fn get_scalar_register_accessor<T: UserType>(
        &self,
        path: &str,
        flags: &AccessModeFlags,
    ) -> Result<ScalarRegisterAccessor<T>> {
        ScalarRegisterAccessor::new(self.typed_accessor::<T>(path, flags)?)
    }

    pub fn get_one_d_register_accessor<T: UserType>(
        &self,
        path: &str,
        flags: &AccessModeFlags,
    ) -> Result<OneDRegisterAccessor<T>> {
        OneDRegisterAccessor::new(self.typed_accessor::<T>(path, flags)?)
    }

    pub fn get_two_d_register_accessor<T: UserType>(
        &self,
        path: &str,
        flags: &AccessModeFlags,
    ) -> Result<TwoDRegisterAccessor<T>> {
        Ok(TwoDRegisterAccessor::new(self.typed_accessor::<T>(path, flags)?))
    }

    pub fn get_void_register_accessor(&self, path: &str, flags: &AccessModeFlags) -> Result<VoidRegisterAccessor> {
        Ok(VoidRegisterAccessor::new(self.typed_accessor::<()>(path, flags)?))
    }

    /// Convenience one-shot read: opens a scalar accessor, reads once,
    /// and discards it. Inefficient compared to keeping the accessor
    /// around across repeated reads — prefer `get_scalar_register_accessor`
    /// for anything called more than once.
    pub fn read_scalar<T: UserType>(&self, path: &str) -> Result<T> {
        let mut accessor = self.get_scalar_register_accessor::<T>(path, &AccessModeFlags::new())?;
        accessor.read()?;
        Ok(accessor.get().clone())
    }

    /// Convenience one-shot write: opens a scalar accessor and writes
    /// once. See [`Device::read_scalar`] for the same efficiency caveat.
    pub fn write_scalar<T: UserType>(&self, path: &str, value: T) -> Result<()> {
        let mut accessor = self.get_scalar_register_accessor::<T>(path, &AccessModeFlags::new())?;
        accessor.write_value(value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dummy_map(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("test.map");
        std::fs::write(&path, "VOLTAGE 1 0 4 0 32 8 1 RW\n").unwrap();
        path
    }

    #[test]
    fn open_unknown_alias_is_a_logic_error() {
        let device = Device::new(DeviceMap::new());
        let err = device.open("missing").unwrap_err();
        assert!(err.is_logic());
        assert!(!device.is_opened());
    }

    #[test]
    fn reopen_without_a_prior_open_is_a_logic_error() {
        let device = Device::new(DeviceMap::new());
        let err = device.reopen().unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn accessor_getter_before_open_is_a_logic_error() {
        let device = Device::new(DeviceMap::new());
        let err = device
            .get_scalar_register_accessor::<i32>("/VOLTAGE", &AccessModeFlags::new())
            .unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn opens_a_dummy_alias_and_round_trips_a_scalar_register() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = write_dummy_map(dir.path());
        let mut device_map = DeviceMap::new();
        device_map.register("board", format!("(dummy?map={})", map_path.to_string_lossy()), None);
        let device = Device::new(device_map);

        device.open("board").unwrap();
        assert!(device.is_opened());
        assert!(device.is_functional());

        device.write_scalar::<f64>("/VOLTAGE", 3.5).unwrap();
        let value: f64 = device.read_scalar("/VOLTAGE").unwrap();
        assert!((value - 3.5).abs() < 1e-6);

        device.close().unwrap();
        assert!(!device.is_opened());

        device.reopen().unwrap();
        assert!(device.is_opened());
    }

    #[test]
    fn catalogue_lists_the_registers_declared_in_the_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = write_dummy_map(dir.path());
        let mut device_map = DeviceMap::new();
        device_map.register("board", format!("(dummy?map={})", map_path.to_string_lossy()), None);
        let device = Device::new(device_map);
        device.open("board").unwrap();

        let catalogue = device.catalogue().unwrap();
        assert!(catalogue.contains(&RegisterPath::new("VOLTAGE")));
    }
}
