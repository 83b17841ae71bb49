//! The `Backend` contract every transport implements, and the shared
//! open/functional/faulted state machine.

pub mod dummy;
pub mod logical;
pub mod map_file;
pub mod numeric_addressed;
pub mod rebot;
pub mod shared_dummy;
pub mod subdevice;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalogue::{AccessModeFlags, RegisterCatalogue};
use crate::error::{DeviceError, Result};
use crate::path::RegisterPath;
use crate::types::{UserType, UserTypeTag};
use crate::accessor::NDRegisterAccessor;

/// `closed -> open -> functional <-> faulted`, per the exception
/// handling state machine every backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Closed,
    Functional,
    Faulted,
}

/// Shared bookkeeping for the open/functional/faulted state machine.
/// Concrete backends hold one of these and delegate `is_functional`,
/// `set_exception`, and state transitions to it, rather than each
/// reimplementing the same mutex-guarded state.
#[derive(Debug)]
pub struct BackendLifecycle {
    state: Mutex<BackendState>,
    last_exception: Mutex<Option<String>>,
}

impl Default for BackendLifecycle {
    fn default() -> Self {
        BackendLifecycle {
            state: Mutex::new(BackendState::Closed),
            last_exception: Mutex::new(None),
        }
    }
}

impl BackendLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn mark_open(&self) {
        *self.state.lock() = BackendState::Functional;
        *self.last_exception.lock() = None;
    }

    pub fn mark_closed(&self) {
        *self.state.lock() = BackendState::Closed;
    }

    pub fn is_functional(&self) -> bool {
        self.state() == BackendState::Functional
    }

    pub fn is_open(&self) -> bool {
        self.state() != BackendState::Closed
    }

    /// Moves `functional -> faulted`, recording the message. A no-op
    /// (idempotent) if already faulted.
    pub fn set_exception(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if *state != BackendState::Closed {
            *state = BackendState::Faulted;
        }
        *self.last_exception.lock() = Some(message.into());
    }

    pub fn last_exception(&self) -> Option<String> {
        self.last_exception.lock().clone()
    }

    /// Returns a runtime error if the backend is not open, or a cloned
    /// runtime error carrying the stored exception if faulted.
    pub fn check_functional(&self, path: &str) -> Result<()> {
        match self.state() {
            BackendState::Functional => Ok(()),
            BackendState::Faulted => Err(DeviceError::runtime(
                path,
                self.last_exception()
                    .unwrap_or_else(|| "backend is in the faulted state".to_string()),
            )),
            BackendState::Closed => Err(DeviceError::runtime(path, "backend is not open")),
        }
    }
}

/// The contract every transport (numeric-addressed hardware, the
/// dummy/shared-dummy test backends, rebot, the logical name mapping
/// backend, subdevices) implements.
///
/// Accessor construction is type-erased (`get_register_accessor_erased`)
/// because trait objects cannot carry a generic method; concrete
/// backends dispatch internally on [`UserTypeTag`] and callers go
/// through [`get_register_accessor`], which downcasts back to the
/// concrete `NDRegisterAccessor<T>` for the caller's `T`. This mirrors
/// the "tagged variant + dispatch table" rework of the source's
/// type-dispatched function templates.
pub trait Backend: fmt::Debug + Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn is_functional(&self) -> bool;
    fn set_exception(&self, message: &str);
    fn catalogue(&self) -> RegisterCatalogue;

    /// Walks the interrupt dispatcher tree and activates hardware
    /// delivery for every subscribed node, delivering each an initial
    /// value. A no-op for backends with no interrupt controller.
    fn activate_async_read(&self) -> Result<()> {
        Ok(())
    }

    fn get_register_accessor_erased(
        &self,
        path: &RegisterPath,
        flags: &AccessModeFlags,
    ) -> Result<TypeErasedAccessor>;
}

/// A `Box<dyn NDRegisterAccessor<T>>` for some `T`, boxed a second time
/// as `Any` so it can cross the non-generic [`Backend`] trait boundary.
pub type TypeErasedAccessor = Box<dyn Any + Send>;

pub fn erase_accessor<T: UserType>(accessor: Box<dyn NDRegisterAccessor<T>>) -> TypeErasedAccessor {
    Box::new(accessor)
}

/// Downcasts a backend's type-erased accessor back to the caller's
/// concrete user type.
pub fn get_register_accessor<T: UserType>(
    backend: &dyn Backend,
    path: &RegisterPath,
    flags: &AccessModeFlags,
) -> Result<Box<dyn NDRegisterAccessor<T>>> {
    let erased = backend.get_register_accessor_erased(path, flags)?;
    erased
        .downcast::<Box<dyn NDRegisterAccessor<T>>>()
        .map(|boxed| *boxed)
        .map_err(|_| {
            DeviceError::logic(
                path.to_canonical_string(),
                format!("register does not support user type {}", T::TAG),
            )
        })
}

/// A reference-counted, shared handle to an open backend. Accessors
/// keep their backend alive for at least as long as they exist by
/// holding a clone of this handle (strong ownership from accessor to
/// backend; the reverse link, used by the async dispatcher, is a weak
/// reference, see [`crate::async_dispatch`]).
pub type SharedBackend = Arc<dyn Backend>;

/// Dispatches `get_register_accessor_erased` for any of the fixed set
/// of user types by calling a generic closure, matching the "pair
/// (TypeTag, fn)" dispatch table called out in the design notes. Each
/// backend's `build<T>` constructor is generic, and this macro is how
/// it is exposed as the single non-generic trait method.
#[macro_export]
macro_rules! dispatch_user_type {
    ($tag:expr, $path:expr, |$t:ident| $body:expr) => {
        match $tag {
            $crate::types::UserTypeTag::Int8 => {
                type $t = i8;
                $body
            }
            $crate::types::UserTypeTag::Int16 => {
                type $t = i16;
                $body
            }
            $crate::types::UserTypeTag::Int32 => {
                type $t = i32;
                $body
            }
            $crate::types::UserTypeTag::Int64 => {
                type $t = i64;
                $body
            }
            $crate::types::UserTypeTag::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::types::UserTypeTag::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::types::UserTypeTag::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::types::UserTypeTag::UInt64 => {
                type $t = u64;
                $body
            }
            $crate::types::UserTypeTag::Float32 => {
                type $t = f32;
                $body
            }
            $crate::types::UserTypeTag::Float64 => {
                type $t = f64;
                $body
            }
            $crate::types::UserTypeTag::Str => {
                type $t = String;
                $body
            }
            $crate::types::UserTypeTag::Boolean => {
                type $t = bool;
                $body
            }
            $crate::types::UserTypeTag::Void => {
                type $t = ();
                $body
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let lc = BackendLifecycle::new();
        assert_eq!(lc.state(), BackendState::Closed);
        assert!(!lc.is_functional());

        lc.mark_open();
        assert!(lc.is_functional());
        assert!(lc.check_functional("/x").is_ok());

        lc.set_exception("boom");
        assert!(!lc.is_functional());
        let err = lc.check_functional("/x").unwrap_err();
        assert!(err.is_runtime());
        assert_eq!(err.message(), "boom");

        lc.mark_open();
        assert!(lc.is_functional());
    }
}
