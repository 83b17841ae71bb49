//! A register-oriented device access library: strongly-typed, backend-
//! agnostic read/write access to hardware and software registers behind
//! a uniform five-phase transfer contract.
//!
//! [`backend`] holds the concrete transports (numeric-addressed memory,
//! the dummy/shared-dummy in-process backends, rebot over TCP, logical
//! name mapping, subdevices). [`accessor`] and [`transfer_element`] hold
//! the typed accessor facades and the phase contract they all share.
//! [`device`] is the user-facing entry point that resolves a CDD alias
//! to a backend and hands out accessors.

pub mod accessor;
pub mod async_dispatch;
pub mod backend;
pub mod bitops;
pub mod buffer;
pub mod catalogue;
pub mod consistency_group;
pub mod conversion;
pub mod device;
pub mod error;
pub mod factory;
pub mod path;
pub mod transfer_element;
pub mod transfer_group;
pub mod types;
pub mod validity;
pub mod version;

pub use error::{DeviceError, Result};
pub use path::RegisterPath;
pub use version::VersionNumber;
