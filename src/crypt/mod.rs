//! LUKS2 encrypted volume handling.

pub mod device;

pub use device::CryptDevice;
