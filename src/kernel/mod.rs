//! Linux kernel primitive wrappers.
//!
//! Thin wrappers around the kernel interfaces the starter needs. All
//! `unsafe` ioctl and signal plumbing is concentrated here with the
//! preconditions stated at each call site.

pub mod loopdev;
pub mod mount;
pub mod namespace;
pub mod signal;
