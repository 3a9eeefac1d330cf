//! Cross-cutting utilities: user identity, main-thread dispatch, and
//! checked integer casts.

pub mod cast;
pub mod mainthread;
pub mod user;
