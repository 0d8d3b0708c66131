//! Daemon subsystem: per-root checker supervision and signal handling.

pub mod signals;
pub mod supervisor;
