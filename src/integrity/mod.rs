//! Checksum database and the checker that maintains it.

pub mod checker;
pub mod checksum;
pub mod database;
pub mod key;
pub mod walk;
