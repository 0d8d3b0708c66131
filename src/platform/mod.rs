//! Platform-specific handling of the database file's protective attributes.

pub mod attributes;
