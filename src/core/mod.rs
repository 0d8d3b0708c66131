//! Core types: errors, configuration, path keys.

pub mod config;
pub mod errors;
pub mod paths;
