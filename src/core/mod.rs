//! Core types: errors, configuration, uid arithmetic.

pub mod config;
pub mod errors;
pub mod uid;
