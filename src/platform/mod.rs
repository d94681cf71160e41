//! Platform abstraction layer: collaborator traits and their Linux implementations.

pub mod linux;
pub mod pal;
