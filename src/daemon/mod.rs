//! Daemon subsystem: the sampling cycle, its scheduler and signal handling,
//! user actions, and alert notifications.

pub mod actions;
pub mod cycle;
#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod notifications;
#[cfg(feature = "daemon")]
pub mod signals;
