//! Signal handling for the sampling daemon.
//!
//! SIGTERM/SIGINT request shutdown, SIGHUP a config reload, SIGUSR1 an
//! immediate sample. The loop polls these flags between sleeps instead of
//! blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};

/// Flags shared between signal hooks and the sampling loop.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
    sample_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create the flags and register OS hooks. Registration failures are logged, not fatal.
    #[must_use]
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Flags that only change through the `request_*` methods.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
            sample_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_sample(&self) -> bool {
        self.sample_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_sample(&self) {
        self.sample_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        let hooks = [
            (SIGTERM, "SIGTERM", &self.shutdown_flag),
            (SIGINT, "SIGINT", &self.shutdown_flag),
            (SIGHUP, "SIGHUP", &self.reload_flag),
            (SIGUSR1, "SIGUSR1", &self.sample_flag),
        ];
        for (signal, name, flag) in hooks {
            if let Err(err) = signal_hook::flag::register(signal, Arc::clone(flag)) {
                tracing::warn!(signal = name, error = %err, "failed to register signal hook");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_and_sample_flags_clear_on_read() {
        let handler = SignalHandler::unregistered();
        assert!(!handler.should_reload());
        handler.request_reload();
        handler.request_sample();
        assert!(handler.should_reload());
        assert!(!handler.should_reload());
        assert!(handler.should_sample());
        assert!(!handler.should_sample());
    }

    #[test]
    fn shutdown_is_sticky_and_shared_across_clones() {
        let handler = SignalHandler::unregistered();
        let clone = handler.clone();
        clone.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }
}
