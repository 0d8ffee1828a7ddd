//! Privacy override gate.
//!
//! Mirrors the reference implementation's `StreamSwitcher::setPrivacyMode`:
//! a single external boolean that forces fallback immediately and blocks a
//! return to the primary source until cleared. Implemented as two atomics so
//! an external collaborator (an HTTP handler, a test) can flip it without
//! touching the orchestrator's lock.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Which source the orchestrator is currently favoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalSource {
    Primary,
    Fallback,
}

impl From<u8> for LogicalSource {
    fn from(v: u8) -> Self {
        if v == 0 {
            LogicalSource::Primary
        } else {
            LogicalSource::Fallback
        }
    }
}

impl From<LogicalSource> for u8 {
    fn from(s: LogicalSource) -> u8 {
        match s {
            LogicalSource::Primary => 0,
            LogicalSource::Fallback => 1,
        }
    }
}

/// Lock-free flag pair consulted by the orchestrator at every switch
/// decision. `privacy_on` forces fallback and blocks `tryReturnToLive`-style
/// logic; `selected_source` records the last decision for observers.
#[derive(Debug, Default)]
pub struct PrivacyGate {
    privacy_on: AtomicBool,
    selected_source: AtomicU8,
}

impl PrivacyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_privacy_on(&self) -> bool {
        self.privacy_on.load(Ordering::Acquire)
    }

    /// Enables or disables the override. Returns whether the value actually
    /// changed, so a caller can log a transition instead of every poll.
    pub fn set_privacy(&self, enabled: bool) -> bool {
        self.privacy_on.swap(enabled, Ordering::AcqRel) != enabled
    }

    pub fn selected_source(&self) -> LogicalSource {
        LogicalSource::from(self.selected_source.load(Ordering::Acquire))
    }

    pub fn record_selected_source(&self, source: LogicalSource) {
        self.selected_source.store(source.into(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_privacy_reports_only_real_transitions() {
        let gate = PrivacyGate::new();
        assert!(!gate.is_privacy_on());
        assert!(gate.set_privacy(true));
        assert!(gate.is_privacy_on());
        assert!(!gate.set_privacy(true));
        assert!(gate.set_privacy(false));
    }

    #[test]
    fn records_selected_source() {
        let gate = PrivacyGate::new();
        assert_eq!(gate.selected_source(), LogicalSource::Primary);
        gate.record_selected_source(LogicalSource::Fallback);
        assert_eq!(gate.selected_source(), LogicalSource::Fallback);
    }
}
