//! Breakpoint management module.

use crate::channel::BreakpointLocation;
use std::collections::BTreeMap;

/// A source breakpoint. Unique per `(file, line)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Script label, as in `StackFrame::file`.
    pub file: String,
    /// 1-based.
    pub line: u32,
    /// Disabled breakpoints are kept but not sent to the runner.
    pub enabled: bool,
}

/// Manager for source breakpoints. Survives across sessions so breakpoints
/// set while idle are sent on the next start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<(String, u32), Breakpoint>,
}

impl BreakpointManager {
    /// An empty set.
    pub fn new() -> Self {
        Self { breakpoints: BTreeMap::new() }
    }

    /// Set an enabled breakpoint, re-enabling an existing one.
    pub fn set_breakpoint(&mut self, file: &str, line: u32) {
        self.breakpoints
            .entry((file.to_string(), line))
            .and_modify(|b| b.enabled = true)
            .or_insert_with(|| Breakpoint { file: file.to_string(), line, enabled: true });
    }

    /// Clear a breakpoint. Returns whether it existed.
    pub fn clear_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.breakpoints.remove(&(file.to_string(), line)).is_some()
    }

    /// Remove every breakpoint.
    pub fn clear_all(&mut self) {
        self.breakpoints.clear();
    }

    /// Toggle a breakpoint. Returns true if it is now set.
    pub fn toggle_breakpoint(&mut self, file: &str, line: u32) -> bool {
        if self.clear_breakpoint(file, line) {
            false
        } else {
            self.set_breakpoint(file, line);
            true
        }
    }

    /// Enable or disable without removing. Returns false if there is no
    /// breakpoint at that location.
    pub fn set_enabled(&mut self, file: &str, line: u32, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&(file.to_string(), line)) {
            Some(breakpoint) => {
                breakpoint.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Breakpoint at the location, if set.
    pub fn get(&self, file: &str, line: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&(file.to_string(), line))
    }

    /// All breakpoints, ordered by file then line.
    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    /// What the runner should break on.
    pub fn enabled_locations(&self) -> Vec<BreakpointLocation> {
        self.breakpoints
            .values()
            .filter(|b| b.enabled)
            .map(|b| BreakpointLocation { file: b.file.clone(), line: b.line })
            .collect()
    }

    /// Number of breakpoints, enabled or not.
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    /// Whether no breakpoints are set.
    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_manager_tracking() {
        let mut mgr = BreakpointManager::new();
        assert!(mgr.list().is_empty());

        assert!(mgr.toggle_breakpoint("main.mw", 4));
        mgr.set_breakpoint("main.mw", 2);
        mgr.set_breakpoint("lib.mw", 9);
        let lines: Vec<_> = mgr.list().into_iter().map(|b| (b.file, b.line)).collect();
        assert_eq!(lines, vec![("lib.mw".into(), 9), ("main.mw".into(), 2), ("main.mw".into(), 4)]);

        assert!(!mgr.toggle_breakpoint("main.mw", 4));
        assert!(mgr.get("main.mw", 4).is_none());
        mgr.clear_all();
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_double_toggle_restores_set() {
        let mut mgr = BreakpointManager::new();
        mgr.set_breakpoint("a.mw", 1);
        let before = mgr.clone();
        mgr.toggle_breakpoint("a.mw", 7);
        mgr.toggle_breakpoint("a.mw", 7);
        assert_eq!(mgr, before);
    }

    #[test]
    fn test_disabled_breakpoints_are_kept_but_not_sent() {
        let mut mgr = BreakpointManager::new();
        mgr.set_breakpoint("a.mw", 3);
        mgr.set_breakpoint("a.mw", 5);
        assert!(mgr.set_enabled("a.mw", 3, false));
        assert!(!mgr.set_enabled("a.mw", 99, false));
        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.enabled_locations(), vec![BreakpointLocation { file: "a.mw".into(), line: 5 }]);

        // Setting again re-enables.
        mgr.set_breakpoint("a.mw", 3);
        assert_eq!(mgr.enabled_locations().len(), 2);
    }
}
