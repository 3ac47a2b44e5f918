//! Component logger handles.
//!
//! Every long-lived component receives a `Logger` at construction time and
//! logs through `target: logger.target()`. Nothing looks a logger up by type
//! name at runtime; the binary decides the root target and hands children
//! down explicitly.

use std::fmt;
use std::sync::Arc;

/// Root target used when no explicit handle is supplied.
pub const ROOT_TARGET: &str = "motion_gate";

/// Cheap, clonable handle naming the log target of one component.
#[derive(Clone, PartialEq, Eq)]
pub struct Logger {
    target: Arc<str>,
}

impl Logger {
    pub fn new(target: impl AsRef<str>) -> Self {
        Self {
            target: Arc::from(target.as_ref()),
        }
    }

    /// Derive a handle for a sub-component, e.g. `motiond` -> `motiond::capture`.
    pub fn child(&self, name: &str) -> Self {
        Self::new(format!("{}::{}", self.target, name))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(ROOT_TARGET)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Logger({})", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_targets_nest_under_parent() {
        let root = Logger::new("motiond");
        let capture = root.child("capture");
        assert_eq!(capture.target(), "motiond::capture");
        assert_eq!(capture.child("dispatch").target(), "motiond::capture::dispatch");
        assert_eq!(root.target(), "motiond");
    }

    #[test]
    fn default_uses_crate_target() {
        assert_eq!(Logger::default().target(), ROOT_TARGET);
    }
}
