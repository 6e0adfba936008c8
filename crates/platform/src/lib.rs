//! Backtick++ Platform
//!
//! Window enumeration and activation for the target application.
//!
//! This crate handles:
//! - Deciding which OS windows belong to the target application
//! - Listing those windows with their focus state
//! - Raising a window by id
//! - Accessibility permission checks and prompts

use backtick_core_order::{WindowId, WindowSnapshot};
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::MacWindowSource;

/// Errors that can occur while talking to the window system.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Window not found: {0}")]
    WindowNotFound(WindowId),

    #[error("Failed to activate window {id}: {reason}")]
    ActivationFailed { id: WindowId, reason: String },

    #[error("Window activation is not supported on this platform")]
    Unsupported,
}

/// Source of window snapshots for the target application.
///
/// Calls may block on the window server, so callers should keep them
/// off latency-sensitive paths.
pub trait WindowSource: Send + Sync {
    /// Enumerate the target application's open windows.
    ///
    /// Returns an empty list (not an error) when permission is missing or
    /// the target application is not running.
    fn list_windows(&self) -> Vec<WindowSnapshot>;

    /// Bring a window to the front and give it focus.
    fn activate(&self, id: WindowId) -> Result<(), PlatformError>;

    /// Whether the helper may inspect and control other applications.
    fn has_permission(&self) -> bool;

    /// Ask the OS to show its permission prompt, if it has one.
    fn request_permission(&self);
}

/// Rules that decide which windows belong to the target application.
#[derive(Debug, Clone)]
pub struct TargetApp {
    /// Substrings matched against the owning process name.
    owner_names: Vec<String>,
    /// Optional pattern a window title must match.
    title_pattern: Option<Regex>,
}

impl TargetApp {
    /// Create a target from owner name substrings and an optional title pattern.
    pub fn new(owner_names: Vec<String>, title_pattern: Option<Regex>) -> Self {
        Self {
            owner_names,
            title_pattern,
        }
    }

    /// Check whether a process name belongs to the target application.
    pub fn matches_owner(&self, owner: &str) -> bool {
        self.owner_names
            .iter()
            .any(|name| !name.is_empty() && owner.contains(name.as_str()))
    }

    /// Check whether a window title looks like a document window.
    ///
    /// Untitled windows never match.
    pub fn matches_title(&self, title: &str) -> bool {
        if title.is_empty() {
            return false;
        }
        match &self.title_pattern {
            Some(re) => re.is_match(title),
            None => true,
        }
    }

    /// Check both owner and title.
    pub fn matches(&self, owner: &str, title: &str) -> bool {
        self.matches_owner(owner) && self.matches_title(title)
    }
}

impl Default for TargetApp {
    fn default() -> Self {
        Self {
            owner_names: vec!["Code".to_string(), "Visual Studio Code".to_string()],
            title_pattern: None,
        }
    }
}

/// Window source for platforms without a window-system integration.
///
/// Reports no permission and no windows, and refuses activation, so the
/// helper still serves its protocol everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWindowSource;

impl WindowSource for NullWindowSource {
    fn list_windows(&self) -> Vec<WindowSnapshot> {
        Vec::new()
    }

    fn activate(&self, _id: WindowId) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    fn has_permission(&self) -> bool {
        false
    }

    fn request_permission(&self) {
        tracing::debug!("Permission prompt not available on this platform");
    }
}

/// Build the window source for the current platform.
#[cfg(target_os = "macos")]
pub fn default_source(target: TargetApp) -> Arc<dyn WindowSource> {
    Arc::new(MacWindowSource::new(target))
}

/// Build the window source for the current platform.
#[cfg(not(target_os = "macos"))]
pub fn default_source(target: TargetApp) -> Arc<dyn WindowSource> {
    tracing::warn!(
        "No window-system integration on this platform; serving an empty window list (target owners: {:?})",
        target.owner_names
    );
    Arc::new(NullWindowSource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vscode_target() -> TargetApp {
        TargetApp::new(
            vec!["Code".to_string(), "Visual Studio Code".to_string()],
            Some(Regex::new("— |Visual Studio Code").unwrap()),
        )
    }

    #[test]
    fn test_target_matches_owner_substring() {
        let target = vscode_target();
        assert!(target.matches_owner("Code"));
        assert!(target.matches_owner("Code - Insiders"));
        assert!(target.matches_owner("Visual Studio Code"));
        assert!(!target.matches_owner("Finder"));
    }

    #[test]
    fn test_target_title_pattern() {
        let target = vscode_target();
        assert!(target.matches_title("main.rs — backtick"));
        assert!(target.matches_title("Welcome - Visual Studio Code"));
        assert!(!target.matches_title("Untitled"));
        assert!(!target.matches_title(""));
    }

    #[test]
    fn test_target_without_pattern_accepts_any_title() {
        let target = TargetApp::new(vec!["Code".to_string()], None);
        assert!(target.matches("Code", "anything"));
        assert!(!target.matches("Code", ""));
        assert!(!target.matches("Safari", "anything"));
    }

    #[test]
    fn test_empty_owner_name_matches_nothing() {
        let target = TargetApp::new(vec![String::new()], None);
        assert!(!target.matches_owner("Code"));
    }

    #[test]
    fn test_default_target() {
        let target = TargetApp::default();
        assert!(target.matches("Code", "project"));
    }

    #[test]
    fn test_null_source() {
        let source = NullWindowSource;
        assert!(source.list_windows().is_empty());
        assert!(!source.has_permission());
        source.request_permission();
        assert!(matches!(source.activate(7), Err(PlatformError::Unsupported)));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(PlatformError::WindowNotFound(42).to_string(), "Window not found: 42");
        let err = PlatformError::ActivationFailed {
            id: 3,
            reason: "no accessibility window".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to activate window 3: no accessibility window");
    }

    #[test]
    fn test_default_source_is_object_safe() {
        let source: Arc<dyn WindowSource> = default_source(TargetApp::default());
        // Without permission or a running target the list is empty, never an error.
        if !source.has_permission() {
            assert!(source.list_windows().is_empty());
        }
    }
}
