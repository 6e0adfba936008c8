//! Backtick++ Core Order
//!
//! Platform-agnostic window ordering for the Backtick++ helper.
//!
//! The operating system hands out a fresh, unordered window list on every
//! query. This crate keeps the one ordering the user cares about:
//! - Windows are tracked by an opaque numeric id
//! - Each snapshot is merged into the persistent order (reconciliation)
//! - Successfully activated windows move to the front (promotion)

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque window handle assigned by the operating system.
/// On macOS this is the `CGWindowID` widened to u64.
pub type WindowId = u64;

/// Errors produced when parsing ordering options from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseEnumError {
    #[error("unknown new window position '{0}' (expected \"top\" or \"bottom\")")]
    Position(String),

    #[error("unknown activation mode '{0}' (expected \"automatic\" or \"manual\")")]
    ActivationMode(String),
}

/// One window as observed by a single enumeration.
/// Never stored beyond the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// The window identifier.
    pub id: WindowId,
    /// Window title at the time of enumeration.
    pub title: String,
    /// Whether this is the window the OS currently has focused.
    pub is_active: bool,
}

impl WindowSnapshot {
    /// Create a new snapshot entry.
    pub fn new(id: WindowId, title: impl Into<String>, is_active: bool) -> Self {
        Self {
            id,
            title: title.into(),
            is_active,
        }
    }
}

/// Where newly discovered windows are placed in the order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum NewWindowPosition {
    /// Insert new windows at the front (below the active window, if one was promoted).
    #[default]
    Top,
    /// Append new windows at the end.
    Bottom,
}

impl NewWindowPosition {
    /// Wire name of this position.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }
}

impl FromStr for NewWindowPosition {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("top") {
            Ok(Self::Top)
        } else if s.eq_ignore_ascii_case("bottom") {
            Ok(Self::Bottom)
        } else {
            Err(ParseEnumError::Position(s.to_string()))
        }
    }
}

impl TryFrom<String> for NewWindowPosition {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for NewWindowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the OS-focused window is pulled to the front on every reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ActivationMode {
    /// The focused window is promoted to the front on every query.
    #[default]
    Automatic,
    /// Only explicit activation reorders existing windows.
    Manual,
}

impl ActivationMode {
    /// Wire name of this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ActivationMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("automatic") {
            Ok(Self::Automatic)
        } else if s.eq_ignore_ascii_case("manual") {
            Ok(Self::Manual)
        } else {
            Err(ParseEnumError::ActivationMode(s.to_string()))
        }
    }
}

impl TryFrom<String> for ActivationMode {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persistent, user-meaningful order of window ids.
///
/// Starts empty and changes only through [`WindowOrder::reconcile`] and
/// [`WindowOrder::promote`]. Ids are never duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowOrder {
    ids: Vec<WindowId>,
}

impl WindowOrder {
    /// Create an empty order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an order from existing ids, dropping repeated ids.
    pub fn from_ids(ids: impl IntoIterator<Item = WindowId>) -> Self {
        let mut seen = HashSet::new();
        Self {
            ids: ids.into_iter().filter(|id| seen.insert(*id)).collect(),
        }
    }

    /// The tracked ids, front first.
    pub fn ids(&self) -> &[WindowId] {
        &self.ids
    }

    /// Number of tracked windows.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if no windows are tracked.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check if a window is tracked.
    pub fn contains(&self, id: WindowId) -> bool {
        self.ids.contains(&id)
    }

    /// Merge a fresh snapshot into the order and return the snapshot entries
    /// in the updated order.
    ///
    /// Closed windows are pruned first. Newly discovered ids are sorted
    /// descending and inserted as one block. In automatic mode, or when the
    /// order was empty before this call (bootstrap), the active window is
    /// moved to the front and `Top` inserts land directly below it.
    pub fn reconcile(
        &mut self,
        snapshot: &[WindowSnapshot],
        position: NewWindowPosition,
        mode: ActivationMode,
    ) -> Vec<WindowSnapshot> {
        let bootstrap = self.ids.is_empty() && !snapshot.is_empty();
        let entries = first_entries(snapshot);

        let snapshot_ids: HashSet<WindowId> = entries.iter().map(|w| w.id).collect();
        self.ids.retain(|id| snapshot_ids.contains(id));

        let tracked: HashSet<WindowId> = self.ids.iter().copied().collect();
        let mut new_ids: Vec<WindowId> = entries
            .iter()
            .map(|w| w.id)
            .filter(|id| !tracked.contains(id))
            .collect();

        let mut insert_at = 0;
        if mode == ActivationMode::Automatic || bootstrap {
            if let Some(active) = entries.iter().find(|w| w.is_active).map(|w| w.id) {
                self.ids.retain(|&id| id != active);
                self.ids.insert(0, active);
                new_ids.retain(|&id| id != active);
                insert_at = 1;
            }
        }

        new_ids.sort_unstable_by(|a, b| b.cmp(a));
        match position {
            NewWindowPosition::Top => {
                self.ids.splice(insert_at..insert_at, new_ids);
            }
            NewWindowPosition::Bottom => self.ids.extend(new_ids),
        }

        self.project(&entries)
    }

    /// Move a window to the front, removing any earlier occurrence.
    pub fn promote(&mut self, id: WindowId) {
        self.ids.retain(|&existing| existing != id);
        self.ids.insert(0, id);
    }

    /// Map each tracked id to its snapshot entry, in order.
    fn project(&self, entries: &[&WindowSnapshot]) -> Vec<WindowSnapshot> {
        let by_id: HashMap<WindowId, &WindowSnapshot> =
            entries.iter().map(|w| (w.id, *w)).collect();

        self.ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|w| (*w).clone()))
            .collect()
    }
}

/// Snapshot entries in order, keeping only the first entry for each id.
fn first_entries(snapshot: &[WindowSnapshot]) -> Vec<&WindowSnapshot> {
    let mut seen = HashSet::with_capacity(snapshot.len());
    snapshot.iter().filter(|w| seen.insert(w.id)).collect()
}
