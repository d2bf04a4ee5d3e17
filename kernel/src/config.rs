// Store Configuration
//
// Knobs for opening a file-backed repository, loadable from JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Create an empty canonical file when the path does not exist.
    pub create_if_missing: bool,

    /// Fold increments left behind by a previous session while opening.
    pub merge_on_open: bool,

    /// Suffix appended to unreadable increments kept for recovery.
    pub quarantine_suffix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            merge_on_open: true,
            quarantine_suffix: "bad".into(),
        }
    }
}
